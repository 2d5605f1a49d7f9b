// FLOWLINE — STANDARD ELEMENT CLASSES
// The class registry plus the pipeline endpoints. Pipeline configs refer to
// classes by name; the graph builder instantiates through this table.

pub mod classifier;
pub mod discard;
pub mod ipsec_flow;
pub mod ipsec_hmac;
pub mod l2fwd;
pub mod queue;

pub use classifier::Classifier;
pub use discard::Discard;
pub use ipsec_flow::IpsecFlowLookup;
pub use ipsec_hmac::IpsecAuthHmacSha1;
pub use l2fwd::L2Forward;
pub use queue::Queue;

use crate::element::{Action, Element, ElementClass, ElementContext};
use crate::packet::{Anno, Packet};
use crate::{Error, Result};

/// Every class the pipeline DSL may name.
pub static ELEMENT_CLASSES: &[ElementClass] = &[
    ElementClass { name: "FromInput", ctor: || Box::new(FromInput::new()) },
    ElementClass { name: "ToOutput", ctor: || Box::new(ToOutput::new()) },
    ElementClass { name: "Discard", ctor: || Box::new(Discard::new()) },
    ElementClass { name: "Classifier", ctor: || Box::new(Classifier::new()) },
    ElementClass { name: "L2Forward", ctor: || Box::new(L2Forward::new()) },
    ElementClass { name: "IPsecFlowLookup", ctor: || Box::new(IpsecFlowLookup::new()) },
    ElementClass { name: "IPsecAuthHMACSHA1", ctor: || Box::new(IpsecAuthHmacSha1::new()) },
    ElementClass { name: "Queue", ctor: || Box::new(Queue::new()) },
];

pub fn create(class: &str) -> Result<Box<dyn Element>> {
    ELEMENT_CLASSES
        .iter()
        .find(|c| c.name == class)
        .map(|c| (c.ctor)())
        .ok_or_else(|| Error::ConfigInvalid(format!("unknown element class {class:?}")))
}

// ============================================================================
// PIPELINE ENDPOINTS
// ============================================================================

/// Graph root for one NIC source port. Batches from that port enter the
/// graph here; the I/O worker has already stamped the port and timestamp
/// annotations.
pub struct FromInput {
    source_port: u16,
}

impl FromInput {
    pub fn new() -> Self {
        FromInput { source_port: 0 }
    }

    pub fn source_port(&self) -> u16 {
        self.source_port
    }
}

impl Element for FromInput {
    fn class_name(&self) -> &'static str {
        "FromInput"
    }

    fn port_count(&self) -> (usize, usize) {
        (0, 1)
    }

    fn configure(&mut self, _ctx: &ElementContext, args: &[String]) -> Result<()> {
        let port = args
            .first()
            .ok_or_else(|| Error::ConfigInvalid("FromInput requires a port argument".into()))?;
        self.source_port = port
            .parse()
            .map_err(|_| Error::ConfigInvalid(format!("FromInput: bad port {port:?}")))?;
        Ok(())
    }

    fn process(&mut self, _input_port: usize, _pkt: &mut Packet) -> Action {
        Action::Continue(0)
    }
}

/// Terminal TX vertex. Stamps the egress-port annotation; the executor moves
/// its output packets onto the paired I/O worker's TX ring for that port.
pub struct ToOutput {
    tx_port: Option<u16>,
}

impl ToOutput {
    pub fn new() -> Self {
        ToOutput { tx_port: None }
    }
}

impl Element for ToOutput {
    fn class_name(&self) -> &'static str {
        "ToOutput"
    }

    fn port_count(&self) -> (usize, usize) {
        (1, 1)
    }

    fn configure(&mut self, ctx: &ElementContext, args: &[String]) -> Result<()> {
        if let Some(arg) = args.first() {
            let port: u16 = arg
                .parse()
                .map_err(|_| Error::ConfigInvalid(format!("ToOutput: bad port {arg:?}")))?;
            if port as usize >= ctx.num_tx_ports {
                return Err(Error::ConfigInvalid(format!(
                    "ToOutput: port {port} out of range ({} ports)",
                    ctx.num_tx_ports
                )));
            }
            self.tx_port = Some(port);
        }
        Ok(())
    }

    fn process(&mut self, _input_port: usize, pkt: &mut Packet) -> Action {
        match self.tx_port {
            Some(p) => pkt.anno.set(Anno::IfaceOut, p as u64),
            None if pkt.anno.is_set(Anno::IfaceOut) => {}
            None => {
                // No egress decision anywhere upstream: dead packet.
                return Action::Drop;
            }
        }
        Action::Continue(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ElementContext {
        ElementContext { node: 0, comp_batch_size: 64, num_tx_ports: 2 }
    }

    fn pkt() -> Packet {
        let mut p = Packet::new();
        p.reset(0, 0, 0);
        p.fill(&[0u8; 60]);
        p
    }

    #[test]
    fn registry_creates_every_class() {
        for class in ELEMENT_CLASSES {
            let elem = create(class.name).unwrap();
            assert_eq!(elem.class_name(), class.name);
        }
        assert!(create("NoSuchElement").is_err());
    }

    #[test]
    fn from_input_parses_port() {
        let mut e = FromInput::new();
        e.configure(&ctx(), &["3".into()]).unwrap();
        assert_eq!(e.source_port(), 3);
        assert!(e.configure(&ctx(), &[]).is_err());
    }

    #[test]
    fn to_output_stamps_configured_port() {
        let mut e = ToOutput::new();
        e.configure(&ctx(), &["1".into()]).unwrap();
        let mut p = pkt();
        assert_eq!(e.process(0, &mut p), Action::Continue(0));
        assert_eq!(p.anno.get(Anno::IfaceOut), 1);
    }

    #[test]
    fn to_output_without_decision_drops() {
        let mut e = ToOutput::new();
        e.configure(&ctx(), &[]).unwrap();
        let mut p = pkt();
        assert_eq!(e.process(0, &mut p), Action::Drop);
        p.anno.set(Anno::IfaceOut, 0);
        assert_eq!(e.process(0, &mut p), Action::Continue(0));
    }

    #[test]
    fn to_output_rejects_out_of_range_port() {
        let mut e = ToOutput::new();
        assert!(e.configure(&ctx(), &["7".into()]).is_err());
    }
}
