// FLOWLINE — CLASSIFIER ELEMENT
// Routes by EtherType: one output port per configured type, in argument
// order, plus a final default port for everything else. The usual way to
// split a pipeline into protocol branches.

use crate::element::{Action, Element, ElementContext};
use crate::packet::Packet;
use crate::{Error, Result};

const ETH_TYPE_OFFSET: usize = 12;

pub struct Classifier {
    ether_types: Vec<u16>,
}

impl Classifier {
    pub fn new() -> Self {
        Classifier { ether_types: Vec::new() }
    }
}

impl Element for Classifier {
    fn class_name(&self) -> &'static str {
        "Classifier"
    }

    fn port_count(&self) -> (usize, usize) {
        (1, self.ether_types.len() + 1)
    }

    fn configure(&mut self, _ctx: &ElementContext, args: &[String]) -> Result<()> {
        if args.is_empty() {
            return Err(Error::ConfigInvalid(
                "Classifier needs at least one ethertype argument".into(),
            ));
        }
        for arg in args {
            let raw = arg.trim().trim_start_matches("0x");
            let et = u16::from_str_radix(raw, 16)
                .map_err(|_| Error::ConfigInvalid(format!("Classifier: bad ethertype {arg:?}")))?;
            self.ether_types.push(et);
        }
        Ok(())
    }

    fn process(&mut self, _input_port: usize, pkt: &mut Packet) -> Action {
        if pkt.len() < ETH_TYPE_OFFSET + 2 {
            pkt.kill();
            return Action::Drop;
        }
        let d = pkt.data();
        let et = u16::from_be_bytes([d[ETH_TYPE_OFFSET], d[ETH_TYPE_OFFSET + 1]]);
        match self.ether_types.iter().position(|&t| t == et) {
            Some(p) => Action::Continue(p as u8),
            None => Action::Continue(self.ether_types.len() as u8),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with_type(et: u16) -> Packet {
        let mut p = Packet::new();
        p.reset(0, 0, 0);
        let mut f = vec![0u8; 60];
        f[12..14].copy_from_slice(&et.to_be_bytes());
        p.fill(&f);
        p
    }

    #[test]
    fn routes_known_types_and_default() {
        let mut c = Classifier::new();
        let ctx = ElementContext { node: 0, comp_batch_size: 64, num_tx_ports: 1 };
        c.configure(&ctx, &["0x0800".into(), "0x86DD".into()]).unwrap();
        assert_eq!(c.port_count(), (1, 3));

        let mut v4 = frame_with_type(0x0800);
        let mut v6 = frame_with_type(0x86DD);
        let mut arp = frame_with_type(0x0806);
        assert_eq!(c.process(0, &mut v4), Action::Continue(0));
        assert_eq!(c.process(0, &mut v6), Action::Continue(1));
        assert_eq!(c.process(0, &mut arp), Action::Continue(2));
    }

    #[test]
    fn runt_killed() {
        let mut c = Classifier::new();
        let ctx = ElementContext { node: 0, comp_batch_size: 64, num_tx_ports: 1 };
        c.configure(&ctx, &["0800".into()]).unwrap();
        let mut p = Packet::new();
        p.reset(0, 0, 0);
        p.fill(&[0u8; 10]);
        assert_eq!(c.process(0, &mut p), Action::Drop);
    }
}
