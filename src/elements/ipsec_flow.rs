// FLOWLINE — IPSEC FLOW LOOKUP ELEMENT
// Resolves a frame's tunnel and stamps the flow-id annotation the auth
// element keys on. The tunnel index comes from the destination address of
// the outer IP header (the per-tunnel addressing plan assigns one inner
// subnet per tunnel); frames too short to carry the header are killed.

use crate::element::{Action, Element, ElementContext};
use crate::packet::{Anno, Packet};
use crate::{Error, Result};

/// Destination address within ETH(14) + IP: bytes 30..34; the tunnel index
/// lives in the low 16 bits.
const IP_DST_OFFSET: usize = 30;

pub struct IpsecFlowLookup {
    num_tunnels: usize,
}

impl IpsecFlowLookup {
    pub fn new() -> Self {
        IpsecFlowLookup { num_tunnels: crate::elements::ipsec_hmac::DEFAULT_NUM_TUNNELS }
    }
}

impl Element for IpsecFlowLookup {
    fn class_name(&self) -> &'static str {
        "IPsecFlowLookup"
    }

    fn port_count(&self) -> (usize, usize) {
        (1, 1)
    }

    fn configure(&mut self, _ctx: &ElementContext, args: &[String]) -> Result<()> {
        for arg in args {
            match arg.split_once('=') {
                Some(("tunnels", v)) => {
                    self.num_tunnels = v.parse().map_err(|_| {
                        Error::ConfigInvalid(format!("IPsecFlowLookup: bad tunnels={v:?}"))
                    })?;
                    if self.num_tunnels == 0 {
                        return Err(Error::ConfigInvalid(
                            "IPsecFlowLookup: tunnels must be > 0".into(),
                        ));
                    }
                }
                _ => {
                    return Err(Error::ConfigInvalid(format!(
                        "IPsecFlowLookup: unknown arg {arg:?}"
                    )))
                }
            }
        }
        Ok(())
    }

    fn process(&mut self, _input_port: usize, pkt: &mut Packet) -> Action {
        if pkt.len() < IP_DST_OFFSET + 4 {
            pkt.kill();
            return Action::Drop;
        }
        let d = pkt.data();
        let flow = u16::from_be_bytes([d[IP_DST_OFFSET + 2], d[IP_DST_OFFSET + 3]]) as usize
            % self.num_tunnels;
        pkt.anno.set(Anno::IpsecFlowId, flow as u64);
        Action::Continue(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamps_flow_from_destination_address() {
        let mut e = IpsecFlowLookup::new();
        let ctx = ElementContext { node: 0, comp_batch_size: 64, num_tx_ports: 1 };
        e.configure(&ctx, &["tunnels=1024".into()]).unwrap();
        let mut p = Packet::new();
        p.reset(0, 0, 0);
        let mut f = vec![0u8; 80];
        f[IP_DST_OFFSET..IP_DST_OFFSET + 4].copy_from_slice(&[10, 0, 0x02, 0x37]);
        p.fill(&f);
        assert_eq!(e.process(0, &mut p), Action::Continue(0));
        assert_eq!(p.anno.get(Anno::IpsecFlowId), 0x0237 % 1024);
    }

    #[test]
    fn short_frame_killed() {
        let mut e = IpsecFlowLookup::new();
        let mut p = Packet::new();
        p.reset(0, 0, 0);
        p.fill(&[0u8; 20]);
        assert_eq!(e.process(0, &mut p), Action::Drop);
        assert!(p.is_killed());
    }
}
