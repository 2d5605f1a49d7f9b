// FLOWLINE — L2 FORWARD ELEMENT
// Forwards by destination MAC. The default mapping sends a frame whose
// destination MAC ends in byte b to egress port b; an explicit `next=N`
// argument pins every frame to port N instead. Frames without a usable
// mapping are killed.

use crate::element::{Action, Caps, Element, ElementContext};
use crate::packet::{Anno, Packet};
use crate::{Error, Result};

const ETH_HDR_LEN: usize = 14;

pub struct L2Forward {
    next_port: Option<u16>,
    num_tx_ports: usize,
}

impl L2Forward {
    pub fn new() -> Self {
        L2Forward { next_port: None, num_tx_ports: 0 }
    }
}

impl Element for L2Forward {
    fn class_name(&self) -> &'static str {
        "L2Forward"
    }

    fn port_count(&self) -> (usize, usize) {
        (1, 1)
    }

    fn caps(&self) -> Caps {
        Caps::default()
    }

    fn configure(&mut self, ctx: &ElementContext, args: &[String]) -> Result<()> {
        self.num_tx_ports = ctx.num_tx_ports;
        for arg in args {
            match arg.split_once('=') {
                Some(("next", v)) => {
                    let port: u16 = v
                        .parse()
                        .map_err(|_| Error::ConfigInvalid(format!("L2Forward: bad next={v:?}")))?;
                    if port as usize >= ctx.num_tx_ports {
                        return Err(Error::ConfigInvalid(format!(
                            "L2Forward: next={port} out of range"
                        )));
                    }
                    self.next_port = Some(port);
                }
                _ => {
                    return Err(Error::ConfigInvalid(format!("L2Forward: unknown arg {arg:?}")));
                }
            }
        }
        Ok(())
    }

    fn process(&mut self, _input_port: usize, pkt: &mut Packet) -> Action {
        if pkt.len() < ETH_HDR_LEN {
            pkt.kill();
            return Action::Drop;
        }
        let port = match self.next_port {
            Some(p) => p,
            None => {
                let last = pkt.data()[5] as u16;
                if (last as usize) >= self.num_tx_ports {
                    pkt.kill();
                    return Action::Drop;
                }
                last
            }
        };
        pkt.anno.set(Anno::IfaceOut, port as u64);
        Action::Continue(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ElementContext {
        ElementContext { node: 0, comp_batch_size: 64, num_tx_ports: 2 }
    }

    fn frame_to(dst_last: u8) -> Packet {
        let mut p = Packet::new();
        p.reset(0, 0, 0);
        let mut f = vec![0u8; 60];
        f[..6].copy_from_slice(&[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, dst_last]);
        p.fill(&f);
        p
    }

    #[test]
    fn routes_by_destination_mac() {
        let mut e = L2Forward::new();
        e.configure(&ctx(), &[]).unwrap();
        let mut p = frame_to(1);
        assert_eq!(e.process(0, &mut p), Action::Continue(0));
        assert_eq!(p.anno.get(Anno::IfaceOut), 1);
    }

    #[test]
    fn unknown_mac_is_killed() {
        let mut e = L2Forward::new();
        e.configure(&ctx(), &[]).unwrap();
        let mut p = frame_to(9);
        assert_eq!(e.process(0, &mut p), Action::Drop);
        assert!(p.is_killed());
    }

    #[test]
    fn pinned_next_port_wins() {
        let mut e = L2Forward::new();
        e.configure(&ctx(), &["next=0".into()]).unwrap();
        let mut p = frame_to(9);
        assert_eq!(e.process(0, &mut p), Action::Continue(0));
        assert_eq!(p.anno.get(Anno::IfaceOut), 0);
    }

    #[test]
    fn runt_frame_is_killed() {
        let mut e = L2Forward::new();
        e.configure(&ctx(), &[]).unwrap();
        let mut p = Packet::new();
        p.reset(0, 0, 0);
        p.fill(&[0u8; 8]);
        assert_eq!(e.process(0, &mut p), Action::Drop);
    }
}
