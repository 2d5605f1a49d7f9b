// FLOWLINE — DISCARD ELEMENT
// 1-in/0-out sink: every packet is dropped and counted by the executor.

use crate::element::{Action, Element};
use crate::packet::Packet;

pub struct Discard;

impl Discard {
    pub fn new() -> Self {
        Discard
    }
}

impl Element for Discard {
    fn class_name(&self) -> &'static str {
        "Discard"
    }

    fn port_count(&self) -> (usize, usize) {
        (1, 0)
    }

    fn process(&mut self, _input_port: usize, _pkt: &mut Packet) -> Action {
        Action::Drop
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_everything() {
        let mut e = Discard::new();
        let mut p = Packet::new();
        p.reset(0, 0, 0);
        p.fill(&[1, 2, 3]);
        assert_eq!(e.process(0, &mut p), Action::Drop);
    }
}
