// FLOWLINE — QUEUE ELEMENT
// The scheduler-capable element: batches routed into it are parked by the
// executor and reinjected on the worker's next dispatch round from output
// port 0. The only class allowed to source a graph back-edge.

use crate::element::{Action, Caps, Element};
use crate::packet::Packet;

pub struct Queue;

impl Queue {
    pub fn new() -> Self {
        Queue
    }
}

impl Element for Queue {
    fn class_name(&self) -> &'static str {
        "Queue"
    }

    fn port_count(&self) -> (usize, usize) {
        (1, 1)
    }

    fn caps(&self) -> Caps {
        Caps { schedulable: true, per_batch: true, ..Caps::default() }
    }

    /// Never invoked per packet; the executor parks whole batches instead.
    fn process(&mut self, _input_port: usize, _pkt: &mut Packet) -> Action {
        Action::Continue(0)
    }
}
