// FLOWLINE — ELEMENT CONTRACT
// A pipeline vertex: N input ports, M output ports, a per-packet process()
// function, and four serialized init phases. Polymorphism is a capability
// record, not inheritance: every element is a trait object, and offload
// support is an optional second vtable reached through offload()/
// offload_mut(). Graph edges store vertex handles, never concrete types.

use crate::engine::nls::NodeLocalStorage;
use crate::offload::datablock::DatablockSpec;
use crate::offload::device::{ComputeDevice, KernelArg, KernelRef};
use crate::packet::Packet;
use crate::Result;

/// Outcome of processing one packet on one input port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Forward on the given output port.
    Continue(u8),
    /// Packet is dead; elided from all further port pushes.
    Drop,
    /// Hand to the slow path (counted, then dropped from the fast path).
    SlowPath,
    /// The element wants the whole batch offloaded; the executor builds a
    /// task and the element finishes the packets in postproc.
    Pending,
}

/// Capability flags of an element class.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Caps {
    pub offloadable: bool,
    /// May reinject batches; the only legal source of graph back-edges.
    pub schedulable: bool,
    /// Prefers whole-batch invocation over per-packet calls.
    pub per_batch: bool,
}

/// What an element sees of its runtime at configure time.
#[derive(Clone, Debug)]
pub struct ElementContext {
    pub node: usize,
    pub comp_batch_size: usize,
    pub num_tx_ports: usize,
}

/// Offload-init work shipped to the owning coprocessor worker. The closure
/// owns everything it needs; it must not borrow the element.
pub type OffloadInitFn =
    Box<dyn FnOnce(&dyn ComputeDevice, &NodeLocalStorage) -> Result<()> + Send>;

pub trait Element: Send {
    fn class_name(&self) -> &'static str;

    /// (input ports, output ports).
    fn port_count(&self) -> (usize, usize);

    fn caps(&self) -> Caps {
        Caps::default()
    }

    fn configure(&mut self, _ctx: &ElementContext, _args: &[String]) -> Result<()> {
        Ok(())
    }

    /// Once per element class, before any per-node work.
    fn initialize_global(&mut self) -> Result<()> {
        Ok(())
    }

    /// Once per NUMA node: publish shared state into node-local storage.
    fn initialize_per_node(&mut self, _nls: &NodeLocalStorage) -> Result<()> {
        Ok(())
    }

    /// Once per computation worker: acquire node-local pointers.
    fn initialize(&mut self, _nls: &NodeLocalStorage) -> Result<()> {
        Ok(())
    }

    fn process(&mut self, input_port: usize, pkt: &mut Packet) -> Action;

    /// The optional offload vtable.
    fn offload(&self) -> Option<&dyn Offloadable> {
        None
    }

    fn offload_mut(&mut self) -> Option<&mut dyn Offloadable> {
        None
    }
}

/// Second vtable of offloadable elements. Device resolution happens once:
/// `offload_init_fn` runs on the coprocessor worker per (device, node) and
/// publishes device buffer handles through node-local storage; `bind_device`
/// then runs per thread and caches the kernel ref and argument words, so the
/// data path performs no lookups.
pub trait Offloadable {
    fn datablocks(&self) -> &'static [DatablockSpec];

    fn kernel_name(&self, device: &str) -> &'static str;

    fn desired_workgroup_size(&self, device: &str) -> u32;

    /// Build the once-per-(device, node) init work, or None if this class
    /// has no device-resident state.
    fn offload_init_fn(&self) -> Option<OffloadInitFn>;

    /// Per-thread binding after offload init has published its handles.
    fn bind_device(&mut self, dev: &dyn ComputeDevice, nls: &NodeLocalStorage) -> Result<()>;

    fn kernel(&self) -> KernelRef;

    fn kernel_args(&self) -> &[KernelArg];

    /// Finish one packet after completion. `device_output` is the item's
    /// primary datablock output, or None on task failure/under-production.
    fn postproc(
        &mut self,
        input_port: usize,
        device_output: Option<&[u8]>,
        pkt: &mut Packet,
    ) -> Action;
}

/// Element class registry entry. The static table lives in `elements`.
#[derive(Clone, Copy)]
pub struct ElementClass {
    pub name: &'static str,
    pub ctor: fn() -> Box<dyn Element>,
}
