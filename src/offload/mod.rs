// FLOWLINE — OFFLOAD LAYER
// Datablock layouts, the accelerator device/context contracts, and the task
// objects that carry a batch through the coprocessor pipeline.

pub mod datablock;
pub mod device;
pub mod task;

pub use datablock::{DatablockSpec, Roi};
pub use device::{ComputeContext, ComputeDevice, CtxState, KernelArg, KernelRef, ResourceParam};
pub use task::{OffloadTask, TaskStatus};
