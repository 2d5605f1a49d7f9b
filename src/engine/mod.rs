// FLOWLINE — ENGINE LAYER
// The mechanisms under the data plane: fast clock, rings + wakeups,
// object pools, node-local storage.

pub mod clock;
pub mod nls;
pub mod pool;
pub mod ring;
