// FLOWLINE — ERROR KINDS
// One enum for the whole crate. Data-plane failures (pool empty, ring full)
// are NOT errors — they are counted drops or requeues at their origin and
// never unwind. Error values appear only at configuration/startup time and
// on the device seam.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("cannot read {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    #[error("transient offload failure: {0}")]
    OffloadTransient(&'static str),

    #[error("fatal device error on {device}: {reason}")]
    DeviceFatal { device: String, reason: String },

    #[error("another instance holds the process lock")]
    LockBusy,

    #[error("terminated by signal")]
    Terminated,
}

impl Error {
    /// Process exit code for fatal startup errors. 0 is success, 1 is
    /// reserved for the process lock, everything else exits 2.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::LockBusy => 1,
            _ => 2,
        }
    }
}
