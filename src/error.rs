use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReproError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("KFD Driver Error: {0}")]
    Driver(String),

    #[error("Reservation failed: {0}")]
    Reservation(String),

    #[error("Out of device memory on device {device}: requested {requested} bytes, {free} free")]
    OutOfMemory {
        device: u32,
        requested: usize,
        free: u64,
    },

    #[error("Invalid range: {0}")]
    Range(String),

    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Barrier protocol violation: {0}")]
    Protocol(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

// A convenient alias
pub type ReproResult<T> = Result<T, ReproError>;

/// Aborts the process after logging `msg`.
///
/// Used when address-space bookkeeping no longer matches what the driver holds;
/// continuing would risk silent corruption.
#[cold]
pub fn fatal(msg: &str) -> ! {
    tracing::error!(target: "hsa_repro::fatal", "{msg}");
    eprintln!("hsa-repro fatal: {msg}");
    std::process::abort()
}
