//! Diagnostic harness for GPU virtual memory and cross-device barriers.
//!
//! [`vmm::VirtualMemoryManager`] separates address-space reservation from
//! physical backing and shares backings between processes through
//! [`handle::ExportedHandle`]s. [`barrier::MultiGpuBarrier`] synchronizes ranks
//! through buffers mapped into every peer. Both run on a
//! [`driver::MemoryDriver`]: the KFD driver on AMD hardware, or a host-memory
//! emulation elsewhere.

pub mod barrier;
pub mod config;
pub mod driver;
pub mod error;
pub mod exchange;
pub mod handle;
pub mod harness;
pub mod kfd;
pub mod utils;
pub mod vmm;

pub use barrier::{BarrierState, MAX_RANKS, MultiGpuBarrier};
pub use config::{Backend, HarnessConfig, open_driver};
pub use driver::host::HostDriver;
pub use driver::kfd::KfdDriver;
pub use driver::{DeviceIndex, Granularity, MemoryDriver, MemoryInfo};
pub use error::{ReproError, ReproResult};
pub use exchange::{AllGather, FileAllGather, ThreadAllGather};
pub use handle::{EXPORTED_HANDLE_LEN, ExportedHandle, HandleKind};
pub use harness::{
    CancelToken, LoopSummary, ReserveScaling, StopReason, StressLoop, measure_reserve_scaling,
};
pub use vmm::{PhysicalAllocation, VirtualMemoryManager, VirtualReservation};
