//! Raw interface to the AMD kernel fusion driver: ioctl ABI, device file and
//! sysfs topology.

pub mod device;
pub mod ioctl;
pub mod sysfs;
