//! [`qpair_harness::QueuePairDriver`] backed by the dnvme kernel driver.
//!
//! The harness talks to a real controller through the dnvme character device: queue memory is
//! prepared by ioctl, commands are copied into the driver's rings, and completions are reaped
//! into a caller buffer. Only Linux has the driver.

pub mod uapi;

#[cfg(target_os = "linux")]
mod device;

#[cfg(target_os = "linux")]
pub use device::DnvmeDevice;

