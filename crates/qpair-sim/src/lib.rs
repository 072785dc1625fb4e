//! Emulated NVMe controller exposing the queue-pair driver contract.
//!
//! [`SimDevice`] stands in for the dnvme character device: queues are prepared and created the
//! same way, admin commands run when the admin doorbell is rung, and I/O commands are fetched by
//! a WRRU or round robin arbiter as device time advances. Device time only advances through
//! [`SimDevice::tick`] or the [`SimClock`] handed to the reaper, so arbitration order is fully
//! deterministic.
//!
//! ```no_run
//! use qpair_harness::HarnessConfig;
//! use qpair_sim::{SimConfig, SimDevice};
//!
//! let device = SimDevice::new(SimConfig::default());
//! let mut harness = device.harness(&HarnessConfig::default());
//! assert!(harness.enable_wrru().unwrap());
//! ```

mod arbiter;
mod controller;
mod namespace;
mod queue;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use qpair_harness::command::SQ_ENTRY_SIZE;
use qpair_harness::{
    CompletionReaper, DataDirection, DmaBuffer, DriverError, Harness, HarnessConfig, PollSleep,
    QueuePairDriver, ReapStatus,
};

pub use arbiter::ArbiterMode;
pub use controller::{errno, SimConfig, SimController, SimFaults};

/// Cloneable handle to an emulated controller. Clones share the device.
#[derive(Debug, Clone)]
pub struct SimDevice {
    inner: Arc<Mutex<SimController>>,
}

impl SimDevice {
    pub fn new(config: SimConfig) -> Self {
        SimDevice {
            inner: Arc::new(Mutex::new(SimController::new(config))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimController> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs `f` against the controller with the device locked.
    pub fn with_controller<R>(&self, f: impl FnOnce(&mut SimController) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn set_faults(&self, faults: SimFaults) {
        self.lock().faults = faults;
    }

    pub fn update_faults(&self, f: impl FnOnce(&mut SimFaults)) {
        f(&mut self.lock().faults);
    }

    /// A sleeper that advances this device instead of blocking the thread.
    pub fn clock(&self) -> SimClock {
        SimClock {
            device: self.clone(),
        }
    }

    /// Builds a harness over this device whose reaper drives device time.
    pub fn harness(&self, config: &HarnessConfig) -> Harness<SimDevice> {
        let reaper = CompletionReaper::with_sleeper(config.reap_policy(), Box::new(self.clock()));
        Harness::with_reaper(self.clone(), config, reaper)
    }

    pub fn tick(&self) {
        self.lock().tick(Duration::ZERO);
    }

    pub fn tick_n(&self, n: u32) {
        let mut ctrl = self.lock();
        for _ in 0..n {
            ctrl.tick(Duration::ZERO);
        }
    }

    pub fn ticks(&self) -> u64 {
        self.lock().ticks
    }

    /// Sum of the poll intervals the reaper asked to sleep for.
    pub fn elapsed(&self) -> Duration {
        self.lock().elapsed
    }

    pub fn reap_calls(&self) -> u32 {
        self.lock().reap_calls
    }

    /// `(sq_id, cid)` of every I/O command the device has executed, in order.
    pub fn executed(&self) -> Vec<(u16, u16)> {
        self.lock().executed.clone()
    }

    pub fn read_blocks(&self, slba: u64, nlb: u32) -> Option<Vec<u8>> {
        self.lock().read_blocks(slba, nlb)
    }

    /// Ids of the I/O submission and completion queues that currently exist on the device.
    pub fn io_queue_ids(&self) -> (Vec<u16>, Vec<u16>) {
        self.lock().io_queue_ids()
    }
}

impl Default for SimDevice {
    fn default() -> Self {
        SimDevice::new(SimConfig::default())
    }
}

impl QueuePairDriver for SimDevice {
    fn prepare_sq(
        &mut self,
        sq_id: u16,
        cq_id: u16,
        elements: u32,
        _contiguous: bool,
    ) -> Result<(), DriverError> {
        self.lock().prepare_sq(sq_id, cq_id, elements)
    }

    fn prepare_cq(
        &mut self,
        cq_id: u16,
        elements: u32,
        _contiguous: bool,
        irq_vector: Option<u16>,
    ) -> Result<(), DriverError> {
        self.lock().prepare_cq(cq_id, elements, irq_vector)
    }

    fn submit_command(
        &mut self,
        sq_id: u16,
        entry: &[u8; SQ_ENTRY_SIZE],
        data: Option<&DmaBuffer>,
        direction: DataDirection,
    ) -> Result<u16, DriverError> {
        self.lock().submit(sq_id, entry, data, direction)
    }

    fn ring_doorbell(&mut self, sq_id: u16) -> Result<(), DriverError> {
        self.lock().ring_doorbell(sq_id)
    }

    fn reap(
        &mut self,
        cq_id: u16,
        requested: u32,
        buf: &mut [u8],
    ) -> Result<ReapStatus, DriverError> {
        self.lock().reap(cq_id, requested, buf)
    }

    fn inquiry(&mut self, cq_id: u16) -> Result<u32, DriverError> {
        self.lock().inquiry(cq_id)
    }

    fn read_register(&mut self, offset: u32) -> Result<u32, DriverError> {
        self.lock().read_register(offset)
    }

    fn write_register(&mut self, offset: u32, value: u32) -> Result<(), DriverError> {
        self.lock().write_register(offset, value)
    }
}

/// Reaper sleeper that advances the emulated device by one tick per poll interval.
#[derive(Debug, Clone)]
pub struct SimClock {
    device: SimDevice,
}

impl PollSleep for SimClock {
    fn sleep(&mut self, interval: Duration) {
        self.device.lock().tick(interval);
    }
}
