//! Host-side validation engine for NVMe queue pairs driven through a queue-pair kernel driver.
//!
//! The pieces build on each other:
//!
//! - [`QueuePairRegistry`] tracks the admin queue and every I/O queue the harness created.
//! - [`CommandSubmitter`] writes commands into submission queues without ringing doorbells.
//! - [`CompletionReaper`] drains completion queues with a progress-based timeout.
//! - [`ArbitrationVerifier`] checks a completion sequence against Weighted Round Robin with
//!   Urgent Priority Class.
//!
//! [`Harness`] bundles them with a [`QueuePairDriver`] and adds queue lifecycle and feature
//! helpers; [`ArbitrationScenario`] runs a complete arbitration check on top of it.

pub mod arbitration;
pub mod command;
pub mod completion;
pub mod config;
pub mod driver;
pub mod error;
pub mod harness;
pub mod reap;
pub mod registry;
pub mod scenario;
pub mod submit;

#[cfg(test)]
mod proptests;

pub use arbitration::{
    derive_order, verify_sequence, ArbitrationFeature, ArbitrationMismatch, ArbitrationParameters,
    ArbitrationReport, ArbitrationVerifier, ArbitrationWindow, VerifierState, VerifyMode,
};
pub use command::{Command, CommandKind, ControlFlags, DataDirection, SubmissionEntry};
pub use completion::{decode_completions, find_by_cid, CompletionEntry, Status};
pub use config::HarnessConfig;
pub use driver::{DmaBuffer, QueuePairDriver, ReapStatus};
pub use error::{DriverError, Error, Result};
pub use harness::Harness;
pub use reap::{
    CompletionReaper, CompletionStatusError, PollSleep, ReapOutcome, ReapPolicy, ThreadSleep,
};
pub use registry::{Priority, Queue, QueuePairRegistry, QueueRole, ADMIN_QUEUE_ID};
pub use scenario::{ArbitrationScenario, ScenarioQueue, ScenarioReport};
pub use submit::CommandSubmitter;
