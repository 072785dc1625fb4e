use thiserror::Error;

use crate::registry::QueueRole;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure reported by a [`crate::QueuePairDriver`] call.
///
/// `errno` carries the raw OS error for the ioctl backend; emulated drivers use the same
/// values so callers can match on them uniformly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{op} failed (errno {errno}): {detail}")]
pub struct DriverError {
    pub op: &'static str,
    pub errno: i32,
    pub detail: String,
}

impl DriverError {
    pub fn new(op: &'static str, errno: i32, detail: impl Into<String>) -> Self {
        Self {
            op,
            errno,
            detail: detail.into(),
        }
    }
}

/// Unified error type for harness operations.
///
/// Content anomalies (nonzero completion status, arbitration order mismatches) are not
/// represented here: they are accumulated in reports so one run surfaces every anomaly.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid queue: cq_id={cq_id} exceeds maximum {max}")]
    InvalidQueue { cq_id: u16, max: u16 },

    #[error("duplicate {role} id {id}")]
    DuplicateQueueId { role: QueueRole, id: u16 },

    #[error("unknown {role} id {id}")]
    UnknownQueueId { role: QueueRole, id: u16 },

    #[error("invalid command: {0}")]
    InvalidCommand(&'static str),

    #[error("submit to sq {sq_id} rejected (opcode {opcode:#04x}): {source}")]
    SubmitFailed {
        sq_id: u16,
        opcode: u8,
        #[source]
        source: DriverError,
    },

    #[error("doorbell for sq {sq_id} failed: {source}")]
    DoorbellFailed {
        sq_id: u16,
        #[source]
        source: DriverError,
    },

    #[error("reap ioctl on cq {cq_id} failed: {source}")]
    ReapIoctlFailed {
        cq_id: u16,
        #[source]
        source: DriverError,
    },

    #[error("reap timeout: cq_id={cq_id} expected={expected} reaped={reaped}")]
    ReapTimeout {
        cq_id: u16,
        expected: u32,
        reaped: u32,
    },

    #[error("queue preparation for {role} {id} failed: {source}")]
    PrepareFailed {
        role: QueueRole,
        id: u16,
        #[source]
        source: DriverError,
    },

    #[error("admin command {opcode:#04x} completed with status {status:#06x}")]
    AdminCommandFailed { opcode: u8, status: u16 },

    #[error("register access at {offset:#x} failed: {source}")]
    RegisterAccess {
        offset: u32,
        #[source]
        source: DriverError,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("config io error: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),
}

impl Error {
    /// Returns true for failures of the driver/ioctl layer itself.
    ///
    /// Once one of these is seen no later data from the device can be trusted, so callers abort
    /// the enclosing scenario instead of accumulating.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Error::SubmitFailed { .. }
                | Error::DoorbellFailed { .. }
                | Error::ReapIoctlFailed { .. }
                | Error::PrepareFailed { .. }
                | Error::RegisterAccess { .. }
        )
    }
}
