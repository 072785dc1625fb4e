use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::reap::{
    ReapPolicy, DEFAULT_MAX_BATCH, DEFAULT_NO_PROGRESS_LIMIT, DEFAULT_POLL_INTERVAL,
};
use crate::registry::QueuePairRegistry;

/// Largest queue depth expressible in the 16-bit zero's based QSIZE field.
pub const MAX_QUEUE_DEPTH: u32 = 65536;

/// Harness settings, usually loaded from a JSON file. Missing keys take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    pub poll_interval_us: u64,
    pub no_progress_limit: u32,
    pub log_entries: bool,
    pub max_sq_id: u16,
    pub max_cq_id: u16,
    pub admin_queue_depth: u32,
    pub io_queue_depth: u32,
    pub nsid: u32,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        HarnessConfig {
            poll_interval_us: DEFAULT_POLL_INTERVAL.as_micros() as u64,
            no_progress_limit: DEFAULT_NO_PROGRESS_LIMIT,
            log_entries: true,
            max_sq_id: 64,
            max_cq_id: 64,
            admin_queue_depth: 64,
            io_queue_depth: 1024,
            nsid: 1,
        }
    }
}

impl HarnessConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: HarnessConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&json)?;
        tracing::debug!(path = %path.display(), ?config, "loaded harness config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_sq_id == 0 || self.max_cq_id == 0 {
            return Err(Error::InvalidConfig(
                "max_sq_id and max_cq_id must leave room for at least one I/O queue".into(),
            ));
        }
        for (name, depth) in [
            ("admin_queue_depth", self.admin_queue_depth),
            ("io_queue_depth", self.io_queue_depth),
        ] {
            if !(2..=MAX_QUEUE_DEPTH).contains(&depth) {
                return Err(Error::InvalidConfig(format!(
                    "{name} {depth} outside 2..={MAX_QUEUE_DEPTH}"
                )));
            }
        }
        if self.admin_queue_depth > 4096 {
            return Err(Error::InvalidConfig(format!(
                "admin_queue_depth {} exceeds 4096",
                self.admin_queue_depth
            )));
        }
        if self.nsid == 0 || self.nsid == u32::MAX {
            return Err(Error::InvalidConfig(format!(
                "nsid {:#x} is not a valid namespace",
                self.nsid
            )));
        }
        Ok(())
    }

    pub fn reap_policy(&self) -> ReapPolicy {
        ReapPolicy {
            poll_interval: Duration::from_micros(self.poll_interval_us),
            no_progress_limit: self.no_progress_limit,
            log_entries: self.log_entries,
            max_batch: DEFAULT_MAX_BATCH,
        }
    }

    pub fn registry(&self) -> QueuePairRegistry {
        QueuePairRegistry::new(self.admin_queue_depth, self.max_sq_id, self.max_cq_id)
    }
}
