use std::collections::HashMap;

use crate::command::Command;
use crate::completion::CompletionEntry;
use crate::driver::{DmaBuffer, QueuePairDriver};
use crate::error::{Error, Result};
use crate::registry::QueuePairRegistry;

#[derive(Debug)]
struct InFlight {
    opcode: u8,
    buffer: Option<DmaBuffer>,
}

/// Writes commands into submission queues and keeps their data buffers alive until completion.
#[derive(Debug, Default)]
pub struct CommandSubmitter {
    in_flight: HashMap<(u16, u16), InFlight>,
}

impl CommandSubmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Submits `command` to `sq_id` and returns the command identifier the driver assigned.
    ///
    /// The doorbell is not rung. Unknown queue ids are passed through to the driver.
    pub fn submit<D: QueuePairDriver + ?Sized>(
        &mut self,
        driver: &mut D,
        registry: &mut QueuePairRegistry,
        sq_id: u16,
        command: &Command,
        buffer: Option<DmaBuffer>,
    ) -> Result<u16> {
        let entry = command.encode()?;
        let opcode = entry.opc;
        let cid = driver
            .submit_command(
                sq_id,
                &entry.to_bytes(),
                buffer.as_ref(),
                command.kind.direction(),
            )
            .map_err(|source| Error::SubmitFailed {
                sq_id,
                opcode,
                source,
            })?;

        registry.note_submitted(sq_id);
        if let Some(stale) = self.in_flight.insert((sq_id, cid), InFlight { opcode, buffer }) {
            tracing::warn!(
                sq_id,
                cid,
                opcode = stale.opcode,
                "command identifier reused while in flight"
            );
        }
        tracing::trace!(sq_id, cid, opcode, "command submitted");
        Ok(cid)
    }

    pub fn ring_doorbell<D: QueuePairDriver + ?Sized>(
        &mut self,
        driver: &mut D,
        sq_id: u16,
    ) -> Result<()> {
        driver
            .ring_doorbell(sq_id)
            .map_err(|source| Error::DoorbellFailed { sq_id, source })?;
        tracing::trace!(sq_id, "doorbell rung");
        Ok(())
    }

    /// Releases the command completed by `entry`, returning its data buffer.
    pub fn retire(
        &mut self,
        registry: &mut QueuePairRegistry,
        entry: &CompletionEntry,
    ) -> Option<DmaBuffer> {
        match self
            .in_flight
            .remove(&(entry.sq_identifier, entry.command_identifier))
        {
            Some(cmd) => {
                registry.note_completed(entry.sq_identifier);
                cmd.buffer
            }
            None => {
                tracing::warn!(
                    sq_id = entry.sq_identifier,
                    cid = entry.command_identifier,
                    "completion for a command that is not in flight"
                );
                None
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn in_flight_on(&self, sq_id: u16) -> usize {
        self.in_flight.keys().filter(|(sq, _)| *sq == sq_id).count()
    }

    /// Forgets every command still in flight on `sq_id`, for use after the queue is deleted.
    pub fn abandon_queue(&mut self, sq_id: u16) -> usize {
        let before = self.in_flight.len();
        self.in_flight.retain(|(sq, _), _| *sq != sq_id);
        before - self.in_flight.len()
    }
}
