//! Decoding of 16-byte completion queue entries.

use std::fmt;

use serde::Serialize;

pub const CQ_ENTRY_SIZE: usize = 16;

/// NVMe status field (the completion status halfword without the phase tag).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Status {
    pub sct: u8,
    pub sc: u8,
    pub crd: u8,
    pub more: bool,
    pub dnr: bool,
}

impl Status {
    pub const SUCCESS: Status = Status::generic(0x00);
    pub const INVALID_OPCODE: Status = Status::generic(0x01);
    pub const INVALID_FIELD: Status = Status::generic(0x02);
    pub const ABORTED_BY_REQUEST: Status = Status::generic(0x07);
    pub const ABORTED_SQ_DELETION: Status = Status::generic(0x08);
    pub const INVALID_NAMESPACE: Status = Status::generic(0x0b);
    pub const LBA_OUT_OF_RANGE: Status = Status::generic(0x80);

    pub const INVALID_CQ: Status = Status::command_specific(0x00);
    pub const INVALID_QUEUE_ID: Status = Status::command_specific(0x01);
    pub const INVALID_QUEUE_SIZE: Status = Status::command_specific(0x02);
    pub const INVALID_INTERRUPT_VECTOR: Status = Status::command_specific(0x08);
    pub const INVALID_QUEUE_DELETION: Status = Status::command_specific(0x0c);
    pub const COMPARE_FAILURE: Status = Status {
        sct: 0x2,
        sc: 0x85,
        crd: 0,
        more: false,
        dnr: false,
    };

    pub const fn generic(sc: u8) -> Status {
        Status {
            sct: 0,
            sc,
            crd: 0,
            more: false,
            dnr: false,
        }
    }

    pub const fn command_specific(sc: u8) -> Status {
        Status {
            sct: 1,
            sc,
            crd: 0,
            more: false,
            dnr: false,
        }
    }

    pub fn with_dnr(mut self) -> Status {
        self.dnr = true;
        self
    }

    /// Decodes the 15-bit status field (status halfword shifted right past the phase tag).
    pub fn from_field(field: u16) -> Status {
        Status {
            sc: (field & 0xff) as u8,
            sct: ((field >> 8) & 0x7) as u8,
            crd: ((field >> 11) & 0x3) as u8,
            more: field & (1 << 13) != 0,
            dnr: field & (1 << 14) != 0,
        }
    }

    pub fn to_field(self) -> u16 {
        u16::from(self.sc)
            | u16::from(self.sct & 0x7) << 8
            | u16::from(self.crd & 0x3) << 11
            | u16::from(self.more) << 13
            | u16::from(self.dnr) << 14
    }

    pub fn is_success(&self) -> bool {
        self.sct == 0 && self.sc == 0
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sct={:#x} sc={:#04x}", self.sct, self.sc)?;
        if self.dnr {
            write!(f, " dnr")?;
        }
        if self.more {
            write!(f, " more")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionEntry {
    pub command_identifier: u16,
    /// DW0, command specific.
    pub result: u32,
    pub phase_bit: bool,
    pub sq_head_pointer: u16,
    pub sq_identifier: u16,
    /// Status halfword bits 15:1. Zero means success.
    pub status_field: u16,
}

impl CompletionEntry {
    pub fn decode(raw: &[u8; CQ_ENTRY_SIZE]) -> CompletionEntry {
        let dw = |i: usize| {
            u32::from_le_bytes([raw[i * 4], raw[i * 4 + 1], raw[i * 4 + 2], raw[i * 4 + 3]])
        };
        let dw2 = dw(2);
        let dw3 = dw(3);
        let status = (dw3 >> 16) as u16;
        CompletionEntry {
            command_identifier: (dw3 & 0xffff) as u16,
            result: dw(0),
            phase_bit: status & 1 != 0,
            sq_head_pointer: (dw2 & 0xffff) as u16,
            sq_identifier: (dw2 >> 16) as u16,
            status_field: status >> 1,
        }
    }

    pub fn encode(&self) -> [u8; CQ_ENTRY_SIZE] {
        let mut out = [0u8; CQ_ENTRY_SIZE];
        let dw2 = u32::from(self.sq_head_pointer) | u32::from(self.sq_identifier) << 16;
        let status = (self.status_field & 0x7fff) << 1 | u16::from(self.phase_bit);
        let dw3 = u32::from(self.command_identifier) | u32::from(status) << 16;
        out[0..4].copy_from_slice(&self.result.to_le_bytes());
        out[8..12].copy_from_slice(&dw2.to_le_bytes());
        out[12..16].copy_from_slice(&dw3.to_le_bytes());
        out
    }

    pub fn status(&self) -> Status {
        Status::from_field(self.status_field)
    }

    pub fn is_success(&self) -> bool {
        self.status_field == 0
    }

    /// Checks that this entry completes `cid` from `sq_id` with `expected` status.
    pub fn check(&self, sq_id: u16, cid: u16, expected: Status) -> bool {
        let ok = self.sq_identifier == sq_id
            && self.command_identifier == cid
            && self.status() == expected;
        if !ok {
            tracing::warn!(
                sq_id = self.sq_identifier,
                cid = self.command_identifier,
                status = %self.status(),
                expected_sq = sq_id,
                expected_cid = cid,
                expected_status = %expected,
                "completion does not match"
            );
        }
        ok
    }
}

/// Decodes every whole record in `raw`. Trailing partial records are ignored.
pub fn decode_completions(raw: &[u8]) -> Vec<CompletionEntry> {
    raw.chunks_exact(CQ_ENTRY_SIZE)
        .map(|chunk| {
            let mut rec = [0u8; CQ_ENTRY_SIZE];
            rec.copy_from_slice(chunk);
            CompletionEntry::decode(&rec)
        })
        .collect()
}

pub fn find_by_cid(entries: &[CompletionEntry], sq_id: u16, cid: u16) -> Option<&CompletionEntry> {
    entries
        .iter()
        .find(|e| e.sq_identifier == sq_id && e.command_identifier == cid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_entry(cid: u16, sqid: u16, sqhd: u16, status: u16, dw0: u32) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..4].copy_from_slice(&dw0.to_le_bytes());
        out[8..12].copy_from_slice(&(u32::from(sqid) << 16 | u32::from(sqhd)).to_le_bytes());
        out[12..16].copy_from_slice(&(u32::from(status) << 16 | u32::from(cid)).to_le_bytes());
        out
    }

    #[test]
    fn decode_splits_phase_from_status() {
        // Phase set, SCT=1 SC=0x0c, DNR.
        let status = (1u16 << 15) | (1 << 9) | (0x0c << 1) | 1;
        let e = CompletionEntry::decode(&raw_entry(0x1234, 3, 7, status, 0xdead_beef));
        assert_eq!(e.command_identifier, 0x1234);
        assert_eq!(e.sq_identifier, 3);
        assert_eq!(e.sq_head_pointer, 7);
        assert_eq!(e.result, 0xdead_beef);
        assert!(e.phase_bit);
        assert!(!e.is_success());
        assert_eq!(e.status(), Status::INVALID_QUEUE_DELETION.with_dnr());
    }

    #[test]
    fn clean_entry_with_phase_is_success() {
        let e = CompletionEntry::decode(&raw_entry(1, 1, 0, 1, 0));
        assert!(e.phase_bit);
        assert!(e.is_success());
        assert!(e.check(1, 1, Status::SUCCESS));
        assert!(!e.check(1, 2, Status::SUCCESS));
    }

    #[test]
    fn decode_ignores_partial_trailing_record() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&raw_entry(1, 1, 0, 1, 0));
        raw.extend_from_slice(&raw_entry(2, 2, 0, 1, 0));
        raw.extend_from_slice(&[0u8; 5]);
        let entries = decode_completions(&raw);
        assert_eq!(entries.len(), 2);
        assert_eq!(find_by_cid(&entries, 2, 2).map(|e| e.command_identifier), Some(2));
        assert!(find_by_cid(&entries, 1, 2).is_none());
    }

    #[test]
    fn status_field_layout() {
        let s = Status {
            sct: 2,
            sc: 0x85,
            crd: 1,
            more: true,
            dnr: false,
        };
        assert_eq!(Status::from_field(s.to_field()), s);
        assert_eq!(Status::COMPARE_FAILURE.to_field(), 0x285);
    }
}
