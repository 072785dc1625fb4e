//! NVMe submission queue entries and the command kinds the harness issues.

use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::registry::Priority;

pub const SQ_ENTRY_SIZE: usize = 64;

pub mod opcode {
    pub const ADMIN_DELETE_IO_SQ: u8 = 0x00;
    pub const ADMIN_CREATE_IO_SQ: u8 = 0x01;
    pub const ADMIN_DELETE_IO_CQ: u8 = 0x04;
    pub const ADMIN_CREATE_IO_CQ: u8 = 0x05;
    pub const ADMIN_ABORT: u8 = 0x08;
    pub const ADMIN_SET_FEATURES: u8 = 0x09;
    pub const ADMIN_GET_FEATURES: u8 = 0x0a;
    pub const ADMIN_KEEP_ALIVE: u8 = 0x18;

    pub const NVM_FLUSH: u8 = 0x00;
    pub const NVM_WRITE: u8 = 0x01;
    pub const NVM_READ: u8 = 0x02;
    pub const NVM_COMPARE: u8 = 0x05;
}

/// Feature identifier of the Arbitration feature.
pub const FEATURE_ARBITRATION: u8 = 0x01;

bitflags! {
    /// Control bits carried in CDW12 of NVM read/write/compare commands.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ControlFlags: u32 {
        const FUA = 1 << 30;
        const LIMITED_RETRY = 1 << 31;
    }
}

/// Direction of the data buffer attached to a command, as seen from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDirection {
    None,
    ToDevice,
    FromDevice,
    Bidirectional,
}

/// Logical block addressing for NVM commands. `nlb` is a 1-based block count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Addressing {
    pub nsid: u32,
    pub slba: u64,
    pub nlb: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Read,
    Write,
    Compare,
    Flush,
    CreateIoCq {
        qid: u16,
        size: u32,
        contiguous: bool,
        irq_vector: Option<u16>,
    },
    CreateIoSq {
        qid: u16,
        cq_id: u16,
        size: u32,
        contiguous: bool,
        priority: Priority,
    },
    DeleteIoSq {
        qid: u16,
    },
    DeleteIoCq {
        qid: u16,
    },
    GetFeatures {
        fid: u8,
    },
    SetFeatures {
        fid: u8,
        value: u32,
    },
    Abort {
        sq_id: u16,
        cid: u16,
    },
    KeepAlive,
}

impl CommandKind {
    pub fn opcode(&self) -> u8 {
        match self {
            CommandKind::Read => opcode::NVM_READ,
            CommandKind::Write => opcode::NVM_WRITE,
            CommandKind::Compare => opcode::NVM_COMPARE,
            CommandKind::Flush => opcode::NVM_FLUSH,
            CommandKind::CreateIoCq { .. } => opcode::ADMIN_CREATE_IO_CQ,
            CommandKind::CreateIoSq { .. } => opcode::ADMIN_CREATE_IO_SQ,
            CommandKind::DeleteIoSq { .. } => opcode::ADMIN_DELETE_IO_SQ,
            CommandKind::DeleteIoCq { .. } => opcode::ADMIN_DELETE_IO_CQ,
            CommandKind::GetFeatures { .. } => opcode::ADMIN_GET_FEATURES,
            CommandKind::SetFeatures { .. } => opcode::ADMIN_SET_FEATURES,
            CommandKind::Abort { .. } => opcode::ADMIN_ABORT,
            CommandKind::KeepAlive => opcode::ADMIN_KEEP_ALIVE,
        }
    }

    pub fn is_admin(&self) -> bool {
        !matches!(
            self,
            CommandKind::Read | CommandKind::Write | CommandKind::Compare | CommandKind::Flush
        )
    }

    pub fn direction(&self) -> DataDirection {
        match self {
            CommandKind::Read => DataDirection::FromDevice,
            CommandKind::Write | CommandKind::Compare => DataDirection::ToDevice,
            // The driver maps discontiguous queue memory through the data buffer.
            CommandKind::CreateIoCq { .. } | CommandKind::CreateIoSq { .. } => {
                DataDirection::Bidirectional
            }
            _ => DataDirection::None,
        }
    }
}

/// One command as the harness describes it, before encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub kind: CommandKind,
    pub addressing: Option<Addressing>,
    pub flags: ControlFlags,
}

impl Command {
    pub fn admin(kind: CommandKind) -> Self {
        Command {
            kind,
            addressing: None,
            flags: ControlFlags::empty(),
        }
    }

    pub fn read(nsid: u32, slba: u64, nlb: u32) -> Self {
        Self::nvm(CommandKind::Read, nsid, slba, nlb)
    }

    pub fn write(nsid: u32, slba: u64, nlb: u32) -> Self {
        Self::nvm(CommandKind::Write, nsid, slba, nlb)
    }

    pub fn compare(nsid: u32, slba: u64, nlb: u32) -> Self {
        Self::nvm(CommandKind::Compare, nsid, slba, nlb)
    }

    pub fn flush(nsid: u32) -> Self {
        Command {
            kind: CommandKind::Flush,
            addressing: Some(Addressing {
                nsid,
                slba: 0,
                nlb: 1,
            }),
            flags: ControlFlags::empty(),
        }
    }

    fn nvm(kind: CommandKind, nsid: u32, slba: u64, nlb: u32) -> Self {
        Command {
            kind,
            addressing: Some(Addressing { nsid, slba, nlb }),
            flags: ControlFlags::empty(),
        }
    }

    pub fn with_flags(mut self, flags: ControlFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Encodes the command into a raw submission queue entry.
    ///
    /// The command identifier and PRP fields are left zero; the driver assigns the CID and maps
    /// the data buffer when the entry is submitted.
    pub fn encode(&self) -> Result<SubmissionEntry> {
        let mut sqe = SubmissionEntry {
            opc: self.kind.opcode(),
            ..SubmissionEntry::default()
        };

        match self.kind {
            CommandKind::Read | CommandKind::Write | CommandKind::Compare => {
                let addr = self
                    .addressing
                    .ok_or(Error::InvalidCommand("nvm command without addressing"))?;
                // NLB is 0's based and only 16 bits wide.
                let nlb0 = addr
                    .nlb
                    .checked_sub(1)
                    .filter(|&n| n <= 0xffff)
                    .ok_or(Error::InvalidCommand("nlb must be within 1..=65536"))?;
                sqe.nsid = addr.nsid;
                sqe.cdw10 = addr.slba as u32;
                sqe.cdw11 = (addr.slba >> 32) as u32;
                sqe.cdw12 = nlb0 | self.flags.bits();
            }
            CommandKind::Flush => {
                sqe.nsid = self.addressing.map(|a| a.nsid).unwrap_or(0xffff_ffff);
            }
            CommandKind::CreateIoCq {
                qid,
                size,
                contiguous,
                irq_vector,
            } => {
                sqe.cdw10 = queue_size_field(size)? << 16 | u32::from(qid);
                let ien = irq_vector.is_some();
                sqe.cdw11 = u32::from(irq_vector.unwrap_or(0)) << 16
                    | u32::from(ien) << 1
                    | u32::from(contiguous);
            }
            CommandKind::CreateIoSq {
                qid,
                cq_id,
                size,
                contiguous,
                priority,
            } => {
                sqe.cdw10 = queue_size_field(size)? << 16 | u32::from(qid);
                sqe.cdw11 =
                    u32::from(cq_id) << 16 | priority.qprio() << 1 | u32::from(contiguous);
            }
            CommandKind::DeleteIoSq { qid } | CommandKind::DeleteIoCq { qid } => {
                sqe.cdw10 = u32::from(qid);
            }
            CommandKind::GetFeatures { fid } => {
                sqe.cdw10 = u32::from(fid);
            }
            CommandKind::SetFeatures { fid, value } => {
                sqe.cdw10 = u32::from(fid);
                sqe.cdw11 = value;
            }
            CommandKind::Abort { sq_id, cid } => {
                sqe.cdw10 = u32::from(cid) << 16 | u32::from(sq_id);
            }
            CommandKind::KeepAlive => {}
        }
        Ok(sqe)
    }
}

fn queue_size_field(size: u32) -> Result<u32> {
    size.checked_sub(1)
        .filter(|&n| n <= 0xffff)
        .ok_or(Error::InvalidCommand("queue size must be within 1..=65536"))
}

/// Raw 64-byte submission queue entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmissionEntry {
    pub opc: u8,
    pub psdt: u8,
    pub cid: u16,
    pub nsid: u32,
    pub mptr: u64,
    pub prp1: u64,
    pub prp2: u64,
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
}

impl SubmissionEntry {
    pub fn parse(bytes: &[u8; SQ_ENTRY_SIZE]) -> SubmissionEntry {
        let u32_at = |off: usize| {
            u32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
        };
        let u64_at = |off: usize| u64::from(u32_at(off)) | u64::from(u32_at(off + 4)) << 32;
        let dw0 = u32_at(0);
        SubmissionEntry {
            opc: (dw0 & 0xff) as u8,
            psdt: ((dw0 >> 14) & 0x3) as u8,
            cid: (dw0 >> 16) as u16,
            nsid: u32_at(4),
            mptr: u64_at(16),
            prp1: u64_at(24),
            prp2: u64_at(32),
            cdw10: u32_at(40),
            cdw11: u32_at(44),
            cdw12: u32_at(48),
            cdw13: u32_at(52),
            cdw14: u32_at(56),
            cdw15: u32_at(60),
        }
    }

    pub fn to_bytes(&self) -> [u8; SQ_ENTRY_SIZE] {
        let mut out = [0u8; SQ_ENTRY_SIZE];
        let dw0 =
            u32::from(self.opc) | u32::from(self.psdt & 0x3) << 14 | u32::from(self.cid) << 16;
        out[0..4].copy_from_slice(&dw0.to_le_bytes());
        out[4..8].copy_from_slice(&self.nsid.to_le_bytes());
        out[16..24].copy_from_slice(&self.mptr.to_le_bytes());
        out[24..32].copy_from_slice(&self.prp1.to_le_bytes());
        out[32..40].copy_from_slice(&self.prp2.to_le_bytes());
        out[40..44].copy_from_slice(&self.cdw10.to_le_bytes());
        out[44..48].copy_from_slice(&self.cdw11.to_le_bytes());
        out[48..52].copy_from_slice(&self.cdw12.to_le_bytes());
        out[52..56].copy_from_slice(&self.cdw13.to_le_bytes());
        out[56..60].copy_from_slice(&self.cdw14.to_le_bytes());
        out[60..64].copy_from_slice(&self.cdw15.to_le_bytes());
        out
    }

    pub fn slba(&self) -> u64 {
        u64::from(self.cdw11) << 32 | u64::from(self.cdw10)
    }

    /// 1-based block count decoded from CDW12.
    pub fn nlb(&self) -> u32 {
        (self.cdw12 & 0xffff) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_encodes_zero_based_length_and_flags() {
        let sqe = Command::read(1, 0x1_0000_0010, 8)
            .with_flags(ControlFlags::FUA)
            .encode()
            .unwrap();
        assert_eq!(sqe.opc, opcode::NVM_READ);
        assert_eq!(sqe.nsid, 1);
        assert_eq!(sqe.cdw10, 0x10);
        assert_eq!(sqe.cdw11, 0x1);
        assert_eq!(sqe.cdw12 & 0xffff, 7);
        assert_ne!(sqe.cdw12 & ControlFlags::FUA.bits(), 0);
        assert_eq!(sqe.nlb(), 8);
        assert_eq!(sqe.slba(), 0x1_0000_0010);
    }

    #[test]
    fn zero_block_count_is_rejected() {
        assert!(matches!(
            Command::write(1, 0, 0).encode(),
            Err(Error::InvalidCommand(_))
        ));
        assert!(Command::write(1, 0, 65536).encode().is_ok());
        assert!(Command::write(1, 0, 65537).encode().is_err());
    }

    #[test]
    fn create_queue_commands_pack_cdw10_and_cdw11() {
        let cq = Command::admin(CommandKind::CreateIoCq {
            qid: 3,
            size: 1024,
            contiguous: true,
            irq_vector: Some(3),
        })
        .encode()
        .unwrap();
        assert_eq!(cq.opc, opcode::ADMIN_CREATE_IO_CQ);
        assert_eq!(cq.cdw10, 1023 << 16 | 3);
        assert_eq!(cq.cdw11, 3 << 16 | 1 << 1 | 1);

        let sq = Command::admin(CommandKind::CreateIoSq {
            qid: 4,
            cq_id: 3,
            size: 64,
            contiguous: false,
            priority: Priority::Medium,
        })
        .encode()
        .unwrap();
        assert_eq!(sq.cdw10, 63 << 16 | 4);
        assert_eq!(sq.cdw11, 3 << 16 | 2 << 1);
    }

    #[test]
    fn abort_packs_sqid_and_cid() {
        let sqe = Command::admin(CommandKind::Abort { sq_id: 2, cid: 0x55 })
            .encode()
            .unwrap();
        assert_eq!(sqe.cdw10, 0x55 << 16 | 2);
    }

    #[test]
    fn entry_bytes_parse_back() {
        let mut sqe = Command::compare(7, 42, 4).encode().unwrap();
        sqe.cid = 0xbeef;
        let parsed = SubmissionEntry::parse(&sqe.to_bytes());
        assert_eq!(parsed, sqe);
    }
}
