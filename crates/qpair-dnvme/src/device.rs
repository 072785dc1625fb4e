use std::ffi::c_void;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr;

use qpair_harness::command::{opcode, DataDirection, SQ_ENTRY_SIZE};
use qpair_harness::{DmaBuffer, DriverError, QueuePairDriver, ReapStatus, ADMIN_QUEUE_ID};

use crate::uapi::*;

/// An open dnvme character device (`/dev/nvmeN`).
#[derive(Debug)]
pub struct DnvmeDevice {
    file: File,
    path: PathBuf,
}

fn os_error(op: &'static str, err: io::Error) -> DriverError {
    DriverError::new(op, err.raw_os_error().unwrap_or(libc::EIO), err.to_string())
}

fn dma_direction(direction: DataDirection) -> u32 {
    match direction {
        DataDirection::None => DMA_NONE,
        DataDirection::ToDevice => DMA_TO_DEVICE,
        DataDirection::FromDevice => DMA_FROM_DEVICE,
        DataDirection::Bidirectional => DMA_BIDIRECTIONAL,
    }
}

impl DnvmeDevice {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        tracing::info!(path = %path.display(), "dnvme device opened");
        Ok(DnvmeDevice { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ioctl<T>(&self, op: &'static str, request: u32, arg: &mut T) -> Result<i32, DriverError> {
        // SAFETY: `arg` is a live `repr(C)` value of the layout `request` encodes.
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), request as _, arg as *mut T) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            tracing::debug!(op, request, error = %err, "dnvme ioctl failed");
            return Err(os_error(op, err));
        }
        Ok(ret)
    }

    fn access(
        &self,
        op: &'static str,
        request: u32,
        offset: u32,
        value: &mut u32,
    ) -> Result<(), DriverError> {
        let mut access = NvmeAccess {
            region: NVME_BAR0_BAR1,
            access_type: access_type(offset, 4),
            buffer: (value as *mut u32).cast(),
            bytes: 4,
            offset,
        };
        self.ioctl(op, request, &mut access)?;
        Ok(())
    }
}

impl QueuePairDriver for DnvmeDevice {
    fn prepare_sq(
        &mut self,
        sq_id: u16,
        cq_id: u16,
        elements: u32,
        contiguous: bool,
    ) -> Result<(), DriverError> {
        let mut prep = NvmePrepSq {
            elements,
            sq_id,
            cq_id,
            flags: if contiguous { PREP_CONTIG } else { 0 },
        };
        self.ioctl("prepare_sq", NVME_IOCTL_PREPARE_IOSQ, &mut prep)?;
        Ok(())
    }

    fn prepare_cq(
        &mut self,
        cq_id: u16,
        elements: u32,
        contiguous: bool,
        irq_vector: Option<u16>,
    ) -> Result<(), DriverError> {
        let mut prep = NvmePrepCq {
            elements,
            cq_id,
            cq_irq_en: u8::from(irq_vector.is_some()),
            cq_irq_no: irq_vector.unwrap_or(0),
            flags: if contiguous { PREP_CONTIG } else { 0 },
        };
        self.ioctl("prepare_cq", NVME_IOCTL_PREPARE_IOCQ, &mut prep)?;
        Ok(())
    }

    fn submit_command(
        &mut self,
        sq_id: u16,
        entry: &[u8; SQ_ENTRY_SIZE],
        data: Option<&DmaBuffer>,
        direction: DataDirection,
    ) -> Result<u16, DriverError> {
        let mut raw = *entry;
        let mut cmd = Nvme64bCmd {
            sqid: sq_id,
            cmd_buf_ptr: raw.as_mut_ptr().cast(),
            data_dir: dma_direction(direction),
            ..Nvme64bCmd::default()
        };

        let creates_queue = sq_id == ADMIN_QUEUE_ID
            && matches!(raw[0], opcode::ADMIN_CREATE_IO_SQ | opcode::ADMIN_CREATE_IO_CQ);
        if creates_queue {
            // The driver points PRP1 at the ring it allocated when the queue was prepared.
            cmd.bit_mask = NVME_MASK_PRP1_PAGE;
            cmd.data_dir = DMA_BIDIRECTIONAL;
        }

        // The buffer's allocation never moves; the driver pins the pages until completion.
        let (data_ptr, len) = match data {
            Some(buf) => {
                let mut guard = buf.lock();
                (guard.as_mut_ptr().cast::<c_void>(), guard.len())
            }
            None => (ptr::null_mut(), 0),
        };
        if !data_ptr.is_null() {
            cmd.bit_mask = NVME_MASK_PRP1_PAGE
                | NVME_MASK_PRP1_LIST
                | NVME_MASK_PRP2_PAGE
                | NVME_MASK_PRP2_LIST;
            cmd.data_buf_ptr = data_ptr;
            cmd.data_buf_size = u32::try_from(len).map_err(|_| {
                DriverError::new("submit", libc::EINVAL, format!("{len} byte buffer too large"))
            })?;
        }

        self.ioctl("submit", NVME_IOCTL_SUBMIT_64B_CMD, &mut cmd)?;
        tracing::trace!(sq_id, cid = cmd.cid, opcode = raw[0], "dnvme command submitted");
        Ok(cmd.cid)
    }

    fn ring_doorbell(&mut self, sq_id: u16) -> Result<(), DriverError> {
        // SAFETY: this request takes its argument by value.
        let ret = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                NVME_IOCTL_RING_SQ_DOORBELL as _,
                libc::c_ulong::from(sq_id),
            )
        };
        if ret < 0 {
            return Err(os_error("ring_doorbell", io::Error::last_os_error()));
        }
        Ok(())
    }

    fn reap(
        &mut self,
        cq_id: u16,
        requested: u32,
        buf: &mut [u8],
    ) -> Result<ReapStatus, DriverError> {
        let size = u32::try_from(buf.len())
            .map_err(|_| DriverError::new("reap", libc::EINVAL, "reap buffer too large"))?;
        let mut reap = NvmeReap {
            cqid: cq_id,
            expect: requested,
            remained: 0,
            reaped: 0,
            buf: buf.as_mut_ptr().cast(),
            size,
        };
        self.ioctl("reap", NVME_IOCTL_REAP_CQE, &mut reap)?;
        Ok(ReapStatus {
            reaped: reap.reaped,
            remaining: reap.remained,
            // This driver revision does not report interrupt counts through reap.
            isr_count: 0,
        })
    }

    fn inquiry(&mut self, cq_id: u16) -> Result<u32, DriverError> {
        let mut inq = NvmeInquiry { cqid: cq_id, nr_cqe: 0 };
        self.ioctl("inquiry", NVME_IOCTL_INQUIRY_CQE, &mut inq)?;
        Ok(inq.nr_cqe)
    }

    fn read_register(&mut self, offset: u32) -> Result<u32, DriverError> {
        let mut value = 0u32;
        self.access("read_register", NVME_IOCTL_READ_GENERIC, offset, &mut value)?;
        Ok(value)
    }

    fn write_register(&mut self, offset: u32, value: u32) -> Result<(), DriverError> {
        let mut value = value;
        self.access("write_register", NVME_IOCTL_WRITE_GENERIC, offset, &mut value)
    }
}
