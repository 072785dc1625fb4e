//! Userspace ABI of the dnvme character device.
//!
//! Layouts mirror the driver's uapi header; every struct is passed by pointer to `ioctl`.

use std::ffi::c_void;
use std::mem::size_of;
use std::ptr;

const DNVME_MAGIC: u32 = b'N' as u32;

const fn _iow(ty: u32, nr: u32, sz: usize) -> u32 {
    (1 << 30) | ((sz as u32) << 16) | (ty << 8) | nr
}

const fn _iowr(ty: u32, nr: u32, sz: usize) -> u32 {
    (3 << 30) | ((sz as u32) << 16) | (ty << 8) | nr
}

// Command numbers, in driver enum order.
const NVME_READ_GENERIC: u32 = 0;
const NVME_WRITE_GENERIC: u32 = 1;
const NVME_SUBMIT_64B_CMD: u32 = 7;
const NVME_PREPARE_IOSQ: u32 = 9;
const NVME_PREPARE_IOCQ: u32 = 10;
const NVME_RING_SQ_DOORBELL: u32 = 11;
const NVME_INQUIRY_CQE: u32 = 12;
const NVME_REAP_CQE: u32 = 13;

pub const NVME_IOCTL_READ_GENERIC: u32 =
    _iowr(DNVME_MAGIC, NVME_READ_GENERIC, size_of::<NvmeAccess>());
pub const NVME_IOCTL_WRITE_GENERIC: u32 =
    _iowr(DNVME_MAGIC, NVME_WRITE_GENERIC, size_of::<NvmeAccess>());
pub const NVME_IOCTL_SUBMIT_64B_CMD: u32 =
    _iowr(DNVME_MAGIC, NVME_SUBMIT_64B_CMD, size_of::<Nvme64bCmd>());
pub const NVME_IOCTL_PREPARE_IOSQ: u32 =
    _iowr(DNVME_MAGIC, NVME_PREPARE_IOSQ, size_of::<NvmePrepSq>());
pub const NVME_IOCTL_PREPARE_IOCQ: u32 =
    _iowr(DNVME_MAGIC, NVME_PREPARE_IOCQ, size_of::<NvmePrepCq>());
/// Takes the SQ id by value, not by pointer.
pub const NVME_IOCTL_RING_SQ_DOORBELL: u32 =
    _iow(DNVME_MAGIC, NVME_RING_SQ_DOORBELL, size_of::<u16>());
pub const NVME_IOCTL_INQUIRY_CQE: u32 =
    _iowr(DNVME_MAGIC, NVME_INQUIRY_CQE, size_of::<NvmeInquiry>());
pub const NVME_IOCTL_REAP_CQE: u32 = _iowr(DNVME_MAGIC, NVME_REAP_CQE, size_of::<NvmeReap>());

// enum nvme_region
pub const NVME_PCI_CONFIG: u32 = 0;
pub const NVME_BAR0_BAR1: u32 = 1;

// enum nvme_access_type
pub const NVME_ACCESS_BYTE: u32 = 0;
pub const NVME_ACCESS_WORD: u32 = 1;
pub const NVME_ACCESS_DWORD: u32 = 2;
pub const NVME_ACCESS_QWORD: u32 = 3;

// enum nvme_64b_cmd_mask
pub const NVME_MASK_PRP1_PAGE: u32 = 1 << 0;
pub const NVME_MASK_PRP1_LIST: u32 = 1 << 1;
pub const NVME_MASK_PRP2_PAGE: u32 = 1 << 2;
pub const NVME_MASK_PRP2_LIST: u32 = 1 << 3;
pub const NVME_MASK_MPTR: u32 = 1 << 4;

// enum dma_data_direction
pub const DMA_BIDIRECTIONAL: u32 = 0;
pub const DMA_TO_DEVICE: u32 = 1;
pub const DMA_FROM_DEVICE: u32 = 2;
pub const DMA_NONE: u32 = 3;

// Bitfield words.
pub const PREP_CONTIG: u32 = 1 << 0;
pub const PREP_USE_CMB: u32 = 1 << 1;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct NvmeAccess {
    pub region: u32,
    pub access_type: u32,
    pub buffer: *mut u8,
    pub bytes: u32,
    pub offset: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NvmePrepSq {
    pub elements: u32,
    pub sq_id: u16,
    pub cq_id: u16,
    /// `contig:1, use_cmb:1`
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NvmePrepCq {
    pub elements: u32,
    pub cq_id: u16,
    pub cq_irq_en: u8,
    pub cq_irq_no: u16,
    /// `contig:1, use_cmb:1`
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Nvme64bCmd {
    pub sqid: u16,
    /// Filled in by the driver.
    pub cid: u16,
    pub cmd_buf_ptr: *mut c_void,
    pub bit_mask: u32,
    pub data_buf_ptr: *mut c_void,
    pub data_buf_size: u32,
    pub data_dir: u32,
    pub meta_id: u32,
    /// `use_bit_bucket:1, use_user_cid:1, use_user_meta:1, use_user_prp:1`
    pub flags: u32,
    pub nr_bit_bucket: u32,
    pub bit_bucket: *mut c_void,
}

impl Default for Nvme64bCmd {
    fn default() -> Self {
        Nvme64bCmd {
            sqid: 0,
            cid: 0,
            cmd_buf_ptr: ptr::null_mut(),
            bit_mask: 0,
            data_buf_ptr: ptr::null_mut(),
            data_buf_size: 0,
            data_dir: DMA_NONE,
            meta_id: 0,
            flags: 0,
            nr_bit_bucket: 0,
            bit_bucket: ptr::null_mut(),
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NvmeInquiry {
    pub cqid: u16,
    pub nr_cqe: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct NvmeReap {
    pub cqid: u16,
    pub expect: u32,
    pub remained: u32,
    pub reaped: u32,
    pub buf: *mut c_void,
    pub size: u32,
}

/// Access width the driver should use for a register window.
pub fn access_type(offset: u32, len: u32) -> u32 {
    match len {
        8 if offset % 8 == 0 => NVME_ACCESS_QWORD,
        4 if offset % 4 == 0 => NVME_ACCESS_DWORD,
        2 if offset % 2 == 0 => NVME_ACCESS_WORD,
        _ => NVME_ACCESS_BYTE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_size_requests() {
        assert_eq!(NVME_IOCTL_RING_SQ_DOORBELL, 0x4002_4e0b);
        assert_eq!(NVME_IOCTL_INQUIRY_CQE, 0xc008_4e0c);
        assert_eq!(NVME_IOCTL_PREPARE_IOSQ, 0xc00c_4e09);
        assert_eq!(NVME_IOCTL_PREPARE_IOCQ, 0xc010_4e0a);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn pointer_carrying_requests_on_64_bit() {
        assert_eq!(size_of::<Nvme64bCmd>(), 64);
        assert_eq!(size_of::<NvmeReap>(), 32);
        assert_eq!(size_of::<NvmeAccess>(), 24);
        assert_eq!(NVME_IOCTL_SUBMIT_64B_CMD, 0xc040_4e07);
        assert_eq!(NVME_IOCTL_REAP_CQE, 0xc020_4e0d);
        assert_eq!(NVME_IOCTL_READ_GENERIC, 0xc018_4e00);
        assert_eq!(NVME_IOCTL_WRITE_GENERIC, 0xc018_4e01);
    }

    #[test]
    fn access_width_follows_alignment() {
        assert_eq!(access_type(0x14, 4), NVME_ACCESS_DWORD);
        assert_eq!(access_type(0x00, 8), NVME_ACCESS_QWORD);
        assert_eq!(access_type(0x04, 8), NVME_ACCESS_BYTE);
        assert_eq!(access_type(0x02, 2), NVME_ACCESS_WORD);
    }
}
