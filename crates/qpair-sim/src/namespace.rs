/// In-memory namespace backing NVM commands.
#[derive(Debug, Clone)]
pub(crate) struct Namespace {
    block_size: usize,
    data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OutOfRange;

impl Namespace {
    pub fn new(blocks: u64, block_size: usize) -> Self {
        Namespace {
            block_size,
            data: vec![0u8; blocks as usize * block_size],
        }
    }

    pub fn blocks(&self) -> u64 {
        (self.data.len() / self.block_size) as u64
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    fn range(&self, slba: u64, nlb: u32) -> Result<std::ops::Range<usize>, OutOfRange> {
        let end = slba.checked_add(u64::from(nlb)).ok_or(OutOfRange)?;
        if end > self.blocks() {
            return Err(OutOfRange);
        }
        Ok(slba as usize * self.block_size..end as usize * self.block_size)
    }

    /// Copies blocks into `dst`, truncated to its length.
    pub fn read(&self, slba: u64, nlb: u32, dst: &mut [u8]) -> Result<(), OutOfRange> {
        let src = &self.data[self.range(slba, nlb)?];
        let n = src.len().min(dst.len());
        dst[..n].copy_from_slice(&src[..n]);
        Ok(())
    }

    /// Writes blocks from `src`; bytes beyond its length are zero filled.
    pub fn write(&mut self, slba: u64, nlb: u32, src: &[u8]) -> Result<(), OutOfRange> {
        let range = self.range(slba, nlb)?;
        let dst = &mut self.data[range];
        let n = src.len().min(dst.len());
        dst[..n].copy_from_slice(&src[..n]);
        dst[n..].fill(0);
        Ok(())
    }

    pub fn compare(&self, slba: u64, nlb: u32, other: &[u8]) -> Result<bool, OutOfRange> {
        let src = &self.data[self.range(slba, nlb)?];
        let n = src.len().min(other.len());
        Ok(src[..n] == other[..n])
    }
}
