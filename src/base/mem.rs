use anyhow::bail;

/// Trait for block-granular backing stores.
pub trait HasMemory {
    fn block_size(&self) -> usize;

    fn read_impl(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), anyhow::Error>;
    fn read_block(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), anyhow::Error> {
        self.check_access(addr, buf.len(), "read")?;
        self.read_impl(addr, buf)
    }

    fn write_impl(&mut self, addr: u64, data: &[u8]) -> Result<(), anyhow::Error>;
    fn write_block(&mut self, addr: u64, data: &[u8]) -> Result<(), anyhow::Error> {
        self.check_access(addr, data.len(), "write")?;
        self.write_impl(addr, data)
    }

    fn check_access(&self, addr: u64, n: usize, what: &str) -> Result<(), anyhow::Error> {
        let block_size = self.block_size();
        // implementors must maintain this themselves
        assert!(block_size.is_power_of_two(), "block size must be a power of two");

        if n != block_size {
            bail!("{} of {} bytes @ {:#x}, expected a whole block of {}", what, n, addr, block_size);
        }
        if addr & (block_size as u64 - 1) != 0 {
            bail!("unaligned block {} @ {:#x}", what, addr);
        }
        Ok(())
    }
}
