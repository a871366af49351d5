//! Remote memory access primitive
//!
//! Every component observes the target process exclusively through
//! [`ProcessMemory`]; nothing assumes direct access, even when the target
//! happens to be the host's own process. Reads are blocking and are never
//! retried: a short or denied read at this layer almost always means the
//! stack or image memory is unmapped or corrupt.

use crate::domain::errors::ReadError;
use crate::domain::types::WordWidth;

/// Read-only view of a target process's address space.
pub trait ProcessMemory {
    /// Read exactly `buf.len()` bytes starting at `addr`.
    ///
    /// # Errors
    /// [`ReadError::Short`] when only a prefix was readable (carrying how
    /// many bytes arrived), [`ReadError::Unmapped`] when none were.
    fn read_exact(&self, addr: u64, buf: &mut [u8]) -> Result<(), ReadError>;

    /// Read a little-endian `u16` at `addr`.
    fn read_u16(&self, addr: u64) -> Result<u16, ReadError> {
        let mut buf = [0u8; 2];
        self.read_exact(addr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    /// Read a little-endian `u32` at `addr`.
    fn read_u32(&self, addr: u64) -> Result<u32, ReadError> {
        let mut buf = [0u8; 4];
        self.read_exact(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Read a little-endian `u64` at `addr`.
    fn read_u64(&self, addr: u64) -> Result<u64, ReadError> {
        let mut buf = [0u8; 8];
        self.read_exact(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Read one pointer-sized word at `addr`, widened to `u64`.
    fn read_word(&self, addr: u64, width: WordWidth) -> Result<u64, ReadError> {
        match width {
            WordWidth::Four => Ok(u64::from(self.read_u32(addr)?)),
            WordWidth::Eight => self.read_u64(addr),
        }
    }
}

/// [`ProcessMemory`] over captured region snapshots.
///
/// Useful when the target's memory has already been dumped (crash capture,
/// minidump-style snapshots) and also serves as the test double for remote
/// reads. Regions must not overlap.
#[derive(Debug, Default)]
pub struct BufferMemory {
    regions: Vec<(u64, Vec<u8>)>,
}

impl BufferMemory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a snapshot of target memory at `base`.
    pub fn add_region(&mut self, base: u64, data: Vec<u8>) {
        self.regions.push((base, data));
        self.regions.sort_by_key(|(b, _)| *b);
    }

    fn region_for(&self, addr: u64) -> Option<(u64, &[u8])> {
        self.regions
            .iter()
            .find(|(base, data)| addr >= *base && addr < base + data.len() as u64)
            .map(|(base, data)| (*base, data.as_slice()))
    }
}

impl ProcessMemory for BufferMemory {
    fn read_exact(&self, addr: u64, buf: &mut [u8]) -> Result<(), ReadError> {
        if buf.is_empty() {
            return Ok(());
        }
        let Some((base, data)) = self.region_for(addr) else {
            return Err(ReadError::Unmapped { addr });
        };
        let offset = (addr - base) as usize;
        let available = data.len() - offset;
        if available < buf.len() {
            // Report how much was actually readable so callers can tell a
            // truncated mapping from no access.
            buf[..available].copy_from_slice(&data[offset..]);
            return Err(ReadError::Short { addr, wanted: buf.len(), got: available });
        }
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
        Ok(())
    }
}
