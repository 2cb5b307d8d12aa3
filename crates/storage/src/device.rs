//! Block-device collaborator
//!
//! The core does not mandate a file format; it talks to an opaque device
//! through three primitives. `MemDevice` backs tests and the default
//! engine; a real device adapter lives outside this repository.

use parking_lot::RwLock;
use raleighsl_core::{Errno, RslResult};
use std::collections::HashMap;

/// Opaque page-addressed device
pub trait BlockDevice: Send + Sync {
    /// Read page `page` into `buf`; a missing or short page is an error
    fn read(&self, page: u64, buf: &mut [u8]) -> RslResult<()>;

    /// Write `buf` as page `page`
    fn write(&self, page: u64, buf: &[u8]) -> RslResult<()>;

    /// Durability barrier
    fn sync(&self) -> RslResult<()>;
}

/// In-memory device for tests and single-process runs
#[derive(Default)]
pub struct MemDevice {
    pages: RwLock<HashMap<u64, Vec<u8>>>,
}

impl MemDevice {
    /// Empty device
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pages ever written
    pub fn page_count(&self) -> usize {
        self.pages.read().len()
    }
}

impl BlockDevice for MemDevice {
    fn read(&self, page: u64, buf: &mut [u8]) -> RslResult<()> {
        let pages = self.pages.read();
        let data = pages.get(&page).ok_or(Errno::ObjectNotFound)?;
        if data.len() < buf.len() {
            return Err(Errno::ObjectNotFound);
        }
        buf.copy_from_slice(&data[..buf.len()]);
        Ok(())
    }

    fn write(&self, page: u64, buf: &[u8]) -> RslResult<()> {
        self.pages.write().insert(page, buf.to_vec());
        Ok(())
    }

    fn sync(&self) -> RslResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_round_trip() {
        let dev = MemDevice::new();
        dev.write(7, b"page-seven").unwrap();
        let mut buf = [0u8; 10];
        dev.read(7, &mut buf).unwrap();
        assert_eq!(&buf, b"page-seven");
        assert_eq!(dev.page_count(), 1);
    }

    #[test]
    fn test_missing_page() {
        let dev = MemDevice::new();
        let mut buf = [0u8; 4];
        assert_eq!(dev.read(1, &mut buf), Err(Errno::ObjectNotFound));
    }
}
