//! In-memory driver.
//!
//! Holds the whole address space in a `Vec<u8>`. Used for scratch containers
//! and for exercising the header layers without touching a file system.

use ohstore_config::log_driver_debug;

use crate::{Address, AddressSpace, FdError, Features, FileDriver, Result};

/// Growable in-memory image with the same address rules as the file drivers
#[derive(Debug, Default)]
pub struct CoreFile {
    image: Vec<u8>,
    space: AddressSpace,
}

impl CoreFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing image, e.g. bytes loaded from elsewhere
    pub fn from_image(image: Vec<u8>) -> Self {
        let eof = image.len() as Address;
        Self {
            image,
            space: AddressSpace::new(eof),
        }
    }

    /// The bytes currently backing the address space
    pub fn image(&self) -> &[u8] {
        &self.image
    }

    pub fn into_image(self) -> Vec<u8> {
        self.image
    }

    fn index(addr: Address) -> Result<usize> {
        usize::try_from(addr).map_err(|_| FdError::Overflow {
            addr,
            size: 0,
            limit: usize::MAX as Address,
        })
    }
}

impl FileDriver for CoreFile {
    fn name(&self) -> &'static str {
        "core"
    }

    fn features(&self) -> Features {
        Features::AGGREGATE_METADATA
            | Features::ACCUMULATE_METADATA
            | Features::DATA_SIEVE
            | Features::AGGREGATE_SMALLDATA
    }

    fn eoa(&self) -> Address {
        self.space.eoa()
    }

    fn set_eoa(&mut self, addr: Address) -> Result<()> {
        self.space.set_eoa(addr)
    }

    fn eof(&self) -> Address {
        self.space.reported_eof()
    }

    fn read(&mut self, addr: Address, buf: &mut [u8]) -> Result<()> {
        self.space.check_region(addr, buf.len())?;
        let start = Self::index(addr)?;

        // Addresses past the image but inside EOA read as zeros
        let available = self.image.len().saturating_sub(start).min(buf.len());
        if available > 0 {
            buf[..available].copy_from_slice(&self.image[start..start + available]);
        }
        buf[available..].fill(0);
        Ok(())
    }

    fn write(&mut self, addr: Address, buf: &[u8]) -> Result<()> {
        self.space.check_region(addr, buf.len())?;
        let start = Self::index(addr)?;
        let end = start + buf.len();

        if end > self.image.len() {
            self.image.resize(end, 0);
        }
        self.image[start..end].copy_from_slice(buf);
        self.space.extend(end as Address);
        Ok(())
    }

    fn truncate(&mut self) -> Result<()> {
        let eoa = Self::index(self.space.eoa())?;
        if eoa != self.image.len() {
            log_driver_debug!("core image resized", from = self.image.len(), to = eoa);
            self.image.resize(eoa, 0);
            self.space.set_physical_eof(eoa as Address);
        }
        Ok(())
    }
}
