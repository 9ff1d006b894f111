//! # ohstore-fd
//!
//! Byte-addressable file drivers for ohstore.
//!
//! Every driver maps a flat logical address space onto a backing store and
//! tracks two markers:
//!
//! - **EOA** (end of allocated address): set by the format layer once it knows
//!   how much space it uses. Transfers past it are rejected.
//! - **EOF** (end of file): the physical high-water mark.
//!
//! ## Drivers
//!
//! - [`DirectFile`]: uncached I/O with block/memory alignment constraints.
//!   Misaligned requests are served through an aligned staging buffer.
//! - [`CoreFile`]: a growable in-memory image with the same address rules.
//!
//! Upper layers program against [`FileDriver`] and never care which one
//! backs a container.

mod aligned;
mod memory;
mod direct;
mod identity;

pub use aligned::AlignedBuf;
pub use memory::CoreFile;
pub use direct::{DirectFile, IoStats};
pub use identity::{cmp_identity, FileId, FileIdentity};

use std::io;

use bitflags::bitflags;
use ohstore_config::ConfigError;
use thiserror::Error;

/// Logical file address
pub type Address = u64;

/// Sentinel for "no address"
pub const UNDEFINED_ADDR: Address = u64::MAX;

/// Largest address a seek offset can represent (signed 64-bit offsets)
pub const MAX_ADDR: Address = i64::MAX as u64;

/// Errors raised by file drivers
#[derive(Error, Debug)]
pub enum FdError {
    #[error("invalid argument: {0}")]
    Argument(String),

    #[error("address overflow: addr={addr}, size={size}, limit={limit}")]
    Overflow { addr: Address, size: u64, limit: Address },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("unable to allocate {size}-byte staging buffer")]
    Allocation { size: usize },

    #[error("file system may not support direct I/O: {0}")]
    DirectIoUnsupported(io::Error),

    #[error("invalid driver configuration: {0}")]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, FdError>;

bitflags! {
    /// How a file is opened
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AccessFlags: u32 {
        const READ_WRITE = 0x01;
        const TRUNCATE = 0x02;
        const EXCLUSIVE = 0x04;
        const CREATE = 0x10;
    }
}

impl AccessFlags {
    pub const READ_ONLY: Self = Self::empty();

    pub fn is_writable(&self) -> bool {
        self.contains(Self::READ_WRITE)
    }
}

bitflags! {
    /// Capabilities a driver advertises to the layers above it
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Features: u32 {
        /// Metadata allocations may be aggregated into larger blocks
        const AGGREGATE_METADATA = 0x01;
        /// Metadata writes may be accumulated before hitting the driver
        const ACCUMULATE_METADATA = 0x02;
        /// Raw data reads and writes may be sieved through a buffer
        const DATA_SIEVE = 0x04;
        /// Small raw data allocations may be aggregated
        const AGGREGATE_SMALLDATA = 0x08;
    }
}

/// Kind of the last transfer, used to decide whether a seek can be skipped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    Unknown,
    Read,
    Write,
}

/// Common interface of every driver
pub trait FileDriver {
    /// Driver name for logging/debugging
    fn name(&self) -> &'static str;

    /// Capability flags
    fn features(&self) -> Features;

    /// End of the allocated address space
    fn eoa(&self) -> Address;

    /// Move the end of the allocated address space
    fn set_eoa(&mut self, addr: Address) -> Result<()>;

    /// `max(eof, eoa)`
    fn eof(&self) -> Address;

    /// Fill `buf` from `addr`; bytes past the physical end read as zero
    fn read(&mut self, addr: Address, buf: &mut [u8]) -> Result<()>;

    /// Write `buf` at `addr`
    fn write(&mut self, addr: Address, buf: &[u8]) -> Result<()>;

    /// Make the physical size match the logical one
    fn truncate(&mut self) -> Result<()>;
}

/// EOA/EOF bookkeeping shared by all drivers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddressSpace {
    eoa: Address,
    eof: Address,
}

impl AddressSpace {
    /// Fresh tracker for a store whose physical size is `eof`
    pub fn new(eof: Address) -> Self {
        Self { eoa: 0, eof }
    }

    pub fn eoa(&self) -> Address {
        self.eoa
    }

    pub fn set_eoa(&mut self, addr: Address) -> Result<()> {
        if addr == UNDEFINED_ADDR || addr > MAX_ADDR {
            return Err(FdError::Overflow {
                addr,
                size: 0,
                limit: MAX_ADDR,
            });
        }
        self.eoa = addr;
        Ok(())
    }

    /// Physical high-water mark as last observed
    pub fn physical_eof(&self) -> Address {
        self.eof
    }

    pub fn set_physical_eof(&mut self, eof: Address) {
        self.eof = eof;
    }

    /// Raise the physical mark after a write ending at `end`
    pub fn extend(&mut self, end: Address) {
        if end > self.eof {
            self.eof = end;
        }
    }

    /// What `get_eof` reports: the larger of both markers
    pub fn reported_eof(&self) -> Address {
        self.eof.max(self.eoa)
    }

    /// Validate a transfer of `size` bytes at `addr`
    pub fn check_region(&self, addr: Address, size: usize) -> Result<()> {
        if addr == UNDEFINED_ADDR {
            return Err(FdError::Argument("address is undefined".into()));
        }
        let size = size as u64;
        let end = match addr.checked_add(size) {
            Some(end) if addr <= MAX_ADDR && size <= MAX_ADDR && end <= MAX_ADDR => end,
            _ => {
                return Err(FdError::Overflow {
                    addr,
                    size,
                    limit: MAX_ADDR,
                })
            }
        };
        if end > self.eoa {
            return Err(FdError::Overflow {
                addr,
                size,
                limit: self.eoa,
            });
        }
        Ok(())
    }
}
