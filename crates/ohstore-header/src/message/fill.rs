//! Fill value message: what unwritten elements read back as.

use super::{Codec, Reader, Sharing};
use crate::{HeaderError, Result};

const VERSION: u8 = 3;
const ALLOC_TIME_MASK: u8 = 0x03;
const FILL_TIME_SHIFT: u8 = 2;
const FILL_TIME_MASK: u8 = 0x03;
const FLAG_DEFINED: u8 = 0x20;
const KNOWN_FLAGS: u8 = ALLOC_TIME_MASK | (FILL_TIME_MASK << FILL_TIME_SHIFT) | FLAG_DEFINED;

/// When storage is allocated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocTime {
    Early = 1,
    #[default]
    Late = 2,
    Incremental = 3,
}

/// When the fill value is written into new storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FillTime {
    Alloc = 0,
    Never = 1,
    #[default]
    IfSet = 2,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FillValue {
    pub sharing: Sharing,
    pub alloc_time: AllocTime,
    pub fill_time: FillTime,
    /// `None` when no fill value is defined
    pub value: Option<Vec<u8>>,
}

impl FillValue {
    pub fn defined(value: &[u8]) -> Self {
        Self {
            value: Some(value.to_vec()),
            ..Self::default()
        }
    }
}

impl Codec for FillValue {
    fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf, "fill value");
        r.version(VERSION)?;
        let flags = r.u8()?;
        if flags & !KNOWN_FLAGS != 0 {
            return Err(r.error(format!("reserved flag bits set: {:#04x}", flags)));
        }
        let alloc_time = match flags & ALLOC_TIME_MASK {
            1 => AllocTime::Early,
            2 => AllocTime::Late,
            3 => AllocTime::Incremental,
            other => return Err(r.error(format!("bad allocation time {}", other))),
        };
        let fill_time = match (flags >> FILL_TIME_SHIFT) & FILL_TIME_MASK {
            0 => FillTime::Alloc,
            1 => FillTime::Never,
            2 => FillTime::IfSet,
            other => return Err(r.error(format!("bad fill time {}", other))),
        };
        let value = if flags & FLAG_DEFINED != 0 {
            let len = r.u32()? as usize;
            Some(r.bytes(len)?.to_vec())
        } else {
            None
        };
        Ok(Self {
            sharing: Sharing::Unshared,
            alloc_time,
            fill_time,
            value,
        })
    }

    fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        let mut flags = self.alloc_time as u8 | ((self.fill_time as u8) << FILL_TIME_SHIFT);
        if self.value.is_some() {
            flags |= FLAG_DEFINED;
        }
        out.push(VERSION);
        out.push(flags);
        if let Some(value) = &self.value {
            let len = u32::try_from(value.len()).map_err(|_| {
                HeaderError::Argument(format!("fill value of {} bytes is too large", value.len()))
            })?;
            out.extend_from_slice(&len.to_le_bytes());
            out.extend_from_slice(value);
        }
        Ok(())
    }

    fn raw_size(&self) -> usize {
        2 + self.value.as_ref().map_or(0, |v| 4 + v.len())
    }
}
