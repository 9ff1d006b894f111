//! Small fixed-layout messages.

use super::{Codec, Reader};
use crate::{HeaderError, Result};

/// Free-form object comment, stored NUL-terminated
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Comment {
    pub text: String,
}

impl Comment {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
        }
    }
}

impl Codec for Comment {
    fn decode(buf: &[u8]) -> Result<Self> {
        let r = Reader::new(buf, "comment");
        let end = buf
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| r.error("missing NUL terminator"))?;
        let text = std::str::from_utf8(&buf[..end])
            .map_err(|e| r.error(format!("not UTF-8: {}", e)))?;
        Ok(Self::new(text))
    }

    fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        if self.text.contains('\0') {
            return Err(HeaderError::Argument("comment contains a NUL byte".into()));
        }
        out.extend_from_slice(self.text.as_bytes());
        out.push(0);
        Ok(())
    }

    fn raw_size(&self) -> usize {
        self.text.len() + 1
    }
}

/// Object modification time in seconds since the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModificationTime {
    pub seconds: u32,
}

impl ModificationTime {
    const VERSION: u8 = 1;
}

impl Codec for ModificationTime {
    fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf, "modification time");
        r.version(Self::VERSION)?;
        r.bytes(3)?;
        Ok(Self { seconds: r.u32()? })
    }

    fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&[Self::VERSION, 0, 0, 0]);
        out.extend_from_slice(&self.seconds.to_le_bytes());
        Ok(())
    }

    fn raw_size(&self) -> usize {
        8
    }
}

/// Number of hard links to the object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RefCount {
    pub count: u32,
}

impl RefCount {
    const VERSION: u8 = 0;
}

impl Codec for RefCount {
    fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf, "reference count");
        r.version(Self::VERSION)?;
        Ok(Self { count: r.u32()? })
    }

    fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        out.push(Self::VERSION);
        out.extend_from_slice(&self.count.to_le_bytes());
        Ok(())
    }

    fn raw_size(&self) -> usize {
        5
    }
}
