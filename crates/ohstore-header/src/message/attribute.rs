//! Attribute message: a small named value attached to an object.
//!
//! Layout (version 3): version, flags, name length (with NUL), datatype
//! length, dataspace length, name encoding, name, datatype, dataspace,
//! data length, data. The creation index travels in the message prefix,
//! not in the payload.

use super::{Codec, Dataspace, Reader, Sharing};
use crate::{HeaderError, Result};

const VERSION: u8 = 3;
const NAME_ENCODING_UTF8: u8 = 1;
const FIXED_SIZE: usize = 9 + 4;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Attribute {
    pub sharing: Sharing,
    pub name: String,
    /// Encoded datatype, opaque at this layer
    pub datatype: Vec<u8>,
    /// Inline extent of `data`
    pub dataspace: Dataspace,
    pub data: Vec<u8>,
    /// Position in the owning object's creation order
    pub creation_index: u16,
}

impl Attribute {
    pub fn new(name: &str, datatype: &[u8], dataspace: Dataspace, data: &[u8]) -> Self {
        Self {
            name: name.to_string(),
            datatype: datatype.to_vec(),
            dataspace,
            data: data.to_vec(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Err(HeaderError::Argument(reason));
        if self.name.is_empty() || self.name.contains('\0') {
            return invalid(format!("invalid attribute name {:?}", self.name));
        }
        if self.name.len() + 1 > u16::MAX as usize {
            return invalid(format!("attribute name of {} bytes is too long", self.name.len()));
        }
        if self.datatype.len() > u16::MAX as usize {
            return invalid(format!("datatype of {} bytes is too large", self.datatype.len()));
        }
        if self.dataspace.sharing.is_shared() {
            return invalid("attribute dataspaces are stored inline".into());
        }
        if u32::try_from(self.data.len()).is_err() {
            return invalid(format!("attribute data of {} bytes is too large", self.data.len()));
        }
        self.dataspace.validate()
    }
}

impl Codec for Attribute {
    fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf, "attribute");
        r.version(VERSION)?;
        let _flags = r.u8()?;
        let name_len = r.u16()? as usize;
        let dt_len = r.u16()? as usize;
        let ds_len = r.u16()? as usize;
        if r.u8()? != NAME_ENCODING_UTF8 {
            return Err(r.error("unsupported name encoding"));
        }
        let name = match r.bytes(name_len)?.split_last() {
            Some((0, name)) => String::from_utf8(name.to_vec())
                .map_err(|e| r.error(format!("name is not UTF-8: {}", e)))?,
            _ => return Err(r.error("name is not NUL-terminated")),
        };
        let datatype = r.bytes(dt_len)?.to_vec();
        let dataspace = Dataspace::decode(r.bytes(ds_len)?)?;
        let data_len = r.u32()? as usize;
        let data = r.bytes(data_len)?.to_vec();

        Ok(Self {
            sharing: Sharing::Unshared,
            name,
            datatype,
            dataspace,
            data,
            creation_index: 0,
        })
    }

    fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        self.validate()?;
        out.push(VERSION);
        out.push(0);
        out.extend_from_slice(&((self.name.len() + 1) as u16).to_le_bytes());
        out.extend_from_slice(&(self.datatype.len() as u16).to_le_bytes());
        out.extend_from_slice(&(self.dataspace.raw_size() as u16).to_le_bytes());
        out.push(NAME_ENCODING_UTF8);
        out.extend_from_slice(self.name.as_bytes());
        out.push(0);
        out.extend_from_slice(&self.datatype);
        self.dataspace.encode(out)?;
        out.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.data);
        Ok(())
    }

    fn raw_size(&self) -> usize {
        FIXED_SIZE
            + self.name.len()
            + 1
            + self.datatype.len()
            + self.dataspace.raw_size()
            + self.data.len()
    }
}
