//! Native (decoded) forms of header messages and their wire codecs.
//!
//! Each payload type implements [`Codec`]; the registry adapts those to the
//! type-erased [`Message`] enum. Wire formats are little-endian and carry a
//! leading version byte.

mod attribute;
mod codec;
mod dataspace;
mod fill;
mod scalar;
pub(crate) mod shared;

pub use attribute::Attribute;
pub use dataspace::{Dataspace, DataspaceKind, UNLIMITED};
pub use fill::{AllocTime, FillTime, FillValue};
pub use scalar::{Comment, ModificationTime, RefCount};

pub(crate) use codec::Reader;

use ohstore_fd::Address;

use crate::registry::MessageType;
use crate::Result;

/// Wire codec of one payload type
pub(crate) trait Codec: Sized {
    fn decode(buf: &[u8]) -> Result<Self>;
    fn encode(&self, out: &mut Vec<u8>) -> Result<()>;
    /// Exact number of bytes `encode` produces
    fn raw_size(&self) -> usize;
}

/// Identifier of a payload stored in the shared heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeapId(pub u64);

impl std::fmt::Display for HeapId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "heap#{}", self.0)
    }
}

/// Where the authoritative copy of a shareable message lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Sharing {
    /// Stored inline in the owning header
    #[default]
    Unshared,
    /// Deduplicated into the shared heap
    Heap(HeapId),
    /// A committed object elsewhere in the container
    Committed(Address),
}

impl Sharing {
    pub fn is_shared(&self) -> bool {
        !matches!(self, Sharing::Unshared)
    }
}

/// A message whose type this library does not understand, kept byte-exact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownMessage {
    /// Type id found in the message prefix
    pub raw_id: u16,
}

/// Decoded form of one header message
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Message {
    /// Free space inside a chunk
    #[default]
    Null,
    Dataspace(Dataspace),
    FillValue(FillValue),
    Attribute(Attribute),
    Comment(Comment),
    ModificationTime(ModificationTime),
    RefCount(RefCount),
    Unknown(UnknownMessage),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Null => MessageType::Null,
            Message::Dataspace(_) => MessageType::Dataspace,
            Message::FillValue(_) => MessageType::FillValue,
            Message::Attribute(_) => MessageType::Attribute,
            Message::Comment(_) => MessageType::Comment,
            Message::ModificationTime(_) => MessageType::ModificationTime,
            Message::RefCount(_) => MessageType::RefCount,
            Message::Unknown(_) => MessageType::Unknown,
        }
    }

    /// Sharing state; always `Unshared` for types that cannot be shared
    pub fn sharing(&self) -> Sharing {
        match self {
            Message::Dataspace(m) => m.sharing,
            Message::FillValue(m) => m.sharing,
            Message::Attribute(m) => m.sharing,
            _ => Sharing::Unshared,
        }
    }

    pub(crate) fn sharing_mut(&mut self) -> Option<&mut Sharing> {
        match self {
            Message::Dataspace(m) => Some(&mut m.sharing),
            Message::FillValue(m) => Some(&mut m.sharing),
            Message::Attribute(m) => Some(&mut m.sharing),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Message::Null)
    }
}

impl From<Dataspace> for Message {
    fn from(m: Dataspace) -> Self {
        Message::Dataspace(m)
    }
}

impl From<FillValue> for Message {
    fn from(m: FillValue) -> Self {
        Message::FillValue(m)
    }
}

impl From<Attribute> for Message {
    fn from(m: Attribute) -> Self {
        Message::Attribute(m)
    }
}

impl From<Comment> for Message {
    fn from(m: Comment) -> Self {
        Message::Comment(m)
    }
}

impl From<ModificationTime> for Message {
    fn from(m: ModificationTime) -> Self {
        Message::ModificationTime(m)
    }
}

impl From<RefCount> for Message {
    fn from(m: RefCount) -> Self {
        Message::RefCount(m)
    }
}
