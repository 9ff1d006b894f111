//! Message type registry.
//!
//! Every [`MessageType`] maps to exactly one static [`MessageClass`]: a
//! record of codec and sharing callbacks. Generic operations look the class
//! up and dispatch through it instead of matching on payloads, so the header
//! layers never need to know what a message contains.

use bitflags::bitflags;
use ohstore_fd::Address;

use crate::message::{
    shared, Attribute, Codec, Comment, Dataspace, FillValue, Message, ModificationTime, RefCount,
    Sharing,
};
use crate::share::SharedMessageIndex;
use crate::{HeaderError, Result};

/// Message type, keyed by the id stored in message prefixes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageType {
    Null = 0,
    Dataspace,
    FillValue,
    Attribute,
    Comment,
    ModificationTime,
    RefCount,
    /// Anything this library cannot interpret
    Unknown,
}

impl MessageType {
    pub const ALL: [MessageType; 8] = [
        MessageType::Null,
        MessageType::Dataspace,
        MessageType::FillValue,
        MessageType::Attribute,
        MessageType::Comment,
        MessageType::ModificationTime,
        MessageType::RefCount,
        MessageType::Unknown,
    ];

    /// On-disk type id
    pub fn id(self) -> u16 {
        match self {
            MessageType::Null => 0x00,
            MessageType::Dataspace => 0x01,
            MessageType::FillValue => 0x05,
            MessageType::Attribute => 0x0C,
            MessageType::Comment => 0x0D,
            MessageType::ModificationTime => 0x12,
            MessageType::RefCount => 0x16,
            MessageType::Unknown => 0x17,
        }
    }

    /// Map an on-disk id; ids without a class become `Unknown`
    pub fn from_id(id: u16) -> Self {
        Self::ALL
            .into_iter()
            .find(|t| *t != MessageType::Unknown && t.id() == id)
            .unwrap_or(MessageType::Unknown)
    }

    pub fn name(self) -> &'static str {
        self.class().name
    }

    /// Inverse of [`name`](Self::name), used for configuration
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.name() == name)
    }

    pub fn class(self) -> &'static MessageClass {
        &CLASSES[self as usize]
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

bitflags! {
    /// Static sharing capabilities of a message class
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShareFlags: u8 {
        /// Payloads may move to the shared heap
        const IS_SHARABLE = 0x01;
        /// Payloads may be tracked by the index while staying in the header
        const IN_HEADER = 0x02;
    }
}

pub type DecodeFn = fn(&[u8]) -> Result<Message>;
pub type EncodeFn = fn(&Message, &mut Vec<u8>) -> Result<()>;
pub type SizeFn = fn(&Message) -> usize;
pub type LinkFn = fn(&mut dyn SharedMessageIndex, &Message) -> Result<()>;
pub type DeleteFn = fn(&mut dyn SharedMessageIndex, Option<Address>, &Message) -> Result<()>;

/// Callbacks for one message type
pub struct MessageClass {
    pub msg_type: MessageType,
    pub name: &'static str,
    pub share_flags: ShareFlags,
    pub decode: DecodeFn,
    pub encode: EncodeFn,
    /// Size of the unshared encoding
    pub raw_size: SizeFn,
    /// Release payload contents, leaving an empty native of the same type
    pub reset: fn(&mut Message),
    pub can_share: Option<fn(&Message) -> bool>,
    pub get_crt_index: Option<fn(&Message) -> u16>,
    pub set_crt_index: Option<fn(&mut Message, u16)>,
    /// Take another reference on whatever the message points at
    pub link: Option<LinkFn>,
    /// Drop the references the message holds, before its slot is freed
    pub delete: Option<DeleteFn>,
}

impl std::fmt::Debug for MessageClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageClass")
            .field("name", &self.name)
            .field("share_flags", &self.share_flags)
            .finish()
    }
}

fn mismatch(expected: MessageType, found: &Message) -> HeaderError {
    HeaderError::Argument(format!(
        "{} class invoked on a {} message",
        expected,
        found.message_type()
    ))
}

// Adapters from the typed codecs to the type-erased callback signatures.
macro_rules! payload_class_fns {
    ($variant:ident, $ty:ty, $decode:ident, $encode:ident, $size:ident, $reset:ident) => {
        fn $decode(buf: &[u8]) -> Result<Message> {
            <$ty as Codec>::decode(buf).map(Message::$variant)
        }

        fn $encode(msg: &Message, out: &mut Vec<u8>) -> Result<()> {
            match msg {
                Message::$variant(m) => m.encode(out),
                other => Err(mismatch(MessageType::$variant, other)),
            }
        }

        fn $size(msg: &Message) -> usize {
            match msg {
                Message::$variant(m) => m.raw_size(),
                _ => 0,
            }
        }

        fn $reset(msg: &mut Message) {
            *msg = Message::$variant(<$ty>::default());
        }
    };
}

payload_class_fns!(Dataspace, Dataspace, dataspace_decode, dataspace_encode, dataspace_size, dataspace_reset);
payload_class_fns!(FillValue, FillValue, fill_decode, fill_encode, fill_size, fill_reset);
payload_class_fns!(Attribute, Attribute, attr_decode, attr_encode, attr_size, attr_reset);
payload_class_fns!(Comment, Comment, comment_decode, comment_encode, comment_size, comment_reset);
payload_class_fns!(ModificationTime, ModificationTime, mtime_decode, mtime_encode, mtime_size, mtime_reset);
payload_class_fns!(RefCount, RefCount, refcount_decode, refcount_encode, refcount_size, refcount_reset);

fn null_decode(_buf: &[u8]) -> Result<Message> {
    Ok(Message::Null)
}

fn null_encode(_msg: &Message, _out: &mut Vec<u8>) -> Result<()> {
    Ok(())
}

fn no_size(_msg: &Message) -> usize {
    0
}

fn null_reset(msg: &mut Message) {
    *msg = Message::Null;
}

fn unknown_decode(_buf: &[u8]) -> Result<Message> {
    Err(HeaderError::Decode {
        what: "unknown",
        reason: "unknown messages keep their raw bytes".into(),
    })
}

fn unknown_encode(_msg: &Message, _out: &mut Vec<u8>) -> Result<()> {
    Err(HeaderError::Argument("unknown messages cannot be encoded".into()))
}

fn unknown_reset(_msg: &mut Message) {}

/// Committed messages are owned by their object and never re-shared
fn shareable_unless_committed(msg: &Message) -> bool {
    !matches!(msg.sharing(), Sharing::Committed(_))
}

fn attr_get_crt_index(msg: &Message) -> u16 {
    match msg {
        Message::Attribute(a) => a.creation_index,
        _ => 0,
    }
}

fn attr_set_crt_index(msg: &mut Message, idx: u16) {
    if let Message::Attribute(a) = msg {
        a.creation_index = idx;
    }
}

fn shared_link(index: &mut dyn SharedMessageIndex, msg: &Message) -> Result<()> {
    let sharing = msg.sharing();
    if sharing.is_shared() {
        index.link(msg.message_type(), &sharing)?;
    }
    Ok(())
}

fn shared_delete(
    index: &mut dyn SharedMessageIndex,
    owner: Option<Address>,
    msg: &Message,
) -> Result<()> {
    let sharing = msg.sharing();
    if sharing.is_shared() {
        index.delete_share(owner, msg.message_type(), &sharing)?;
    }
    Ok(())
}

static CLASSES: [MessageClass; 8] = [
    MessageClass {
        msg_type: MessageType::Null,
        name: "null",
        share_flags: ShareFlags::empty(),
        decode: null_decode,
        encode: null_encode,
        raw_size: no_size,
        reset: null_reset,
        can_share: None,
        get_crt_index: None,
        set_crt_index: None,
        link: None,
        delete: None,
    },
    MessageClass {
        msg_type: MessageType::Dataspace,
        name: "dataspace",
        share_flags: ShareFlags::IS_SHARABLE,
        decode: dataspace_decode,
        encode: dataspace_encode,
        raw_size: dataspace_size,
        reset: dataspace_reset,
        can_share: Some(shareable_unless_committed),
        get_crt_index: None,
        set_crt_index: None,
        link: Some(shared_link),
        delete: Some(shared_delete),
    },
    MessageClass {
        msg_type: MessageType::FillValue,
        name: "fill_value",
        share_flags: ShareFlags::IS_SHARABLE,
        decode: fill_decode,
        encode: fill_encode,
        raw_size: fill_size,
        reset: fill_reset,
        can_share: Some(shareable_unless_committed),
        get_crt_index: None,
        set_crt_index: None,
        link: Some(shared_link),
        delete: Some(shared_delete),
    },
    MessageClass {
        msg_type: MessageType::Attribute,
        name: "attribute",
        share_flags: ShareFlags::IS_SHARABLE.union(ShareFlags::IN_HEADER),
        decode: attr_decode,
        encode: attr_encode,
        raw_size: attr_size,
        reset: attr_reset,
        can_share: Some(shareable_unless_committed),
        get_crt_index: Some(attr_get_crt_index),
        set_crt_index: Some(attr_set_crt_index),
        link: Some(shared_link),
        delete: Some(shared_delete),
    },
    MessageClass {
        msg_type: MessageType::Comment,
        name: "comment",
        share_flags: ShareFlags::empty(),
        decode: comment_decode,
        encode: comment_encode,
        raw_size: comment_size,
        reset: comment_reset,
        can_share: None,
        get_crt_index: None,
        set_crt_index: None,
        link: None,
        delete: None,
    },
    MessageClass {
        msg_type: MessageType::ModificationTime,
        name: "modification_time",
        share_flags: ShareFlags::empty(),
        decode: mtime_decode,
        encode: mtime_encode,
        raw_size: mtime_size,
        reset: mtime_reset,
        can_share: None,
        get_crt_index: None,
        set_crt_index: None,
        link: None,
        delete: None,
    },
    MessageClass {
        msg_type: MessageType::RefCount,
        name: "ref_count",
        share_flags: ShareFlags::empty(),
        decode: refcount_decode,
        encode: refcount_encode,
        raw_size: refcount_size,
        reset: refcount_reset,
        can_share: None,
        get_crt_index: None,
        set_crt_index: None,
        link: None,
        delete: None,
    },
    MessageClass {
        msg_type: MessageType::Unknown,
        name: "unknown",
        share_flags: ShareFlags::empty(),
        decode: unknown_decode,
        encode: unknown_encode,
        raw_size: no_size,
        reset: unknown_reset,
        can_share: None,
        get_crt_index: None,
        set_crt_index: None,
        link: None,
        delete: None,
    },
];

// ============================================================================
// Generic operations
// ============================================================================

/// Encoded size; shared messages encode as a shared record unless
/// `disable_shared` asks for the payload itself
pub fn raw_size(msg: &Message, disable_shared: bool) -> usize {
    if !disable_shared && is_shared(msg) {
        shared::RECORD_SIZE
    } else {
        (msg.message_type().class().raw_size)(msg)
    }
}

/// Append the wire form of `msg` to `out`
pub fn encode(msg: &Message, disable_shared: bool, out: &mut Vec<u8>) -> Result<()> {
    if !disable_shared && is_shared(msg) {
        shared::encode(msg.sharing(), out)
    } else {
        (msg.message_type().class().encode)(msg, out)
    }
}

/// Decode a payload (never a shared record) of the given type
pub fn decode(msg_type: MessageType, buf: &[u8]) -> Result<Message> {
    (msg_type.class().decode)(buf)
}

/// Whether this particular message may move to the shared heap
pub fn can_share(msg: &Message) -> bool {
    let class = msg.message_type().class();
    match class.can_share {
        Some(can_share) => can_share(msg),
        None => class.share_flags.contains(ShareFlags::IS_SHARABLE),
    }
}

pub fn can_share_in_header(msg_type: MessageType) -> bool {
    msg_type.class().share_flags.contains(ShareFlags::IN_HEADER)
}

/// Whether the message currently lives outside the header
pub fn is_shared(msg: &Message) -> bool {
    msg.message_type()
        .class()
        .share_flags
        .contains(ShareFlags::IS_SHARABLE)
        && msg.sharing().is_shared()
}

pub fn set_share(msg: &mut Message, sharing: Sharing) -> Result<()> {
    if !sharing.is_shared() {
        return Err(HeaderError::Argument("set_share needs a shared location".into()));
    }
    let msg_type = msg.message_type();
    match msg.sharing_mut() {
        Some(slot) => {
            *slot = sharing;
            Ok(())
        }
        None => Err(HeaderError::Argument(format!("{} messages are not sharable", msg_type))),
    }
}

/// Forget any sharing state; a no-op for unsharable types
pub fn reset_share(msg: &mut Message) {
    if let Some(slot) = msg.sharing_mut() {
        *slot = Sharing::Unshared;
    }
}

pub fn get_crt_index(msg: &Message) -> u16 {
    msg.message_type()
        .class()
        .get_crt_index
        .map_or(0, |get| get(msg))
}

pub fn set_crt_index(msg: &mut Message, idx: u16) {
    if let Some(set) = msg.message_type().class().set_crt_index {
        set(msg, idx);
    }
}

/// Clear the payload in place, keeping the message type
pub fn reset(msg: &mut Message) {
    (msg.message_type().class().reset)(msg)
}

/// Release whatever the message references outside its own slot
pub fn delete(
    index: &mut dyn SharedMessageIndex,
    owner: Option<Address>,
    msg: &Message,
) -> Result<()> {
    match msg.message_type().class().delete {
        Some(delete) => delete(index, owner, msg),
        None => Ok(()),
    }
}

pub fn link(index: &mut dyn SharedMessageIndex, msg: &Message) -> Result<()> {
    match msg.message_type().class().link {
        Some(link) => link(index, msg),
        None => Ok(()),
    }
}

/// Copy a message for placement in another header or container.
///
/// Heap references are only meaningful to the index that issued them, so the
/// copy comes back unshared and the destination decides again.
pub fn copy_file(msg: &Message) -> Result<Message> {
    match msg.sharing() {
        Sharing::Committed(addr) => Err(HeaderError::ShareState(format!(
            "{} message committed at {} cannot be copied across containers",
            msg.message_type(),
            addr
        ))),
        _ => {
            let mut copy = msg.clone();
            reset_share(&mut copy);
            Ok(copy)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::HeapId;

    #[test]
    fn test_every_type_has_its_class() {
        for t in MessageType::ALL {
            assert_eq!(t.class().msg_type, t);
            assert_eq!(MessageType::from_name(t.name()), Some(t));
        }
    }

    #[test]
    fn test_id_mapping() {
        assert_eq!(MessageType::from_id(0x0C), MessageType::Attribute);
        assert_eq!(MessageType::from_id(0x12), MessageType::ModificationTime);
        assert_eq!(MessageType::from_id(0x2A), MessageType::Unknown);
        assert_eq!(MessageType::from_id(0x17), MessageType::Unknown);
    }

    #[test]
    fn test_shared_encoding_switch() {
        let mut msg = Message::Dataspace(Dataspace::simple(&[4, 4]));
        let inline = raw_size(&msg, false);
        assert_eq!(inline, 4 + 16);

        set_share(&mut msg, Sharing::Heap(HeapId(7))).unwrap();
        assert!(is_shared(&msg));
        assert_eq!(raw_size(&msg, false), shared::RECORD_SIZE);
        assert_eq!(raw_size(&msg, true), inline);

        let mut out = Vec::new();
        encode(&msg, false, &mut out).unwrap();
        assert_eq!(out.len(), shared::RECORD_SIZE);
    }

    #[test]
    fn test_share_capabilities() {
        let comment = Message::Comment(Comment::new("x"));
        assert!(!can_share(&comment));
        assert!(!is_shared(&comment));
        assert!(set_share(&mut comment.clone(), Sharing::Heap(HeapId(1))).is_err());

        let attr = Message::Attribute(Attribute::default());
        assert!(can_share(&attr));
        assert!(can_share_in_header(MessageType::Attribute));
        assert!(!can_share_in_header(MessageType::Dataspace));

        let mut committed = Message::FillValue(FillValue::default());
        set_share(&mut committed, Sharing::Committed(4096)).unwrap();
        assert!(!can_share(&committed));
        assert!(copy_file(&committed).is_err());
    }

    #[test]
    fn test_crt_index_and_reset() {
        let mut attr = Message::Attribute(Attribute::new("a", &[], Dataspace::scalar(), &[1]));
        set_crt_index(&mut attr, 5);
        assert_eq!(get_crt_index(&attr), 5);
        assert_eq!(get_crt_index(&Message::RefCount(RefCount { count: 1 })), 0);

        reset(&mut attr);
        assert_eq!(attr, Message::Attribute(Attribute::default()));
    }

    #[test]
    fn test_copy_file_drops_heap_reference() {
        let mut msg = Message::Dataspace(Dataspace::scalar());
        set_share(&mut msg, Sharing::Heap(HeapId(3))).unwrap();
        let copy = copy_file(&msg).unwrap();
        assert_eq!(copy.sharing(), Sharing::Unshared);
    }
}
