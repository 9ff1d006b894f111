//! Shared-message index.
//!
//! Identical shareable payloads (same type, same encoded bytes) are stored
//! once in a heap and referenced from headers through a shared record. The
//! heap keeps one reference count per payload; the last release frees it.

use std::collections::HashMap;

use ohstore_config::{log_share_debug, ShareConfig};
use ohstore_fd::{Address, UNDEFINED_ADDR};

use crate::flags::MessageFlags;
use crate::message::{HeapId, Message, Sharing};
use crate::registry::{self, MessageType};
use crate::{HeaderError, Result};

/// Collaborator that decides and records message sharing
pub trait SharedMessageIndex {
    /// Try to move `message` out of the header owned by `owner`.
    ///
    /// `owner == None` requests heap placement regardless of the size policy.
    /// On success the message's sharing is set and `SHARED` is added to
    /// `flags`; `Ok(false)` leaves the message untouched.
    fn try_share(
        &mut self,
        owner: Option<Address>,
        message: &mut Message,
        flags: &mut MessageFlags,
    ) -> Result<bool>;

    /// Drop one reference; a no-op for unshared messages
    fn delete_share(
        &mut self,
        owner: Option<Address>,
        msg_type: MessageType,
        sharing: &Sharing,
    ) -> Result<()>;

    /// Take one more reference on an already shared message
    fn link(&mut self, msg_type: MessageType, sharing: &Sharing) -> Result<()>;

    /// Encoded payload behind a shared record
    fn resolve(&self, msg_type: MessageType, sharing: &Sharing) -> Result<Vec<u8>>;
}

/// Which messages go to the heap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharePolicy {
    pub enabled: bool,
    /// Payloads smaller than this stay in the header
    pub min_message_size: usize,
    pub types: Vec<MessageType>,
}

impl Default for SharePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            min_message_size: 0,
            types: vec![
                MessageType::Dataspace,
                MessageType::FillValue,
                MessageType::Attribute,
            ],
        }
    }
}

impl SharePolicy {
    pub fn from_config(cfg: &ShareConfig) -> Result<Self> {
        let types = cfg
            .types
            .iter()
            .map(|name| {
                MessageType::from_name(name)
                    .filter(|t| t.class().share_flags.contains(registry::ShareFlags::IS_SHARABLE))
                    .ok_or_else(|| {
                        HeaderError::Argument(format!("{:?} is not a sharable message type", name))
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            enabled: cfg.enabled,
            min_message_size: cfg.min_message_size,
            types,
        })
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn covers(&self, msg_type: MessageType) -> bool {
        self.enabled && self.types.contains(&msg_type)
    }
}

#[derive(Debug)]
struct HeapEntry {
    msg_type: MessageType,
    payload: Vec<u8>,
    refcount: u32,
    hash: blake3::Hash,
}

/// In-memory shared heap, deduplicating by content hash
#[derive(Debug, Default)]
pub struct SharedHeap {
    policy: SharePolicy,
    entries: HashMap<HeapId, HeapEntry>,
    by_content: HashMap<blake3::Hash, HeapId>,
    committed: HashMap<Address, u32>,
    next_id: u64,
}

fn content_hash(msg_type: MessageType, payload: &[u8]) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&msg_type.id().to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

impl SharedHeap {
    pub fn new(policy: SharePolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    pub fn policy(&self) -> &SharePolicy {
        &self.policy
    }

    /// Number of distinct payloads held
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current reference count; 0 when nothing is recorded
    pub fn refcount(&self, sharing: &Sharing) -> u32 {
        match sharing {
            Sharing::Heap(id) => self.entries.get(id).map_or(0, |e| e.refcount),
            Sharing::Committed(addr) => self.committed.get(addr).copied().unwrap_or(0),
            Sharing::Unshared => 0,
        }
    }

    fn entry_mut(&mut self, msg_type: MessageType, id: HeapId) -> Result<&mut HeapEntry> {
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or_else(|| HeaderError::ShareState(format!("{} is not in the shared heap", id)))?;
        if entry.msg_type != msg_type {
            return Err(HeaderError::ShareState(format!(
                "{} holds a {} message, not {}",
                id, entry.msg_type, msg_type
            )));
        }
        Ok(entry)
    }
}

impl SharedMessageIndex for SharedHeap {
    fn try_share(
        &mut self,
        owner: Option<Address>,
        message: &mut Message,
        flags: &mut MessageFlags,
    ) -> Result<bool> {
        let msg_type = message.message_type();
        if flags.contains(MessageFlags::DONT_SHARE)
            || !self.policy.covers(msg_type)
            || !registry::can_share(message)
        {
            return Ok(false);
        }
        if registry::is_shared(message) {
            return Err(HeaderError::ShareState(format!(
                "{} message is already shared",
                msg_type
            )));
        }

        let mut payload = Vec::with_capacity(registry::raw_size(message, true));
        registry::encode(message, true, &mut payload)?;
        if owner.is_some() && payload.len() < self.policy.min_message_size {
            if registry::can_share_in_header(msg_type) {
                flags.insert(MessageFlags::SHAREABLE);
            }
            return Ok(false);
        }

        let hash = content_hash(msg_type, &payload);
        let existing = self.by_content.get(&hash).copied();
        let id = match existing {
            Some(id) => {
                self.entry_mut(msg_type, id)?.refcount += 1;
                id
            }
            None => {
                let id = HeapId(self.next_id);
                self.next_id += 1;
                self.entries.insert(
                    id,
                    HeapEntry {
                        msg_type,
                        payload,
                        refcount: 1,
                        hash,
                    },
                );
                self.by_content.insert(hash, id);
                id
            }
        };

        registry::set_share(message, Sharing::Heap(id))?;
        flags.remove(MessageFlags::SHAREABLE);
        flags.insert(MessageFlags::SHARED);
        log_share_debug!(
            "message shared",
            msg_type = msg_type.name(),
            heap_id = id.0,
            owner = owner.unwrap_or(UNDEFINED_ADDR),
            refcount = self.refcount(&Sharing::Heap(id))
        );
        Ok(true)
    }

    fn delete_share(
        &mut self,
        owner: Option<Address>,
        msg_type: MessageType,
        sharing: &Sharing,
    ) -> Result<()> {
        match *sharing {
            Sharing::Unshared => Ok(()),
            Sharing::Heap(id) => {
                let entry = self.entry_mut(msg_type, id)?;
                entry.refcount -= 1;
                let remaining = entry.refcount;
                if remaining == 0 {
                    let hash = entry.hash;
                    self.entries.remove(&id);
                    self.by_content.remove(&hash);
                }
                log_share_debug!(
                    "shared reference dropped",
                    heap_id = id.0,
                    owner = owner.unwrap_or(UNDEFINED_ADDR),
                    remaining = remaining
                );
                Ok(())
            }
            Sharing::Committed(addr) => match self.committed.get_mut(&addr) {
                Some(count) => {
                    *count -= 1;
                    if *count == 0 {
                        self.committed.remove(&addr);
                    }
                    Ok(())
                }
                None => Err(HeaderError::ShareState(format!(
                    "no references recorded for committed message at {}",
                    addr
                ))),
            },
        }
    }

    fn link(&mut self, msg_type: MessageType, sharing: &Sharing) -> Result<()> {
        match *sharing {
            Sharing::Heap(id) => {
                self.entry_mut(msg_type, id)?.refcount += 1;
                Ok(())
            }
            Sharing::Committed(addr) => {
                *self.committed.entry(addr).or_insert(0) += 1;
                Ok(())
            }
            Sharing::Unshared => Err(HeaderError::Argument(format!(
                "cannot link an unshared {} message",
                msg_type
            ))),
        }
    }

    fn resolve(&self, msg_type: MessageType, sharing: &Sharing) -> Result<Vec<u8>> {
        match *sharing {
            Sharing::Heap(id) => match self.entries.get(&id) {
                Some(entry) if entry.msg_type == msg_type => Ok(entry.payload.clone()),
                Some(entry) => Err(HeaderError::ShareState(format!(
                    "{} holds a {} message, not {}",
                    id, entry.msg_type, msg_type
                ))),
                None => Err(HeaderError::ShareState(format!(
                    "{} is not in the shared heap",
                    id
                ))),
            },
            Sharing::Committed(addr) => Err(HeaderError::ShareState(format!(
                "committed {} message at {} is resolved by its owning object",
                msg_type, addr
            ))),
            Sharing::Unshared => Err(HeaderError::Argument(format!(
                "unshared {} message has nothing to resolve",
                msg_type
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Attribute, Comment, Dataspace};

    fn dataspace() -> Message {
        Message::Dataspace(Dataspace::simple(&[8, 8]))
    }

    #[test]
    fn test_identical_payloads_deduplicated() {
        let mut heap = SharedHeap::default();
        let (mut a, mut b) = (dataspace(), dataspace());
        let (mut fa, mut fb) = (MessageFlags::empty(), MessageFlags::empty());
        assert!(heap.try_share(Some(0), &mut a, &mut fa).unwrap());
        assert!(heap.try_share(Some(100), &mut b, &mut fb).unwrap());

        assert_eq!(a.sharing(), b.sharing());
        assert!(fa.contains(MessageFlags::SHARED));
        assert_eq!(heap.len(), 1);
        assert_eq!(heap.refcount(&a.sharing()), 2);

        heap.delete_share(Some(0), MessageType::Dataspace, &a.sharing()).unwrap();
        assert_eq!(heap.refcount(&a.sharing()), 1);
        heap.delete_share(Some(100), MessageType::Dataspace, &b.sharing()).unwrap();
        assert!(heap.is_empty());
        assert!(heap
            .delete_share(Some(100), MessageType::Dataspace, &b.sharing())
            .is_err());
    }

    #[test]
    fn test_policy_gates_sharing() {
        let mut heap = SharedHeap::new(SharePolicy {
            min_message_size: 1000,
            ..SharePolicy::default()
        });

        let mut flags = MessageFlags::DONT_SHARE;
        assert!(!heap.try_share(None, &mut dataspace(), &mut flags).unwrap());

        let mut comment = Message::Comment(Comment::new("not sharable"));
        let mut flags = MessageFlags::empty();
        assert!(!heap.try_share(Some(0), &mut comment, &mut flags).unwrap());

        // small attribute stays in the header but is marked shareable
        let mut attr = Message::Attribute(Attribute::new("a", &[1], Dataspace::scalar(), &[2]));
        assert!(!heap.try_share(Some(0), &mut attr, &mut flags).unwrap());
        assert_eq!(flags, MessageFlags::SHAREABLE);

        // no owner: size threshold ignored
        assert!(heap.try_share(None, &mut attr, &mut flags).unwrap());
        assert_eq!(flags, MessageFlags::SHARED);
    }

    #[test]
    fn test_disabled_policy() {
        let mut heap = SharedHeap::new(SharePolicy::disabled());
        let mut flags = MessageFlags::empty();
        assert!(!heap.try_share(None, &mut dataspace(), &mut flags).unwrap());
    }

    #[test]
    fn test_resolve_checks_type() {
        let mut heap = SharedHeap::default();
        let mut msg = dataspace();
        heap.try_share(Some(0), &mut msg, &mut MessageFlags::empty()).unwrap();

        let bytes = heap.resolve(MessageType::Dataspace, &msg.sharing()).unwrap();
        assert_eq!(registry::decode(MessageType::Dataspace, &bytes).unwrap(), dataspace());
        assert!(heap.resolve(MessageType::FillValue, &msg.sharing()).is_err());
        assert!(heap.link(MessageType::FillValue, &msg.sharing()).is_err());
    }

    #[test]
    fn test_committed_references() {
        let mut heap = SharedHeap::default();
        let committed = Sharing::Committed(4096);
        heap.link(MessageType::Dataspace, &committed).unwrap();
        heap.link(MessageType::Dataspace, &committed).unwrap();
        assert_eq!(heap.refcount(&committed), 2);
        heap.delete_share(None, MessageType::Dataspace, &committed).unwrap();
        heap.delete_share(None, MessageType::Dataspace, &committed).unwrap();
        assert!(heap.delete_share(None, MessageType::Dataspace, &committed).is_err());
    }

    #[test]
    fn test_policy_from_config() {
        let policy = SharePolicy::from_config(&ShareConfig::default()).unwrap();
        assert_eq!(policy, SharePolicy::default());

        let bad = ShareConfig {
            types: vec!["comment".into()],
            ..ShareConfig::default()
        };
        assert!(SharePolicy::from_config(&bad).is_err());
    }
}
