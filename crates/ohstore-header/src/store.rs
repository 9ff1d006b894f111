//! Message operations over one object header.
//!
//! A [`MessageStore`] is a short-lived view pairing the file's write intent
//! with the shared-message index and chunk allocator. The header itself is
//! handed in per call, already protected by the cache; the store never keeps
//! a reference to it.

use ohstore_config::{log_header_debug, log_header_warn};
use ohstore_fd::AccessFlags;
use tracing::instrument;

use crate::alloc::ChunkAllocator;
use crate::flags::{MessageFlags, UpdateFlags};
use crate::header::{unix_now, ObjectHeader, SlotState};
use crate::message::{shared, Message, ModificationTime, Sharing};
use crate::registry::{self, MessageType};
use crate::share::SharedMessageIndex;
use crate::{HeaderError, Result};

/// Which messages of a type `remove` acts on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selector {
    All,
    First,
    /// Zero-based occurrence among messages of the type, in table order
    Nth(usize),
}

/// Visitor verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    Continue,
    Stop,
}

pub struct MessageStore<'a> {
    intent: AccessFlags,
    index: &'a mut dyn SharedMessageIndex,
    allocator: &'a mut dyn ChunkAllocator,
}

impl<'a> MessageStore<'a> {
    pub fn new(
        intent: AccessFlags,
        index: &'a mut dyn SharedMessageIndex,
        allocator: &'a mut dyn ChunkAllocator,
    ) -> Self {
        Self {
            intent,
            index,
            allocator,
        }
    }

    fn require_write(&self) -> Result<()> {
        if !self.intent.is_writable() {
            return Err(HeaderError::WriteProtected(
                "file is not open for writing".into(),
            ));
        }
        Ok(())
    }

    fn require_payload_type(msg_type: MessageType) -> Result<()> {
        if matches!(msg_type, MessageType::Null | MessageType::Unknown) {
            return Err(HeaderError::Argument(format!(
                "{} messages are managed by the header itself",
                msg_type
            )));
        }
        Ok(())
    }

    fn check_encodable(message: &Message) -> Result<()> {
        let mut scratch = Vec::with_capacity(registry::raw_size(message, true));
        registry::encode(message, true, &mut scratch)
    }

    // ------------------------------------------------------------------------
    // create / write / read
    // ------------------------------------------------------------------------

    /// Add a new message, returning its slot index.
    ///
    /// An already shared message gains a reference; anything else is offered
    /// to the shared index before space is allocated.
    #[instrument(level = "debug", skip_all, fields(address = header.address(), msg_type = %message.message_type()))]
    pub fn append(
        &mut self,
        header: &mut ObjectHeader,
        message: &Message,
        flags: MessageFlags,
        update: UpdateFlags,
    ) -> Result<usize> {
        self.require_write()?;
        let msg_type = message.message_type();
        Self::require_payload_type(msg_type)?;
        if flags.intersects(MessageFlags::SHARED | MessageFlags::SHAREABLE) {
            return Err(HeaderError::Argument(
                "sharing flags are assigned by the store".into(),
            ));
        }

        let mut native = message.clone();
        let mut flags = flags;
        if registry::is_shared(&native) {
            registry::link(&mut *self.index, &native)?;
            flags.insert(MessageFlags::SHARED);
        } else {
            Self::check_encodable(&native)?;
            self.index
                .try_share(Some(header.address()), &mut native, &mut flags)?;
        }

        let idx = match self.allocator.allocate(header, &native) {
            Ok(idx) => idx,
            Err(e) => {
                if flags.contains(MessageFlags::SHARED) {
                    self.undo_share(header, &native);
                }
                return Err(e);
            }
        };
        header.slots[idx].crt_idx = registry::get_crt_index(&native);
        self.copy_into(header, idx, native, flags, update)?;
        log_header_debug!(
            "message appended",
            address = header.address(),
            msg_type = msg_type.name(),
            slot = idx
        );
        Ok(idx)
    }

    fn undo_share(&mut self, header: &ObjectHeader, native: &Message) {
        let sharing = native.sharing();
        if let Err(e) =
            self.index
                .delete_share(Some(header.address()), native.message_type(), &sharing)
        {
            log_header_warn!(
                "unable to release share after failed allocation",
                address = header.address(),
                error = e.to_string().as_str()
            );
        }
    }

    /// Install `native` as the slot's payload
    fn copy_into(
        &mut self,
        header: &mut ObjectHeader,
        idx: usize,
        native: Message,
        flags: MessageFlags,
        update: UpdateFlags,
    ) -> Result<()> {
        let slot = &mut header.slots[idx];
        slot.flags = flags;
        slot.state = SlotState::Decoded {
            native,
            dirty: true,
        };
        if update.contains(UpdateFlags::TIME) {
            self.touch(header, false)?;
        }
        header.mark_dirty();
        Ok(())
    }

    /// Replace the first message of the payload's type.
    ///
    /// The slot keeps its position and creation index. A payload that no
    /// longer fits moves to new space and its old span becomes free.
    #[instrument(level = "debug", skip_all, fields(address = header.address(), msg_type = %message.message_type()))]
    pub fn write(
        &mut self,
        header: &mut ObjectHeader,
        message: &Message,
        flags: MessageFlags,
        update: UpdateFlags,
    ) -> Result<()> {
        self.require_write()?;
        let msg_type = message.message_type();
        Self::require_payload_type(msg_type)?;
        let idx = header
            .find_first(msg_type)
            .ok_or(HeaderError::NotFound(msg_type.name()))?;

        let old_flags = header.slots[idx].flags;
        if old_flags.contains(MessageFlags::CONSTANT) && !update.contains(UpdateFlags::FORCE) {
            return Err(HeaderError::WriteProtected(format!(
                "{} message is constant",
                msg_type
            )));
        }

        let mut native = message.clone();
        registry::reset_share(&mut native);
        Self::check_encodable(&native)?;
        registry::set_crt_index(&mut native, header.slots[idx].crt_idx);

        let mut flags = flags;
        let wants_shared = flags.contains(MessageFlags::SHARED);
        flags.remove(MessageFlags::SHARED | MessageFlags::SHAREABLE);

        let old_sharing = if old_flags.intersects(MessageFlags::SHARED | MessageFlags::SHAREABLE) {
            let old = self.load_native(header, idx)?.sharing();
            if let Sharing::Committed(addr) = old {
                return Err(HeaderError::ShareState(format!(
                    "{} message committed at {} cannot be rewritten in place",
                    msg_type, addr
                )));
            }
            let owner = if wants_shared {
                None
            } else {
                Some(header.address())
            };
            let shared = self.index.try_share(owner, &mut native, &mut flags)?;
            if wants_shared && !shared {
                return Err(HeaderError::ShareState(format!(
                    "replacement {} message could not stay shared",
                    msg_type
                )));
            }
            Some(old)
        } else {
            if wants_shared {
                return Err(HeaderError::Argument(format!(
                    "cannot mark the unshared {} message as shared",
                    msg_type
                )));
            }
            None
        };

        let needed = header.align(registry::raw_size(&native, false));
        let idx = if needed > header.slots[idx].raw.len {
            match self.relocate(header, idx, &native) {
                Ok(idx) => idx,
                Err(e) => {
                    if flags.contains(MessageFlags::SHARED) {
                        self.undo_share(header, &native);
                    }
                    return Err(e);
                }
            }
        } else {
            idx
        };

        if let Some(old) = old_sharing {
            self.index
                .delete_share(Some(header.address()), msg_type, &old)?;
        }
        self.copy_into(header, idx, native, flags, update)
    }

    /// Give slot `idx` a fresh span large enough for `native`; the old span
    /// becomes a null message. Returns the slot's (possibly shifted) index.
    fn relocate(&mut self, header: &mut ObjectHeader, idx: usize, native: &Message) -> Result<usize> {
        let claimed = self.allocator.allocate(header, native)?;
        let new_raw = header.slots.remove(claimed).raw;
        let idx = if claimed < idx { idx - 1 } else { idx };
        let old_raw = std::mem::replace(&mut header.slots[idx].raw, new_raw);
        header.push_null(old_raw);
        log_header_debug!(
            "message relocated",
            address = header.address(),
            from = old_raw.offset,
            to = new_raw.offset,
            chunk = new_raw.chunk
        );
        Ok(idx)
    }

    /// Native form of slot `idx`, decoding it first if needed
    fn load_native<'h>(&self, header: &'h mut ObjectHeader, idx: usize) -> Result<&'h mut Message> {
        if let SlotState::RawOnly = header.slots[idx].state {
            let slot = &header.slots[idx];
            let bytes = &header.chunks[slot.raw.chunk].image[slot.raw.offset..slot.raw.end()];
            let mut native = if slot.flags.contains(MessageFlags::SHARED) {
                let sharing = shared::decode(bytes)?;
                let payload = self.index.resolve(slot.msg_type, &sharing)?;
                let mut m = registry::decode(slot.msg_type, &payload)?;
                registry::set_share(&mut m, sharing)?;
                m
            } else {
                registry::decode(slot.msg_type, bytes)?
            };
            registry::set_crt_index(&mut native, slot.crt_idx);
            header.slots[idx].state = SlotState::Decoded {
                native,
                dirty: false,
            };
        }
        match &mut header.slots[idx].state {
            SlotState::Decoded { native, .. } => Ok(native),
            SlotState::RawOnly => Err(HeaderError::Corruption(format!(
                "slot {} failed to materialize",
                idx
            ))),
        }
    }

    /// Copy of the first message of `msg_type`
    pub fn read(&mut self, header: &mut ObjectHeader, msg_type: MessageType) -> Result<Message> {
        let idx = header
            .find_first(msg_type)
            .ok_or(HeaderError::NotFound(msg_type.name()))?;
        Ok(self.load_native(header, idx)?.clone())
    }

    /// Like [`read`](Self::read), into a caller-owned message. `dest` is reset
    /// first and stays reset if the read fails.
    pub fn read_into(
        &mut self,
        header: &mut ObjectHeader,
        msg_type: MessageType,
        dest: &mut Message,
    ) -> Result<()> {
        registry::reset(dest);
        let idx = header
            .find_first(msg_type)
            .ok_or(HeaderError::NotFound(msg_type.name()))?;
        dest.clone_from(self.load_native(header, idx)?);
        Ok(())
    }

    pub fn exists(&self, header: &ObjectHeader, msg_type: MessageType) -> bool {
        header.contains(msg_type)
    }

    pub fn count(&self, header: &ObjectHeader, msg_type: MessageType) -> usize {
        header.count(msg_type)
    }

    // ------------------------------------------------------------------------
    // remove / iterate
    // ------------------------------------------------------------------------

    /// Convert the selected messages to free space, returning how many went.
    ///
    /// With `adjust_links`, references held by the messages (shared heap
    /// entries) are released too. Constant messages are skipped unless
    /// forced and make the call fail once the rest are gone.
    #[instrument(level = "debug", skip_all, fields(address = header.address(), msg_type = %msg_type))]
    pub fn remove(
        &mut self,
        header: &mut ObjectHeader,
        msg_type: MessageType,
        selector: Selector,
        adjust_links: bool,
        update: UpdateFlags,
    ) -> Result<usize> {
        let stop_after_first = selector != Selector::All;
        self.remove_where(header, msg_type, adjust_links, update, stop_after_first, |_, seq| {
            Ok(match selector {
                Selector::Nth(n) => seq == n,
                Selector::All | Selector::First => true,
            })
        })
    }

    /// Remove every message of `msg_type` the predicate accepts
    pub fn remove_matching<P>(
        &mut self,
        header: &mut ObjectHeader,
        msg_type: MessageType,
        adjust_links: bool,
        update: UpdateFlags,
        predicate: P,
    ) -> Result<usize>
    where
        P: FnMut(&Message, usize) -> Result<bool>,
    {
        self.remove_where(header, msg_type, adjust_links, update, false, predicate)
    }

    fn remove_where<P>(
        &mut self,
        header: &mut ObjectHeader,
        msg_type: MessageType,
        adjust_links: bool,
        update: UpdateFlags,
        stop_after_first: bool,
        mut select: P,
    ) -> Result<usize>
    where
        P: FnMut(&Message, usize) -> Result<bool>,
    {
        self.require_write()?;
        Self::require_payload_type(msg_type)?;

        let mut removed = 0usize;
        let mut protected = 0usize;
        self.iterate_internal(header, msg_type, |store, header, idx, seq, modified| {
            if !select(store.load_native(header, idx)?, seq)? {
                return Ok(Visit::Continue);
            }
            if header.slots[idx].flags.contains(MessageFlags::CONSTANT)
                && !update.contains(UpdateFlags::FORCE)
            {
                protected += 1;
            } else {
                store.release(header, idx, adjust_links)?;
                *modified = true;
                removed += 1;
            }
            Ok(if stop_after_first {
                Visit::Stop
            } else {
                Visit::Continue
            })
        })?;

        if protected > 0 {
            return Err(HeaderError::WriteProtected(format!(
                "{} constant {} message(s) not removed",
                protected, msg_type
            )));
        }
        if removed == 0 {
            return Err(HeaderError::NotFound(msg_type.name()));
        }
        log_header_debug!(
            "messages removed",
            address = header.address(),
            msg_type = msg_type.name(),
            count = removed
        );
        Ok(removed)
    }

    /// Free slot `idx`, first dropping what it references when `adjust_links`
    fn release(&mut self, header: &mut ObjectHeader, idx: usize, adjust_links: bool) -> Result<()> {
        if adjust_links {
            let owner = header.address();
            let native = self.load_native(header, idx)?;
            registry::delete(&mut *self.index, Some(owner), native)?;
        }
        header.convert_to_null(idx);
        Ok(())
    }

    /// Visit each message of `msg_type` in table order with its per-type
    /// ordinal. A visitor error aborts the walk and is returned as is.
    pub fn iterate<F>(
        &mut self,
        header: &mut ObjectHeader,
        msg_type: MessageType,
        mut visitor: F,
    ) -> Result<Visit>
    where
        F: FnMut(&Message, usize) -> Result<Visit>,
    {
        self.iterate_internal(header, msg_type, |store, header, idx, seq, _| {
            visitor(store.load_native(header, idx)?, seq)
        })
    }

    /// Walk with full access to the header. If any step sets `modified`, the
    /// header is condensed, touched and dirtied once at the end, whatever
    /// the outcome of the walk.
    fn iterate_internal<F>(
        &mut self,
        header: &mut ObjectHeader,
        msg_type: MessageType,
        mut op: F,
    ) -> Result<Visit>
    where
        F: FnMut(&mut Self, &mut ObjectHeader, usize, usize, &mut bool) -> Result<Visit>,
    {
        let mut modified = false;
        let mut seq = 0;
        let mut result = Ok(Visit::Continue);

        for idx in 0..header.slots.len() {
            if header.slots[idx].msg_type != msg_type {
                continue;
            }
            if let Err(e) = self.load_native(header, idx) {
                result = Err(e);
                break;
            }
            match op(self, header, idx, seq, &mut modified) {
                Ok(Visit::Continue) => seq += 1,
                other => {
                    result = other;
                    break;
                }
            }
        }

        if modified {
            header.condense();
            if let Err(e) = self.touch(header, false) {
                if result.is_ok() {
                    result = Err(e);
                }
            }
            header.mark_dirty();
        }
        result
    }

    // ------------------------------------------------------------------------
    // flush / sizes / time
    // ------------------------------------------------------------------------

    /// Encode one dirty slot into its chunk image
    pub fn flush(&mut self, header: &mut ObjectHeader, idx: usize) -> Result<()> {
        header.flush_message(idx)
    }

    /// Encode every dirty slot; see [`ObjectHeader::flush_messages`]
    pub fn flush_all(&mut self, header: &mut ObjectHeader) -> Result<usize> {
        header.flush_messages()
    }

    /// Encoded size of `message` as it would be stored
    pub fn raw_size(&self, message: &Message) -> usize {
        registry::raw_size(message, false)
    }

    /// Space `message` plus `extra` bytes would take in `header`, prefix included
    pub fn final_size(&self, header: &ObjectHeader, message: &Message, extra: usize) -> usize {
        header.layout().final_size(message, extra)
    }

    /// Refresh the header's modification time.
    ///
    /// Headers that store times get their timestamps bumped. Otherwise the
    /// ModificationTime message is updated; with `force` it is created when
    /// absent.
    pub fn touch(&mut self, header: &mut ObjectHeader, force: bool) -> Result<()> {
        let now = unix_now();
        if let Some(times) = header.times_mut() {
            times.access = now;
            times.modification = now;
            times.change = now;
            header.mark_dirty();
            return Ok(());
        }

        let stamp = Message::ModificationTime(ModificationTime { seconds: now });
        match header.find_first(MessageType::ModificationTime) {
            Some(idx) => {
                *self.load_native(header, idx)? = stamp;
                header.slots[idx].mark_dirty()?;
            }
            None if force => {
                let idx = self.allocator.allocate(header, &stamp)?;
                header.slots[idx].state = SlotState::Decoded {
                    native: stamp,
                    dirty: true,
                };
            }
            None => return Ok(()),
        }
        header.mark_dirty();
        Ok(())
    }

    // ------------------------------------------------------------------------
    // copy
    // ------------------------------------------------------------------------

    /// Append copies of every `msg_type` message of `src` to `dst` through
    /// `dst_store`, returning how many were copied. Copies start unshared and
    /// keep only the `CONSTANT` and `DONT_SHARE` flags.
    pub fn copy_to(
        &mut self,
        src: &mut ObjectHeader,
        msg_type: MessageType,
        dst_store: &mut MessageStore<'_>,
        dst: &mut ObjectHeader,
    ) -> Result<usize> {
        Self::require_payload_type(msg_type)?;
        let mut copies = Vec::new();
        self.iterate_internal(src, msg_type, |store, header, idx, _, _| {
            let copy = registry::copy_file(store.load_native(header, idx)?)?;
            let flags = header.slots[idx].flags & (MessageFlags::CONSTANT | MessageFlags::DONT_SHARE);
            copies.push((copy, flags));
            Ok(Visit::Continue)
        })?;

        for (copy, flags) in &copies {
            dst_store.append(dst, copy, *flags, UpdateFlags::empty())?;
        }
        Ok(copies.len())
    }
}
