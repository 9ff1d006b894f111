//! In-memory object header.
//!
//! A header owns a list of chunk images and a table of message slots. Each
//! slot points into one chunk by `(chunk, offset, len)`, where `offset` is the
//! first payload byte; the message prefix sits immediately before it.
//!
//! Prefix layout:
//!
//! | version | bytes                                               |
//! |---------|-----------------------------------------------------|
//! | 1       | type u16, size u16, flags u8, 3 reserved            |
//! | 2       | type u8, size u16, flags u8, [creation index u16]   |
//!
//! Version 1 payload sizes are multiples of 8. Version 2 chunks may end in a
//! gap too small for a message; a chunk with a gap holds no null messages.

use std::time::{SystemTime, UNIX_EPOCH};

use ohstore_config::{log_header_debug, HeaderConfig};
use ohstore_fd::{Address, UNDEFINED_ADDR};

use crate::flags::{HeaderFlags, MessageFlags};
use crate::message::{Message, Reader, UnknownMessage};
use crate::registry::{self, MessageType};
use crate::{HeaderError, Result};

/// Largest payload a prefix can describe
pub const MAX_MESSAGE_SIZE: usize = u16::MAX as usize;

/// Format parameters of a header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderLayout {
    pub version: u8,
    pub flags: HeaderFlags,
    /// Size of the first chunk of a new header
    pub chunk_size: usize,
    /// Chunks are not grown past this size
    pub max_chunk_size: usize,
}

impl Default for HeaderLayout {
    fn default() -> Self {
        Self::from_config(&HeaderConfig::default())
    }
}

impl HeaderLayout {
    pub fn from_config(cfg: &HeaderConfig) -> Self {
        let mut flags = HeaderFlags::empty();
        if cfg.version > 1 {
            flags.set(HeaderFlags::ATTR_CRT_ORDER_TRACKED, cfg.track_creation_order);
            flags.set(HeaderFlags::STORE_TIMES, cfg.store_times);
        }
        Self {
            version: cfg.version,
            flags,
            chunk_size: cfg.initial_chunk_size,
            max_chunk_size: cfg.max_chunk_size,
        }
    }

    pub fn tracks_creation_order(&self) -> bool {
        self.version > 1 && self.flags.contains(HeaderFlags::ATTR_CRT_ORDER_TRACKED)
    }

    pub fn stores_times(&self) -> bool {
        self.version > 1 && self.flags.contains(HeaderFlags::STORE_TIMES)
    }

    /// Size of a message prefix
    pub fn msg_header_size(&self) -> usize {
        match self.version {
            1 => 8,
            _ if self.tracks_creation_order() => 6,
            _ => 4,
        }
    }

    /// Round a payload size up to the layout's message alignment
    pub fn align(&self, size: usize) -> usize {
        match self.version {
            1 => size.div_ceil(8) * 8,
            _ => size,
        }
    }

    /// Bytes `msg` plus `extra` payload bytes would occupy, prefix included
    pub fn final_size(&self, msg: &Message, extra: usize) -> usize {
        self.msg_header_size() + self.align(registry::raw_size(msg, false) + extra)
    }
}

/// Version 2 header timestamps, seconds since the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeaderTimes {
    pub access: u32,
    pub modification: u32,
    pub change: u32,
    pub birth: u32,
}

impl HeaderTimes {
    pub(crate) fn now() -> Self {
        let t = unix_now();
        Self {
            access: t,
            modification: t,
            change: t,
            birth: t,
        }
    }
}

pub(crate) fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().min(u32::MAX as u64) as u32)
        .unwrap_or(0)
}

/// Location of a message payload inside the header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSpan {
    pub chunk: usize,
    /// First payload byte; the prefix precedes it
    pub offset: usize,
    pub len: usize,
}

impl RawSpan {
    pub fn end(&self) -> usize {
        self.offset + self.len
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotState {
    /// Only the raw bytes are known
    RawOnly,
    /// Native form present; `dirty` means the raw bytes are stale
    Decoded { native: Message, dirty: bool },
}

/// One entry of the message table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub(crate) msg_type: MessageType,
    pub(crate) flags: MessageFlags,
    pub(crate) raw: RawSpan,
    pub(crate) crt_idx: u16,
    pub(crate) state: SlotState,
}

impl Slot {
    fn null(raw: RawSpan) -> Self {
        Self {
            msg_type: MessageType::Null,
            flags: MessageFlags::empty(),
            raw,
            crt_idx: 0,
            state: SlotState::Decoded {
                native: Message::Null,
                dirty: true,
            },
        }
    }

    pub fn msg_type(&self) -> MessageType {
        self.msg_type
    }

    pub fn flags(&self) -> MessageFlags {
        self.flags
    }

    pub fn raw(&self) -> RawSpan {
        self.raw
    }

    pub fn creation_index(&self) -> u16 {
        self.crt_idx
    }

    pub fn state(&self) -> &SlotState {
        &self.state
    }

    pub fn native(&self) -> Option<&Message> {
        match &self.state {
            SlotState::Decoded { native, .. } => Some(native),
            SlotState::RawOnly => None,
        }
    }

    pub fn is_null(&self) -> bool {
        self.msg_type == MessageType::Null
    }

    pub fn is_dirty(&self) -> bool {
        matches!(self.state, SlotState::Decoded { dirty: true, .. })
    }

    pub(crate) fn mark_dirty(&mut self) -> Result<()> {
        match &mut self.state {
            SlotState::Decoded { dirty, .. } => {
                *dirty = true;
                Ok(())
            }
            SlotState::RawOnly => Err(HeaderError::Corruption(format!(
                "cannot dirty undecoded {} message",
                self.msg_type
            ))),
        }
    }
}

/// Contiguous region of a header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub(crate) image: Vec<u8>,
    pub(crate) gap: usize,
    pub(crate) dirty: bool,
}

impl Chunk {
    pub fn image(&self) -> &[u8] {
        &self.image
    }

    /// Unused tail bytes too small to hold a message
    pub fn gap(&self) -> usize {
        self.gap
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

#[derive(Debug, Clone)]
pub struct ObjectHeader {
    address: Address,
    layout: HeaderLayout,
    pub(crate) chunks: Vec<Chunk>,
    pub(crate) slots: Vec<Slot>,
    times: Option<HeaderTimes>,
    dirty: bool,
}

impl Default for ObjectHeader {
    fn default() -> Self {
        Self {
            address: UNDEFINED_ADDR,
            layout: HeaderLayout::default(),
            chunks: Vec::new(),
            slots: Vec::new(),
            times: None,
            dirty: false,
        }
    }
}

impl ObjectHeader {
    /// New header whose single chunk is one null message
    pub fn new(address: Address, layout: HeaderLayout) -> Result<Self> {
        if !matches!(layout.version, 1 | 2) {
            return Err(HeaderError::Argument(format!(
                "unsupported header version {}",
                layout.version
            )));
        }
        let hdr = layout.msg_header_size();
        let size = layout.align(layout.chunk_size.max(hdr));
        if size - hdr > MAX_MESSAGE_SIZE {
            return Err(HeaderError::Argument(format!(
                "initial chunk of {} bytes cannot be described by one null message",
                size
            )));
        }

        let mut header = Self {
            address,
            layout,
            chunks: vec![Chunk {
                image: vec![0; size],
                gap: 0,
                dirty: true,
            }],
            slots: Vec::new(),
            times: layout.stores_times().then(HeaderTimes::now),
            dirty: true,
        };
        header.slots.push(Slot::null(RawSpan {
            chunk: 0,
            offset: hdr,
            len: size - hdr,
        }));
        Ok(header)
    }

    /// Rebuild a header from persisted chunk images
    pub fn from_chunks(
        address: Address,
        layout: HeaderLayout,
        times: Option<HeaderTimes>,
        images: Vec<Vec<u8>>,
    ) -> Result<Self> {
        if images.is_empty() {
            return Err(HeaderError::Corruption("header has no chunks".into()));
        }
        let hdr = layout.msg_header_size();
        let mut slots = Vec::new();
        let mut chunks = Vec::with_capacity(images.len());

        for (chunk_idx, image) in images.into_iter().enumerate() {
            let mut p = 0;
            let mut has_null = false;
            while image.len() - p >= hdr {
                let mut r = Reader::new(&image[p..p + hdr], "message prefix");
                let (raw_id, size, flag_bits, crt_idx) = if layout.version == 1 {
                    let id = r.u16()?;
                    let size = r.u16()?;
                    (id, size, r.u8()?, 0)
                } else {
                    let id = u16::from(r.u8()?);
                    let size = r.u16()?;
                    let flags = r.u8()?;
                    let crt = if layout.tracks_creation_order() { r.u16()? } else { 0 };
                    (id, size, flags, crt)
                };

                let offset = p + hdr;
                let len = size as usize;
                if offset + len > image.len() {
                    return Err(HeaderError::Corruption(format!(
                        "message at chunk {} offset {} overruns the chunk",
                        chunk_idx, p
                    )));
                }
                if layout.align(len) != len {
                    return Err(HeaderError::Corruption(format!(
                        "unaligned message size {} at chunk {} offset {}",
                        len, chunk_idx, p
                    )));
                }

                let flags = MessageFlags::from_bits_retain(flag_bits);
                let msg_type = MessageType::from_id(raw_id);
                let state = match msg_type {
                    MessageType::Null => {
                        has_null = true;
                        SlotState::Decoded {
                            native: Message::Null,
                            dirty: false,
                        }
                    }
                    MessageType::Unknown => {
                        if flags.contains(MessageFlags::FAIL_IF_UNKNOWN_ALWAYS) {
                            return Err(HeaderError::Decode {
                                what: "unknown",
                                reason: format!("type id {:#x} must be understood", raw_id),
                            });
                        }
                        SlotState::Decoded {
                            native: Message::Unknown(UnknownMessage { raw_id }),
                            dirty: false,
                        }
                    }
                    _ => SlotState::RawOnly,
                };

                slots.push(Slot {
                    msg_type,
                    flags,
                    raw: RawSpan {
                        chunk: chunk_idx,
                        offset,
                        len,
                    },
                    crt_idx,
                    state,
                });
                p = offset + len;
            }

            let gap = image.len() - p;
            if gap > 0 && layout.version == 1 {
                return Err(HeaderError::Corruption(format!(
                    "chunk {} has {} trailing bytes",
                    chunk_idx, gap
                )));
            }
            if gap > 0 && has_null {
                return Err(HeaderError::Corruption(format!(
                    "chunk {} has both a gap and null messages",
                    chunk_idx
                )));
            }
            chunks.push(Chunk {
                image,
                gap,
                dirty: false,
            });
        }

        log_header_debug!(
            "header parsed",
            address = address,
            chunks = chunks.len(),
            messages = slots.len()
        );
        Ok(Self {
            address,
            layout,
            chunks,
            slots,
            times,
            dirty: false,
        })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn layout(&self) -> &HeaderLayout {
        &self.layout
    }

    pub fn version(&self) -> u8 {
        self.layout.version
    }

    pub fn flags(&self) -> HeaderFlags {
        self.layout.flags
    }

    pub fn times(&self) -> Option<&HeaderTimes> {
        self.times.as_ref()
    }

    pub(crate) fn times_mut(&mut self) -> Option<&mut HeaderTimes> {
        self.times.as_mut()
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn msg_header_size(&self) -> usize {
        self.layout.msg_header_size()
    }

    pub fn align(&self, size: usize) -> usize {
        self.layout.align(size)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub(crate) fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    /// Index of the first slot of `msg_type`
    pub fn find_first(&self, msg_type: MessageType) -> Option<usize> {
        self.slots.iter().position(|s| s.msg_type == msg_type)
    }

    pub fn contains(&self, msg_type: MessageType) -> bool {
        self.find_first(msg_type).is_some()
    }

    pub fn count(&self, msg_type: MessageType) -> usize {
        self.slots.iter().filter(|s| s.msg_type == msg_type).count()
    }

    /// Sum of the chunk sizes
    pub fn total_size(&self) -> usize {
        self.chunks.iter().map(|c| c.image.len()).sum()
    }

    /// Payload bytes held by null messages, plus gaps
    pub fn free_space(&self) -> usize {
        let nulls: usize = self
            .slots
            .iter()
            .filter(|s| s.is_null())
            .map(|s| s.raw.len)
            .sum();
        nulls + self.chunks.iter().map(|c| c.gap).sum::<usize>()
    }

    // ------------------------------------------------------------------------
    // Space primitives, used by chunk allocators
    // ------------------------------------------------------------------------

    /// Turn null slot `idx` into a `needed`-byte slot of `msg_type`.
    ///
    /// The remainder becomes a new null slot when it can hold a prefix;
    /// otherwise the whole span goes to the new message.
    pub fn claim_null(&mut self, idx: usize, msg_type: MessageType, needed: usize) -> Result<()> {
        let hdr = self.msg_header_size();
        let slot = self
            .slots
            .get(idx)
            .ok_or_else(|| HeaderError::Argument(format!("no slot {}", idx)))?;
        if !slot.is_null() || slot.raw.len < needed {
            return Err(HeaderError::Allocation(format!(
                "slot {} cannot hold {} bytes",
                idx, needed
            )));
        }

        let raw = slot.raw;
        let leftover = raw.len - needed;
        if leftover >= hdr {
            self.slots[idx].raw.len = needed;
            self.slots.push(Slot::null(RawSpan {
                chunk: raw.chunk,
                offset: raw.offset + needed + hdr,
                len: leftover - hdr,
            }));
        }
        self.assign(idx, msg_type);
        Ok(())
    }

    /// Append a `needed`-byte slot at the end of chunk `chunk`, absorbing its gap
    pub fn append_to_chunk(
        &mut self,
        chunk: usize,
        msg_type: MessageType,
        needed: usize,
    ) -> Result<usize> {
        let hdr = self.msg_header_size();
        let target = self
            .chunks
            .get_mut(chunk)
            .ok_or_else(|| HeaderError::Argument(format!("no chunk {}", chunk)))?;
        let start = target.image.len() - target.gap;
        target.image.resize(start + hdr + needed, 0);
        target.image[start..].fill(0);
        target.gap = 0;

        self.slots.push(Slot::null(RawSpan {
            chunk,
            offset: start + hdr,
            len: needed,
        }));
        let idx = self.slots.len() - 1;
        self.assign(idx, msg_type);
        Ok(idx)
    }

    /// Start a new chunk holding exactly one `needed`-byte slot
    pub fn add_chunk(&mut self, msg_type: MessageType, needed: usize) -> Result<usize> {
        self.chunks.push(Chunk {
            image: Vec::new(),
            gap: 0,
            dirty: true,
        });
        self.append_to_chunk(self.chunks.len() - 1, msg_type, needed)
    }

    fn assign(&mut self, idx: usize, msg_type: MessageType) {
        let slot = &mut self.slots[idx];
        slot.msg_type = msg_type;
        slot.flags = MessageFlags::empty();
        slot.crt_idx = 0;
        slot.state = SlotState::RawOnly;
        let raw = slot.raw;
        let chunk = &mut self.chunks[raw.chunk];
        chunk.image[raw.offset..raw.end()].fill(0);
        chunk.dirty = true;
        self.dirty = true;
    }

    // ------------------------------------------------------------------------
    // Freeing space
    // ------------------------------------------------------------------------

    /// Convert slot `idx` into a null message in place
    pub(crate) fn convert_to_null(&mut self, idx: usize) {
        let raw = self.slots[idx].raw;
        self.slots[idx] = Slot::null(raw);
        let chunk = &mut self.chunks[raw.chunk];
        chunk.image[raw.offset..raw.end()].fill(0);
        chunk.dirty = true;
        self.dirty = true;
        if chunk.gap > 0 {
            self.eliminate_gap(idx);
        }
    }

    /// Record an abandoned span as a new null slot
    pub(crate) fn push_null(&mut self, raw: RawSpan) {
        self.slots.push(Slot::null(raw));
        self.convert_to_null(self.slots.len() - 1);
    }

    /// Slide the messages after null slot `idx` down so the null message
    /// ends at the gap, then fold the gap into it.
    fn eliminate_gap(&mut self, idx: usize) {
        let hdr = self.msg_header_size();
        let raw = self.slots[idx].raw;
        let gap = self.chunks[raw.chunk].gap;
        let null_total = hdr + raw.len;
        let gap_start = self.chunks[raw.chunk].image.len() - gap;

        for (i, slot) in self.slots.iter_mut().enumerate() {
            if i != idx && slot.raw.chunk == raw.chunk && slot.raw.offset > raw.offset {
                slot.raw.offset -= null_total;
            }
        }
        let moved = RawSpan {
            chunk: raw.chunk,
            offset: gap_start - null_total + hdr,
            len: raw.len + gap,
        };
        self.slots[idx].raw = moved;

        let chunk = &mut self.chunks[raw.chunk];
        chunk
            .image
            .copy_within(raw.end()..gap_start, raw.offset - hdr);
        chunk.image[moved.offset..moved.end()].fill(0);
        chunk.gap = 0;
        chunk.dirty = true;
        log_header_debug!("gap folded into null message", chunk = raw.chunk, gap = gap);
    }

    /// Merge physically adjacent null messages within each chunk.
    /// Returns whether anything changed.
    pub fn condense(&mut self) -> bool {
        let hdr = self.msg_header_size();
        let mut merged = false;

        'scan: loop {
            for i in 0..self.slots.len() {
                if !self.slots[i].is_null() {
                    continue;
                }
                let raw = self.slots[i].raw;
                let next = self.slots.iter().position(|s| {
                    s.is_null()
                        && s.raw.chunk == raw.chunk
                        && s.raw.offset == raw.end() + hdr
                        && raw.len + hdr + s.raw.len <= MAX_MESSAGE_SIZE
                });
                if let Some(j) = next {
                    let absorbed = self.slots.remove(j).raw;
                    let i = if j < i { i - 1 } else { i };
                    let mut span = raw;
                    span.len += hdr + absorbed.len;
                    self.slots[i] = Slot::null(span);

                    let chunk = &mut self.chunks[span.chunk];
                    chunk.image[span.offset..span.end()].fill(0);
                    chunk.dirty = true;
                    merged = true;
                    continue 'scan;
                }
            }
            break;
        }

        if merged {
            self.dirty = true;
        }
        merged
    }

    /// Apply unknown-message policy before the header is modified
    pub(crate) fn check_unknown_for_write(&mut self) -> Result<()> {
        let mut marked = false;
        for slot in self.slots.iter_mut().filter(|s| s.msg_type == MessageType::Unknown) {
            if slot
                .flags
                .contains(MessageFlags::FAIL_IF_UNKNOWN_AND_OPEN_FOR_WRITE)
            {
                return Err(HeaderError::WriteProtected(
                    "header holds an unknown message that forbids writing".into(),
                ));
            }
            if slot.flags.contains(MessageFlags::MARK_IF_UNKNOWN)
                && !slot.flags.contains(MessageFlags::WAS_UNKNOWN)
            {
                slot.flags.insert(MessageFlags::WAS_UNKNOWN);
                slot.mark_dirty()?;
                marked = true;
            }
        }
        if marked {
            self.dirty = true;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Encoding
    // ------------------------------------------------------------------------

    /// Encode dirty slot `idx` (prefix and payload) into its chunk image
    pub fn flush_message(&mut self, idx: usize) -> Result<()> {
        let hdr = self.msg_header_size();
        let slot = self
            .slots
            .get(idx)
            .ok_or_else(|| HeaderError::Argument(format!("no slot {}", idx)))?;
        let native = match &slot.state {
            SlotState::Decoded {
                native,
                dirty: true,
            } => native,
            _ => return Err(HeaderError::Argument(format!("slot {} is not dirty", idx))),
        };
        let raw = slot.raw;

        if slot.is_null() && self.chunks[raw.chunk].gap != 0 {
            return Err(HeaderError::Corruption(format!(
                "null message in chunk {} which has a gap",
                raw.chunk
            )));
        }
        let size = u16::try_from(raw.len).map_err(|_| {
            HeaderError::Corruption(format!("message of {} bytes overflows its prefix", raw.len))
        })?;
        let raw_id = match native {
            Message::Unknown(u) => u.raw_id,
            _ => slot.msg_type.id(),
        };

        let mut prefix = Vec::with_capacity(hdr);
        if self.layout.version == 1 {
            prefix.extend_from_slice(&raw_id.to_le_bytes());
            prefix.extend_from_slice(&size.to_le_bytes());
            prefix.extend_from_slice(&[slot.flags.bits(), 0, 0, 0]);
        } else {
            let id = u8::try_from(raw_id).map_err(|_| {
                HeaderError::Corruption(format!("type id {:#x} does not fit a v2 prefix", raw_id))
            })?;
            prefix.push(id);
            prefix.extend_from_slice(&size.to_le_bytes());
            prefix.push(slot.flags.bits());
            if self.layout.tracks_creation_order() {
                prefix.extend_from_slice(&slot.crt_idx.to_le_bytes());
            }
        }

        let payload = match native {
            Message::Unknown(_) => None,
            other => {
                let mut buf = Vec::with_capacity(raw.len);
                registry::encode(other, false, &mut buf)?;
                if buf.len() > raw.len {
                    return Err(HeaderError::Corruption(format!(
                        "{} message needs {} bytes, slot holds {}",
                        slot.msg_type,
                        buf.len(),
                        raw.len
                    )));
                }
                Some(buf)
            }
        };

        let chunk = &mut self.chunks[raw.chunk];
        chunk.image[raw.offset - hdr..raw.offset].copy_from_slice(&prefix);
        if let Some(bytes) = payload {
            let (used, rest) = chunk.image[raw.offset..raw.end()].split_at_mut(bytes.len());
            used.copy_from_slice(&bytes);
            rest.fill(0);
        }
        chunk.dirty = true;
        if let SlotState::Decoded { dirty, .. } = &mut self.slots[idx].state {
            *dirty = false;
        }
        Ok(())
    }

    /// Encode every dirty slot, then check the images against the table.
    ///
    /// Keeps going after a failed slot and reports the first error.
    pub fn flush_messages(&mut self) -> Result<usize> {
        let mut flushed = 0;
        let mut first_err = None;
        for idx in 0..self.slots.len() {
            if !self.slots[idx].is_dirty() {
                continue;
            }
            match self.flush_message(idx) {
                Ok(()) => flushed += 1,
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_err {
            return Err(e);
        }

        let found = self.count_encoded_messages()?;
        if found != self.slots.len() {
            return Err(HeaderError::Corruption(format!(
                "message count mismatch: table has {}, chunks encode {}",
                self.slots.len(),
                found
            )));
        }
        Ok(flushed)
    }

    fn count_encoded_messages(&self) -> Result<usize> {
        let hdr = self.msg_header_size();
        let mut total = 0;
        for (i, chunk) in self.chunks.iter().enumerate() {
            let body = chunk.image.len() - chunk.gap;
            let mut p = 0;
            while p < body {
                if body - p < hdr {
                    return Err(HeaderError::Corruption(format!(
                        "chunk {} ends mid-prefix at offset {}",
                        i, p
                    )));
                }
                let size_at = if self.layout.version == 1 { p + 2 } else { p + 1 };
                let size = u16::from_le_bytes([chunk.image[size_at], chunk.image[size_at + 1]]);
                p += hdr + size as usize;
                total += 1;
            }
            if p != body {
                return Err(HeaderError::Corruption(format!(
                    "chunk {} messages overrun the chunk body",
                    i
                )));
            }
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Comment, RefCount};

    fn layout(version: u8, chunk_size: usize) -> HeaderLayout {
        HeaderLayout {
            version,
            flags: HeaderFlags::empty(),
            chunk_size,
            max_chunk_size: 4096,
        }
    }

    fn place(header: &mut ObjectHeader, idx: usize, native: Message) {
        header.slots[idx].state = SlotState::Decoded {
            native,
            dirty: true,
        };
    }

    fn v2_prefix(id: u8, size: u16, flags: u8) -> Vec<u8> {
        let mut p = vec![id];
        p.extend_from_slice(&size.to_le_bytes());
        p.push(flags);
        p
    }

    #[test]
    fn test_new_header_is_one_null_message() {
        let header = ObjectHeader::new(0, layout(2, 256)).unwrap();
        assert_eq!(header.slots().len(), 1);
        assert!(header.slots()[0].is_null());
        assert_eq!(header.total_size(), 256);
        assert_eq!(header.free_space(), 252);
        assert!(header.is_dirty());
    }

    #[test]
    fn test_v1_sizes_are_aligned() {
        let header = ObjectHeader::new(0, layout(1, 100)).unwrap();
        assert_eq!(header.total_size(), 104);
        assert_eq!(header.slots()[0].raw().len, 96);
        assert_eq!(header.layout().final_size(&Message::RefCount(RefCount { count: 1 }), 0), 16);
    }

    #[test]
    fn test_prefix_size_follows_creation_order_tracking() {
        let mut l = layout(2, 64);
        assert_eq!(l.msg_header_size(), 4);
        l.flags = HeaderFlags::ATTR_CRT_ORDER_TRACKED;
        assert_eq!(l.msg_header_size(), 6);
        l.version = 1;
        assert_eq!(l.msg_header_size(), 8);
    }

    #[test]
    fn test_claim_null_splits_or_consumes() {
        let mut header = ObjectHeader::new(0, layout(2, 256)).unwrap();
        header.claim_null(0, MessageType::RefCount, 20).unwrap();
        assert_eq!(header.slots().len(), 2);
        assert_eq!(header.slots()[0].raw().len, 20);
        let rest = header.slots()[1].raw();
        assert_eq!((rest.offset, rest.len), (28, 228));

        // 2 leftover bytes cannot hold a prefix
        let mut small = ObjectHeader::new(0, layout(2, 26)).unwrap();
        small.claim_null(0, MessageType::RefCount, 20).unwrap();
        assert_eq!(small.slots().len(), 1);
        assert_eq!(small.slots()[0].raw().len, 22);
    }

    #[test]
    fn test_flush_and_reparse() {
        let mut header = ObjectHeader::new(64, layout(2, 128)).unwrap();
        header.claim_null(0, MessageType::Comment, 6).unwrap();
        place(&mut header, 0, Message::Comment(Comment::new("hello")));
        header.slots[0].flags = MessageFlags::CONSTANT;

        assert_eq!(header.flush_messages().unwrap(), 2);
        assert!(header.slots().iter().all(|s| !s.is_dirty()));
        assert!(header.chunks()[0].is_dirty());

        let images = header.chunks().iter().map(|c| c.image().to_vec()).collect();
        let parsed = ObjectHeader::from_chunks(64, *header.layout(), None, images).unwrap();
        assert_eq!(parsed.slots().len(), 2);
        assert_eq!(parsed.slots()[0].msg_type(), MessageType::Comment);
        assert_eq!(parsed.slots()[0].flags(), MessageFlags::CONSTANT);
        assert_eq!(parsed.slots()[0].raw(), header.slots()[0].raw());
        assert_eq!(parsed.slots()[0].state(), &SlotState::RawOnly);
        assert!(parsed.slots()[1].is_null());
    }

    #[test]
    fn test_flush_keeps_going_past_a_failed_slot() {
        let mut header = ObjectHeader::new(0, layout(2, 128)).unwrap();
        header.claim_null(0, MessageType::Comment, 6).unwrap();
        header.claim_null(1, MessageType::Comment, 6).unwrap();
        place(&mut header, 0, Message::Comment(Comment::new("far too long for six bytes")));
        place(&mut header, 1, Message::Comment(Comment::new("world")));

        assert!(matches!(header.flush_messages(), Err(HeaderError::Corruption(_))));
        assert!(header.slots()[0].is_dirty());
        assert!(!header.slots()[1].is_dirty());
        assert!(!header.slots()[2].is_dirty());
        assert!(header.chunks()[0].image().windows(5).any(|w| w == b"world"));
    }

    #[test]
    fn test_flush_detects_table_out_of_step_with_chunks() {
        let mut header = ObjectHeader::new(0, layout(2, 128)).unwrap();
        header.claim_null(0, MessageType::Comment, 6).unwrap();
        place(&mut header, 0, Message::Comment(Comment::new("hello")));
        assert_eq!(header.flush_messages().unwrap(), 2);

        let stray = header.slots[1].clone();
        header.slots.push(stray);
        let err = header.flush_messages().unwrap_err();
        assert!(matches!(err, HeaderError::Corruption(ref m) if m.contains("count mismatch")));
        assert!(header.slots().iter().all(|s| !s.is_dirty()));
    }

    #[test]
    fn test_flush_requires_dirty_slot() {
        let mut header = ObjectHeader::new(0, layout(2, 64)).unwrap();
        header.flush_messages().unwrap();
        assert!(matches!(header.flush_message(0), Err(HeaderError::Argument(_))));
    }

    #[test]
    fn test_condense_merges_adjacent_nulls() {
        let mut header = ObjectHeader::new(0, layout(2, 256)).unwrap();
        header.claim_null(0, MessageType::RefCount, 5).unwrap();
        header.claim_null(1, MessageType::RefCount, 5).unwrap();
        assert_eq!(header.count(MessageType::RefCount), 2);

        header.convert_to_null(0);
        header.convert_to_null(1);
        assert_eq!(header.count(MessageType::Null), 3);
        assert!(header.condense());
        assert_eq!(header.slots().len(), 1);
        assert_eq!(header.slots()[0].raw().len, 252);
        assert!(!header.condense());
    }

    #[test]
    fn test_gap_parsing_rules() {
        let mut image = v2_prefix(0x16, 5, 0);
        image.extend_from_slice(&[0, 1, 0, 0, 0]);
        image.extend_from_slice(&[0, 0]);
        let header = ObjectHeader::from_chunks(0, layout(2, 0), None, vec![image.clone()]).unwrap();
        assert_eq!(header.chunks()[0].gap(), 2);

        let mut with_null = v2_prefix(0x00, 0, 0);
        with_null.extend_from_slice(&image);
        assert!(matches!(
            ObjectHeader::from_chunks(0, layout(2, 0), None, vec![with_null]),
            Err(HeaderError::Corruption(_))
        ));

        let mut v1 = vec![0u8; 8];
        v1.extend_from_slice(&[0, 0, 0, 0]);
        assert!(matches!(
            ObjectHeader::from_chunks(0, layout(1, 0), None, vec![v1]),
            Err(HeaderError::Corruption(_))
        ));
    }

    #[test]
    fn test_freeing_a_message_absorbs_the_gap() {
        let mut image = v2_prefix(0x16, 5, 0);
        image.extend_from_slice(&[0, 1, 0, 0, 0]);
        image.extend_from_slice(&v2_prefix(0x0D, 3, 0));
        image.extend_from_slice(b"hi\0");
        image.extend_from_slice(&[0, 0]);
        let len = image.len();
        let mut header = ObjectHeader::from_chunks(0, layout(2, 0), None, vec![image]).unwrap();

        header.convert_to_null(0);
        assert_eq!(header.chunks()[0].gap(), 0);
        let comment = header.slots()[1].raw();
        assert_eq!(comment.offset, 4);
        assert_eq!(&header.chunks()[0].image()[comment.offset..comment.end()], b"hi\0");
        let null = header.slots()[0].raw();
        assert_eq!(null.end(), len);
        assert_eq!(null.len, 5 + 2);

        header.flush_messages().unwrap();
        let images = vec![header.chunks()[0].image().to_vec()];
        let parsed = ObjectHeader::from_chunks(0, layout(2, 0), None, images).unwrap();
        assert_eq!(parsed.count(MessageType::Comment), 1);
        assert_eq!(parsed.count(MessageType::Null), 1);
    }

    #[test]
    fn test_unknown_messages() {
        let mut image = v2_prefix(0x2A, 4, MessageFlags::MARK_IF_UNKNOWN.bits());
        image.extend_from_slice(&[9, 8, 7, 6]);
        let mut header =
            ObjectHeader::from_chunks(0, layout(2, 0), None, vec![image.clone()]).unwrap();
        assert_eq!(header.slots()[0].msg_type(), MessageType::Unknown);

        header.check_unknown_for_write().unwrap();
        assert!(header.slots()[0].flags().contains(MessageFlags::WAS_UNKNOWN));
        header.flush_messages().unwrap();
        let out = header.chunks()[0].image();
        assert_eq!(out[0], 0x2A);
        assert_eq!(&out[4..], &[9, 8, 7, 6]);

        let mut strict = image.clone();
        strict[3] = MessageFlags::FAIL_IF_UNKNOWN_ALWAYS.bits();
        assert!(matches!(
            ObjectHeader::from_chunks(0, layout(2, 0), None, vec![strict]),
            Err(HeaderError::Decode { .. })
        ));

        let mut no_write = image;
        no_write[3] = MessageFlags::FAIL_IF_UNKNOWN_AND_OPEN_FOR_WRITE.bits();
        let mut header = ObjectHeader::from_chunks(0, layout(2, 0), None, vec![no_write]).unwrap();
        assert!(matches!(
            header.check_unknown_for_write(),
            Err(HeaderError::WriteProtected(_))
        ));
    }
}
