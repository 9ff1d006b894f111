//! Header cache over a file driver.
//!
//! Headers are loaded on first protect and stay resident until evicted.
//! Modified headers are only written back on `flush`, `evict` or `close`.
//!
//! ## Frame layout
//!
//! Each header lives in a frame reserved at the end of the allocated space:
//!
//! ```text
//! "OHDR" | version u8 | flags u8 | chunks u16 | capacity u32 | body u32
//! chunk lengths (u32 each) | times (4 x u32, STORE_TIMES only)
//! chunk images | crc32 of everything before it
//! ```
//!
//! A frame that outgrows its capacity moves to the end of the file and the
//! original address keeps a 12-byte `"OFWD" | target u64` forward record, so
//! header addresses never change.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};

use ohstore_config::{log_cache_debug, log_cache_info, log_header_warn, HeaderConfig};
use ohstore_fd::{Address, FileDriver};

use crate::flags::HeaderFlags;
use crate::header::{HeaderLayout, HeaderTimes, ObjectHeader};
use crate::message::Reader;
use crate::{HeaderError, Result};

const FRAME_MAGIC: &[u8; 4] = b"OHDR";
const FORWARD_MAGIC: &[u8; 4] = b"OFWD";
const PREAMBLE: usize = 16;
const CRC_SIZE: usize = 4;
/// Frame capacities are rounded up to this
const FRAME_ALIGN: u64 = 64;

/// How a protected header will be used
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

#[derive(Debug)]
struct CacheEntry {
    /// `None` while checked out through a guard
    header: Option<ObjectHeader>,
    /// Where the frame currently lives
    location: Address,
    capacity: u64,
    dirty: bool,
}

pub struct MetadataCache<D: FileDriver> {
    driver: D,
    entries: HashMap<Address, CacheEntry>,
    max_chunk_size: usize,
    relocations: u64,
}

fn frame_capacity(len: usize) -> u64 {
    (len as u64).div_ceil(FRAME_ALIGN) * FRAME_ALIGN
}

fn to_u32(value: usize, what: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| HeaderError::Argument(format!("{} of {} bytes exceeds the frame format", what, value)))
}

/// Everything after the preamble except the checksum
fn encode_body(header: &ObjectHeader) -> Result<Vec<u8>> {
    let mut body = Vec::with_capacity(header.total_size() + 4 * header.chunks().len() + 16);
    for chunk in header.chunks() {
        body.extend_from_slice(&to_u32(chunk.image().len(), "chunk")?.to_le_bytes());
    }
    if let Some(t) = header.times() {
        for v in [t.access, t.modification, t.change, t.birth] {
            body.extend_from_slice(&v.to_le_bytes());
        }
    }
    for chunk in header.chunks() {
        body.extend_from_slice(chunk.image());
    }
    Ok(body)
}

fn encode_frame(header: &ObjectHeader, capacity: u64, body: &[u8]) -> Result<Vec<u8>> {
    let nchunks = u16::try_from(header.chunks().len())
        .map_err(|_| HeaderError::Argument("too many header chunks".into()))?;
    let mut frame = Vec::with_capacity(PREAMBLE + body.len() + CRC_SIZE);
    frame.extend_from_slice(FRAME_MAGIC);
    frame.push(header.version());
    frame.push(header.flags().bits());
    frame.extend_from_slice(&nchunks.to_le_bytes());
    frame.extend_from_slice(&to_u32(capacity as usize, "frame capacity")?.to_le_bytes());
    frame.extend_from_slice(&to_u32(body.len(), "frame body")?.to_le_bytes());
    frame.extend_from_slice(body);
    let crc = crc32fast::hash(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    Ok(frame)
}

impl<D: FileDriver> MetadataCache<D> {
    pub fn new(driver: D, config: &HeaderConfig) -> Self {
        Self {
            driver,
            entries: HashMap::new(),
            max_chunk_size: config.max_chunk_size,
            relocations: 0,
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    /// Number of resident headers
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_dirty(&self, addr: Address) -> bool {
        self.entries.get(&addr).is_some_and(|e| e.dirty)
    }

    /// Reserve a frame for a new, empty header and return its address
    pub fn create_header(&mut self, layout: &HeaderLayout) -> Result<Address> {
        let addr = self.driver.eoa();
        let header = ObjectHeader::new(addr, *layout)?;
        let len = PREAMBLE + encode_body(&header)?.len() + CRC_SIZE;
        let capacity = frame_capacity(len);
        self.driver.set_eoa(addr + capacity)?;
        self.entries.insert(
            addr,
            CacheEntry {
                header: Some(header),
                location: addr,
                capacity,
                dirty: true,
            },
        );
        log_cache_debug!("header created", address = addr, capacity = capacity);
        Ok(addr)
    }

    /// Check a header out of the cache, loading it if needed.
    ///
    /// Write mode applies the unknown-message policy first. The header goes
    /// back into the cache when the guard is dropped.
    pub fn protect(&mut self, addr: Address, mode: LockMode) -> Result<HeaderGuard<'_, D>> {
        if !self.entries.contains_key(&addr) {
            let entry = self.load(addr)?;
            self.entries.insert(addr, entry);
        }
        let entry = self
            .entries
            .get_mut(&addr)
            .ok_or_else(|| HeaderError::Corruption(format!("header {} vanished from cache", addr)))?;
        let mut header = entry
            .header
            .take()
            .ok_or_else(|| HeaderError::Argument(format!("header {} is already protected", addr)))?;
        if mode == LockMode::Write {
            if let Err(e) = header.check_unknown_for_write() {
                entry.header = Some(header);
                return Err(e);
            }
        }
        Ok(HeaderGuard {
            cache: self,
            header,
            addr,
            mode,
        })
    }

    fn unprotect(&mut self, addr: Address, mut header: ObjectHeader) {
        let Some(entry) = self.entries.get_mut(&addr) else {
            log_header_warn!("unprotect of unknown header", address = addr);
            return;
        };
        if header.take_dirty() {
            entry.dirty = true;
        }
        entry.header = Some(header);
    }

    fn load(&mut self, addr: Address) -> Result<CacheEntry> {
        let mut preamble = [0u8; PREAMBLE];
        let mut location = addr;
        self.driver.read(location, &mut preamble)?;
        if &preamble[..4] == FORWARD_MAGIC {
            let mut r = Reader::new(&preamble[4..12], "forward record");
            location = r.u64()?;
            self.driver.read(location, &mut preamble)?;
        }
        if &preamble[..4] != FRAME_MAGIC {
            return Err(HeaderError::Corruption(format!(
                "no header frame at {}",
                location
            )));
        }

        let mut r = Reader::new(&preamble[4..], "frame preamble");
        let version = r.u8()?;
        let flags = HeaderFlags::from_bits(r.u8()?)
            .ok_or_else(|| HeaderError::Corruption(format!("unknown header flags at {}", location)))?;
        let nchunks = r.u16()? as usize;
        let capacity = u64::from(r.u32()?);
        let body_len = r.u32()? as usize;
        if (PREAMBLE + body_len + CRC_SIZE) as u64 > capacity {
            return Err(HeaderError::Corruption(format!(
                "frame at {} claims {} body bytes but holds {}",
                location, body_len, capacity
            )));
        }
        if location.saturating_add(capacity) > self.driver.eoa() {
            return Err(HeaderError::Corruption(format!(
                "frame at {} with capacity {} runs past eoa {}",
                location,
                capacity,
                self.driver.eoa()
            )));
        }

        let mut rest = vec![0u8; body_len + CRC_SIZE];
        self.driver.read(location + PREAMBLE as u64, &mut rest)?;
        let (body, stored) = rest.split_at(body_len);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&preamble);
        hasher.update(body);
        let expected = u32::from_le_bytes([stored[0], stored[1], stored[2], stored[3]]);
        if hasher.finalize() != expected {
            return Err(HeaderError::Corruption(format!(
                "checksum mismatch in header frame at {}",
                location
            )));
        }

        let mut r = Reader::new(body, "header frame");
        let lengths = (0..nchunks)
            .map(|_| r.u32().map(|n| n as usize))
            .collect::<Result<Vec<_>>>()?;
        let times = if flags.contains(HeaderFlags::STORE_TIMES) {
            Some(HeaderTimes {
                access: r.u32()?,
                modification: r.u32()?,
                change: r.u32()?,
                birth: r.u32()?,
            })
        } else {
            None
        };
        let images = lengths
            .iter()
            .map(|&n| r.bytes(n).map(<[u8]>::to_vec))
            .collect::<Result<Vec<_>>>()?;

        let layout = HeaderLayout {
            version,
            flags,
            chunk_size: lengths.first().copied().unwrap_or_default(),
            max_chunk_size: self.max_chunk_size,
        };
        let mut header = ObjectHeader::from_chunks(addr, layout, times, images)?;
        header.take_dirty();
        log_cache_debug!(
            "header loaded",
            address = addr,
            location = location,
            chunks = nchunks
        );
        Ok(CacheEntry {
            header: Some(header),
            location,
            capacity,
            dirty: false,
        })
    }

    fn flush_entry(&mut self, addr: Address) -> Result<()> {
        let Self {
            driver,
            entries,
            relocations,
            ..
        } = self;
        let entry = entries
            .get_mut(&addr)
            .ok_or_else(|| HeaderError::Argument(format!("header {} is not cached", addr)))?;
        let header = entry
            .header
            .as_mut()
            .ok_or_else(|| HeaderError::Argument(format!("header {} is protected", addr)))?;

        header.flush_messages()?;
        let body = encode_body(header)?;
        let len = PREAMBLE + body.len() + CRC_SIZE;
        if len as u64 > entry.capacity {
            let capacity = frame_capacity(len);
            let location = driver.eoa();
            driver.set_eoa(location + capacity)?;
            let mut forward = Vec::with_capacity(12);
            forward.extend_from_slice(FORWARD_MAGIC);
            forward.extend_from_slice(&location.to_le_bytes());
            driver.write(addr, &forward)?;
            log_cache_debug!(
                "header frame relocated",
                address = addr,
                from = entry.location,
                to = location,
                capacity = capacity
            );
            entry.location = location;
            entry.capacity = capacity;
            *relocations += 1;
        }

        let frame = encode_frame(header, entry.capacity, &body)?;
        driver.write(entry.location, &frame)?;
        for chunk in header.chunks.iter_mut() {
            chunk.dirty = false;
        }
        header.take_dirty();
        entry.dirty = false;
        Ok(())
    }

    /// Write every modified resident header back, returning how many were
    /// written. Headers still protected are skipped.
    pub fn flush(&mut self) -> Result<usize> {
        let mut dirty: Vec<Address> = self
            .entries
            .iter()
            .filter(|(_, e)| e.dirty && e.header.is_some())
            .map(|(addr, _)| *addr)
            .collect();
        dirty.sort_unstable();
        for addr in &dirty {
            self.flush_entry(*addr)?;
        }
        if !dirty.is_empty() {
            log_cache_debug!("cache flushed", headers = dirty.len());
        }
        Ok(dirty.len())
    }

    /// Flush one header and drop it from memory
    pub fn evict(&mut self, addr: Address) -> Result<()> {
        let entry = self
            .entries
            .get(&addr)
            .ok_or_else(|| HeaderError::Argument(format!("header {} is not cached", addr)))?;
        if entry.header.is_none() {
            return Err(HeaderError::Argument(format!(
                "header {} is protected and cannot be evicted",
                addr
            )));
        }
        if entry.dirty {
            self.flush_entry(addr)?;
        }
        self.entries.remove(&addr);
        Ok(())
    }

    /// Flush everything, trim the file to its allocated size and hand the
    /// driver back
    pub fn close(mut self) -> Result<D> {
        self.flush()?;
        self.driver.truncate()?;
        log_cache_info!(
            "cache closed",
            driver = self.driver.name(),
            headers = self.entries.len(),
            relocations = self.relocations,
            eoa = self.driver.eoa()
        );
        Ok(self.driver)
    }
}

/// A header checked out of a [`MetadataCache`]
pub struct HeaderGuard<'a, D: FileDriver> {
    cache: &'a mut MetadataCache<D>,
    header: ObjectHeader,
    addr: Address,
    mode: LockMode,
}

impl<D: FileDriver> HeaderGuard<'_, D> {
    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl<D: FileDriver> std::fmt::Debug for HeaderGuard<'_, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeaderGuard")
            .field("header", &self.header)
            .field("addr", &self.addr)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl<D: FileDriver> Deref for HeaderGuard<'_, D> {
    type Target = ObjectHeader;

    fn deref(&self) -> &ObjectHeader {
        &self.header
    }
}

impl<D: FileDriver> DerefMut for HeaderGuard<'_, D> {
    fn deref_mut(&mut self) -> &mut ObjectHeader {
        &mut self.header
    }
}

impl<D: FileDriver> Drop for HeaderGuard<'_, D> {
    fn drop(&mut self) {
        let header = std::mem::take(&mut self.header);
        self.cache.unprotect(self.addr, header);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::FirstFitAllocator;
    use crate::flags::{MessageFlags, UpdateFlags};
    use crate::message::{Comment, Message};
    use crate::registry::MessageType;
    use crate::share::{SharePolicy, SharedHeap};
    use crate::store::MessageStore;
    use ohstore_fd::{AccessFlags, CoreFile};

    fn cache() -> MetadataCache<CoreFile> {
        MetadataCache::new(CoreFile::new(), &HeaderConfig::default())
    }

    fn layout() -> HeaderLayout {
        HeaderLayout::from_config(&HeaderConfig::default())
    }

    fn append_comment(cache: &mut MetadataCache<CoreFile>, addr: Address, text: &str) {
        let mut heap = SharedHeap::new(SharePolicy::disabled());
        let mut alloc = FirstFitAllocator;
        let mut store = MessageStore::new(AccessFlags::READ_WRITE, &mut heap, &mut alloc);
        let mut guard = cache.protect(addr, LockMode::Write).unwrap();
        store
            .append(
                &mut guard,
                &Message::Comment(Comment::new(text)),
                MessageFlags::empty(),
                UpdateFlags::empty(),
            )
            .unwrap();
    }

    fn reopen(cache: MetadataCache<CoreFile>) -> MetadataCache<CoreFile> {
        let image = cache.close().unwrap().into_image();
        let mut driver = CoreFile::from_image(image);
        let eof = driver.eof();
        driver.set_eoa(eof).unwrap();
        MetadataCache::new(driver, &HeaderConfig::default())
    }

    fn comments(cache: &mut MetadataCache<CoreFile>, addr: Address) -> Vec<String> {
        let mut heap = SharedHeap::default();
        let mut alloc = FirstFitAllocator;
        let mut store = MessageStore::new(AccessFlags::READ_ONLY, &mut heap, &mut alloc);
        let mut guard = cache.protect(addr, LockMode::Read).unwrap();
        let mut out = Vec::new();
        store
            .iterate(&mut guard, MessageType::Comment, |msg, _| {
                if let Message::Comment(c) = msg {
                    out.push(c.text.clone());
                }
                Ok(crate::store::Visit::Continue)
            })
            .unwrap();
        out
    }

    #[test]
    fn test_headers_survive_close_and_reopen() {
        let mut cache = cache();
        let a = cache.create_header(&layout()).unwrap();
        let b = cache.create_header(&layout()).unwrap();
        assert_ne!(a, b);
        append_comment(&mut cache, a, "first");
        append_comment(&mut cache, b, "second");
        assert!(cache.is_dirty(a));

        let mut cache = reopen(cache);
        assert!(cache.is_empty());
        assert_eq!(comments(&mut cache, a), vec!["first"]);
        assert_eq!(comments(&mut cache, b), vec!["second"]);
    }

    #[test]
    fn test_guard_returns_dirty_state() {
        let mut cache = cache();
        let addr = cache.create_header(&layout()).unwrap();
        assert_eq!(cache.flush().unwrap(), 1);
        assert!(!cache.is_dirty(addr));

        drop(cache.protect(addr, LockMode::Read).unwrap());
        assert!(!cache.is_dirty(addr));

        append_comment(&mut cache, addr, "x");
        assert!(cache.is_dirty(addr));
        assert_eq!(cache.flush().unwrap(), 1);
        assert_eq!(cache.flush().unwrap(), 0);
    }

    #[test]
    fn test_leaked_guard_keeps_header_protected() {
        let mut cache = cache();
        let addr = cache.create_header(&layout()).unwrap();
        std::mem::forget(cache.protect(addr, LockMode::Write).unwrap());
        assert!(matches!(
            cache.protect(addr, LockMode::Read),
            Err(HeaderError::Argument(_))
        ));
        assert!(matches!(cache.evict(addr), Err(HeaderError::Argument(_))));
    }

    #[test]
    fn test_growing_header_is_forwarded() {
        let mut cache = cache();
        let addr = cache.create_header(&layout()).unwrap();
        let texts: Vec<String> = (0..40).map(|i| format!("comment number {:02}", i)).collect();
        for text in &texts {
            append_comment(&mut cache, addr, text);
        }
        cache.flush().unwrap();
        assert_eq!(cache.relocations, 1);

        let mut cache = reopen(cache);
        let mut forward = [0u8; 4];
        cache.driver_mut().read(addr, &mut forward).unwrap();
        assert_eq!(&forward, FORWARD_MAGIC);
        assert_eq!(comments(&mut cache, addr), texts);
    }

    #[test]
    fn test_evict_flushes() {
        let mut cache = cache();
        let addr = cache.create_header(&layout()).unwrap();
        append_comment(&mut cache, addr, "kept");
        cache.evict(addr).unwrap();
        assert!(cache.is_empty());
        assert_eq!(comments(&mut cache, addr), vec!["kept"]);
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let mut cache = cache();
        let addr = cache.create_header(&layout()).unwrap();
        append_comment(&mut cache, addr, "payload");
        let mut image = cache.close().unwrap().into_image();
        image[addr as usize + PREAMBLE + 6] ^= 0xFF;

        let mut driver = CoreFile::from_image(image);
        let eof = driver.eof();
        driver.set_eoa(eof).unwrap();
        let mut cache = MetadataCache::new(driver, &HeaderConfig::default());
        assert!(matches!(
            cache.protect(addr, LockMode::Read),
            Err(HeaderError::Corruption(_))
        ));
    }

    #[test]
    fn test_oversized_frame_rejected_before_reading_body() {
        let mut cache = cache();
        let addr = cache.create_header(&layout()).unwrap();
        let mut image = cache.close().unwrap().into_image();
        let at = addr as usize + 8;
        image[at..at + 4].copy_from_slice(&u32::MAX.to_le_bytes());
        image[at + 4..at + 8].copy_from_slice(&(u32::MAX - 64).to_le_bytes());

        let mut driver = CoreFile::from_image(image);
        let eof = driver.eof();
        driver.set_eoa(eof).unwrap();
        let mut cache = MetadataCache::new(driver, &HeaderConfig::default());
        let err = cache.protect(addr, LockMode::Read).unwrap_err();
        assert!(matches!(err, HeaderError::Corruption(ref m) if m.contains("past eoa")));
    }

    #[test]
    fn test_garbage_address_is_corruption() {
        let mut driver = CoreFile::from_image(vec![0xAB; 256]);
        driver.set_eoa(256).unwrap();
        let mut cache = MetadataCache::new(driver, &HeaderConfig::default());
        assert!(matches!(
            cache.protect(64, LockMode::Read),
            Err(HeaderError::Corruption(_))
        ));
    }
}
