//! A file full of object headers.
//!
//! [`Container`] ties a driver, the header cache, a shared-message heap and
//! an allocator together and exposes the message operations by header
//! address. The shared heap lives in memory for as long as the container is
//! open.

use std::path::Path;

use ohstore_config::{log_cache_info, Config};
use ohstore_fd::{AccessFlags, Address, CoreFile, DirectFile, FileDriver};
use tracing::instrument;

use crate::alloc::FirstFitAllocator;
use crate::cache::{LockMode, MetadataCache};
use crate::flags::{MessageFlags, UpdateFlags};
use crate::header::{HeaderLayout, ObjectHeader};
use crate::message::Message;
use crate::registry::MessageType;
use crate::share::{SharePolicy, SharedHeap};
use crate::store::{MessageStore, Selector, Visit};
use crate::{HeaderError, Result};

pub struct Container<D: FileDriver> {
    cache: MetadataCache<D>,
    heap: SharedHeap,
    allocator: FirstFitAllocator,
    intent: AccessFlags,
    layout: HeaderLayout,
}

impl Container<DirectFile> {
    /// Create (or truncate) a container file
    pub fn create(path: &Path, config: &Config) -> Result<Self> {
        let flags = AccessFlags::READ_WRITE | AccessFlags::CREATE | AccessFlags::TRUNCATE;
        let driver = DirectFile::open(path, flags, &config.driver)?;
        Self::with_driver(driver, flags, config)
    }

    /// Open an existing container file
    pub fn open(path: &Path, intent: AccessFlags, config: &Config) -> Result<Self> {
        let driver = DirectFile::open(path, intent, &config.driver)?;
        Self::with_driver(driver, intent, config)
    }
}

impl Container<CoreFile> {
    /// Scratch container backed by memory
    pub fn in_memory(config: &Config) -> Result<Self> {
        Self::with_driver(CoreFile::new(), AccessFlags::READ_WRITE, config)
    }
}

impl<D: FileDriver> Container<D> {
    /// Wrap an open driver; everything it already holds counts as allocated
    pub fn with_driver(mut driver: D, intent: AccessFlags, config: &Config) -> Result<Self> {
        config
            .header
            .validate()
            .map_err(|e| HeaderError::Argument(e.to_string()))?;
        let eof = driver.eof();
        driver.set_eoa(eof)?;
        log_cache_info!(
            "container opened",
            driver = driver.name(),
            eof = eof,
            writable = intent.is_writable()
        );
        Ok(Self {
            cache: MetadataCache::new(driver, &config.header),
            heap: SharedHeap::new(SharePolicy::from_config(&config.share)?),
            allocator: FirstFitAllocator,
            intent,
            layout: HeaderLayout::from_config(&config.header),
        })
    }

    pub fn layout(&self) -> &HeaderLayout {
        &self.layout
    }

    pub fn shared_heap(&self) -> &SharedHeap {
        &self.heap
    }

    pub fn driver(&self) -> &D {
        self.cache.driver()
    }

    fn require_write(&self) -> Result<()> {
        if !self.intent.is_writable() {
            return Err(HeaderError::WriteProtected("container is read-only".into()));
        }
        Ok(())
    }

    /// Run `f` against the protected header at `addr`
    fn with_header<T>(
        &mut self,
        addr: Address,
        mode: LockMode,
        f: impl FnOnce(&mut MessageStore<'_>, &mut ObjectHeader) -> Result<T>,
    ) -> Result<T> {
        if mode == LockMode::Write {
            self.require_write()?;
        }
        let mut guard = self.cache.protect(addr, mode)?;
        let mut store = MessageStore::new(self.intent, &mut self.heap, &mut self.allocator);
        f(&mut store, &mut guard)
    }

    /// New empty header using the container's default layout
    pub fn create_header(&mut self) -> Result<Address> {
        let layout = self.layout;
        self.create_header_with(layout)
    }

    pub fn create_header_with(&mut self, layout: HeaderLayout) -> Result<Address> {
        self.require_write()?;
        self.cache.create_header(&layout)
    }

    #[instrument(level = "debug", skip(self, message), fields(msg_type = %message.message_type()))]
    pub fn append(
        &mut self,
        addr: Address,
        message: &Message,
        flags: MessageFlags,
        update: UpdateFlags,
    ) -> Result<usize> {
        self.with_header(addr, LockMode::Write, |store, header| {
            store.append(header, message, flags, update)
        })
    }

    #[instrument(level = "debug", skip(self, message), fields(msg_type = %message.message_type()))]
    pub fn write(
        &mut self,
        addr: Address,
        message: &Message,
        flags: MessageFlags,
        update: UpdateFlags,
    ) -> Result<()> {
        self.with_header(addr, LockMode::Write, |store, header| {
            store.write(header, message, flags, update)
        })
    }

    pub fn read(&mut self, addr: Address, msg_type: MessageType) -> Result<Message> {
        self.with_header(addr, LockMode::Read, |store, header| store.read(header, msg_type))
    }

    pub fn read_into(&mut self, addr: Address, msg_type: MessageType, dest: &mut Message) -> Result<()> {
        self.with_header(addr, LockMode::Read, |store, header| {
            store.read_into(header, msg_type, dest)
        })
    }

    pub fn exists(&mut self, addr: Address, msg_type: MessageType) -> Result<bool> {
        self.with_header(addr, LockMode::Read, |store, header| Ok(store.exists(header, msg_type)))
    }

    pub fn count(&mut self, addr: Address, msg_type: MessageType) -> Result<usize> {
        self.with_header(addr, LockMode::Read, |store, header| Ok(store.count(header, msg_type)))
    }

    #[instrument(level = "debug", skip(self))]
    pub fn remove(
        &mut self,
        addr: Address,
        msg_type: MessageType,
        selector: Selector,
        adjust_links: bool,
        update: UpdateFlags,
    ) -> Result<usize> {
        self.with_header(addr, LockMode::Write, |store, header| {
            store.remove(header, msg_type, selector, adjust_links, update)
        })
    }

    pub fn remove_matching<P>(
        &mut self,
        addr: Address,
        msg_type: MessageType,
        adjust_links: bool,
        update: UpdateFlags,
        predicate: P,
    ) -> Result<usize>
    where
        P: FnMut(&Message, usize) -> Result<bool>,
    {
        self.with_header(addr, LockMode::Write, |store, header| {
            store.remove_matching(header, msg_type, adjust_links, update, predicate)
        })
    }

    pub fn iterate<F>(&mut self, addr: Address, msg_type: MessageType, visitor: F) -> Result<Visit>
    where
        F: FnMut(&Message, usize) -> Result<Visit>,
    {
        self.with_header(addr, LockMode::Read, |store, header| {
            store.iterate(header, msg_type, visitor)
        })
    }

    pub fn touch(&mut self, addr: Address, force: bool) -> Result<()> {
        self.with_header(addr, LockMode::Write, |store, header| store.touch(header, force))
    }

    /// Copy every `msg_type` message of header `src` into header `dst_addr`
    /// of `dst`, which may be this container's twin over another file.
    pub fn copy_messages<E: FileDriver>(
        &mut self,
        src: Address,
        msg_type: MessageType,
        dst: &mut Container<E>,
        dst_addr: Address,
    ) -> Result<usize> {
        dst.require_write()?;
        let mut src_header = self.cache.protect(src, LockMode::Read)?;
        let mut src_store = MessageStore::new(self.intent, &mut self.heap, &mut self.allocator);
        let mut dst_header = dst.cache.protect(dst_addr, LockMode::Write)?;
        let mut dst_store = MessageStore::new(dst.intent, &mut dst.heap, &mut dst.allocator);
        src_store.copy_to(&mut src_header, msg_type, &mut dst_store, &mut dst_header)
    }

    /// Write modified headers back to the driver
    pub fn flush(&mut self) -> Result<usize> {
        self.cache.flush()
    }

    pub fn evict(&mut self, addr: Address) -> Result<()> {
        self.cache.evict(addr)
    }

    /// Flush, trim and return the driver
    pub fn close(self) -> Result<D> {
        self.cache.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Comment;

    #[test]
    fn test_read_only_container_rejects_writes() {
        let config = Config::default();
        let mut rw = Container::in_memory(&config).unwrap();
        let addr = rw.create_header().unwrap();
        rw.append(
            addr,
            &Message::Comment(Comment::new("hello")),
            MessageFlags::empty(),
            UpdateFlags::empty(),
        )
        .unwrap();
        let image = rw.close().unwrap().into_image();

        let mut ro =
            Container::with_driver(CoreFile::from_image(image), AccessFlags::READ_ONLY, &config).unwrap();
        assert_eq!(
            ro.read(addr, MessageType::Comment).unwrap(),
            Message::Comment(Comment::new("hello"))
        );
        assert!(matches!(ro.create_header(), Err(HeaderError::WriteProtected(_))));
        assert!(matches!(
            ro.remove(addr, MessageType::Comment, Selector::All, true, UpdateFlags::empty()),
            Err(HeaderError::WriteProtected(_))
        ));
    }

    #[test]
    fn test_unknown_address() {
        let mut c = Container::in_memory(&Config::default()).unwrap();
        c.create_header().unwrap();
        assert!(c.read(1_000_000, MessageType::Comment).is_err());
    }
}
