//! Uncached file driver with alignment-aware transfers.
//!
//! ## Alignment Contract
//!
//! When the open probe finds that the file system rejects unaligned direct
//! transfers, a handle is flagged `must_align`. From then on a request is
//! passed straight to the OS only when its address, its length and its buffer
//! start are all aligned. Anything else goes through an aligned staging
//! buffer: reads fetch whole blocks and copy the requested slice out, writes
//! read-modify-write every block the request does not cover completely.
//!
//! Staged writes may extend the physical file past the logical end by up to
//! one block. The padding is removed by [`DirectFile::truncate`].

use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use ohstore_config::{
    log_driver_debug, log_driver_info, log_driver_trace, log_driver_warn, DriverConfig,
};
use tracing::instrument;

use crate::aligned::AlignedBuf;
use crate::identity::{FileId, FileIdentity};
use crate::{AccessFlags, Address, AddressSpace, FdError, Features, FileDriver, IoOp, Result};

/// Transfer counters, mostly useful to verify which path a request took
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoStats {
    pub seeks: u64,
    pub direct_transfers: u64,
    pub staged_transfers: u64,
    pub staging_allocations: u64,
}

/// An open file under direct-I/O alignment rules
#[derive(Debug)]
pub struct DirectFile {
    file: File,
    path: PathBuf,
    space: AddressSpace,
    /// OS cursor as last left by this handle; `None` forces the next seek
    pos: Option<Address>,
    last_op: IoOp,
    mem_boundary: usize,
    block_size: usize,
    copy_buffer_size: usize,
    must_align: bool,
    writable: bool,
    id: FileId,
    stats: IoStats,
}

impl DirectFile {
    /// Open (or create) `path` and probe whether transfers must be aligned.
    #[instrument(skip(config), level = "debug")]
    pub fn open(path: &Path, flags: AccessFlags, config: &DriverConfig) -> Result<Self> {
        config.validate()?;
        if path.as_os_str().is_empty() {
            return Err(FdError::Argument("invalid file name".into()));
        }
        let creating = flags.intersects(AccessFlags::CREATE | AccessFlags::TRUNCATE);
        if !flags.is_writable() && (creating || flags.contains(AccessFlags::EXCLUSIVE)) {
            return Err(FdError::Argument(
                "create, truncate and exclusive opens need write access".into(),
            ));
        }

        let mut file = open_file(path, flags, config.direct_io)?;
        configure_after_open(&file, config.direct_io)?;

        let eof = file.metadata()?.len();
        let id = FileId::of(&file)?;

        // Writing the probe is only harmless on an empty file we just made.
        let write_probe = flags.is_writable() && creating && eof == 0;
        let probed = probe_alignment(&mut file, config, write_probe)?;
        let must_align = probed || config.force_alignment;
        if config.direct_io && !probed {
            log_driver_warn!(
                "direct I/O requested but unaligned transfers were accepted",
                path = path.display().to_string().as_str()
            );
        }

        log_driver_info!(
            "file opened",
            eof = eof,
            must_align = must_align,
            probed = probed,
            direct_io = config.direct_io
        );

        Ok(Self {
            file,
            path: path.to_path_buf(),
            space: AddressSpace::new(eof),
            pos: None,
            last_op: IoOp::Unknown,
            mem_boundary: config.memory_boundary,
            block_size: config.file_block_size,
            copy_buffer_size: config.max_copy_buffer_size,
            must_align,
            writable: flags.is_writable(),
            id,
            stats: IoStats::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn must_align(&self) -> bool {
        self.must_align
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn memory_boundary(&self) -> usize {
        self.mem_boundary
    }

    pub fn copy_buffer_size(&self) -> usize {
        self.copy_buffer_size
    }

    pub fn stats(&self) -> IoStats {
        self.stats
    }

    /// Cached OS position, `None` when unknown
    pub fn position(&self) -> Option<Address> {
        self.pos
    }

    pub fn last_op(&self) -> IoOp {
        self.last_op
    }

    /// Underlying OS descriptor
    #[cfg(unix)]
    pub fn raw_fd(&self) -> std::os::unix::io::RawFd {
        use std::os::unix::io::AsRawFd;
        self.file.as_raw_fd()
    }

    /// Underlying OS handle
    #[cfg(windows)]
    pub fn raw_handle(&self) -> std::os::windows::io::RawHandle {
        use std::os::windows::io::AsRawHandle;
        self.file.as_raw_handle()
    }

    /// Read `buf.len()` bytes at `addr`.
    #[instrument(skip(self, buf), fields(size = buf.len()), level = "debug")]
    pub fn read(&mut self, addr: Address, buf: &mut [u8]) -> Result<()> {
        let result = self
            .space
            .check_region(addr, buf.len())
            .and_then(|()| self.read_inner(addr, buf));
        if result.is_err() {
            self.reset_position();
        }
        result
    }

    /// Write `buf` at `addr`.
    #[instrument(skip(self, buf), fields(size = buf.len()), level = "debug")]
    pub fn write(&mut self, addr: Address, buf: &[u8]) -> Result<()> {
        let result = self
            .space
            .check_region(addr, buf.len())
            .and_then(|()| self.write_inner(addr, buf));
        if result.is_err() {
            self.reset_position();
        }
        result
    }

    /// Bring the physical size in line with the logical one.
    ///
    /// Shrinks or grows to EOA when the markers differ; otherwise, on an
    /// aligned handle, trims the block padding left behind by staged writes.
    /// A read-only handle is left untouched.
    #[instrument(skip(self), level = "debug")]
    pub fn truncate(&mut self) -> Result<()> {
        let eoa = self.space.eoa();
        let eof = self.space.physical_eof();
        if !self.writable {
            log_driver_trace!("truncate skipped on read-only handle", eoa = eoa, eof = eof);
            return Ok(());
        }

        if eoa != eof {
            if let Err(e) = self.file.set_len(eoa) {
                self.reset_position();
                return Err(e.into());
            }
            self.space.set_physical_eof(eoa);
            self.reset_position();
            log_driver_debug!("file resized to eoa", eoa = eoa, old_eof = eof);
        } else if self.must_align {
            if let Err(e) = self.file.set_len(eof) {
                self.reset_position();
                return Err(e.into());
            }
            log_driver_trace!("alignment padding trimmed", eof = eof);
        }
        Ok(())
    }

    /// Release the handle.
    pub fn close(self) -> Result<()> {
        log_driver_debug!("file closed", eof = self.space.reported_eof());
        drop(self.file);
        Ok(())
    }

    fn reset_position(&mut self) {
        self.pos = None;
        self.last_op = IoOp::Unknown;
    }

    fn is_direct_eligible(&self, addr: Address, buf_addr: usize, size: usize) -> bool {
        !self.must_align
            || (addr % self.block_size as u64 == 0
                && size % self.block_size == 0
                && buf_addr % self.mem_boundary == 0)
    }

    /// Staging buffer size for a `size`-byte request
    fn staging_size(&self, size: usize) -> usize {
        if size < self.copy_buffer_size {
            (size / self.block_size) * self.block_size + self.block_size
        } else {
            self.copy_buffer_size
        }
    }

    fn seek(&mut self, addr: Address) -> Result<()> {
        self.file.seek(SeekFrom::Start(addr))?;
        self.stats.seeks += 1;
        self.pos = Some(addr);
        Ok(())
    }

    /// Seek unless the cursor is already at `addr` from an `op` of the same kind
    fn seek_for(&mut self, addr: Address, op: IoOp) -> Result<()> {
        if self.pos != Some(addr) || self.last_op != op {
            self.seek(addr)?;
        }
        Ok(())
    }

    fn read_inner(&mut self, addr: Address, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        if self.is_direct_eligible(addr, buf.as_ptr() as usize, buf.len()) {
            self.stats.direct_transfers += 1;
            self.seek_for(addr, IoOp::Read)?;
            let filled = read_zero_extended(&mut self.file, buf)?;
            self.pos = Some(addr + filled as u64);
        } else {
            self.read_staged(addr, buf)?;
        }
        self.last_op = IoOp::Read;
        Ok(())
    }

    fn write_inner(&mut self, addr: Address, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        if self.is_direct_eligible(addr, buf.as_ptr() as usize, buf.len()) {
            self.stats.direct_transfers += 1;
            self.seek_for(addr, IoOp::Write)?;
            write_retrying(&mut self.file, buf)?;
            self.pos = Some(addr + buf.len() as u64);
        } else {
            self.write_staged(addr, buf)?;
        }
        self.last_op = IoOp::Write;
        self.space.extend(addr + buf.len() as u64);
        Ok(())
    }

    fn allocate_staging(&mut self, size: usize) -> Result<AlignedBuf> {
        let alloc_size = self.staging_size(size);
        let staging = AlignedBuf::zeroed(alloc_size, self.mem_boundary)?;
        self.stats.staging_allocations += 1;
        self.stats.staged_transfers += 1;
        Ok(staging)
    }

    /// Bytes of the `span`-byte window at `start` that exist in the file
    fn on_disk(&self, start: Address, span: usize) -> usize {
        let remaining = self.space.physical_eof().saturating_sub(start);
        usize::try_from(remaining).map_or(span, |r| r.min(span))
    }

    fn read_staged(&mut self, addr: Address, buf: &mut [u8]) -> Result<()> {
        let block = self.block_size;
        let mut staging = self.allocate_staging(buf.len())?;
        let alloc_size = staging.len();

        let mut done = 0usize;
        while done < buf.len() {
            let cur = addr + done as u64;
            let head = (cur % block as u64) as usize;
            let block_start = cur - head as u64;
            let chunk = (buf.len() - done).min(alloc_size - head);
            let span = round_up(head + chunk, block);

            let want = self.on_disk(block_start, span);
            let window = &mut staging.as_mut_slice()[..span];
            window.fill(0);
            self.seek(block_start)?;
            let got = read_window(&mut self.file, window, want)?;
            self.pos = Some(block_start + got as u64);

            buf[done..done + chunk].copy_from_slice(&window[head..head + chunk]);
            done += chunk;
        }
        log_driver_trace!("staged read", addr = addr, size = buf.len(), staging = alloc_size);
        Ok(())
    }

    fn write_staged(&mut self, addr: Address, buf: &[u8]) -> Result<()> {
        let block = self.block_size;
        let mut staging = self.allocate_staging(buf.len())?;
        let alloc_size = staging.len();

        let mut done = 0usize;
        while done < buf.len() {
            let cur = addr + done as u64;
            let head = (cur % block as u64) as usize;
            let block_start = cur - head as u64;
            let chunk = (buf.len() - done).min(alloc_size - head);
            let span = round_up(head + chunk, block);

            let want = self.on_disk(block_start, span);
            let window = &mut staging.as_mut_slice()[..span];
            // Only a window the incoming bytes cover exactly may skip the read.
            if head != 0 || chunk != span {
                window.fill(0);
                self.seek(block_start)?;
                read_window(&mut self.file, window, want)?;
            }
            window[head..head + chunk].copy_from_slice(&buf[done..done + chunk]);

            self.seek(block_start)?;
            write_retrying(&mut self.file, window)?;
            self.pos = Some(block_start + span as u64);
            done += chunk;
        }
        log_driver_trace!("staged write", addr = addr, size = buf.len(), staging = alloc_size);
        Ok(())
    }
}

impl FileDriver for DirectFile {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn features(&self) -> Features {
        Features::AGGREGATE_METADATA
            | Features::ACCUMULATE_METADATA
            | Features::DATA_SIEVE
            | Features::AGGREGATE_SMALLDATA
    }

    fn eoa(&self) -> Address {
        self.space.eoa()
    }

    fn set_eoa(&mut self, addr: Address) -> Result<()> {
        self.space.set_eoa(addr)
    }

    fn eof(&self) -> Address {
        self.space.reported_eof()
    }

    fn read(&mut self, addr: Address, buf: &mut [u8]) -> Result<()> {
        DirectFile::read(self, addr, buf)
    }

    fn write(&mut self, addr: Address, buf: &[u8]) -> Result<()> {
        DirectFile::write(self, addr, buf)
    }

    fn truncate(&mut self) -> Result<()> {
        DirectFile::truncate(self)
    }
}

impl FileIdentity for DirectFile {
    fn file_id(&self) -> FileId {
        self.id
    }
}

fn round_up(n: usize, block: usize) -> usize {
    n.div_ceil(block) * block
}

/// Fill `buf`, zero-extending past end of file. Returns the bytes actually read.
fn read_zero_extended(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => {
                buf[filled..].fill(0);
                break;
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Read a staging window until at least `want` bytes are in or the file ends.
///
/// The tail past what was read is left as is. Under O_DIRECT a short read
/// before the end of file is block-granular, so the follow-up read stays
/// aligned.
fn read_window<R: Read>(src: &mut R, buf: &mut [u8], want: usize) -> io::Result<usize> {
    let want = want.min(buf.len());
    let mut filled = 0;
    while filled < want {
        match src.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn write_retrying(file: &mut File, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match file.write(buf) {
            Ok(0) => return Err(io::Error::new(ErrorKind::WriteZero, "file write returned 0")),
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Small unaligned transfer first; if the OS refuses it but accepts a full
/// aligned block, the handle must align.
fn probe_alignment(file: &mut File, config: &DriverConfig, write_probe: bool) -> Result<bool> {
    let mut small = [0u8; std::mem::size_of::<i32>()];
    let mut block = AlignedBuf::zeroed(config.file_block_size, config.memory_boundary)?;

    let must_align = if write_probe {
        let must_align = match file.write(&small) {
            Ok(_) => false,
            Err(_) => {
                file.write(block.as_slice())
                    .map_err(FdError::DirectIoUnsupported)?;
                true
            }
        };
        file.set_len(0)?;
        must_align
    } else {
        match file.read(&mut small) {
            Ok(_) => false,
            Err(_) => {
                file.read(block.as_mut_slice())
                    .map_err(FdError::DirectIoUnsupported)?;
                true
            }
        }
    };
    Ok(must_align)
}

fn open_file(path: &Path, flags: AccessFlags, direct: bool) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.read(true).write(flags.is_writable());
    if flags.contains(AccessFlags::CREATE) {
        if flags.contains(AccessFlags::EXCLUSIVE) {
            options.create_new(true);
        } else {
            options.create(true);
        }
    }
    options.truncate(flags.contains(AccessFlags::TRUNCATE));
    apply_platform_flags(&mut options, direct);
    options.open(path)
}

#[cfg(target_os = "linux")]
fn apply_platform_flags(options: &mut OpenOptions, direct: bool) {
    use std::os::unix::fs::OpenOptionsExt;

    options.mode(0o666);
    if direct {
        options.custom_flags(libc::O_DIRECT);
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
fn apply_platform_flags(options: &mut OpenOptions, _direct: bool) {
    use std::os::unix::fs::OpenOptionsExt;

    options.mode(0o666);
}

#[cfg(windows)]
fn apply_platform_flags(options: &mut OpenOptions, direct: bool) {
    use std::os::windows::fs::OpenOptionsExt;
    use windows_sys::Win32::Storage::FileSystem::FILE_FLAG_NO_BUFFERING;

    if direct {
        options.custom_flags(FILE_FLAG_NO_BUFFERING);
    }
}

#[cfg(target_os = "macos")]
fn configure_after_open(file: &File, direct: bool) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    if !direct {
        return Ok(());
    }
    let result = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_NOCACHE, 1) };
    if result == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "macos"))]
fn configure_after_open(_file: &File, _direct: bool) -> io::Result<()> {
    Ok(())
}
