//! Platform file identity.
//!
//! Two handles refer to the same file when their identity keys are equal.
//! The key is (device, inode) on Unix and (volume serial, file index) on
//! Windows; the ordering is only meaningful within one machine.

use std::cmp::Ordering;
use std::fs::File;

use crate::Result;

/// Identity key of an open file
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileId {
    /// Device number or volume serial
    pub volume: u64,
    /// Inode number or file index
    pub index: u64,
}

/// Anything that can report the identity of the file behind it
pub trait FileIdentity {
    fn file_id(&self) -> FileId;
}

/// Total order over open handles, used to detect a file opened twice
pub fn cmp_identity<A: FileIdentity + ?Sized, B: FileIdentity + ?Sized>(a: &A, b: &B) -> Ordering {
    a.file_id().cmp(&b.file_id())
}

// ============================================================================
// Unix: fstat(2) device + inode
// ============================================================================

#[cfg(unix)]
impl FileId {
    pub fn of(file: &File) -> Result<Self> {
        use std::os::unix::io::AsRawFd;

        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        let ret = unsafe { libc::fstat(file.as_raw_fd(), &mut st) };
        if ret != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        #[allow(clippy::unnecessary_cast)]
        let (volume, index) = (st.st_dev as u64, st.st_ino as u64);
        Ok(Self { volume, index })
    }
}

// ============================================================================
// Windows: GetFileInformationByHandle volume serial + file index
// ============================================================================

#[cfg(windows)]
impl FileId {
    pub fn of(file: &File) -> Result<Self> {
        use std::os::windows::io::AsRawHandle;
        use windows_sys::Win32::Storage::FileSystem::{
            GetFileInformationByHandle, BY_HANDLE_FILE_INFORMATION,
        };

        let mut info: BY_HANDLE_FILE_INFORMATION = unsafe { std::mem::zeroed() };
        let ok = unsafe { GetFileInformationByHandle(file.as_raw_handle() as _, &mut info) };
        if ok == 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(Self {
            volume: u64::from(info.dwVolumeSerialNumber),
            index: (u64::from(info.nFileIndexHigh) << 32) | u64::from(info.nFileIndexLow),
        })
    }
}
