//! # ohstore-header
//!
//! Object headers: per-object containers of typed metadata messages.
//!
//! A header is a list of chunks (raw byte images) plus a table of message
//! slots pointing into them. Each slot carries the raw bytes of one message
//! and, once touched, its decoded native form. Messages are decoded lazily
//! and re-encoded on flush.
//!
//! ## Layers
//!
//! - [`registry`]: one [`MessageClass`] per [`MessageType`], a static table of
//!   codec and sharing callbacks.
//! - [`ObjectHeader`]: chunks, slots, null-space bookkeeping.
//! - [`MessageStore`]: append/write/read/remove/iterate/flush over a header,
//!   cooperating with a [`SharedMessageIndex`] and a [`ChunkAllocator`].
//! - [`MetadataCache`]: loads and persists headers through a
//!   [`FileDriver`](ohstore_fd::FileDriver) with protect/unprotect guards.
//! - [`Container`]: the above wired together behind header addresses.

pub mod alloc;
pub mod cache;
pub mod container;
pub mod flags;
pub mod header;
pub mod message;
pub mod registry;
pub mod share;
pub mod store;

pub use alloc::{ChunkAllocator, FirstFitAllocator};
pub use cache::{HeaderGuard, LockMode, MetadataCache};
pub use container::Container;
pub use flags::{HeaderFlags, MessageFlags, UpdateFlags};
pub use header::{Chunk, HeaderLayout, HeaderTimes, ObjectHeader, RawSpan, Slot, SlotState};
pub use message::{
    AllocTime, Attribute, Comment, Dataspace, DataspaceKind, FillTime, FillValue, HeapId, Message,
    ModificationTime, RefCount, Sharing, UnknownMessage,
};
pub use registry::{MessageClass, MessageType, ShareFlags};
pub use share::{SharePolicy, SharedHeap, SharedMessageIndex};
pub use store::{MessageStore, Selector, Visit};

use ohstore_fd::FdError;
use thiserror::Error;

/// Errors raised by the header layers
#[derive(Error, Debug)]
pub enum HeaderError {
    #[error("invalid argument: {0}")]
    Argument(String),

    #[error("no {0} message in object header")]
    NotFound(&'static str),

    #[error("write protected: {0}")]
    WriteProtected(String),

    #[error("shared message state: {0}")]
    ShareState(String),

    #[error("unable to allocate message space: {0}")]
    Allocation(String),

    #[error("corrupt object header: {0}")]
    Corruption(String),

    #[error("unable to decode {what} message: {reason}")]
    Decode { what: &'static str, reason: String },

    #[error("driver error: {0}")]
    Driver(#[from] FdError),
}

pub type Result<T> = std::result::Result<T, HeaderError>;
