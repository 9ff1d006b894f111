//! Space allocation inside object headers.

use ohstore_config::log_header_debug;

use crate::header::{ObjectHeader, MAX_MESSAGE_SIZE};
use crate::message::Message;
use crate::registry;
use crate::{HeaderError, Result};

/// Finds room for a new message in a header
pub trait ChunkAllocator {
    /// Reserve a slot sized for `message` (in its current sharing state) and
    /// return its index. The slot comes back typed, with no native form.
    fn allocate(&mut self, header: &mut ObjectHeader, message: &Message) -> Result<usize>;
}

/// First null message that fits; otherwise grow the last chunk up to the
/// layout's maximum chunk size; otherwise start a new chunk.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstFitAllocator;

impl ChunkAllocator for FirstFitAllocator {
    fn allocate(&mut self, header: &mut ObjectHeader, message: &Message) -> Result<usize> {
        let msg_type = message.message_type();
        let needed = header.align(registry::raw_size(message, false));
        if needed > MAX_MESSAGE_SIZE {
            return Err(HeaderError::Allocation(format!(
                "{} message of {} bytes exceeds the {}-byte limit",
                msg_type, needed, MAX_MESSAGE_SIZE
            )));
        }

        let fit = header
            .slots()
            .iter()
            .position(|s| s.is_null() && s.raw().len >= needed);
        if let Some(idx) = fit {
            header.claim_null(idx, msg_type, needed)?;
            return Ok(idx);
        }

        let hdr = header.msg_header_size();
        let last = header.chunks().len() - 1;
        let last_chunk = &header.chunks()[last];
        let grown = last_chunk.image().len() - last_chunk.gap() + hdr + needed;
        let idx = if grown <= header.layout().max_chunk_size {
            header.append_to_chunk(last, msg_type, needed)?
        } else {
            header.add_chunk(msg_type, needed)?
        };
        log_header_debug!(
            "header grown",
            address = header.address(),
            chunks = header.chunks().len(),
            size = header.total_size()
        );
        Ok(idx)
    }
}
