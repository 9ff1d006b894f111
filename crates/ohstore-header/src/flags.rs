//! Bit flags stored in message prefixes and header prefixes.

use bitflags::bitflags;

bitflags! {
    /// Per-message flags, persisted in the message prefix
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MessageFlags: u8 {
        /// Message may not be modified without `UpdateFlags::FORCE`
        const CONSTANT = 0x01;
        /// Raw bytes are a shared record pointing at the real payload
        const SHARED = 0x02;
        /// Never move this message into the shared heap
        const DONT_SHARE = 0x04;
        /// Refuse write access if the type is unknown to the reader
        const FAIL_IF_UNKNOWN_AND_OPEN_FOR_WRITE = 0x08;
        /// Set `WAS_UNKNOWN` when a reader does not know the type
        const MARK_IF_UNKNOWN = 0x10;
        /// A writer that did not know the type has touched this header
        const WAS_UNKNOWN = 0x20;
        /// Tracked by the shared index but stored in the header
        const SHAREABLE = 0x40;
        /// Refuse any access if the type is unknown to the reader
        const FAIL_IF_UNKNOWN_ALWAYS = 0x80;
    }
}

bitflags! {
    /// Version 2 header flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct HeaderFlags: u8 {
        /// Message prefixes carry a creation index
        const ATTR_CRT_ORDER_TRACKED = 0x04;
        /// Creation order is indexed (informational here)
        const ATTR_CRT_ORDER_INDEXED = 0x08;
        /// Access/modification/change/birth times are kept in the header
        const STORE_TIMES = 0x20;
    }
}

bitflags! {
    /// Modifiers for mutating operations
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct UpdateFlags: u8 {
        /// Refresh the header's modification time
        const TIME = 0x01;
        /// Override `MessageFlags::CONSTANT`
        const FORCE = 0x02;
    }
}
