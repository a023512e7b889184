//! Event flag bitfield carried in every event header.

use bitflags::bitflags;

bitflags! {
    /// Per-event status and behaviour bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EventFlags: u32 {
        /// The request was served successfully.
        const ACK            = 1 << 0;
        /// The request was refused; see the other bits for the reason.
        const NACK           = 1 << 1;
        /// The request is blocked waiting for resources.
        const BLOCK          = 1 << 2;
        /// The event is served locally and never leaves the host.
        const LOCAL_SERVE    = 1 << 3;
        /// The link is being torn down.
        const TERMINATE      = 1 << 4;
        /// The receiving stream pool is full.
        const BUFFER_FULL    = 1 << 5;
        /// The payload does not fit the receiving stream buffer.
        const SIZE_TOO_BIG   = 1 << 6;
        /// The addressed stream does not exist on the receiver.
        const NO_SUCH_STREAM = 1 << 7;
        /// The reader took ownership of the packet buffer.
        const MOVE_SEMANTIC  = 1 << 8;
    }
}

impl EventFlags {
    /// Flags of a positive acknowledgement.
    pub fn acked() -> Self {
        EventFlags::ACK
    }

    /// Flags of a refusal with the given reason bits.
    pub fn nacked(reason: EventFlags) -> Self {
        EventFlags::NACK | reason
    }

    pub fn is_ack(&self) -> bool {
        self.contains(EventFlags::ACK) && !self.contains(EventFlags::NACK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nack_carries_reason() {
        let f = EventFlags::nacked(EventFlags::BUFFER_FULL);
        assert!(!f.is_ack());
        assert!(f.contains(EventFlags::BUFFER_FULL));
        assert_eq!(f.bits(), 0b10_0010);
    }

    #[test]
    fn unknown_bits_are_dropped() {
        let f = EventFlags::from_bits_truncate(0xFFFF_0001);
        assert!(f.is_ack());
        assert_eq!(f.bits(), 1);
    }
}
