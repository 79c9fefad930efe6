//! Message envelope and protocol-type constants.
//!
//! Every inbound message a service sees is a [`Message`]: source handle,
//! session, an 8-bit protocol type, and an owned payload. On the original
//! wire format the type tag and payload size share one machine word (high
//! 8 bits type, low bits size), which caps a payload at `usize::MAX >> 8`
//! bytes; [`MAX_MESSAGE_SIZE`] preserves that cap for wire compatibility
//! even though the fields travel separately in memory.

use crate::socket::SocketMessage;

/// 32-bit service identifier. High 8 bits select the node, low 24 bits
/// the registry slot. Value 0 is reserved and never names a service.
pub type Handle = u32;

/// An envelope addressed to a service on another node, handed to the
/// harbor delegate for forwarding.
#[derive(Debug)]
pub struct RemoteMessage {
    pub destination: Handle,
    pub ptype: u8,
    pub payload: Box<[u8]>,
}

/// Number of bits the node id occupies in a [`Handle`].
pub const HANDLE_REMOTE_SHIFT: u32 = 24;

/// Mask isolating the node id byte of a [`Handle`].
pub const HANDLE_MASK: Handle = 0x00ff_ffff;

/// Largest payload a single message may carry.
pub const MAX_MESSAGE_SIZE: usize = usize::MAX >> 8;

// ── Protocol types ──────────────────────────────────────────────────────

/// Plain text, consumed by the logger service.
pub const PTYPE_TEXT: u8 = 0;
/// Response half of a session pair (timer expirations use this too).
pub const PTYPE_RESPONSE: u8 = 1;
/// Client traffic injected by a gate-style frontend.
pub const PTYPE_CLIENT: u8 = 3;
/// Runtime-internal notifications (exit-watcher messages).
pub const PTYPE_SYSTEM: u8 = 4;
/// Envelope bound for another node, consumed by the harbor delegate.
pub const PTYPE_HARBOR: u8 = 5;
/// Socket events synthesized by the I/O thread.
pub const PTYPE_SOCKET: u8 = 6;
/// Delivery failure bounced back to the original sender.
pub const PTYPE_ERROR: u8 = 7;

// ── Payload ─────────────────────────────────────────────────────────────

/// Owned message payload.
///
/// The original runtime routes every payload as `(void *, size_t)` and
/// tells socket events apart by the type tag alone; here the distinction
/// is a sum type, with the 8-bit tag preserved on the envelope for wire
/// compatibility.
#[derive(Debug, Default)]
pub enum Payload {
    /// No payload (errors, bare responses).
    #[default]
    Empty,
    /// Raw bytes, ownership transfers to the receiving handler.
    Bytes(Box<[u8]>),
    /// A socket event from the I/O thread.
    Socket(SocketMessage),
    /// An outbound remote envelope, consumed by the harbor delegate.
    Remote(Box<RemoteMessage>),
}

impl Payload {
    /// Payload size in bytes as accounted by mailbox and log bookkeeping.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Payload::Empty => 0,
            Payload::Bytes(b) => b.len(),
            Payload::Socket(m) => m.buffer.len(),
            Payload::Remote(m) => m.payload.len(),
        }
    }

    /// Returns `true` for a zero-length payload.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrow the raw bytes of the payload, if any.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Empty => &[],
            Payload::Bytes(b) => b,
            Payload::Socket(m) => &m.buffer,
            Payload::Remote(m) => &m.payload,
        }
    }
}

impl From<Vec<u8>> for Payload {
    fn from(v: Vec<u8>) -> Self {
        Payload::Bytes(v.into_boxed_slice())
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::Bytes(s.as_bytes().into())
    }
}

// ── Message ─────────────────────────────────────────────────────────────

/// One mailbox entry. Ownership of the payload moves with the message:
/// the dispatcher hands the whole value to the handler, and whatever the
/// handler does not keep is dropped when the value goes out of scope.
#[derive(Debug)]
pub struct Message {
    /// Handle of the sending service (0 for runtime-internal pushes).
    pub source: Handle,
    /// Session tag pairing a request with its response; 0 when untagged.
    pub session: i32,
    /// Protocol type, one of the `PTYPE_*` constants.
    pub ptype: u8,
    /// Owned payload.
    pub payload: Payload,
}

impl Message {
    /// Build a message, checking the packed-word size cap.
    ///
    /// Returns `None` when the payload exceeds [`MAX_MESSAGE_SIZE`].
    #[must_use]
    pub fn checked(source: Handle, session: i32, ptype: u8, payload: Payload) -> Option<Message> {
        if payload.len() > MAX_MESSAGE_SIZE {
            return None;
        }
        Some(Message {
            source,
            session,
            ptype,
            payload,
        })
    }

    /// An error bounce for `session`, delivered to the failed sender.
    #[must_use]
    pub fn error(source: Handle, session: i32) -> Message {
        Message {
            source,
            session,
            ptype: PTYPE_ERROR,
            payload: Payload::Empty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_len_accounts_variants() {
        assert_eq!(Payload::Empty.len(), 0);
        assert!(Payload::Empty.is_empty());
        let p = Payload::from(vec![1u8, 2, 3]);
        assert_eq!(p.len(), 3);
        assert_eq!(p.as_bytes(), &[1, 2, 3]);
    }

    #[test]
    fn checked_rejects_oversized_payloads() {
        // Can't allocate usize::MAX >> 8 bytes in a test; exercise the
        // boundary predicate directly instead.
        assert!(3usize <= MAX_MESSAGE_SIZE);
        assert!(Message::checked(1, 0, PTYPE_TEXT, Payload::from(vec![0u8; 3])).is_some());
        // The cap itself equals usize::MAX >> 8 per the packed word format.
        assert_eq!(MAX_MESSAGE_SIZE, usize::MAX >> 8);
    }

    #[test]
    fn error_bounce_has_no_payload() {
        let m = Message::error(7, 42);
        assert_eq!(m.ptype, PTYPE_ERROR);
        assert_eq!(m.session, 42);
        assert!(m.payload.is_empty());
    }

    #[test]
    fn handle_packing_constants() {
        let h: Handle = (9 << HANDLE_REMOTE_SHIFT) | 0x1234;
        assert_eq!(h >> HANDLE_REMOTE_SHIFT, 9);
        assert_eq!(h & HANDLE_MASK, 0x1234);
    }
}
