//! Worker-facing socket API and socket-event message synthesis.
//!
//! Services drive sockets through the methods here (listen, connect,
//! send, close, UDP); every operation is a thin wrapper over the
//! control-pipe request API of [`crate::socket_server`], stamped with
//! the calling service's handle as the socket owner. The I/O thread's
//! events come back through [`poll_once`], which wraps each one in a
//! [`SocketMessage`] and pushes it to the owner's mailbox as
//! PTYPE_SOCKET.

use std::sync::Arc;

use crate::message::{Message, Payload, PTYPE_SOCKET};
use crate::runtime::RuntimeCore;
use crate::service::ServiceContext;
use crate::socket_server::{SocketEvent, SocketEventKind, UdpAddress, UDP_ADDRESS_SIZE};

// ── Message kinds (wire-stable) ─────────────────────────────────────────

pub const SOCKET_DATA: i32 = 1;
pub const SOCKET_CONNECT: i32 = 2;
pub const SOCKET_CLOSE: i32 = 3;
pub const SOCKET_ACCEPT: i32 = 4;
pub const SOCKET_ERR: i32 = 5;
pub const SOCKET_UDP: i32 = 6;
pub const SOCKET_WARNING: i32 = 7;

/// The socket event a service receives inside a PTYPE_SOCKET message.
///
/// `ud` carries the payload size (DATA/UDP), the accepted id (ACCEPT),
/// or the queued KiB count (WARNING). For ACCEPT/CONNECT/ERR the buffer
/// holds the peer address or error text; for UDP the sender address
/// blob is appended after the datagram bytes.
#[derive(Debug)]
pub struct SocketMessage {
    pub kind: i32,
    pub id: u32,
    pub ud: usize,
    pub buffer: Box<[u8]>,
}

/// Split a SOCKET_UDP payload into datagram bytes and sender address.
#[must_use]
pub fn udp_address(msg: &SocketMessage) -> Option<(&[u8], UdpAddress)> {
    if msg.kind != SOCKET_UDP || msg.buffer.len() < UDP_ADDRESS_SIZE {
        return None;
    }
    let (data, addr) = msg.buffer.split_at(msg.buffer.len() - UDP_ADDRESS_SIZE);
    let mut out = [0u8; UDP_ADDRESS_SIZE];
    out.copy_from_slice(addr);
    Some((data, out))
}

// ── Event pump (I/O thread) ─────────────────────────────────────────────

/// Outcome of one poll round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketPoll {
    /// An event was delivered to its owner.
    Dispatched,
    /// 'X' observed; the I/O thread winds down.
    Exit,
}

/// Block for the next socket event and deliver it to the owner's
/// mailbox.
pub fn poll_once(core: &Arc<RuntimeCore>) -> SocketPoll {
    let Some(ev) = core.socket.poll_event() else {
        return SocketPoll::Exit;
    };
    forward_event(core, ev);
    SocketPoll::Dispatched
}

fn forward_event(core: &Arc<RuntimeCore>, ev: SocketEvent) {
    let (kind, mut buffer, ud) = match ev.kind {
        SocketEventKind::Data => (SOCKET_DATA, ev.data, ev.ud),
        SocketEventKind::Open => (SOCKET_CONNECT, ev.data, ev.ud),
        SocketEventKind::Close => (SOCKET_CLOSE, ev.data, ev.ud),
        SocketEventKind::Accept => (SOCKET_ACCEPT, ev.data, ev.ud),
        SocketEventKind::Error => (SOCKET_ERR, ev.data, ev.ud),
        SocketEventKind::Warning => (SOCKET_WARNING, ev.data, ev.ud),
        SocketEventKind::Udp => {
            let mut data = ev.data;
            let ud = data.len();
            if let Some(addr) = ev.udp_addr {
                data.extend_from_slice(&addr);
            }
            (SOCKET_UDP, data, ud)
        }
        SocketEventKind::Exit => return,
    };
    if ev.kind == SocketEventKind::Data {
        debug_assert_eq!(ud, buffer.len());
    }
    buffer.shrink_to_fit();
    let msg = Message {
        source: 0,
        session: 0,
        ptype: PTYPE_SOCKET,
        payload: Payload::Socket(SocketMessage {
            kind,
            id: ev.id,
            ud,
            buffer: buffer.into_boxed_slice(),
        }),
    };
    // A retired owner drops the event; the socket itself is reaped when
    // the close request (or error path) runs.
    let _ = core.push(ev.opaque, msg);
}

// ── Service-side API ────────────────────────────────────────────────────

impl ServiceContext {
    /// Listen on `host:port` (port 0 picks one; the SOCKET_CONNECT event
    /// reports it). The socket stays paused until [`Self::socket_start`].
    pub fn socket_listen(&self, host: &str, port: u16, backlog: i32) -> Option<u32> {
        self.core().socket.listen(self.handle(), host, port, backlog)
    }

    /// Open a TCP connection.
    pub fn socket_connect(&self, host: &str, port: u16) -> Option<u32> {
        self.core().socket.connect(self.handle(), host, port)
    }

    /// Adopt an existing fd (e.g. stdin).
    pub fn socket_bind(&self, fd: std::os::unix::io::RawFd) -> Option<u32> {
        self.core().socket.bind_fd(self.handle(), fd)
    }

    /// Start (or resume) delivery of events for `id`, claiming it.
    pub fn socket_start(&self, id: u32) {
        self.core().socket.start(self.handle(), id);
    }

    /// Pause delivery of read events for `id`.
    pub fn socket_pause(&self, id: u32) {
        self.core().socket.pause(self.handle(), id);
    }

    /// High-priority send.
    pub fn socket_send(&self, id: u32, data: Vec<u8>) -> bool {
        self.core().socket.send(id, data)
    }

    /// Low-priority send.
    pub fn socket_send_lowpriority(&self, id: u32, data: Vec<u8>) -> bool {
        self.core().socket.send_lowpriority(id, data)
    }

    /// Graceful close (drains pending sends first).
    pub fn socket_close(&self, id: u32) {
        self.core().socket.close(self.handle(), id);
    }

    /// Immediate close.
    pub fn socket_shutdown(&self, id: u32) {
        self.core().socket.shutdown(self.handle(), id);
    }

    /// Set TCP_NODELAY.
    pub fn socket_nodelay(&self, id: u32) {
        self.core().socket.nodelay(id);
    }

    /// Create a UDP socket, optionally bound.
    pub fn socket_udp(&self, host: &str, port: u16) -> Option<u32> {
        self.core().socket.udp(self.handle(), host, port)
    }

    /// Set the current peer of a UDP socket.
    pub fn socket_udp_connect(&self, id: u32, host: &str, port: u16) -> bool {
        self.core().socket.udp_connect(id, host, port)
    }

    /// Create a UDP socket with its peer preset.
    pub fn socket_udp_dial(&self, host: &str, port: u16) -> Option<u32> {
        self.core().socket.udp_dial(self.handle(), host, port)
    }

    /// Send a datagram, optionally overriding the current peer.
    pub fn socket_udp_send(&self, id: u32, addr: Option<&UdpAddress>, data: Vec<u8>) -> bool {
        self.core().socket.udp_send(id, addr, data)
    }
}
