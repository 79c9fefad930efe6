//! Thin epoll wrapper for the I/O thread.
//!
//! Linux-only, mirroring the runtime's deployment target. Registered fds
//! carry a `u64` token (a socket slot index, or the control-pipe marker)
//! instead of a pointer, so the event loop never holds raw references
//! into the slot array.

use std::io;
use std::os::unix::io::RawFd;

/// Upper bound on events drained per wait.
pub const MAX_EVENT: usize = 64;

/// One readiness notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct PollEvent {
    pub token: u64,
    pub read: bool,
    pub write: bool,
    pub error: bool,
    pub eof: bool,
}

/// Owned epoll instance.
#[derive(Debug)]
pub struct EventPoll {
    epfd: RawFd,
}

impl EventPoll {
    pub fn new() -> io::Result<EventPoll> {
        // SAFETY: epoll_create1 with valid flags has no preconditions.
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(EventPoll { epfd })
    }

    /// Register `fd` for read readiness with `token`.
    pub fn add(&self, fd: RawFd, token: u64) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: token,
        };
        // SAFETY: epfd and fd are valid descriptors; ev is a valid event.
        let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Deregister `fd`.
    pub fn del(&self, fd: RawFd) {
        // SAFETY: DEL ignores the event argument on modern kernels.
        unsafe {
            libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
        }
    }

    /// Rearm `fd` with the requested read/write interest.
    pub fn enable(&self, fd: RawFd, token: u64, read: bool, write: bool) -> io::Result<()> {
        let mut events = 0u32;
        if read {
            events |= libc::EPOLLIN as u32;
        }
        if write {
            events |= libc::EPOLLOUT as u32;
        }
        let mut ev = libc::epoll_event { events, u64: token };
        // SAFETY: epfd and fd are valid descriptors; ev is a valid event.
        let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut ev) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Block until readiness, filling `out` (up to [`MAX_EVENT`]).
    pub fn wait(&self, out: &mut Vec<PollEvent>) -> io::Result<()> {
        let mut raw = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENT];
        // SAFETY: raw is a valid buffer of MAX_EVENT events.
        let n = unsafe {
            libc::epoll_wait(self.epfd, raw.as_mut_ptr(), MAX_EVENT as i32, -1)
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        out.clear();
        for ev in raw.iter().take(n as usize) {
            let flags = ev.events;
            out.push(PollEvent {
                token: ev.u64,
                read: flags & (libc::EPOLLIN as u32) != 0,
                write: flags & (libc::EPOLLOUT as u32) != 0,
                error: flags & (libc::EPOLLERR as u32) != 0,
                eof: flags & (libc::EPOLLHUP as u32) != 0,
            });
        }
        Ok(())
    }
}

impl Drop for EventPoll {
    fn drop(&mut self) {
        // SAFETY: closing our own epoll fd.
        unsafe {
            libc::close(self.epfd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn pipe_readiness_round_trip() {
        let poll = EventPoll::new().expect("epoll");
        let (reader, mut writer) = std::io::pipe().expect("pipe");
        poll.add(reader.as_raw_fd(), 42).expect("add");

        writer.write_all(b"x").unwrap();
        let mut events = Vec::new();
        poll.wait(&mut events).expect("wait");
        assert!(events.iter().any(|e| e.token == 42 && e.read));

        poll.del(reader.as_raw_fd());
    }

    #[test]
    fn enable_write_interest() {
        let poll = EventPoll::new().expect("epoll");
        let (reader, writer) = std::io::pipe().expect("pipe");
        poll.add(writer.as_raw_fd(), 7).expect("add");
        // A fresh pipe is writable once write interest is armed.
        poll.enable(writer.as_raw_fd(), 7, false, true).expect("mod");
        let mut events = Vec::new();
        poll.wait(&mut events).expect("wait");
        assert!(events.iter().any(|e| e.token == 7 && e.write));
        poll.del(writer.as_raw_fd());
        drop(reader);
    }
}
