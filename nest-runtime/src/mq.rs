//! Per-service message queue and the global run queue.
//!
//! Each service owns one [`MessageQueue`]: a ring buffer that starts at
//! 64 entries and doubles when a push finds the ring full. The global
//! run queue holds the set of mailboxes that currently have messages;
//! a mailbox appears there at most once, tracked by its `in_global`
//! flag. A worker that pops a mailbox owns the exclusive right to drain
//! it until it requeues or releases it.
//!
//! Overload tracking: when the queue length crosses the running
//! threshold (initially 1024) the length is latched into a sticky
//! `overload` field and the threshold doubles; draining the queue to
//! empty resets the threshold.

use std::sync::{Arc, Mutex};

use crossbeam_deque::{Injector, Steal};

use crate::message::{Handle, Message};

/// Initial ring capacity.
const DEFAULT_QUEUE_SIZE: usize = 64;
/// Initial overload threshold.
const MQ_OVERLOAD: usize = 1024;

// ── Per-service queue ───────────────────────────────────────────────────

#[derive(Debug)]
struct MqInner {
    ring: Vec<Option<Message>>,
    head: usize,
    tail: usize,
    /// Present in the global run queue (or about to be drained by the
    /// worker that popped it there).
    in_global: bool,
    /// Owning service is gone; drain with the drop policy on release.
    release_pending: bool,
    /// Sticky high-water length, reported and cleared by `overload()`.
    overload: usize,
    overload_threshold: usize,
}

impl MqInner {
    fn len(&self) -> usize {
        if self.head <= self.tail {
            self.tail - self.head
        } else {
            self.tail + self.ring.len() - self.head
        }
    }
}

/// A service mailbox. Shared between senders, the global run queue, and
/// the owning service; all state sits behind one short-lived lock.
#[derive(Debug)]
pub struct MessageQueue {
    handle: Handle,
    inner: Mutex<MqInner>,
}

impl MessageQueue {
    /// Create the mailbox for `handle`.
    ///
    /// A fresh mailbox claims `in_global` so that pushes during service
    /// init do not enqueue it; the launcher pushes it once init
    /// succeeds.
    #[must_use]
    pub fn new(handle: Handle) -> MessageQueue {
        MessageQueue {
            handle,
            inner: Mutex::new(MqInner {
                ring: (0..DEFAULT_QUEUE_SIZE).map(|_| None).collect(),
                head: 0,
                tail: 0,
                in_global: true,
                release_pending: false,
                overload: 0,
                overload_threshold: MQ_OVERLOAD,
            }),
        }
    }

    /// Handle of the owning service.
    #[must_use]
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Append `msg`, growing the ring if full, and enqueue the mailbox on
    /// `global` when it was not already there.
    pub fn push(self: &Arc<Self>, global: &GlobalQueue, msg: Message) {
        let mut q = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let cap = q.ring.len();
        let tail = q.tail;
        q.ring[tail] = Some(msg);
        q.tail = (tail + 1) % cap;
        if q.head == q.tail {
            expand(&mut q);
        }
        if !q.in_global {
            q.in_global = true;
            drop(q);
            global.push(Arc::clone(self));
        }
    }

    /// Pop the oldest message. On empty, clears `in_global` (the caller
    /// popped this mailbox off the global queue and is abandoning it)
    /// and resets the overload threshold.
    pub fn pop(&self) -> Option<Message> {
        let mut q = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if q.head == q.tail {
            q.in_global = false;
            q.overload_threshold = MQ_OVERLOAD;
            return None;
        }
        let head = q.head;
        let msg = q.ring[head].take();
        debug_assert!(msg.is_some(), "mailbox ring hole at head");
        q.head = (head + 1) % q.ring.len();

        let len = q.len();
        while len > q.overload_threshold {
            q.overload = len;
            q.overload_threshold *= 2;
        }
        msg
    }

    /// Current queue length.
    #[must_use]
    pub fn len(&self) -> usize {
        let q = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        q.len()
    }

    /// Returns `true` when no messages are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Report and clear the sticky overload length.
    pub fn overload(&self) -> usize {
        let mut q = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut q.overload)
    }

    /// Mark the mailbox for release: its service is gone. Ensures the
    /// mailbox reaches a worker (via `global`) so remaining messages get
    /// the drop policy.
    pub fn mark_release(self: &Arc<Self>, global: &GlobalQueue) {
        let mut q = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        debug_assert!(!q.release_pending);
        q.release_pending = true;
        if !q.in_global {
            q.in_global = true;
            drop(q);
            global.push(Arc::clone(self));
        }
    }

    /// Worker-side release after a failed grab: drain with `drop_policy`
    /// when the service retired, otherwise hand the mailbox back to the
    /// global queue (the retire may still be in flight).
    pub fn release<F>(self: &Arc<Self>, global: &GlobalQueue, mut drop_policy: F)
    where
        F: FnMut(Message),
    {
        let pending = {
            let q = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            q.release_pending
        };
        if pending {
            while let Some(msg) = self.pop() {
                drop_policy(msg);
            }
        } else {
            global.push(Arc::clone(self));
        }
    }
}

/// Double the ring, rewriting entries in FIFO order.
fn expand(q: &mut MqInner) {
    let cap = q.ring.len();
    let mut bigger: Vec<Option<Message>> = (0..cap * 2).map(|_| None).collect();
    for (i, slot) in bigger.iter_mut().take(cap).enumerate() {
        *slot = q.ring[(q.head + i) % cap].take();
        debug_assert!(slot.is_some());
    }
    q.head = 0;
    q.tail = cap;
    q.ring = bigger;
}

// ── Global run queue ────────────────────────────────────────────────────

/// FIFO of mailboxes that currently hold messages. The only queue shared
/// between workers.
#[derive(Debug, Default)]
pub struct GlobalQueue {
    injector: Injector<Arc<MessageQueue>>,
}

impl GlobalQueue {
    #[must_use]
    pub fn new() -> GlobalQueue {
        GlobalQueue {
            injector: Injector::new(),
        }
    }

    /// Append a mailbox at the tail.
    pub fn push(&self, q: Arc<MessageQueue>) {
        self.injector.push(q);
    }

    /// Remove the mailbox at the head, if any.
    #[must_use]
    pub fn pop(&self) -> Option<Arc<MessageQueue>> {
        loop {
            match self.injector.steal() {
                Steal::Success(q) => return Some(q),
                Steal::Empty => return None,
                Steal::Retry => {}
            }
        }
    }

    /// Returns `true` when no mailbox is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.injector.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Payload, PTYPE_TEXT};

    fn msg(session: i32) -> Message {
        Message {
            source: 1,
            session,
            ptype: PTYPE_TEXT,
            payload: Payload::Empty,
        }
    }

    fn fresh(handle: Handle) -> (Arc<MessageQueue>, GlobalQueue) {
        let q = Arc::new(MessageQueue::new(handle));
        let global = GlobalQueue::new();
        // Drain the initial in_global claim the way the launcher does.
        assert!(q.pop().is_none());
        (q, global)
    }

    #[test]
    fn fifo_order_is_preserved() {
        let (q, global) = fresh(7);
        for i in 0..10 {
            q.push(&global, msg(i));
        }
        for i in 0..10 {
            assert_eq!(q.pop().unwrap().session, i);
        }
        assert!(q.pop().is_none());
    }

    #[test]
    fn first_push_enqueues_on_global_once() {
        let (q, global) = fresh(7);
        q.push(&global, msg(0));
        q.push(&global, msg(1));
        q.push(&global, msg(2));
        // Exactly one appearance despite three pushes.
        let popped = global.pop().expect("mailbox queued");
        assert_eq!(popped.handle(), 7);
        assert!(global.pop().is_none());
    }

    #[test]
    fn drained_mailbox_requeues_on_next_push() {
        let (q, global) = fresh(7);
        q.push(&global, msg(0));
        let _ = global.pop();
        while q.pop().is_some() {}
        // The empty pop cleared in_global; the next push re-enqueues.
        q.push(&global, msg(1));
        assert!(global.pop().is_some());
    }

    #[test]
    fn ring_grows_exactly_at_the_full_boundary() {
        let (q, global) = fresh(7);
        // 63 pushes leave one free slot in the 64-ring.
        for i in 0..63 {
            q.push(&global, msg(i));
        }
        assert_eq!(q.inner.lock().unwrap().ring.len(), DEFAULT_QUEUE_SIZE);
        // The 64th push fills the ring (head == tail) and doubles it.
        q.push(&global, msg(63));
        assert_eq!(q.inner.lock().unwrap().ring.len(), DEFAULT_QUEUE_SIZE * 2);
        // FIFO order survives the copy.
        for i in 0..64 {
            assert_eq!(q.pop().unwrap().session, i);
        }
    }

    #[test]
    fn growth_preserves_order_with_wrapped_head() {
        let (q, global) = fresh(7);
        // Wrap the ring: push 40, pop 40, then fill past the boundary.
        for i in 0..40 {
            q.push(&global, msg(i));
        }
        for _ in 0..40 {
            q.pop().unwrap();
        }
        for i in 0..64 {
            q.push(&global, msg(100 + i));
        }
        for i in 0..64 {
            assert_eq!(q.pop().unwrap().session, 100 + i);
        }
    }

    #[test]
    fn overload_latches_and_doubles_threshold() {
        let (q, global) = fresh(7);
        for i in 0..1100 {
            q.push(&global, msg(i));
        }
        // Crossing 1024 is observed by pop, not push.
        q.pop().unwrap();
        let over = q.overload();
        assert!(over > 1024, "sticky overload recorded: {over}");
        // The report cleared it.
        assert_eq!(q.overload(), 0);
        // Threshold doubled: 1099 remaining stays below 2048.
        q.pop().unwrap();
        assert_eq!(q.overload(), 0);
        // Draining to empty resets the threshold.
        while q.pop().is_some() {}
        assert_eq!(q.inner.lock().unwrap().overload_threshold, MQ_OVERLOAD);
    }

    #[test]
    fn release_with_drop_policy_reports_each_message() {
        let (q, global) = fresh(7);
        q.push(&global, msg(1));
        q.push(&global, msg(2));
        let popped = global.pop().unwrap();
        popped.mark_release(&global);
        let mut dropped = Vec::new();
        popped.release(&global, |m| dropped.push(m.session));
        assert_eq!(dropped, vec![1, 2]);
    }

    #[test]
    fn release_without_pending_requeues() {
        let (q, global) = fresh(7);
        q.push(&global, msg(1));
        let popped = global.pop().unwrap();
        popped.release(&global, |_| panic!("no drop expected"));
        assert!(global.pop().is_some());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn mark_release_enqueues_idle_mailbox() {
        let (q, global) = fresh(7);
        // Mailbox is idle (not in global). mark_release must enqueue it so
        // a worker can run the drop policy.
        q.mark_release(&global);
        assert!(global.pop().is_some());
    }

    #[test]
    fn global_queue_is_fifo() {
        let global = GlobalQueue::new();
        let a = Arc::new(MessageQueue::new(1));
        let b = Arc::new(MessageQueue::new(2));
        global.push(a);
        global.push(b);
        assert_eq!(global.pop().unwrap().handle(), 1);
        assert_eq!(global.pop().unwrap().handle(), 2);
        assert!(global.pop().is_none());
    }
}
