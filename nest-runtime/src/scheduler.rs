//! Worker pool: weights, parking, and the dispatch loop.
//!
//! A fixed pool of OS worker threads drains mailboxes off the global
//! run queue. Each worker carries a weight that bounds how much of one
//! mailbox it drains before re-entering the queue:
//!
//! * weight -1: one message, then yield the mailbox back.
//! * weight 0: drain the batch observed on entry.
//! * weight k >= 1: drain `length >> k` messages.
//!
//! Workers park on a single condition variable; the timer thread wakes
//! one per tick, the socket thread wakes the pool when all workers are
//! asleep, and a worker signals a peer after each handler return so a
//! fan-out of sends ramps the pool up quickly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::monitor::StallMonitor;
use crate::runtime::RuntimeCore;
use crate::service::message_dispatch;

/// Per-worker drain policy. The reference pattern covers the first 32
/// workers; any extras drain whole batches.
#[must_use]
pub fn weight_for(index: usize) -> i32 {
    match index {
        0..=3 => -1,
        4..=7 => 0,
        8..=15 => 1,
        16..=23 => 2,
        24..=31 => 3,
        _ => 0,
    }
}

// ── Wake hub ────────────────────────────────────────────────────────────

/// Sleep/wake accounting for the worker pool.
#[derive(Debug)]
pub(crate) struct WakeHub {
    count: usize,
    /// Number of workers currently parked.
    sleep: Mutex<usize>,
    cond: Condvar,
    quit: AtomicBool,
}

impl WakeHub {
    pub(crate) fn new(count: usize) -> WakeHub {
        WakeHub {
            count,
            sleep: Mutex::new(0),
            cond: Condvar::new(),
            quit: AtomicBool::new(false),
        }
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.count
    }

    /// Wake one parked worker when at most `busy` workers are awake.
    pub(crate) fn wakeup(&self, busy: usize) {
        let sleep = self.sleep.lock().unwrap_or_else(|e| e.into_inner());
        if *sleep > 0 && *sleep + busy >= self.count {
            self.cond.notify_one();
        }
    }

    /// Park the calling worker until notified.
    pub(crate) fn worker_sleep(&self) {
        let mut sleep = self.sleep.lock().unwrap_or_else(|e| e.into_inner());
        *sleep += 1;
        if !self.quit.load(Ordering::Acquire) {
            let guard = self
                .cond
                .wait(sleep)
                .unwrap_or_else(|e| e.into_inner());
            sleep = guard;
        }
        *sleep -= 1;
    }

    /// Raise the quit flag and wake everyone.
    pub(crate) fn shutdown(&self) {
        let _sleep = self.sleep.lock().unwrap_or_else(|e| e.into_inner());
        self.quit.store(true, Ordering::Release);
        self.cond.notify_all();
    }

    pub(crate) fn quitting(&self) -> bool {
        self.quit.load(Ordering::Acquire)
    }
}

// ── Worker loop ─────────────────────────────────────────────────────────

/// Body of one worker thread.
pub(crate) fn worker_loop(core: &Arc<RuntimeCore>, sm: &StallMonitor, weight: i32) {
    let mut q = None;
    while !core.hub.quitting() {
        q = message_dispatch(core, sm, q, weight);
        if q.is_none() {
            core.hub.worker_sleep();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, Payload, PTYPE_TEXT};
    use crate::module::ServiceModule;
    use crate::runtime::{start, test_core_with_workers};
    use crate::service::ServiceContext;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    #[test]
    fn weight_pattern_matches_reference() {
        let head: Vec<i32> = (0..32).map(weight_for).collect();
        let mut expect = vec![-1; 4];
        expect.extend([0; 4]);
        expect.extend([1; 8]);
        expect.extend([2; 8]);
        expect.extend([3; 8]);
        assert_eq!(head, expect);
        assert_eq!(weight_for(40), 0);
    }

    #[test]
    fn wake_hub_quit_unparks() {
        let hub = WakeHub::new(1);
        let hub = std::sync::Arc::new(hub);
        let h2 = std::sync::Arc::clone(&hub);
        let t = std::thread::spawn(move || h2.worker_sleep());
        std::thread::sleep(Duration::from_millis(50));
        hub.shutdown();
        t.join().expect("worker unparked");
        assert!(hub.quitting());
    }

    /// A service that sends itself one message per received message, up
    /// to a cap, counting into a shared counter.
    struct PingSelf {
        counter: Arc<AtomicUsize>,
        cap: usize,
    }

    impl ServiceModule for PingSelf {
        fn init(&mut self, ctx: &Arc<ServiceContext>, _args: &str) -> Result<(), String> {
            ctx.send(ctx.handle(), PTYPE_TEXT, 0, Payload::from("PING"))
                .map_err(|e| e.to_string())?;
            Ok(())
        }
        fn message(&mut self, ctx: &Arc<ServiceContext>, _msg: Message) {
            let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
            if n < self.cap {
                let _ = ctx.send(ctx.handle(), PTYPE_TEXT, 0, Payload::from("PING"));
            }
        }
    }

    #[test]
    fn ping_round_trip_thousand_messages() {
        let core = test_core_with_workers(2);
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        core.modules.register("ping", move || {
            Box::new(PingSelf {
                counter: Arc::clone(&c),
                cap: 1000,
            })
        });
        let ctx = ServiceContext::launch(&core, "ping", "").expect("launch");
        let runtime = start(&core);

        let deadline = Instant::now() + Duration::from_secs(10);
        while counter.load(Ordering::Relaxed) < 1000 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(counter.load(Ordering::Relaxed), 1000);
        assert_eq!(ctx.queue().overload(), 0, "no overload warning expected");

        // Retire the lone service; the runtime drains and exits.
        core.handles.retire(ctx.handle());
        drop(ctx);
        runtime.join();
    }

    /// Exclusive-dispatch check: a handler that asserts it is never
    /// entered concurrently.
    struct Exclusive {
        busy: Arc<AtomicBool>,
        violations: Arc<AtomicUsize>,
        seen: Arc<AtomicUsize>,
    }

    impl ServiceModule for Exclusive {
        fn init(&mut self, _ctx: &Arc<ServiceContext>, _args: &str) -> Result<(), String> {
            Ok(())
        }
        fn message(&mut self, _ctx: &Arc<ServiceContext>, _msg: Message) {
            if self.busy.swap(true, Ordering::SeqCst) {
                self.violations.fetch_add(1, Ordering::SeqCst);
            }
            std::thread::sleep(Duration::from_micros(50));
            self.busy.store(false, Ordering::SeqCst);
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn handler_never_runs_concurrently_with_itself() {
        let core = test_core_with_workers(4);
        let busy = Arc::new(AtomicBool::new(false));
        let violations = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(AtomicUsize::new(0));
        let (b, v, s) = (
            Arc::clone(&busy),
            Arc::clone(&violations),
            Arc::clone(&seen),
        );
        core.modules.register("exclusive", move || {
            Box::new(Exclusive {
                busy: Arc::clone(&b),
                violations: Arc::clone(&v),
                seen: Arc::clone(&s),
            })
        });
        let ctx = ServiceContext::launch(&core, "exclusive", "").expect("launch");
        let h = ctx.handle();
        let runtime = start(&core);

        for _ in 0..200 {
            crate::service::send(&core, h, h, PTYPE_TEXT, 0, Payload::Empty).unwrap();
        }
        let deadline = Instant::now() + Duration::from_secs(10);
        while seen.load(Ordering::SeqCst) < 200 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(seen.load(Ordering::SeqCst), 200);
        assert_eq!(violations.load(Ordering::SeqCst), 0);

        core.handles.retire(h);
        drop(ctx);
        runtime.join();
    }

    /// Fairness: a saturating service must not starve a quiet one.
    struct Hog {
        stop: Arc<AtomicBool>,
    }

    impl ServiceModule for Hog {
        fn init(&mut self, ctx: &Arc<ServiceContext>, _args: &str) -> Result<(), String> {
            ctx.send(ctx.handle(), PTYPE_TEXT, 0, Payload::Empty)
                .map_err(|e| e.to_string())?;
            Ok(())
        }
        fn message(&mut self, ctx: &Arc<ServiceContext>, _msg: Message) {
            if !self.stop.load(Ordering::Relaxed) {
                let _ = ctx.send(ctx.handle(), PTYPE_TEXT, 0, Payload::Empty);
            }
        }
    }

    struct Quiet {
        got: Arc<AtomicUsize>,
    }

    impl ServiceModule for Quiet {
        fn init(&mut self, _ctx: &Arc<ServiceContext>, _args: &str) -> Result<(), String> {
            Ok(())
        }
        fn message(&mut self, _ctx: &Arc<ServiceContext>, _msg: Message) {
            self.got.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn busy_service_does_not_starve_others() {
        let core = test_core_with_workers(2);
        let stop = Arc::new(AtomicBool::new(false));
        let got = Arc::new(AtomicUsize::new(0));
        let (st, g) = (Arc::clone(&stop), Arc::clone(&got));
        core.modules.register("hog", move || {
            Box::new(Hog {
                stop: Arc::clone(&st),
            })
        });
        core.modules.register("quiet", move || {
            Box::new(Quiet {
                got: Arc::clone(&g),
            })
        });
        let hog = ServiceContext::launch(&core, "hog", "").expect("hog");
        let quiet = ServiceContext::launch(&core, "quiet", "").expect("quiet");
        let runtime = start(&core);

        // Let the hog saturate, then poke the quiet service.
        std::thread::sleep(Duration::from_millis(20));
        quiet
            .send(quiet.handle(), PTYPE_TEXT, 0, Payload::from("hello"))
            .unwrap();
        let deadline = Instant::now() + Duration::from_millis(2000);
        while got.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(
            got.load(Ordering::SeqCst) > 0,
            "quiet service starved by the hog"
        );

        stop.store(true, Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(20));
        core.handles.retire(hog.handle());
        core.handles.retire(quiet.handle());
        drop(hog);
        drop(quiet);
        runtime.join();
    }
}
