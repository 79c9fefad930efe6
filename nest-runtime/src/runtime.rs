//! Runtime assembly: shared core state, thread startup, shutdown.
//!
//! One [`RuntimeCore`] owns every shared structure: the handle
//! registry, the global run queue, the timer, the env store, the module
//! registry, the harbor, and the socket server. [`start`] spawns the
//! fixed thread set (N workers, one timer, one stall monitor, one
//! socket thread); the runtime winds down when the live-service count
//! reaches zero, observed by the timer thread, which tells the socket
//! thread to exit and broadcasts quit to the workers.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::env::EnvStore;
use crate::error;
use crate::handle::HandleStorage;
use crate::harbor::Harbor;
use crate::message::{Handle, Message, Payload, PTYPE_RESPONSE};
use crate::module::ModuleRegistry;
use crate::monitor::{StallMonitor, CHECK_INTERVAL_SECS};
use crate::mq::GlobalQueue;
use crate::scheduler::{weight_for, worker_loop, WakeHub};
use crate::service::{self, ServiceContext};
use crate::socket::{poll_once, SocketPoll};
use crate::socket_server::SocketServer;
use crate::timer::Timer;

/// Boot configuration consumed by [`RuntimeCore::new`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Worker thread count.
    pub thread: usize,
    /// Node id stamped into the high byte of every handle.
    pub harbor: u8,
    /// Default per-dispatch CPU accounting for new services.
    pub profile: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            thread: 8,
            harbor: 0,
            profile: false,
        }
    }
}

/// Shared state of one runtime instance.
#[derive(Debug)]
pub struct RuntimeCore {
    pub handles: HandleStorage<ServiceContext>,
    pub global: GlobalQueue,
    pub timer: Timer,
    pub env: EnvStore,
    pub modules: ModuleRegistry,
    pub harbor: Harbor,
    pub socket: SocketServer,
    pub(crate) hub: WakeHub,
    /// Live services (reserved ones excluded).
    total: AtomicUsize,
    /// The exit-watcher service handle (MONITOR command).
    pub(crate) monitor_exit: AtomicU32,
    pub(crate) logger_cache: AtomicU32,
    profile_default: AtomicBool,
}

impl RuntimeCore {
    pub fn new(config: &Config) -> io::Result<Arc<RuntimeCore>> {
        let harbor = Harbor::new();
        harbor.init(config.harbor);
        Ok(Arc::new(RuntimeCore {
            handles: HandleStorage::new(config.harbor),
            global: GlobalQueue::new(),
            timer: Timer::new(),
            env: EnvStore::new(),
            modules: ModuleRegistry::new(),
            harbor,
            socket: SocketServer::new()?,
            hub: WakeHub::new(config.thread),
            total: AtomicUsize::new(0),
            monitor_exit: AtomicU32::new(0),
            logger_cache: AtomicU32::new(0),
            profile_default: AtomicBool::new(config.profile),
        }))
    }

    /// Push `msg` into the mailbox of `handle`. Returns `false` when the
    /// handle is not registered.
    pub fn push(&self, handle: Handle, msg: Message) -> bool {
        let Some(ctx) = self.handles.grab(handle) else {
            return false;
        };
        ctx.queue().push(&self.global, msg);
        self.signal_workers();
        true
    }

    /// Schedule a timeout for `handle`. Non-positive delays respond
    /// immediately without touching the wheel.
    pub fn timeout(&self, handle: Handle, ticks: i32, session: i32) {
        if ticks <= 0 {
            let msg = Message {
                source: 0,
                session,
                ptype: PTYPE_RESPONSE,
                payload: Payload::Empty,
            };
            self.push(handle, msg);
        } else {
            self.timer.add(handle, ticks, session);
        }
    }

    /// Wake a parked worker if any is sleeping.
    pub(crate) fn signal_workers(&self) {
        let count = self.hub.worker_count();
        if count > 0 {
            self.hub.wakeup(count - 1);
        }
    }

    pub(crate) fn service_started(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn service_stopped(&self) {
        self.total.fetch_sub(1, Ordering::Relaxed);
    }

    /// Count of live (non-reserved) services.
    #[must_use]
    pub fn live_services(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    /// Exclude an already-launched service from the liveness count; the
    /// harbor delegate is installed this way so an otherwise idle node
    /// still shuts down.
    pub fn reserve(&self, ctx: &Arc<ServiceContext>) {
        let _ = ctx;
        self.total.fetch_sub(1, Ordering::Relaxed);
    }

    /// Retire every service (ABORT).
    pub fn abort(&self) {
        self.handles.retire_all(|_, _| {});
    }

    pub(crate) fn profile_default(&self) -> bool {
        self.profile_default.load(Ordering::Relaxed)
    }
}

// ── Thread startup ──────────────────────────────────────────────────────

/// A started runtime: join to wait for shutdown.
#[derive(Debug)]
pub struct Runtime {
    core: Arc<RuntimeCore>,
    threads: Vec<JoinHandle<()>>,
}

/// Spawn the worker pool plus the timer, stall-monitor, and socket
/// threads.
#[must_use]
pub fn start(core: &Arc<RuntimeCore>) -> Runtime {
    let worker_count = core.hub.worker_count();
    let monitors: Vec<Arc<StallMonitor>> =
        (0..worker_count).map(|_| Arc::new(StallMonitor::new())).collect();
    let mut threads = Vec::with_capacity(worker_count + 3);

    {
        let core = Arc::clone(core);
        let monitors = monitors.clone();
        threads.push(
            std::thread::Builder::new()
                .name("nest-monitor".into())
                .spawn(move || monitor_thread(&core, &monitors))
                .expect("spawn monitor thread"),
        );
    }
    {
        let core = Arc::clone(core);
        threads.push(
            std::thread::Builder::new()
                .name("nest-timer".into())
                .spawn(move || timer_thread(&core))
                .expect("spawn timer thread"),
        );
    }
    {
        let core = Arc::clone(core);
        threads.push(
            std::thread::Builder::new()
                .name("nest-socket".into())
                .spawn(move || socket_thread(&core))
                .expect("spawn socket thread"),
        );
    }
    for (i, sm) in monitors.into_iter().enumerate() {
        let core = Arc::clone(core);
        let weight = weight_for(i);
        threads.push(
            std::thread::Builder::new()
                .name(format!("nest-worker-{i}"))
                .spawn(move || worker_loop(&core, &sm, weight))
                .expect("spawn worker thread"),
        );
    }

    Runtime {
        core: Arc::clone(core),
        threads,
    }
}

impl Runtime {
    /// Wait for shutdown (live services reaching zero) and join every
    /// runtime thread.
    pub fn join(self) {
        for t in self.threads {
            let _ = t.join();
        }
        // Drop the harbor delegate reference last.
        self.core.harbor.exit();
    }
}

fn timer_thread(core: &Arc<RuntimeCore>) {
    service::init_thread(service::THREAD_TIMER);
    loop {
        for fired in core.timer.update() {
            let msg = Message {
                source: 0,
                session: fired.session,
                ptype: PTYPE_RESPONSE,
                payload: Payload::Empty,
            };
            core.push(fired.handle, msg);
        }
        core.socket.update_time(core.timer.now());
        if core.live_services() == 0 {
            break;
        }
        core.signal_workers();
        std::thread::sleep(Duration::from_micros(2500));
    }
    // Wind down: stop the socket thread, then release the workers.
    core.socket.exit();
    core.hub.shutdown();
}

fn monitor_thread(core: &Arc<RuntimeCore>, monitors: &[Arc<StallMonitor>]) {
    service::init_thread(service::THREAD_MONITOR);
    loop {
        if core.live_services() == 0 || core.hub.quitting() {
            return;
        }
        for sm in monitors {
            if let Some(stall) = sm.check() {
                if let Some(ctx) = core.handles.grab(stall.destination) {
                    ctx.mark_endless();
                }
                error::report(
                    core,
                    0,
                    &format!(
                        "error: a message from [ :{:08x} ] to [ :{:08x} ] maybe in an endless loop (version = {})",
                        stall.source, stall.destination, stall.version
                    ),
                );
            }
        }
        for _ in 0..CHECK_INTERVAL_SECS {
            if core.live_services() == 0 || core.hub.quitting() {
                return;
            }
            std::thread::sleep(Duration::from_secs(1));
        }
    }
}

fn socket_thread(core: &Arc<RuntimeCore>) {
    service::init_thread(service::THREAD_SOCKET);
    loop {
        match poll_once(core) {
            SocketPoll::Exit => return,
            SocketPoll::Dispatched => {
                // Wake the pool only when everyone is parked.
                core.hub.wakeup(0);
            }
        }
    }
}

// ── Bootstrap ───────────────────────────────────────────────────────────

/// Failures surfaced by [`bootstrap`].
#[derive(Debug)]
pub enum BootError {
    LoggerFailed(String),
    BootstrapFailed(String),
}

impl std::fmt::Display for BootError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BootError::LoggerFailed(m) => write!(f, "launch logger service failed: {m}"),
            BootError::BootstrapFailed(m) => write!(f, "bootstrap command failed: {m}"),
        }
    }
}

impl std::error::Error for BootError {}

/// Launch the logger service and run the bootstrap LAUNCH command.
///
/// Mirrors the original boot order: the logger comes up first (named
/// `logger` so error routing works), then the bootstrap command runs on
/// its behalf; on failure the logger's queue is flushed inline so the
/// failure reason is not lost.
pub fn bootstrap(
    core: &Arc<RuntimeCore>,
    logservice: &str,
    logger_args: &str,
    command: &str,
) -> Result<(), BootError> {
    let logger = ServiceContext::launch(core, logservice, logger_args)
        .ok_or_else(|| BootError::LoggerFailed(logservice.to_owned()))?;
    core.handles.bind_name("logger", logger.handle());

    let (module, args) = match command.split_once(char::is_whitespace) {
        Some((m, a)) => (m, a.trim()),
        None => (command, ""),
    };
    if ServiceContext::launch(core, module, args).is_none() {
        error::report(core, 0, &format!("bootstrap error: {command}"));
        service::dispatch_all(&logger);
        return Err(BootError::BootstrapFailed(command.to_owned()));
    }
    Ok(())
}

// ── Test support ────────────────────────────────────────────────────────

/// A core with no worker threads, for single-threaded dispatch tests.
#[cfg(test)]
pub(crate) fn test_core() -> Arc<RuntimeCore> {
    test_core_with_workers(0)
}

#[cfg(test)]
pub(crate) fn test_core_with_workers(threads: usize) -> Arc<RuntimeCore> {
    RuntimeCore::new(&Config {
        thread: threads,
        harbor: 0,
        profile: false,
    })
    .expect("runtime core")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ServiceModule;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    struct Idle;

    impl ServiceModule for Idle {
        fn init(&mut self, _ctx: &Arc<ServiceContext>, _args: &str) -> Result<(), String> {
            Ok(())
        }
    }

    /// Counts PTYPE_RESPONSE sessions in arrival order.
    struct SessionOrder(Arc<std::sync::Mutex<Vec<i32>>>);

    impl ServiceModule for SessionOrder {
        fn init(&mut self, _ctx: &Arc<ServiceContext>, _args: &str) -> Result<(), String> {
            Ok(())
        }
        fn message(&mut self, _ctx: &Arc<ServiceContext>, msg: Message) {
            if msg.ptype == PTYPE_RESPONSE {
                self.0.lock().unwrap().push(msg.session);
            }
        }
    }

    #[test]
    fn abort_retires_everything() {
        let core = test_core();
        core.modules.register("idle", || Box::new(Idle));
        let a = ServiceContext::launch(&core, "idle", "").unwrap();
        let b = ServiceContext::launch(&core, "idle", "").unwrap();
        assert_eq!(core.live_services(), 2);
        core.abort();
        assert!(core.handles.grab(a.handle()).is_none());
        assert!(core.handles.grab(b.handle()).is_none());
        drop(a);
        drop(b);
        assert_eq!(core.live_services(), 0);
    }

    #[test]
    fn timer_ordering_short_before_long() {
        let core = test_core_with_workers(2);
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let o = Arc::clone(&order);
        core.modules
            .register("order", move || Box::new(SessionOrder(Arc::clone(&o))));
        let ctx = ServiceContext::launch(&core, "order", "").unwrap();

        // TIMEOUT 10 then TIMEOUT 5: the 5 must arrive first.
        let s_long: i32 = ctx.command("TIMEOUT", "10").unwrap().parse().unwrap();
        let s_short: i32 = ctx.command("TIMEOUT", "5").unwrap().parse().unwrap();
        let runtime = start(&core);

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            {
                let got = order.lock().unwrap();
                if got.len() == 2 {
                    assert_eq!(*got, vec![s_short, s_long]);
                    break;
                }
            }
            assert!(Instant::now() < deadline, "timers never fired");
            std::thread::sleep(Duration::from_millis(5));
        }

        core.handles.retire(ctx.handle());
        drop(ctx);
        runtime.join();
    }

    #[test]
    fn bootstrap_launches_logger_and_target() {
        let core = test_core();
        let booted = Arc::new(AtomicUsize::new(0));
        let b = Arc::clone(&booted);
        core.modules.register("logger", || Box::new(Idle));
        core.modules.register("main", move || {
            b.fetch_add(1, Ordering::Relaxed);
            Box::new(Idle)
        });
        bootstrap(&core, "logger", "", "main with args").expect("boot");
        assert_eq!(booted.load(Ordering::Relaxed), 1);
        assert!(core.handles.find_name("logger").is_some());
        core.abort();
    }

    #[test]
    fn bootstrap_failure_reports() {
        let core = test_core();
        core.modules.register("logger", || Box::new(Idle));
        let err = bootstrap(&core, "logger", "", "missing-module").unwrap_err();
        assert!(matches!(err, BootError::BootstrapFailed(_)));
        core.abort();
    }

    #[test]
    fn immediate_timeout_skips_wheel() {
        let core = test_core();
        core.modules.register("idle", || Box::new(Idle));
        let ctx = ServiceContext::launch(&core, "idle", "").unwrap();
        core.timeout(ctx.handle(), 0, 9);
        core.timeout(ctx.handle(), -5, 10);
        assert_eq!(ctx.queue_len(), 2);
        core.abort();
        drop(ctx);
    }
}
