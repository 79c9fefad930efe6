//! Text command surface.
//!
//! Short ASCII verbs routed to the runtime itself rather than to a user
//! service. Each returns either nothing or a short string; handles
//! render as `:hex` and local names as `.name`.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::error;
use crate::log;
use crate::message::Handle;
use crate::service::{handle_exit, ServiceContext};

/// Execute `cmd` with `param` on behalf of `ctx`.
pub fn command(ctx: &Arc<ServiceContext>, cmd: &str, param: &str) -> Option<String> {
    match cmd {
        "TIMEOUT" => cmd_timeout(ctx, param),
        "REG" => cmd_reg(ctx, param),
        "QUERY" => cmd_query(ctx, param),
        "NAME" => cmd_name(ctx, param),
        "EXIT" => {
            handle_exit(ctx, 0);
            None
        }
        "KILL" => cmd_kill(ctx, param),
        "LAUNCH" => cmd_launch(ctx, param),
        "GETENV" => ctx.core().env.get(param),
        "SETENV" => cmd_setenv(ctx, param),
        "STARTTIME" => Some(ctx.core().timer.start_secs().to_string()),
        "ABORT" => {
            ctx.core().abort();
            None
        }
        "MONITOR" => cmd_monitor(ctx, param),
        "STAT" => cmd_stat(ctx, param),
        "LOGON" => cmd_logon(ctx, param),
        "LOGOFF" => cmd_logoff(ctx, param),
        "SIGNAL" => cmd_signal(ctx, param),
        _ => None,
    }
}

/// Parse `:hex` or `.name` into a handle; 0 when unresolvable.
fn tohandle(ctx: &ServiceContext, param: &str) -> Handle {
    let core = ctx.core();
    match crate::harbor::query_name(param, |n| core.handles.find_name(n)) {
        Some(h) => h,
        None => {
            error::report(core, ctx.handle(), &format!("error: can't convert {param} to handle"));
            0
        }
    }
}

fn cmd_timeout(ctx: &Arc<ServiceContext>, param: &str) -> Option<String> {
    let ticks: i32 = param.trim().parse().ok()?;
    let session = ctx.new_session();
    ctx.core().timeout(ctx.handle(), ticks, session);
    Some(session.to_string())
}

fn cmd_reg(ctx: &Arc<ServiceContext>, param: &str) -> Option<String> {
    let core = ctx.core();
    if param.is_empty() {
        return Some(format!(":{:x}", ctx.handle()));
    }
    if let Some(name) = param.strip_prefix('.') {
        if core.handles.bind_name(name, ctx.handle()) {
            return Some(name.to_owned());
        }
        return None;
    }
    error::report(
        core,
        ctx.handle(),
        &format!("error: can't register global name {param} in the core"),
    );
    None
}

fn cmd_query(ctx: &Arc<ServiceContext>, param: &str) -> Option<String> {
    let name = param.strip_prefix('.')?;
    let handle = ctx.core().handles.find_name(name)?;
    Some(format!(":{handle:x}"))
}

fn cmd_name(ctx: &Arc<ServiceContext>, param: &str) -> Option<String> {
    let (name, addr) = param.split_once(' ')?;
    let hex = addr.strip_prefix(':')?;
    let handle = u32::from_str_radix(hex, 16).ok()?;
    if handle == 0 {
        return None;
    }
    if let Some(local) = name.strip_prefix('.') {
        if ctx.core().handles.bind_name(local, handle) {
            return Some(local.to_owned());
        }
        return None;
    }
    error::report(
        ctx.core(),
        ctx.handle(),
        &format!("error: can't set global name {name} in the core"),
    );
    None
}

fn cmd_kill(ctx: &Arc<ServiceContext>, param: &str) -> Option<String> {
    let handle = tohandle(ctx, param);
    if handle != 0 {
        handle_exit(ctx, handle);
    }
    None
}

fn cmd_launch(ctx: &Arc<ServiceContext>, param: &str) -> Option<String> {
    let param = param.trim();
    let (module, args) = match param.split_once(char::is_whitespace) {
        Some((m, a)) => (m, a.trim()),
        None => (param, ""),
    };
    if module.is_empty() {
        return None;
    }
    let launched = ServiceContext::launch(ctx.core(), module, args)?;
    Some(format!(":{:x}", launched.handle()))
}

fn cmd_setenv(ctx: &Arc<ServiceContext>, param: &str) -> Option<String> {
    let (key, value) = param.split_once(' ')?;
    ctx.core().env.set(key, value);
    None
}

fn cmd_monitor(ctx: &Arc<ServiceContext>, param: &str) -> Option<String> {
    let core = ctx.core();
    if param.is_empty() {
        let watcher = core.monitor_exit.load(Ordering::Relaxed);
        if watcher != 0 {
            return Some(format!(":{watcher:x}"));
        }
        return None;
    }
    let handle = tohandle(ctx, param);
    core.monitor_exit.store(handle, Ordering::Relaxed);
    None
}

fn cmd_stat(ctx: &Arc<ServiceContext>, param: &str) -> Option<String> {
    let out = match param {
        "mqlen" => ctx.queue_len().to_string(),
        "endless" => {
            if ctx.take_endless() {
                "1".to_owned()
            } else {
                "0".to_owned()
            }
        }
        "cpu" => format!("{:.6}", ctx.cpu_cost_us() as f64 / 1_000_000.0),
        "time" => format!("{:.6}", ctx.dispatch_elapsed_us() as f64 / 1_000_000.0),
        "message" => ctx.message_count().to_string(),
        _ => String::new(),
    };
    Some(out)
}

fn cmd_logon(ctx: &Arc<ServiceContext>, param: &str) -> Option<String> {
    let handle = tohandle(ctx, param);
    if handle == 0 {
        return None;
    }
    let core = ctx.core();
    let target = core.handles.grab(handle)?;
    let logpath = core.env.get("logpath")?;
    match log::open_service_log(&logpath, handle, core.timer.now(), core.timer.start_secs()) {
        Ok((file, path)) => {
            if target.set_logfile(file) {
                error::report(core, ctx.handle(), &format!("open log file {}", path.display()));
            }
        }
        Err(_) => {
            let path = log::service_log_path(&logpath, handle);
            error::report(
                core,
                ctx.handle(),
                &format!("open log file {} fail", path.display()),
            );
        }
    }
    None
}

fn cmd_logoff(ctx: &Arc<ServiceContext>, param: &str) -> Option<String> {
    let handle = tohandle(ctx, param);
    if handle == 0 {
        return None;
    }
    let core = ctx.core();
    let target = core.handles.grab(handle)?;
    if target.close_logfile(core.timer.now()) {
        error::report(core, ctx.handle(), &format!("close log file :{handle:08x}"));
    }
    None
}

fn cmd_signal(ctx: &Arc<ServiceContext>, param: &str) -> Option<String> {
    let (addr, rest) = match param.split_once(' ') {
        Some((a, r)) => (a, r.trim()),
        None => (param, ""),
    };
    let handle = tohandle(ctx, addr);
    if handle == 0 {
        return None;
    }
    let target = ctx.core().handles.grab(handle)?;
    let sig: i32 = rest.parse().unwrap_or(0);
    target.signal(sig);
    None
}
