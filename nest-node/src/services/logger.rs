//! The `logger` service: sink for PTYPE_TEXT lines.
//!
//! Writes `[:{source:08x}] text` lines to a file (when launched with a
//! path argument) or stdout. File-backed loggers prefix each line with
//! a wall-clock timestamp and reopen their file on signal 0 or a
//! PTYPE_SYSTEM message, which is how log rotation is driven.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Arc;

use chrono::{Local, TimeZone};
use nest_runtime::message::{Message, Payload, PTYPE_SYSTEM, PTYPE_TEXT};
use nest_runtime::{ServiceContext, ServiceModule};

#[derive(Default)]
pub struct Logger {
    file: Option<File>,
    filename: Option<String>,
    start_secs: u64,
    reopen_pending: bool,
}

impl Logger {
    pub fn new() -> Logger {
        Logger::default()
    }

    fn reopen(&mut self) {
        if let Some(name) = &self.filename {
            self.file = OpenOptions::new().append(true).create(true).open(name).ok();
        }
    }

    fn stamp(&self, now_ticks: u64) -> String {
        let secs = self.start_secs + now_ticks / 100;
        let centis = now_ticks % 100;
        match Local.timestamp_opt(secs as i64, 0).single() {
            Some(t) => format!("{}.{centis:02} ", t.format("%d/%m/%y %H:%M:%S")),
            None => String::new(),
        }
    }

    fn write_line(&mut self, line: &str) {
        match self.file.as_mut() {
            Some(f) => {
                let _ = writeln!(f, "{line}");
                let _ = f.flush();
            }
            None => println!("{line}"),
        }
    }
}

impl ServiceModule for Logger {
    fn init(&mut self, ctx: &Arc<ServiceContext>, args: &str) -> Result<(), String> {
        let start = ctx
            .command("STARTTIME", "")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        self.start_secs = start;
        let args = args.trim();
        if !args.is_empty() {
            self.filename = Some(args.to_owned());
            self.reopen();
            if self.file.is_none() {
                return Err(format!("can't open log file {args}"));
            }
        }
        Ok(())
    }

    fn message(&mut self, ctx: &Arc<ServiceContext>, msg: Message) {
        if self.reopen_pending {
            self.reopen_pending = false;
            self.reopen();
        }
        match msg.ptype {
            PTYPE_SYSTEM => self.reopen(),
            PTYPE_TEXT => {
                let text = match &msg.payload {
                    Payload::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
                    other => format!("{other:?}"),
                };
                let prefix = if self.filename.is_some() {
                    self.stamp(ctx.core().timer.now())
                } else {
                    String::new()
                };
                self.write_line(&format!("{prefix}[:{:08x}] {text}", msg.source));
            }
            _ => {}
        }
    }

    fn signal(&mut self, signal: i32) {
        // Signal 0 requests a reopen; file work is deferred to the next
        // message since the signal hook must stay cheap.
        if signal == 0 {
            self.reopen_pending = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nest_runtime::{Config, RuntimeCore};
    use std::io::Read;

    #[test]
    fn file_logger_records_error_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.log");
        let path_str = path.to_str().unwrap().to_owned();

        let core = RuntimeCore::new(&Config {
            thread: 0,
            harbor: 0,
            profile: false,
        })
        .unwrap();
        core.modules.register("logger", || Box::new(Logger::new()));
        let logger = ServiceContext::launch(&core, "logger", &path_str).expect("launch logger");
        core.handles.bind_name("logger", logger.handle());

        logger.log_error("hello from the node");
        nest_runtime::service::dispatch_all(&logger);

        let mut text = String::new();
        File::open(&path).unwrap().read_to_string(&mut text).unwrap();
        assert!(text.contains("hello from the node"), "{text}");
        core.abort();
    }
}
