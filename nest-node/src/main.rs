//! `nest` — node driver.
//!
//! ```text
//! nest <config>      # boot a node from a config file
//! nest version       # print version info
//! ```
//!
//! The config file holds `key = value` lines (`#` comments, `$VAR`
//! expands from the process environment). Keys consumed by the runtime:
//!
//! ```text
//! thread     worker count                      (default 8)
//! harbor     node id, high byte of handles     (default 0)
//! bootstrap  initial LAUNCH command            (default "echod 127.0.0.1:8888")
//! logservice logger module name                (default "logger")
//! logger     argument for the logger service   (default empty = stdout)
//! logpath    directory for per-service logs    (optional)
//! profile    per-dispatch CPU accounting       (default false)
//! cpath      accepted for compatibility; modules are compiled in
//! ```

mod services;

use std::sync::Arc;

use nest_runtime::{bootstrap, start, Config, RuntimeCore};

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }
    match args[1].as_str() {
        "version" | "--version" | "-V" => {
            println!("nest {}", env!("CARGO_PKG_VERSION"));
        }
        "help" | "--help" | "-h" => print_usage(),
        config_path => {
            if let Err(code) = run(config_path) {
                std::process::exit(code);
            }
        }
    }
}

fn print_usage() {
    eprintln!("usage: nest <config>");
    eprintln!("       nest version");
}

fn run(config_path: &str) -> Result<(), i32> {
    // Writes to sockets whose peer vanished must surface as errors on
    // the write, not kill the process.
    // SAFETY: installing SIG_IGN for SIGPIPE has no preconditions.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    let text = std::fs::read_to_string(config_path).map_err(|e| {
        eprintln!("nest: can't read config {config_path}: {e}");
        1
    })?;

    let pairs = parse_config(&text).map_err(|line| {
        eprintln!("nest: invalid config line: {line}");
        1
    })?;

    // Env store first, so read-through defaults land beside the file's
    // own keys.
    let core = build_core(&pairs).map_err(|e| {
        eprintln!("nest: {e}");
        1
    })?;

    services::register_all(&core.modules);

    let logservice = core.env.get_or("logservice", "logger");
    let logger_args = core.env.get_or("logger", "");
    let command = core.env.get_or("bootstrap", "echod 127.0.0.1:8888");
    if let Err(e) = bootstrap(&core, &logservice, &logger_args, &command) {
        eprintln!("nest: {e}");
        return Err(1);
    }

    start(&core).join();
    Ok(())
}

fn build_core(pairs: &[(String, String)]) -> Result<Arc<RuntimeCore>, String> {
    // Seed a temporary env to read the boot keys, then copy everything
    // into the runtime's own store.
    let seed = nest_runtime::env::EnvStore::new();
    for (k, v) in pairs {
        seed.set(k, v);
    }
    let config = Config {
        thread: seed.get_or_int("thread", 8).max(1) as usize,
        harbor: u8::try_from(seed.get_or_int("harbor", 0))
            .map_err(|_| "harbor must be 0..=255".to_owned())?,
        profile: seed.get_or_bool("profile", false),
    };
    let core = RuntimeCore::new(&config).map_err(|e| format!("socket server init failed: {e}"))?;
    for (k, v) in pairs {
        core.env.set(k, v);
    }
    // Pin the boot defaults so GETENV sees them even when the file was
    // silent.
    let _ = core.env.get_or("thread", &config.thread.to_string());
    let _ = core.env.get_or("harbor", &config.harbor.to_string());
    let _ = core
        .env
        .get_or("profile", if config.profile { "true" } else { "false" });
    Ok(core)
}

/// Parse `key = value` lines; `#` starts a comment, `$VAR` in a value
/// expands from the process environment.
fn parse_config(text: &str) -> Result<Vec<(String, String)>, String> {
    let mut out = Vec::new();
    for raw in text.lines() {
        let line = match raw.find('#') {
            Some(at) => &raw[..at],
            None => raw,
        }
        .trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = line.split_once('=').ok_or_else(|| raw.to_owned())?;
        let key = key.trim();
        if key.is_empty() {
            return Err(raw.to_owned());
        }
        let value = expand_env(value.trim().trim_matches('"'));
        out.push((key.to_owned(), value));
    }
    Ok(out)
}

/// Expand `$NAME` references from the process environment.
fn expand_env(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let mut name = String::new();
        while let Some(&n) = chars.peek() {
            if n.is_ascii_alphanumeric() || n == '_' {
                name.push(n);
                chars.next();
            } else {
                break;
            }
        }
        if name.is_empty() {
            out.push('$');
        } else if let Ok(v) = std::env::var(&name) {
            out.push_str(&v);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comments_and_pairs() {
        let text = "
# node config
thread = 4
harbor = 1   # node one
bootstrap = \"echod 127.0.0.1:9000\"
";
        let pairs = parse_config(text).unwrap();
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[0], ("thread".to_owned(), "4".to_owned()));
        assert_eq!(pairs[1], ("harbor".to_owned(), "1".to_owned()));
        assert_eq!(
            pairs[2],
            ("bootstrap".to_owned(), "echod 127.0.0.1:9000".to_owned())
        );
    }

    #[test]
    fn rejects_bare_words() {
        assert!(parse_config("not a pair").is_err());
    }

    #[test]
    fn expands_process_env() {
        std::env::set_var("NEST_TEST_ROOT", "/srv/nest");
        assert_eq!(expand_env("$NEST_TEST_ROOT/log"), "/srv/nest/log");
        assert_eq!(expand_env("plain"), "plain");
        assert_eq!(expand_env("$"), "$");
        assert_eq!(expand_env("$NEST_UNSET_VAR_XYZ"), "");
    }

    #[test]
    fn build_core_reads_boot_keys() {
        let pairs = vec![
            ("thread".to_owned(), "2".to_owned()),
            ("harbor".to_owned(), "3".to_owned()),
        ];
        let core = build_core(&pairs).unwrap();
        assert_eq!(core.env.get("thread").as_deref(), Some("2"));
        assert_eq!(core.env.get("harbor").as_deref(), Some("3"));
    }
}
