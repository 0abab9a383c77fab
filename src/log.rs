//! Structured logging setup.
//!
//! Log levels:
//! - ERROR: A run failed at a fatal stage
//! - WARN: Recoverable conditions (failed attempts, transient API errors, rollbacks)
//! - INFO: Stage transitions (plan created, task finished, PR opened)
//! - DEBUG: Per-call traces of the hosting API, workspace and agent runtime
//! - TRACE: Prompts and raw completions
//!
//! Output goes to `~/.autopr/autopr.log`. Debug mode can be enabled with
//! `init_with_debug(true)` or `AUTOPR_DEBUG=1`; `RUST_LOG` overrides both.

use std::fs::OpenOptions;
use std::sync::{Mutex, OnceLock};

use tracing_subscriber::EnvFilter;

use crate::config::Config;

static INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize logging at INFO level.
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging with an explicit debug mode setting.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_with_debug(debug: bool) {
    INITIALIZED.get_or_init(|| {
        let level = if debug || debug_from_env() {
            "debug"
        } else {
            "info"
        };
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("autopr={}", level)));

        let file = Config::log_path().ok().and_then(|path| {
            if let Some(dir) = path.parent() {
                let _ = std::fs::create_dir_all(dir);
            }
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(path)
                .ok()
        });

        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false);
        let _ = match file {
            Some(file) => builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init(),
            None => builder.with_writer(std::io::stderr).try_init(),
        };
    });
}

fn debug_from_env() -> bool {
    std::env::var("AUTOPR_DEBUG")
        .map(|v| is_truthy(&v))
        .unwrap_or(false)
}

fn is_truthy(v: &str) -> bool {
    v == "1" || v.eq_ignore_ascii_case("true")
}
