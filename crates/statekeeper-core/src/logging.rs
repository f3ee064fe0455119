//! Logging for the statekeeper binaries.
//!
//! Records go out as JSON lines by default. Each line names the binary that
//! wrote it (`component`) and the reconcile stage it came from (`subsystem`,
//! e.g. `diff`, `apply`, `drift`, `samba`), so a daemon log can be filtered
//! down to one stage of the pipeline.

use env_logger::Env;
use serde_json::{json, Value};
use std::env;
use std::io::Write;
use std::sync::OnceLock;

static INIT: OnceLock<()> = OnceLock::new();

const FORMAT_ENV: &str = "STATEKEEPER_LOG_FORMAT";
const LEVEL_ENV: &str = "STATEKEEPER_LOG_LEVEL";

/// Install the global logger for `component` (`statekeeperd`, `statekeeper`).
///
/// Only the first call has an effect. `RUST_LOG` wins over everything;
/// otherwise `STATEKEEPER_LOG_LEVEL`, then `default_level`.
/// `STATEKEEPER_LOG_FORMAT=plain` switches to one human-readable line per record.
pub fn init(component: &'static str, default_level: &str) {
    let _ = INIT.get_or_init(|| configure(component, default_level));
}

/// Reconcile stage for a log target: the module after the crate name, or the
/// crate itself with its `statekeeper_` prefix dropped.
pub fn subsystem(target: &str) -> &str {
    let mut parts = target.split("::");
    let krate = parts.next().unwrap_or(target);
    match parts.next() {
        Some(module) => module,
        None => krate.strip_prefix("statekeeper_").unwrap_or(krate),
    }
}

fn json_line(component: &str, timestamp: &str, level: log::Level, target: &str, message: &str) -> Value {
    json!({
        "timestamp": timestamp,
        "level": level.as_str().to_lowercase(),
        "component": component,
        "subsystem": subsystem(target),
        "target": target,
        "message": message,
    })
}

fn configure(component: &'static str, default_level: &str) {
    let default_level = env::var(LEVEL_ENV).unwrap_or_else(|_| default_level.to_string());
    let env = Env::default().default_filter_or(default_level);

    let plain = env::var(FORMAT_ENV)
        .map(|format| format.eq_ignore_ascii_case("plain"))
        .unwrap_or(false);

    let mut builder = env_logger::Builder::from_env(env);
    if plain {
        builder.format(move |buf, record| {
            writeln!(
                buf,
                "{} {:<5} {}/{} - {}",
                buf.timestamp(),
                record.level().as_str().to_lowercase(),
                component,
                subsystem(record.target()),
                record.args()
            )
        });
    } else {
        builder.format(move |buf, record| {
            let line = json_line(
                component,
                &buf.timestamp().to_string(),
                record.level(),
                record.target(),
                &record.args().to_string(),
            );
            writeln!(buf, "{line}")
        });
    }

    if let Err(err) = builder.try_init() {
        eprintln!("failed to initialize logger: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subsystem_follows_the_module_path() {
        assert_eq!(subsystem("statekeeper_core::drift"), "drift");
        assert_eq!(subsystem("statekeeper_system::samba"), "samba");
        assert_eq!(subsystem("statekeeper_core::apply::inner"), "apply");
        assert_eq!(subsystem("statekeeperd"), "statekeeperd");
        assert_eq!(subsystem("statekeeper_daemon"), "daemon");
    }

    #[test]
    fn json_line_carries_component_and_subsystem() {
        let line = json_line(
            "statekeeperd",
            "2026-01-01T00:00:00Z",
            log::Level::Warn,
            "statekeeper_core::apply",
            "apply halted",
        );
        assert_eq!(line["level"], "warn");
        assert_eq!(line["component"], "statekeeperd");
        assert_eq!(line["subsystem"], "apply");
        assert_eq!(line["message"], "apply halted");
    }
}
