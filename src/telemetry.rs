//! Tracing-subscriber initialization.
//!
//! `mup` logs through plain `tracing::{info,warn,error,debug}!` call sites in
//! each subsystem rather than building bespoke span-context types per
//! message kind; this module just wires the global subscriber once at
//! startup.

use tracing_subscriber::EnvFilter;

use crate::config::LogFormat;

/// Install the global tracing subscriber. `debug` forces `debug` level for
/// the `mup` crate regardless of `RUST_LOG`; otherwise the default filter is
/// `info`.
pub fn init(format: LogFormat, debug: bool) {
    let default_directive = if debug { "mup=debug,info" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let subscriber = tracing_subscriber::fmt().with_env_filter(env_filter);

    match format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Pretty => subscriber.init(),
    }
}
