//! Persist Core - Persistent Script Execution Runtime
//!
//! Embeds a script engine so that programs are compiled once and then run
//! many times in the same process, each unit isolated in its own private
//! namespace.
//!
//! # Design Patterns:
//! - One engine per [`Runtime`], installed as the thread's current runtime
//!   for the duration of every operation
//! - Handles are generational keys, never pointers
//! - Process state visible to scripts (name, environment, argv) changes
//!   only through a dynamic-scope save stack, so every exit path restores it
//! - Lifecycle hooks (load, check, init, unload) fire at well-defined points

pub mod args;
pub mod config;
pub mod engine;
pub mod env;
pub mod error;
pub mod executor;
pub mod handle;
pub mod log;
pub mod perf;
pub mod runtime;
pub mod source;

pub use args::{ArgStats, ArgumentList};
pub use config::{ArgLoopMode, EngineLimits, RuntimeConfig, TaintMode, UnicodeFlags, WarningsMode};
pub use engine::{CacheStats, HookKind, IoCallbacks};
pub use env::EnvironmentContext;
pub use error::{RunResult, RuntimeError, RuntimeResult};
pub use handle::{ArgList, CodeUnit, EnvContext, IoHandle, RuntimeId};
pub use log::{LogLevel, LogSink, TracingSink};
pub use perf::PerfSnapshot;
pub use runtime::Runtime;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Install the `tracing` subscriber, filtered by `RUST_LOG` (default `warn`).
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_logging() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
    {
        info!("Persist runtime v{}", env!("CARGO_PKG_VERSION"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging() {
        assert!(init_logging().is_ok());
        assert!(init_logging().is_ok());
    }
}
