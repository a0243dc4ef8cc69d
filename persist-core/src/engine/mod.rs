//! Engine module - Core runtime components
//!
//! One [`Interp`] exists per [`Runtime`](crate::Runtime).  It owns the
//! script engine and every table the runtime keeps (namespaces, hooks,
//! I/O handles, modules, units, environments and argument lists).
//!
//! Each table sits in its own `RefCell`.  Engine calls re-enter the host
//! through registered functions, so no borrow may be held across a call
//! into the engine.

pub mod context;
pub mod hooks;
pub mod io;
pub mod modules;
pub mod namespace;

mod host_api;

use crate::args::ArgumentList;
use crate::config::RuntimeConfig;
use crate::env::EnvironmentContext;
use crate::handle::{HandleTable, RuntimeId};
use crate::log::{LogLevel, LogSink};
use crate::perf::RuntimeMetrics;
use context::{ContextGuard, ProcessState};
use hooks::HookLists;
use io::IoRegistry;
use modules::{IncludePathResolver, ModuleCache};
use namespace::{NamespaceId, NamespaceTable};
use rhai::{Dynamic, Engine, EvalAltResult};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use tracing::{debug, info};

pub use hooks::HookKind;
pub use io::IoCallbacks;
pub use modules::CacheStats;

/// Tag carried by values that came from a tainted environment or argument
/// list.
pub(crate) const TAINT_TAG: i32 = 1;

/// Mark `value` tainted when `tainted` is set.
pub(crate) fn tainted_value(mut value: Dynamic, tainted: bool) -> Dynamic {
    if tainted {
        value.set_tag(TAINT_TAG);
    }
    value
}

pub(crate) fn is_tainted(value: &Dynamic) -> bool {
    value.tag() == TAINT_TAG
}

/// Exit status of a `terminate` or `exit` call, looking through call
/// frames.
pub(crate) fn termination_status(err: &EvalAltResult) -> Option<i32> {
    match err {
        EvalAltResult::Exit(value, _) | EvalAltResult::ErrorTerminated(value, _) => Some(
            value
                .as_int()
                .ok()
                .and_then(|code| i32::try_from(code).ok())
                .unwrap_or(0),
        ),
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _)
        | EvalAltResult::ErrorInModule(_, inner, _) => termination_status(inner),
        _ => None,
    }
}

/// Message text of a script error.  A thrown value reads as itself.
pub(crate) fn describe_error(err: &EvalAltResult) -> String {
    match err {
        EvalAltResult::ErrorRuntime(value, _) => value.to_string(),
        EvalAltResult::ErrorInFunctionCall(name, _, inner, _) => {
            format!("{} (in function {name})", describe_error(inner))
        }
        other => other.to_string(),
    }
}

/// A compiled code unit.
pub(crate) struct UnitRecord {
    pub(crate) name: String,
    pub(crate) ns: NamespaceId,
    /// Environment the unit was compiled with, reinstalled for its unload.
    pub(crate) env: Option<EnvironmentContext>,
}

/// Interpreter state behind one runtime.
pub(crate) struct Interp {
    pub(crate) id: RuntimeId,
    pub(crate) engine: Engine,
    pub(crate) config: RuntimeConfig,
    pub(crate) sink: Rc<dyn LogSink>,
    pub(crate) process_name: String,
    pub(crate) metrics: RuntimeMetrics,
    pub(crate) state: RefCell<ProcessState>,
    pub(crate) hooks: RefCell<HookLists>,
    pub(crate) namespaces: RefCell<NamespaceTable>,
    pub(crate) io: RefCell<IoRegistry>,
    pub(crate) modules: RefCell<ModuleCache>,
    pub(crate) units: RefCell<HandleTable<UnitRecord>>,
    pub(crate) envs: RefCell<HandleTable<EnvironmentContext>>,
    pub(crate) args: RefCell<HandleTable<ArgumentList>>,
}

impl Interp {
    /// Build the engine and run the bootstrap script.
    pub(crate) fn boot(
        process_name: &str,
        config: RuntimeConfig,
        sink: Rc<dyn LogSink>,
    ) -> Result<Rc<Self>, String> {
        let id = RuntimeId::next();
        let mut engine = Engine::new();

        let limits = config.limits();
        engine.set_max_call_levels(limits.max_call_levels);
        engine.set_max_expr_depths(limits.max_expr_depth.0, limits.max_expr_depth.1);
        engine.set_max_string_size(limits.max_string_size);
        engine.set_module_resolver(IncludePathResolver);
        host_api::register(&mut engine);

        let env: BTreeMap<String, Dynamic> = std::env::vars()
            .map(|(k, v)| (k, Dynamic::from(v)))
            .collect();

        let interp = Rc::new(Self {
            id,
            engine,
            config,
            sink,
            process_name: process_name.to_string(),
            metrics: RuntimeMetrics::new(),
            state: RefCell::new(ProcessState::new(process_name, env)),
            hooks: RefCell::new(HookLists::default()),
            namespaces: RefCell::new(NamespaceTable::new()),
            io: RefCell::new(IoRegistry::new()),
            modules: RefCell::new(ModuleCache::new()),
            units: RefCell::new(HandleTable::new()),
            envs: RefCell::new(HandleTable::new()),
            args: RefCell::new(HandleTable::new()),
        });

        {
            let _current = ContextGuard::enter(&interp);
            interp
                .engine
                .run("")
                .map_err(|e| format!("bootstrap failed: {e}"))?;
        }

        info!(runtime = %id, process = process_name, "Runtime booted");
        Ok(interp)
    }

    /// Report a runtime diagnostic, subject to the warnings mode.
    pub(crate) fn diagnostic(&self, message: &str) {
        if self.config.warnings.diagnostics() {
            self.sink.log(LogLevel::Warn, message);
        } else {
            debug!(runtime = %self.id, "{message}");
        }
    }

    /// Drop a namespace together with every hook it still has queued.
    pub(crate) fn discard_namespace(&self, ns: NamespaceId) {
        {
            let mut lists = self.hooks.borrow_mut();
            for kind in HookKind::ALL {
                lists.clear(kind, hooks::HookFilter::Namespace(ns));
            }
        }
        self.namespaces.borrow_mut().erase(ns);
    }

    /// Namespace whose code is currently executing.
    pub(crate) fn current_namespace(&self) -> Option<NamespaceId> {
        self.state.borrow().namespace
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rhai::Position;

    #[test]
    fn test_taint_tag() {
        let plain = tainted_value(Dynamic::from("x".to_string()), false);
        let marked = tainted_value(Dynamic::from("x".to_string()), true);
        assert!(!is_tainted(&plain));
        assert!(is_tainted(&marked));
    }

    #[test]
    fn test_termination_status_through_frames() {
        let terminated = EvalAltResult::ErrorTerminated(Dynamic::from(42_i64), Position::NONE);
        assert_eq!(termination_status(&terminated), Some(42));

        let nested = EvalAltResult::ErrorInFunctionCall(
            "f".into(),
            String::new(),
            terminated.into(),
            Position::NONE,
        );
        assert_eq!(termination_status(&nested), Some(42));

        let exit = EvalAltResult::Exit(Dynamic::UNIT, Position::NONE);
        assert_eq!(termination_status(&exit), Some(0));

        let plain = EvalAltResult::ErrorRuntime("boom".into(), Position::NONE);
        assert_eq!(termination_status(&plain), None);
    }

    #[test]
    fn test_describe_thrown_value() {
        let err = EvalAltResult::ErrorRuntime("boom".into(), Position::NONE);
        assert_eq!(describe_error(&err), "boom");

        let nested = EvalAltResult::ErrorInFunctionCall(
            "helper".into(),
            String::new(),
            err.into(),
            Position::NONE,
        );
        assert_eq!(describe_error(&nested), "boom (in function helper)");
    }
}
