//! Executor - Running and Unloading Code Units
//!
//! A run installs the unit's name, environment, argument vector and
//! namespace inside a fresh dynamic scope, evaluates the unit against its
//! persistent symbol table and reports the outcome as a [`RunResult`].
//! Everything the run installed is restored when the scope is left, on
//! every exit path.
//!
//! # Run outcomes:
//! - A raised error becomes `message`
//! - `terminate(n)` becomes `status`
//! - A non-unit final value becomes `value`

pub mod compiler;

use crate::config::ArgLoopMode;
use crate::engine::context::ScopeGuard;
use crate::engine::hooks::{self, HookFilter, HookKind, OnError};
use crate::engine::namespace::compact;
use crate::engine::{describe_error, io, termination_status, Interp};
use crate::env::EnvironmentContext;
use crate::error::RunResult;
use crate::handle::Key;
use crate::perf::{ScopedTimer, TimerType};
use rhai::{Array, Dynamic, EvalAltResult, Position, Scope, AST};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Name the arg loop binds each input line to.
pub const LINE_VARIABLE: &str = "line";

/// Result of a script error: termination status or message.
pub(crate) fn failure(err: &EvalAltResult) -> RunResult {
    match termination_status(err) {
        Some(status) => RunResult::terminated(status),
        None => RunResult::failed(describe_error(err)),
    }
}

fn completed(value: Dynamic) -> RunResult {
    RunResult {
        value: (!value.is_unit()).then(|| value.to_string()),
        ..RunResult::default()
    }
}

/// Run a compiled unit once.
pub(crate) fn run(
    interp: &Interp,
    unit: Key,
    argv: Array,
    env: BTreeMap<String, Dynamic>,
) -> RunResult {
    let Some((name, ns)) = interp
        .units
        .borrow()
        .get(unit)
        .map(|record| (record.name.clone(), record.ns))
    else {
        return RunResult::failed("code unit is not loaded").with_errno(libc::EINVAL);
    };
    let Some(ast) = interp.namespaces.borrow().ast(ns) else {
        return RunResult::failed(format!("{name}: namespace has no code")).with_errno(libc::EINVAL);
    };

    let _timer = ScopedTimer::new(&interp.metrics, TimerType::Run);
    let _scope = ScopeGuard::enter(interp);
    {
        let mut state = interp.state.borrow_mut();
        state.set_program_name(name.as_str());
        state.install_env(env);
        state.install_argv(argv);
        state.set_namespace(Some(ns));
    }

    let mut scope = interp.namespaces.borrow_mut().take_scope(ns);
    let outcome = match interp.config.arg_loop {
        ArgLoopMode::Off => interp.engine.eval_ast_with_scope::<Dynamic>(&mut scope, &ast),
        ArgLoopMode::NoPrint => line_loop(interp, &mut scope, &ast, false),
        ArgLoopMode::Print => line_loop(interp, &mut scope, &ast, true),
    };
    interp.namespaces.borrow_mut().put_scope(ns, scope);

    let result = match outcome {
        Ok(value) => completed(value),
        Err(err) => failure(&err),
    };
    debug!(unit = %name, status = result.status, failed = result.message.is_some(), "Run finished");
    result
}

fn io_error(message: String) -> Box<EvalAltResult> {
    EvalAltResult::ErrorRuntime(message.into(), Position::NONE).into()
}

/// Evaluate the unit once per `STDIN` line, with the line bound to
/// [`LINE_VARIABLE`].  With `print` the (possibly modified) line is
/// written back to `STDOUT` after each pass.
fn line_loop(
    interp: &Interp,
    scope: &mut Scope<'static>,
    ast: &AST,
    print: bool,
) -> Result<Dynamic, Box<EvalAltResult>> {
    let mut last = Dynamic::UNIT;
    while let Some(line) = io::read_line(interp, "STDIN").map_err(io_error)? {
        if scope.is_constant(LINE_VARIABLE) == Some(true) {
            return Err(io_error(format!("cannot rebind constant '{LINE_VARIABLE}'")));
        }
        scope.set_value(LINE_VARIABLE, line);

        last = interp.engine.eval_ast_with_scope::<Dynamic>(scope, ast)?;
        compact(scope);

        if print {
            let text = scope
                .get_value::<Dynamic>(LINE_VARIABLE)
                .map(|v| v.to_string())
                .unwrap_or_default();
            io::write(interp, "STDOUT", &text).map_err(io_error)?;
        }
    }
    Ok(last)
}

/// Unload a unit: run its unload hooks, drop its other pending hooks and
/// erase its namespace.  Returns `false` if the unit was not loaded.
pub(crate) fn unload(interp: &Interp, unit: Key) -> bool {
    let Some(record) = interp.units.borrow_mut().remove(unit) else {
        return false;
    };

    {
        let _scope = ScopeGuard::enter(interp);
        {
            let mut state = interp.state.borrow_mut();
            state.set_program_name(record.name.as_str());
            state.install_env(
                record
                    .env
                    .as_ref()
                    .map(EnvironmentContext::to_visible)
                    .unwrap_or_default(),
            );
            state.set_namespace(Some(record.ns));
        }

        if let Err(err) = hooks::run(
            interp,
            HookKind::Unload,
            HookFilter::Namespace(record.ns),
            OnError::Continue,
        ) {
            warn!(unit = %record.name, error = %err, "Unload hook failed");
        }

        let mut lists = interp.hooks.borrow_mut();
        for kind in [HookKind::Load, HookKind::Check, HookKind::Init] {
            lists.clear(kind, HookFilter::Namespace(record.ns));
        }
    }

    interp.namespaces.borrow_mut().erase(record.ns);
    interp.metrics.record_unload();
    info!(runtime = %interp.id, unit = %record.name, "Code unit unloaded");
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completed_value() {
        assert_eq!(completed(Dynamic::UNIT).value, None);
        assert_eq!(completed(Dynamic::from(3_i64)).value.as_deref(), Some("3"));
        assert!(completed(Dynamic::from("x".to_string())).is_success());
    }

    #[test]
    fn test_failure_mapping() {
        let thrown = EvalAltResult::ErrorRuntime("boom".into(), Position::NONE);
        let result = failure(&thrown);
        assert_eq!(result.message.as_deref(), Some("boom"));
        assert_eq!(result.status, 0);

        let terminated = EvalAltResult::ErrorTerminated(Dynamic::from(42_i64), Position::NONE);
        let result = failure(&terminated);
        assert_eq!(result.status, 42);
        assert!(result.message.is_none());
    }
}
