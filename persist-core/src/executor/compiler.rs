//! Code Unit Compiler
//!
//! Compiling a unit allocates its private namespace, compiles the source
//! into a self-contained AST (loading every imported module on the way)
//! and fires the load, check and init hooks.  A unit that fails at any
//! step leaves nothing behind: its namespace is erased and none of its
//! hooks, unload hooks included, will ever run.

use super::failure;
use crate::engine::context::ScopeGuard;
use crate::engine::hooks::{self, HookFilter, HookKind, OnError};
use crate::engine::modules;
use crate::engine::namespace::NamespaceId;
use crate::engine::{Interp, UnitRecord};
use crate::env::EnvironmentContext;
use crate::error::RunResult;
use crate::handle::Key;
use crate::perf::{ScopedTimer, TimerType};
use rhai::{Position, Scope};
use std::rc::Rc;
use tracing::{info, warn};

/// Compile `source` into a new code unit named `name`.
pub(crate) fn compile(
    interp: &Interp,
    name: &str,
    env: Option<EnvironmentContext>,
    source: &[u8],
) -> Result<Key, RunResult> {
    let _timer = ScopedTimer::new(&interp.metrics, TimerType::Compile);

    let text = std::str::from_utf8(source).map_err(|e| {
        interp.metrics.record_compile_failure();
        RunResult::failed(format!("{name}: source is not valid UTF-8 ({e})")).with_errno(libc::EILSEQ)
    })?;

    let ns = interp.namespaces.borrow_mut().allocate_unit();
    let outcome = {
        let _scope = ScopeGuard::enter(interp);
        {
            let mut state = interp.state.borrow_mut();
            state.set_program_name(name);
            state.install_env(env.as_ref().map(EnvironmentContext::to_visible).unwrap_or_default());
            state.set_namespace(Some(ns));
        }
        build(interp, name, ns, text)
    };

    match outcome {
        Ok(()) => {
            let key = interp.units.borrow_mut().insert(UnitRecord {
                name: name.to_string(),
                ns,
                env,
            });
            info!(runtime = %interp.id, unit = name, ns, "Code unit compiled");
            Ok(key)
        }
        Err(result) => {
            interp.discard_namespace(ns);
            interp.metrics.record_compile_failure();
            warn!(unit = name, message = ?result.message, status = result.status, "Compile failed");
            Err(result)
        }
    }
}

fn build(interp: &Interp, name: &str, ns: NamespaceId, text: &str) -> Result<(), RunResult> {
    let mut ast = interp
        .engine
        .compile_into_self_contained(&Scope::new(), text)
        .map_err(|e| failure(&e))?;
    ast.set_source(name);
    let ast = Rc::new(ast);
    interp.namespaces.borrow_mut().set_ast(ns, Rc::clone(&ast));

    hooks::register_declared(interp, ns, &ast).map_err(RunResult::failed)?;
    hooks::run(interp, HookKind::Load, HookFilter::Namespace(ns), OnError::Stop)
        .map_err(|e| RunResult::failed(e.to_string()))?;
    post_compile(interp, ns)
}

/// Fire the check and then the init hooks of `ns` and of every module.
pub(crate) fn post_compile(interp: &Interp, ns: NamespaceId) -> Result<(), RunResult> {
    for kind in [HookKind::Check, HookKind::Init] {
        hooks::run(interp, kind, HookFilter::NamespaceAndModules(ns), OnError::Stop)
            .map_err(|e| RunResult::failed(e.to_string()))?;
    }
    Ok(())
}

/// Load the module `name` ahead of any unit that imports it.
pub(crate) fn preload(interp: &Interp, name: &str, env: Option<&EnvironmentContext>) -> RunResult {
    let _scope = ScopeGuard::enter(interp);
    {
        let mut state = interp.state.borrow_mut();
        state.set_program_name(name);
        state.install_env(env.map(EnvironmentContext::to_visible).unwrap_or_default());
    }

    if let Err(err) = modules::load(interp, &interp.engine, name, Position::NONE) {
        return failure(&err);
    }
    let module_ns = interp
        .modules
        .borrow()
        .namespace_of(&modules::module_name(name));
    match module_ns {
        Some(ns) => post_compile(interp, ns).err().unwrap_or_default(),
        None => RunResult::default(),
    }
}
