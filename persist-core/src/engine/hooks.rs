//! Lifecycle Hook Engine
//!
//! Namespaces queue hooks in four lists: load, check, init and unload.
//! Check and init together form the post-compile phase, which a persistent
//! runtime must fire by hand once a unit finishes compiling.  Load and check
//! registrations are also recorded in secondary "saved" lists, which are
//! cleared in lock-step with the primary ones.
//!
//! # Semantics:
//! - Hooks run in registration order, and each is removed before it runs
//! - Hooks queued while a list is running are picked up by the same run
//! - The unload list always continues past errors and swallows them
//! - Other lists stop at the first error and leave the rest queued
//! - The dynamic scope depth is restored after every hook
//! - Hooks see the modules their unit imports at top level

use super::context::ScopeGuard;
use super::namespace::NamespaceId;
use super::{describe_error, termination_status, Interp};
use rhai::{CallFnOptions, Dynamic, FnPtr, Module, Scope, Stmt, AST};
use std::fmt;
use tracing::{debug, warn};

/// The hook lists a namespace can queue into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    /// Runs while the owning namespace compiles.
    Load,
    /// First post-compile phase.
    Check,
    /// Second post-compile phase.
    Init,
    /// Runs once when the owning namespace is unloaded or the runtime is destroyed.
    Unload,
}

impl HookKind {
    pub const ALL: [HookKind; 4] = [Self::Load, Self::Check, Self::Init, Self::Unload];

    /// Name of the declared function that registers this hook.
    pub fn function_name(self) -> &'static str {
        match self {
            Self::Load => "on_load",
            Self::Check => "on_check",
            Self::Init => "on_init",
            Self::Unload => "on_unload",
        }
    }

    fn from_function_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.function_name() == name)
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Load => write!(f, "load"),
            Self::Check => write!(f, "check"),
            Self::Init => write!(f, "init"),
            Self::Unload => write!(f, "unload"),
        }
    }
}

/// Which entries an operation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HookFilter {
    All,
    Namespace(NamespaceId),
    /// The namespace plus every module namespace.
    NamespaceAndModules(NamespaceId),
}

/// Behaviour after a hook raises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OnError {
    Stop,
    Continue,
}

#[derive(Clone)]
pub(crate) struct HookEntry {
    ns: NamespaceId,
    module: bool,
    func: FnPtr,
}

impl HookEntry {
    fn matches(&self, filter: HookFilter) -> bool {
        match filter {
            HookFilter::All => true,
            HookFilter::Namespace(ns) => self.ns == ns,
            HookFilter::NamespaceAndModules(ns) => self.ns == ns || self.module,
        }
    }
}

/// A hook that raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HookError {
    pub(crate) kind: HookKind,
    pub(crate) hook: String,
    pub(crate) message: String,
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} hook '{}' failed: {}", self.kind, self.hook, self.message)
    }
}

/// Hook lists of one runtime.
#[derive(Default)]
pub(crate) struct HookLists {
    load: Vec<HookEntry>,
    check: Vec<HookEntry>,
    init: Vec<HookEntry>,
    unload: Vec<HookEntry>,
    load_saved: Vec<HookEntry>,
    check_saved: Vec<HookEntry>,
}

impl HookLists {
    fn list_mut(&mut self, kind: HookKind) -> &mut Vec<HookEntry> {
        match kind {
            HookKind::Load => &mut self.load,
            HookKind::Check => &mut self.check,
            HookKind::Init => &mut self.init,
            HookKind::Unload => &mut self.unload,
        }
    }

    fn saved_mut(&mut self, kind: HookKind) -> Option<&mut Vec<HookEntry>> {
        match kind {
            HookKind::Load => Some(&mut self.load_saved),
            HookKind::Check => Some(&mut self.check_saved),
            HookKind::Init | HookKind::Unload => None,
        }
    }

    pub(crate) fn push(&mut self, kind: HookKind, entry: HookEntry) {
        if let Some(saved) = self.saved_mut(kind) {
            saved.push(entry.clone());
        }
        self.list_mut(kind).push(entry);
    }

    /// Remove the first entry matching `filter`.
    fn take_next(&mut self, kind: HookKind, filter: HookFilter) -> Option<HookEntry> {
        let list = self.list_mut(kind);
        let index = list.iter().position(|entry| entry.matches(filter))?;
        Some(list.remove(index))
    }

    /// Drop matching entries without running them, saved copies included.
    /// Returns how many primary entries were removed.
    pub(crate) fn clear(&mut self, kind: HookKind, filter: HookFilter) -> usize {
        let list = self.list_mut(kind);
        let before = list.len();
        list.retain(|entry| !entry.matches(filter));
        let removed = before - list.len();

        if let Some(saved) = self.saved_mut(kind) {
            saved.retain(|entry| !entry.matches(filter));
        }
        removed
    }

    pub(crate) fn clear_all(&mut self) {
        *self = Self::default();
    }

    pub(crate) fn pending(&self, kind: HookKind) -> usize {
        match kind {
            HookKind::Load => self.load.len(),
            HookKind::Check => self.check.len(),
            HookKind::Init => self.init.len(),
            HookKind::Unload => self.unload.len(),
        }
    }

    pub(crate) fn saved(&self, kind: HookKind) -> usize {
        match kind {
            HookKind::Load => self.load_saved.len(),
            HookKind::Check => self.check_saved.len(),
            HookKind::Init | HookKind::Unload => 0,
        }
    }
}

/// Queue `func` as a `kind` hook owned by `ns`.
pub(crate) fn register(interp: &Interp, kind: HookKind, ns: NamespaceId, func: FnPtr) {
    let module = interp.namespaces.borrow().is_module(ns);
    debug!(%kind, ns, hook = func.fn_name(), "Hook registered");
    interp
        .hooks
        .borrow_mut()
        .push(kind, HookEntry { ns, module, func });
}

/// Queue every zero-argument `on_load`/`on_check`/`on_init`/`on_unload`
/// function the AST declares.
pub(crate) fn register_declared(interp: &Interp, ns: NamespaceId, ast: &AST) -> Result<(), String> {
    let declared: Vec<(HookKind, String)> = ast
        .iter_functions()
        .filter(|f| f.params.is_empty())
        .filter_map(|f| HookKind::from_function_name(f.name).map(|kind| (kind, f.name.to_string())))
        .collect();

    for (kind, name) in declared {
        let func = FnPtr::new(name).map_err(|e| e.to_string())?;
        register(interp, kind, ns, func);
    }
    Ok(())
}

/// Run matching `kind` hooks.
///
/// Unload hooks always continue past errors and report success.  For the
/// other kinds `on_error` decides, and with [`OnError::Stop`] the first
/// error is returned while later hooks stay queued.
pub(crate) fn run(
    interp: &Interp,
    kind: HookKind,
    filter: HookFilter,
    on_error: OnError,
) -> Result<(), HookError> {
    let on_error = if kind == HookKind::Unload {
        OnError::Continue
    } else {
        on_error
    };

    let mut first_error = None;
    loop {
        let next = interp.hooks.borrow_mut().take_next(kind, filter);
        let Some(entry) = next else {
            break;
        };

        if let Err(err) = invoke(interp, kind, &entry) {
            match on_error {
                OnError::Stop => return Err(err),
                OnError::Continue => {
                    warn!(error = %err, "Hook failed, continuing");
                    interp.diagnostic(&err.to_string());
                    if kind != HookKind::Unload && first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
    }

    first_error.map_or(Ok(()), Err)
}

/// Drain the whole `kind` list regardless of namespace.
pub(crate) fn run_all(interp: &Interp, kind: HookKind) -> Result<(), HookError> {
    run(interp, kind, HookFilter::All, OnError::Continue)
}

/// The program a hook runs in: the top-level `import` statements of `ast`
/// followed by its functions, with the embedded module resolver kept.
pub(crate) fn hook_program(ast: &AST) -> AST {
    let imports: Vec<Stmt> = ast
        .statements()
        .iter()
        .filter(|stmt| matches!(stmt, Stmt::Import(..)))
        .cloned()
        .collect();
    AST::new(imports, Module::new()).merge(&ast.clone_functions_only())
}

fn invoke(interp: &Interp, kind: HookKind, entry: &HookEntry) -> Result<(), HookError> {
    let hook = entry.func.fn_name().to_string();
    let Some(ast) = interp.namespaces.borrow().ast(entry.ns) else {
        debug!(%kind, ns = entry.ns, hook = %hook, "Hook owner has no code, skipping");
        return Ok(());
    };
    let program = hook_program(&ast);

    let _scope = ScopeGuard::enter(interp);
    interp.state.borrow_mut().set_namespace(Some(entry.ns));

    debug!(%kind, ns = entry.ns, hook = %hook, "Running hook");
    interp.metrics.record_hook();
    let options = CallFnOptions::new().eval_ast(true).in_all_namespaces(true);
    let outcome = interp.engine.call_fn_with_options::<Dynamic>(
        options,
        &mut Scope::new(),
        &program,
        &hook,
        entry.func.curry().to_vec(),
    );

    match outcome {
        Ok(_) => Ok(()),
        Err(err) => match termination_status(&err) {
            Some(status) => {
                debug!(%kind, hook = %hook, status, "Hook terminated");
                Ok(())
            }
            None => Err(HookError {
                kind,
                hook,
                message: describe_error(&err),
            }),
        },
    }
}
