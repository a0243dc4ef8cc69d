//! Persistent Runtime - Compile Once, Run Many Times
//!
//! A [`Runtime`] owns one script engine for its whole life.  Code units are
//! compiled into private namespaces and can then be run any number of
//! times, each run with its own argument vector and environment, while the
//! unit's globals persist between runs.
//!
//! # Lifecycle:
//! - `Runtime::new` boots the engine (failure is fatal, exit code 69)
//! - `compile` / `run` / `unload` manage code units
//! - `destroy` (or drop) unloads every unit, drains module unload hooks,
//!   frees contexts and closes redirected I/O handles
//!
//! Every operation installs the runtime as the thread's current one for
//! its duration, so several runtimes can coexist on one thread.

use crate::args::{ArgStats, ArgumentList};
use crate::config::RuntimeConfig;
use crate::engine::context::ContextGuard;
use crate::engine::hooks::{self, HookKind};
use crate::engine::modules::CacheStats;
use crate::engine::namespace::private_name;
use crate::engine::{io, IoCallbacks, Interp};
use crate::env::EnvironmentContext;
use crate::error::{RunResult, RuntimeError, RuntimeResult};
use crate::executor::{self, compiler};
use crate::handle::{ArgList, CodeUnit, EnvContext, IoHandle, RuntimeId};
use crate::log::{LogSink, TracingSink};
use crate::perf::PerfSnapshot;
use crate::source;
use std::collections::BTreeMap;
use std::fmt;
use std::os::unix::io::AsFd;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::{info, warn};

/// Exit code used when the engine cannot be booted.
pub const EX_UNAVAILABLE: i32 = 69;

/// A persistent script runtime.
///
/// Not `Send`: a runtime and all its handles stay on the thread that
/// created it.
pub struct Runtime {
    interp: Rc<Interp>,
    torn_down: bool,
}

impl Runtime {
    /// Boot a runtime that logs through `tracing`.
    pub fn new(process_name: &str, config: RuntimeConfig) -> Self {
        Self::with_sink(process_name, config, Rc::new(TracingSink))
    }

    /// Boot a runtime with a custom log and fatal sink.
    pub fn with_sink(process_name: &str, config: RuntimeConfig, sink: Rc<dyn LogSink>) -> Self {
        match Interp::boot(process_name, config, Rc::clone(&sink)) {
            Ok(interp) => Self {
                interp,
                torn_down: false,
            },
            Err(message) => sink.fatal(EX_UNAVAILABLE, &message),
        }
    }

    pub fn id(&self) -> RuntimeId {
        self.interp.id
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.interp.config
    }

    fn enter(&self) -> ContextGuard {
        ContextGuard::enter(&self.interp)
    }

    fn owns(&self, runtime: RuntimeId, kind: &'static str) -> RuntimeResult<()> {
        if runtime == self.interp.id {
            Ok(())
        } else {
            Err(RuntimeError::StaleHandle { kind })
        }
    }

    // ---------------------------------------------------------------
    // Environment contexts
    // ---------------------------------------------------------------

    /// Create an environment from `KEY=VALUE` entries.  Entries without
    /// `=` are skipped.
    pub fn env_new<I, S>(&self, tainted: bool, entries: I) -> EnvContext
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.env_insert(EnvironmentContext::new(tainted, entries))
    }

    /// Register an already built environment.
    pub fn env_insert(&self, context: EnvironmentContext) -> EnvContext {
        let _current = self.enter();
        let key = self.interp.envs.borrow_mut().insert(context);
        EnvContext::new(self.interp.id, key)
    }

    fn with_env<T>(
        &self,
        handle: &EnvContext,
        f: impl FnOnce(&mut EnvironmentContext) -> T,
    ) -> RuntimeResult<T> {
        let _current = self.enter();
        self.owns(handle.runtime, EnvContext::KIND)?;
        let mut envs = self.interp.envs.borrow_mut();
        let context = envs.get_mut(handle.key).ok_or(RuntimeError::StaleHandle {
            kind: EnvContext::KIND,
        })?;
        Ok(f(context))
    }

    pub fn env_set(&self, handle: &EnvContext, key: &str, value: &str) -> RuntimeResult<()> {
        self.with_env(handle, |context| context.set(key, value))
    }

    pub fn env_set_fmt(
        &self,
        handle: &EnvContext,
        key: &str,
        args: fmt::Arguments<'_>,
    ) -> RuntimeResult<()> {
        self.with_env(handle, |context| context.set_fmt(key, args))
    }

    pub fn env_get(&self, handle: &EnvContext, key: &str) -> RuntimeResult<Option<String>> {
        self.with_env(handle, |context| context.get(key).map(str::to_string))
    }

    pub fn env_unset(&self, handle: &EnvContext, key: &str) -> RuntimeResult<bool> {
        self.with_env(handle, |context| context.unset(key))
    }

    pub fn env_len(&self, handle: &EnvContext) -> RuntimeResult<usize> {
        self.with_env(handle, |context| context.len())
    }

    pub fn env_destroy(&self, handle: EnvContext) -> RuntimeResult<()> {
        let _current = self.enter();
        self.owns(handle.runtime, EnvContext::KIND)?;
        self.interp
            .envs
            .borrow_mut()
            .remove(handle.key)
            .map(drop)
            .ok_or(RuntimeError::StaleHandle {
                kind: EnvContext::KIND,
            })
    }

    fn env_snapshot(&self, handle: Option<&EnvContext>) -> RuntimeResult<Option<EnvironmentContext>> {
        handle
            .map(|h| self.with_env(h, |context| context.clone()))
            .transpose()
    }

    // ---------------------------------------------------------------
    // Argument lists
    // ---------------------------------------------------------------

    pub fn args_new<I, S>(&self, tainted: bool, items: I) -> ArgList
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        let _current = self.enter();
        let key = self
            .interp
            .args
            .borrow_mut()
            .insert(ArgumentList::new(tainted, items));
        ArgList::new(self.interp.id, key)
    }

    fn with_args<T>(&self, handle: &ArgList, f: impl FnOnce(&mut ArgumentList) -> T) -> RuntimeResult<T> {
        let _current = self.enter();
        self.owns(handle.runtime, ArgList::KIND)?;
        let mut args = self.interp.args.borrow_mut();
        let list = args.get_mut(handle.key).ok_or(RuntimeError::StaleHandle {
            kind: ArgList::KIND,
        })?;
        Ok(f(list))
    }

    pub fn args_append(&self, handle: &ArgList, item: impl AsRef<[u8]>) -> RuntimeResult<()> {
        self.with_args(handle, |list| list.append(item.as_ref()))
    }

    pub fn args_append_fmt(&self, handle: &ArgList, args: fmt::Arguments<'_>) -> RuntimeResult<()> {
        self.with_args(handle, |list| list.append_fmt(args))
    }

    pub fn args_len(&self, handle: &ArgList) -> RuntimeResult<usize> {
        self.with_args(handle, |list| list.len())
    }

    pub fn args_stats(&self, handle: &ArgList) -> RuntimeResult<ArgStats> {
        self.with_args(handle, |list| list.stats())
    }

    pub fn args_destroy(&self, handle: ArgList) -> RuntimeResult<()> {
        let _current = self.enter();
        self.owns(handle.runtime, ArgList::KIND)?;
        self.interp
            .args
            .borrow_mut()
            .remove(handle.key)
            .map(drop)
            .ok_or(RuntimeError::StaleHandle { kind: ArgList::KIND })
    }

    // ---------------------------------------------------------------
    // Code units
    // ---------------------------------------------------------------

    /// Compile `source` into a code unit named `name`, with `env` as the
    /// visible environment while it compiles.
    pub fn compile(
        &self,
        name: &str,
        env: Option<&EnvContext>,
        source: &[u8],
    ) -> Result<CodeUnit, RunResult> {
        let _current = self.enter();
        let env = self.env_snapshot(env)?;
        let key = compiler::compile(&self.interp, name, env, source)?;
        Ok(CodeUnit::new(self.interp.id, key))
    }

    /// Compile a script file, naming the unit after its last path
    /// component.
    pub fn compile_file(
        &self,
        path: impl AsRef<Path>,
        env: Option<&EnvContext>,
    ) -> Result<CodeUnit, RunResult> {
        let _current = self.enter();
        let path = path.as_ref();
        let bytes = source::read_path(path).map_err(|e| {
            RunResult::failed(format!("{}: {e:#}", path.display())).with_errno(source::errno_of(&e))
        })?;
        self.compile(&source::script_name(path), env, &bytes)
    }

    /// Compile the script readable from `fd`.  The descriptor stays open.
    pub fn compile_fd(
        &self,
        name: &str,
        fd: impl AsFd,
        env: Option<&EnvContext>,
    ) -> Result<CodeUnit, RunResult> {
        let _current = self.enter();
        let bytes = source::read_fd(fd.as_fd()).map_err(|e| {
            RunResult::failed(format!("{name}: {e:#}")).with_errno(source::errno_of(&e))
        })?;
        self.compile(name, env, &bytes)
    }

    /// Run `unit` once with the given arguments and environment.  Absent
    /// arguments or environment mean empty ones.
    pub fn run(&self, unit: &CodeUnit, args: Option<&ArgList>, env: Option<&EnvContext>) -> RunResult {
        let _current = self.enter();
        if let Err(err) = self.owns(unit.runtime, CodeUnit::KIND) {
            return err.into();
        }

        let utf8 = self.interp.config.utf8_argv();
        let argv = match args {
            Some(handle) => match self.with_args(handle, |list| list.to_visible(utf8)) {
                Ok(argv) => argv,
                Err(err) => return err.into(),
            },
            None => Vec::new(),
        };
        let env = match env {
            Some(handle) => match self.with_env(handle, |context| context.to_visible()) {
                Ok(env) => env,
                Err(err) => return err.into(),
            },
            None => BTreeMap::new(),
        };

        executor::run(&self.interp, unit.key, argv, env)
    }

    /// Unload `unit`, running its unload hooks.
    pub fn unload(&self, unit: CodeUnit) -> RuntimeResult<()> {
        let _current = self.enter();
        self.owns(unit.runtime, CodeUnit::KIND)?;
        if executor::unload(&self.interp, unit.key) {
            Ok(())
        } else {
            Err(RuntimeError::StaleHandle {
                kind: CodeUnit::KIND,
            })
        }
    }

    pub fn unit_name(&self, unit: &CodeUnit) -> RuntimeResult<String> {
        let _current = self.enter();
        self.owns(unit.runtime, CodeUnit::KIND)?;
        self.interp
            .units
            .borrow()
            .get(unit.key)
            .map(|record| record.name.clone())
            .ok_or(RuntimeError::StaleHandle {
                kind: CodeUnit::KIND,
            })
    }

    /// Package name of the unit's private namespace.
    pub fn unit_namespace(&self, unit: &CodeUnit) -> RuntimeResult<String> {
        let _current = self.enter();
        self.owns(unit.runtime, CodeUnit::KIND)?;
        self.interp
            .units
            .borrow()
            .get(unit.key)
            .map(|record| private_name(record.ns))
            .ok_or(RuntimeError::StaleHandle {
                kind: CodeUnit::KIND,
            })
    }

    // ---------------------------------------------------------------
    // Modules
    // ---------------------------------------------------------------

    /// Append a module search directory.
    pub fn add_include_path(&self, path: impl Into<PathBuf>) {
        let _current = self.enter();
        self.interp.modules.borrow_mut().add_include_path(path.into());
    }

    /// Load module `name` (`Text::Util` is `Text/Util.rhai`) now, with
    /// `env` visible while it loads.
    pub fn load_module(&self, name: &str, env: Option<&EnvContext>) -> RunResult {
        let _current = self.enter();
        let env = match self.env_snapshot(env) {
            Ok(env) => env,
            Err(err) => return err.into(),
        };
        compiler::preload(&self.interp, name, env.as_ref())
    }

    pub fn module_cache_stats(&self) -> CacheStats {
        self.interp.modules.borrow().cache_stats()
    }

    // ---------------------------------------------------------------
    // I/O redirection
    // ---------------------------------------------------------------

    /// Back the handle `name` with host callbacks.  An open handle of the
    /// same name is closed first.
    pub fn io_override(&self, name: &str, callbacks: IoCallbacks) -> RuntimeResult<IoHandle> {
        let _current = self.enter();
        let key = io::override_handle(&self.interp, name, callbacks)?;
        Ok(IoHandle::new(self.interp.id, key))
    }

    /// Close a redirected handle; its close callback runs.
    pub fn io_close(&self, handle: IoHandle) -> RuntimeResult<()> {
        let _current = self.enter();
        self.owns(handle.runtime, IoHandle::KIND)?;
        let name = self
            .interp
            .io
            .borrow()
            .name_of(handle.key)
            .ok_or(RuntimeError::StaleHandle { kind: IoHandle::KIND })?;
        if io::close(&self.interp, &name) {
            Ok(())
        } else {
            Err(RuntimeError::NotOpen(name))
        }
    }

    pub fn io_is_open(&self, name: &str) -> bool {
        self.interp.io.borrow().is_open(name)
    }

    /// Open mode of handle `name`: `<`, `>` or `+<`.
    pub fn io_mode(&self, name: &str) -> Option<&'static str> {
        self.interp.io.borrow().mode(name)
    }

    // ---------------------------------------------------------------
    // Introspection
    // ---------------------------------------------------------------

    /// Environment scripts would see right now.
    pub fn visible_env(&self) -> BTreeMap<String, String> {
        self.interp
            .state
            .borrow()
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.to_string()))
            .collect()
    }

    /// Process name scripts would see right now.
    pub fn program_name(&self) -> String {
        self.interp.state.borrow().program_name.clone()
    }

    pub fn scope_depth(&self) -> usize {
        self.interp.state.borrow().depth()
    }

    pub fn pending_hooks(&self, kind: HookKind) -> usize {
        self.interp.hooks.borrow().pending(kind)
    }

    /// Load or check hooks recorded in the saved lists.
    pub fn saved_hooks(&self, kind: HookKind) -> usize {
        self.interp.hooks.borrow().saved(kind)
    }

    /// Whether a namespace with this package name exists.
    pub fn has_namespace(&self, name: &str) -> bool {
        self.interp.namespaces.borrow().lookup(name).is_some()
    }

    pub fn namespace_count(&self) -> usize {
        self.interp.namespaces.borrow().len()
    }

    pub fn loaded_units(&self) -> usize {
        self.interp.units.borrow().len()
    }

    pub fn metrics(&self) -> PerfSnapshot {
        self.interp.metrics.snapshot()
    }

    // ---------------------------------------------------------------
    // Teardown
    // ---------------------------------------------------------------

    /// Unload everything and release the engine.
    pub fn destroy(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        let interp = &self.interp;
        let _current = ContextGuard::enter_final(interp);

        let units = interp.units.borrow().keys_in_order();
        for key in units {
            executor::unload(interp, key);
        }
        if let Err(err) = hooks::run_all(interp, HookKind::Unload) {
            warn!(error = %err, "Module unload hook failed");
        }

        interp.args.borrow_mut().clear();
        interp.envs.borrow_mut().clear();
        io::close_all(interp);

        interp.hooks.borrow_mut().clear_all();
        interp.namespaces.borrow_mut().clear();
        interp.modules.borrow_mut().clear();
        info!(runtime = %interp.id, "Runtime destroyed");
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("id", &self.interp.id)
            .field("process_name", &self.interp.process_name)
            .field("units", &self.loaded_units())
            .finish()
    }
}
