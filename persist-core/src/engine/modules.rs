//! Include-Path Module Loading
//!
//! `import "Text::Util" as util;` resolves to `Text/Util.rhai`, searched
//! across the runtime's include directories in the order they were added.
//! Each module gets its own namespace, runs its load hooks and then its
//! body, and is cached for the lifetime of the runtime so every later
//! import reuses it.
//!
//! # Design:
//! - Imports are resolved when a unit compiles, so a missing module is a compile error
//! - Post-compile and unload hooks a module queues wait for the importing unit
//! - [`ModuleCache`] keeps hit/miss statistics for introspection

use super::context::{self, ScopeGuard};
use super::hooks::{self, HookFilter, HookKind, OnError};
use super::namespace::NamespaceId;
use super::Interp;
use crate::perf::{ScopedTimer, TimerType};
use crate::source;
use rhai::{Engine, EvalAltResult, Module, ModuleResolver, Position, Scope};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::{debug, info};

/// File extension of module sources.
pub const MODULE_EXTENSION: &str = "rhai";

/// Runtime statistics for a [`ModuleCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    /// Imports served from the cache.
    pub hits: usize,
    /// Imports that had to load the module.
    pub misses: usize,
    /// Modules currently cached.
    pub cached_count: usize,
}

struct CachedModule {
    ns: NamespaceId,
    module: Rc<Module>,
}

/// Loaded modules and the include path of one runtime.
pub(crate) struct ModuleCache {
    include_paths: Vec<PathBuf>,
    entries: HashMap<String, CachedModule>,
    hits: usize,
    misses: usize,
}

impl ModuleCache {
    pub(crate) fn new() -> Self {
        Self {
            include_paths: Vec::new(),
            entries: HashMap::new(),
            hits: 0,
            misses: 0,
        }
    }

    /// Append a search directory.
    pub(crate) fn add_include_path(&mut self, path: PathBuf) {
        info!(path = %path.display(), "Include path added");
        self.include_paths.push(path);
    }

    pub(crate) fn include_paths(&self) -> &[PathBuf] {
        &self.include_paths
    }

    fn get(&mut self, name: &str) -> Option<Rc<Module>> {
        let cached = self.entries.get(name).map(|entry| Rc::clone(&entry.module));
        if cached.is_some() {
            self.hits += 1;
            debug!(name, "Module cache hit");
        }
        cached
    }

    fn insert(&mut self, name: &str, ns: NamespaceId, module: Rc<Module>) {
        self.misses += 1;
        self.entries
            .insert(name.to_string(), CachedModule { ns, module });
    }

    pub(crate) fn namespace_of(&self, name: &str) -> Option<NamespaceId> {
        self.entries.get(name).map(|entry| entry.ns)
    }

    pub(crate) fn cache_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            cached_count: self.entries.len(),
        }
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for ModuleCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Canonical module name: `a/b.rhai` and `a::b` both become `a::b`.
pub fn module_name(path: &str) -> String {
    let trimmed = path
        .strip_suffix(&format!(".{MODULE_EXTENSION}"))
        .unwrap_or(path);
    trimmed.replace('/', "::")
}

/// Relative file path of a module name: `Text::Util` is `Text/Util.rhai`.
pub fn module_file(name: &str) -> PathBuf {
    let mut path: PathBuf = name.split("::").collect();
    path.set_extension(MODULE_EXTENSION);
    path
}

fn locate(include_paths: &[PathBuf], name: &str) -> Option<PathBuf> {
    let relative = module_file(name);
    include_paths
        .iter()
        .map(|dir| dir.join(&relative))
        .find(|candidate| candidate.is_file())
}

fn not_found(path: &str, pos: Position) -> Box<EvalAltResult> {
    EvalAltResult::ErrorModuleNotFound(path.to_string(), pos).into()
}

fn in_module(path: &str, err: Box<EvalAltResult>, pos: Position) -> Box<EvalAltResult> {
    EvalAltResult::ErrorInModule(path.to_string(), err, pos).into()
}

/// Resolves imports against the include path of the current runtime.
pub(crate) struct IncludePathResolver;

impl ModuleResolver for IncludePathResolver {
    fn resolve(
        &self,
        engine: &Engine,
        _source: Option<&str>,
        path: &str,
        pos: Position,
    ) -> Result<Rc<Module>, Box<EvalAltResult>> {
        let interp = context::current().ok_or_else(|| not_found(path, pos))?;
        load(&interp, engine, path, pos)
    }
}

/// Load (or fetch from cache) the module named by `path`.
pub(crate) fn load(
    interp: &Interp,
    engine: &Engine,
    path: &str,
    pos: Position,
) -> Result<Rc<Module>, Box<EvalAltResult>> {
    let name = module_name(path);
    if let Some(module) = interp.modules.borrow_mut().get(&name) {
        return Ok(module);
    }

    let _timer = ScopedTimer::new(&interp.metrics, TimerType::ModuleLoad);
    let include_paths = interp.modules.borrow().include_paths().to_vec();
    let file = locate(&include_paths, &name).ok_or_else(|| not_found(path, pos))?;
    let bytes = source::read_path(&file)
        .map_err(|e| in_module(path, format!("{e:#}").into(), pos))?;
    let text = std::str::from_utf8(&bytes)
        .map_err(|_| in_module(path, "module source is not valid UTF-8".into(), pos))?;

    let ns = interp.namespaces.borrow_mut().allocate_module(&name);
    match evaluate(interp, engine, ns, &file, text) {
        Ok(module) => {
            let module = Rc::new(module);
            interp
                .modules
                .borrow_mut()
                .insert(&name, ns, Rc::clone(&module));
            info!(module = %name, file = %file.display(), "Module loaded");
            Ok(module)
        }
        Err(err) => {
            interp.discard_namespace(ns);
            Err(in_module(path, err, pos))
        }
    }
}

fn evaluate(
    interp: &Interp,
    engine: &Engine,
    ns: NamespaceId,
    file: &Path,
    text: &str,
) -> Result<Module, Box<EvalAltResult>> {
    let _scope = ScopeGuard::enter(interp);
    interp.state.borrow_mut().set_namespace(Some(ns));

    let mut ast = engine.compile_into_self_contained(&Scope::new(), text)?;
    ast.set_source(file.display().to_string());
    let ast = Rc::new(ast);
    interp.namespaces.borrow_mut().set_ast(ns, Rc::clone(&ast));

    hooks::register_declared(interp, ns, &ast).map_err(Box::<EvalAltResult>::from)?;
    hooks::run(interp, HookKind::Load, HookFilter::Namespace(ns), OnError::Stop)
        .map_err(|e| Box::<EvalAltResult>::from(e.to_string()))?;

    Module::eval_ast_as_new(Scope::new(), &ast, engine)
}
