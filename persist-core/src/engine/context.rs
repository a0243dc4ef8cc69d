//! Engine Context and Dynamic Scope
//!
//! Exactly one runtime is current on a thread at any instant.  Host
//! functions called from scripts find their runtime through that slot.
//! Every public operation installs its runtime with a [`ContextGuard`]
//! and the previous one comes back when the guard drops, on every exit
//! path.
//!
//! The visible process state (program name, environment, argument vector,
//! executing namespace) is changed only through the save stack in
//! [`ProcessState`].  Entering a scope records its depth, and leaving it
//! restores every value saved since then.  Hooks and runs rely on
//! `leave_to` to come back to a known depth no matter what the script did.

use super::namespace::NamespaceId;
use super::Interp;
use rhai::{Array, Dynamic};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

thread_local! {
    static CURRENT: RefCell<Option<Rc<Interp>>> = const { RefCell::new(None) };
}

/// The runtime currently installed on this thread.
pub(crate) fn current() -> Option<Rc<Interp>> {
    CURRENT.with(|slot| slot.borrow().clone())
}

fn replace_current(interp: Option<Rc<Interp>>) -> Option<Rc<Interp>> {
    CURRENT.with(|slot| std::mem::replace(&mut *slot.borrow_mut(), interp))
}

/// Installs a runtime as current and restores the previous one on drop.
pub(crate) struct ContextGuard {
    previous: Option<Rc<Interp>>,
    forget_self: Option<Rc<Interp>>,
}

impl ContextGuard {
    pub(crate) fn enter(interp: &Rc<Interp>) -> Self {
        Self {
            previous: replace_current(Some(Rc::clone(interp))),
            forget_self: None,
        }
    }

    /// Like [`enter`](Self::enter), for teardown: if the previous runtime
    /// was this same one, nothing is current afterwards.
    pub(crate) fn enter_final(interp: &Rc<Interp>) -> Self {
        let mut guard = Self::enter(interp);
        guard.forget_self = Some(Rc::clone(interp));
        guard
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let mut previous = self.previous.take();
        if let (Some(prev), Some(this)) = (&previous, &self.forget_self) {
            if Rc::ptr_eq(prev, this) {
                previous = None;
            }
        }
        replace_current(previous);
    }
}

/// A value saved on the dynamic scope stack.
#[derive(Debug)]
pub(crate) enum Saved {
    ProgramName(String),
    Env(BTreeMap<String, Dynamic>),
    EnvVar(String, Option<Dynamic>),
    Argv(Array),
    Namespace(Option<NamespaceId>),
}

/// The process view scripts observe, plus its save stack.
#[derive(Debug)]
pub(crate) struct ProcessState {
    pub(crate) program_name: String,
    pub(crate) env: BTreeMap<String, Dynamic>,
    pub(crate) argv: Array,
    pub(crate) namespace: Option<NamespaceId>,
    saves: Vec<Saved>,
    marks: Vec<usize>,
    /// Scopes at or below this depth belong to the runtime, not the script.
    floor: usize,
}

impl ProcessState {
    pub(crate) fn new(program_name: impl Into<String>, env: BTreeMap<String, Dynamic>) -> Self {
        Self {
            program_name: program_name.into(),
            env,
            argv: Array::new(),
            namespace: None,
            saves: Vec::new(),
            marks: Vec::new(),
            floor: 0,
        }
    }

    /// Current nesting depth.
    pub(crate) fn depth(&self) -> usize {
        self.marks.len()
    }

    pub(crate) fn enter(&mut self) {
        self.marks.push(self.saves.len());
    }

    /// Leave the innermost scope.  Returns `false` if none is open.
    pub(crate) fn leave(&mut self) -> bool {
        let Some(mark) = self.marks.pop() else {
            return false;
        };
        while self.saves.len() > mark {
            if let Some(saved) = self.saves.pop() {
                self.restore(saved);
            }
        }
        true
    }

    /// Leave a scope the script itself entered.  Scopes opened by the
    /// runtime cannot be left this way.
    pub(crate) fn script_leave(&mut self) -> bool {
        self.depth() > self.floor && self.leave()
    }

    /// Leave scopes until the depth is at most `depth`.
    pub(crate) fn leave_to(&mut self, depth: usize) {
        while self.depth() > depth {
            self.leave();
        }
    }

    fn restore(&mut self, saved: Saved) {
        match saved {
            Saved::ProgramName(name) => self.program_name = name,
            Saved::Env(env) => self.env = env,
            Saved::EnvVar(key, Some(value)) => {
                self.env.insert(key, value);
            }
            Saved::EnvVar(key, None) => {
                self.env.remove(&key);
            }
            Saved::Argv(argv) => self.argv = argv,
            Saved::Namespace(ns) => self.namespace = ns,
        }
    }

    /// Outside any scope a change is permanent; inside one it is undone
    /// when the scope is left.
    fn save(&mut self, saved: Saved) {
        if !self.marks.is_empty() {
            self.saves.push(saved);
        }
    }

    pub(crate) fn set_program_name(&mut self, name: impl Into<String>) {
        let old = std::mem::replace(&mut self.program_name, name.into());
        self.save(Saved::ProgramName(old));
    }

    pub(crate) fn install_env(&mut self, env: BTreeMap<String, Dynamic>) {
        let old = std::mem::replace(&mut self.env, env);
        self.save(Saved::Env(old));
    }

    pub(crate) fn install_argv(&mut self, argv: Array) {
        let old = std::mem::replace(&mut self.argv, argv);
        self.save(Saved::Argv(old));
    }

    pub(crate) fn set_namespace(&mut self, ns: Option<NamespaceId>) {
        let old = std::mem::replace(&mut self.namespace, ns);
        self.save(Saved::Namespace(old));
    }

    /// Set one variable, undone when the innermost scope is left.
    pub(crate) fn local_env(&mut self, key: &str, value: Dynamic) {
        let old = self.env.insert(key.to_string(), value);
        self.save(Saved::EnvVar(key.to_string(), old));
    }

    /// Plain variable assignment, undone only if a whole-environment
    /// install is undone.
    pub(crate) fn set_env(&mut self, key: &str, value: Dynamic) {
        self.env.insert(key.to_string(), value);
    }

    pub(crate) fn unset_env(&mut self, key: &str) -> bool {
        self.env.remove(key).is_some()
    }
}

/// Enters a dynamic scope on a runtime and leaves back to the entry depth
/// on drop.
pub(crate) struct ScopeGuard<'a> {
    interp: &'a Interp,
    depth: usize,
    floor: usize,
}

impl<'a> ScopeGuard<'a> {
    pub(crate) fn enter(interp: &'a Interp) -> Self {
        let mut state = interp.state.borrow_mut();
        let depth = state.depth();
        let floor = state.floor;
        state.enter();
        state.floor = state.depth();
        Self {
            interp,
            depth,
            floor,
        }
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.interp.state.borrow_mut();
        state.leave_to(self.depth);
        state.floor = self.floor;
    }
}
