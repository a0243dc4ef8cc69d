//! Environment Contexts
//!
//! An [`EnvironmentContext`] is an ordered set of `KEY=VALUE` pairs that
//! becomes the visible environment of a unit while it compiles or runs.
//! Contexts are independent of code units and can be reused freely.

use rhai::Dynamic;
use std::collections::BTreeMap;
use std::fmt;

/// Ordered key/value environment with a taint flag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentContext {
    tainted: bool,
    vars: Vec<(String, String)>,
}

impl EnvironmentContext {
    /// Build a context from environ-style `KEY=VALUE` strings.
    ///
    /// Entries without `=` are skipped.  A repeated key keeps its first
    /// position and its last value.
    pub fn new<I, S>(tainted: bool, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut env = Self {
            tainted,
            vars: Vec::new(),
        };
        for entry in entries {
            if let Some((key, value)) = entry.as_ref().split_once('=') {
                env.set(key, value);
            }
        }
        env
    }

    /// Build a context from explicit pairs.
    pub fn from_pairs<I, K, V>(tainted: bool, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut env = Self {
            tainted,
            vars: Vec::new(),
        };
        for (key, value) in pairs {
            env.set(key, value);
        }
        env
    }

    /// Set `key`, replacing any previous value in place.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.vars.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value,
            None => self.vars.push((key, value)),
        }
    }

    /// Set `key` to a formatted value.
    pub fn set_fmt(&mut self, key: impl Into<String>, args: fmt::Arguments<'_>) {
        self.set(key, fmt::format(args));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Remove `key`, returning whether it was present.
    pub fn unset(&mut self, key: &str) -> bool {
        let before = self.vars.len();
        self.vars.retain(|(k, _)| k != key);
        self.vars.len() != before
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn is_tainted(&self) -> bool {
        self.tainted
    }

    /// Pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Script-visible environment, every value tagged if the context is tainted.
    pub(crate) fn to_visible(&self) -> BTreeMap<String, Dynamic> {
        self.vars
            .iter()
            .map(|(k, v)| {
                (
                    k.clone(),
                    crate::engine::tainted_value(Dynamic::from(v.clone()), self.tainted),
                )
            })
            .collect()
    }
}
