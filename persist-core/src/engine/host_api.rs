//! Script-facing host functions.
//!
//! Every function resolves its runtime through the thread's current slot,
//! so the same engine registration serves whichever unit is executing.

use super::context;
use super::hooks::{self, HookKind};
use super::io;
use super::{is_tainted, tainted_value, Interp};
use crate::config::{TaintMode, WarningsMode};
use rhai::{Array, Dynamic, Engine, EvalAltResult, FnPtr, ImmutableString, Position, INT};
use tracing::{debug, warn};

type HostResult<T> = Result<T, Box<EvalAltResult>>;

fn runtime_error(message: impl Into<String>) -> Box<EvalAltResult> {
    EvalAltResult::ErrorRuntime(Dynamic::from(message.into()), Position::NONE).into()
}

fn with_current<T>(f: impl FnOnce(&Interp) -> HostResult<T>) -> HostResult<T> {
    let interp = context::current().ok_or_else(|| runtime_error("no runtime is current"))?;
    f(&interp)
}

fn terminate(code: INT) -> HostResult<()> {
    Err(EvalAltResult::ErrorTerminated(Dynamic::from(code), Position::NONE).into())
}

/// Replaces the engine's `exit`, whose value would otherwise become the
/// result of the run.  Non-integer values exit with status 0.
fn exit_with(value: Dynamic) -> HostResult<()> {
    terminate(value.as_int().unwrap_or(0))
}

fn register_hook(kind: HookKind, func: FnPtr) -> HostResult<()> {
    with_current(|interp| {
        let ns = interp
            .current_namespace()
            .ok_or_else(|| runtime_error(format!("{} outside any namespace", kind.function_name())))?;
        hooks::register(interp, kind, ns, func);
        Ok(())
    })
}

fn write_value(handle: &str, value: &Dynamic) -> HostResult<INT> {
    with_current(|interp| {
        if is_tainted(value) {
            let message = format!("Insecure dependency in write to {handle}");
            match interp.config.taint {
                TaintMode::Off => {}
                TaintMode::Warn => interp.diagnostic(&message),
                TaintMode::Fatal => return Err(runtime_error(message)),
            }
        }
        let written = io::write(interp, handle, &value.to_string()).map_err(runtime_error)?;
        Ok(INT::try_from(written).unwrap_or(INT::MAX))
    })
}

fn print_line(interp: &Interp, handle: &str, text: &str) {
    if let Err(e) = io::write(interp, handle, &format!("{text}\n")) {
        warn!(handle, error = %e, "Script output dropped");
    }
}

fn visible_env(key: &str) -> HostResult<Dynamic> {
    with_current(|interp| {
        Ok(interp
            .state
            .borrow()
            .env
            .get(key)
            .cloned()
            .unwrap_or(Dynamic::UNIT))
    })
}

/// Keep the taint mark of `value` on its string form.
fn env_value(value: &Dynamic) -> Dynamic {
    tainted_value(Dynamic::from(value.to_string()), is_tainted(value))
}

pub(super) fn register(engine: &mut Engine) {
    engine.on_print(|text| {
        if let Some(interp) = context::current() {
            print_line(&interp, "STDOUT", text);
        }
    });
    engine.on_debug(|text, source, pos| {
        let Some(interp) = context::current() else {
            return;
        };
        if interp.config.warnings == WarningsMode::ForceAll {
            let line = match source {
                Some(source) => format!("{source} @ {pos:?} | {text}"),
                None => text.to_string(),
            };
            print_line(&interp, "STDERR", &line);
        } else {
            debug!(source = source.unwrap_or(""), "{text}");
        }
    });

    // Process view
    engine.register_fn("program_name", || {
        with_current(|interp| Ok(interp.state.borrow().program_name.clone()))
    });
    engine.register_fn("argv", || with_current(|interp| Ok(interp.state.borrow().argv.clone())));
    engine.register_fn("argc", || {
        with_current(|interp| Ok(INT::try_from(interp.state.borrow().argv.len()).unwrap_or(INT::MAX)))
    });
    engine.register_fn("namespace", || {
        with_current(|interp| {
            let name = interp
                .current_namespace()
                .and_then(|ns| interp.namespaces.borrow().name(ns).map(str::to_string))
                .unwrap_or_default();
            Ok(name)
        })
    });

    // Environment
    engine.register_fn("env", |key: ImmutableString| visible_env(&key));
    engine.register_fn("env_keys", || {
        with_current(|interp| {
            let keys: Array = interp
                .state
                .borrow()
                .env
                .keys()
                .map(|k| Dynamic::from(k.clone()))
                .collect();
            Ok(keys)
        })
    });
    engine.register_fn("set_env", |key: ImmutableString, value: Dynamic| {
        with_current(|interp| {
            interp.state.borrow_mut().set_env(&key, env_value(&value));
            Ok(())
        })
    });
    engine.register_fn("unset_env", |key: ImmutableString| {
        with_current(|interp| Ok(interp.state.borrow_mut().unset_env(&key)))
    });
    engine.register_fn("local_env", |key: ImmutableString, value: Dynamic| {
        with_current(|interp| {
            interp.state.borrow_mut().local_env(&key, env_value(&value));
            Ok(())
        })
    });

    // Dynamic scope
    engine.register_fn("scope_enter", || {
        with_current(|interp| {
            interp.state.borrow_mut().enter();
            Ok(())
        })
    });
    engine.register_fn("scope_leave", || {
        with_current(|interp| {
            if interp.state.borrow_mut().script_leave() {
                Ok(())
            } else {
                Err(runtime_error("scope_leave() without a matching scope_enter()"))
            }
        })
    });

    engine.register_fn("is_tainted", |value: Dynamic| is_tainted(&value));

    // Termination
    engine.register_fn("terminate", || terminate(0));
    engine.register_fn("terminate", terminate);
    engine.register_fn("exit", || terminate(0));
    engine.register_fn("exit", exit_with);

    // Diagnostics and I/O
    engine.register_fn("warn", |message: Dynamic| {
        with_current(|interp| {
            if interp.config.warnings != WarningsMode::ForceNone {
                let text = message.to_string();
                let text = text.strip_suffix('\n').unwrap_or(&text);
                print_line(interp, "STDERR", text);
            }
            Ok(())
        })
    });
    engine.register_fn("write", |handle: ImmutableString, value: Dynamic| {
        write_value(&handle, &value)
    });
    engine.register_fn("read", |handle: ImmutableString, max: INT| {
        with_current(|interp| {
            let max = usize::try_from(max).map_err(|_| runtime_error("read() length must not be negative"))?;
            let chunk = io::read(interp, &handle, max).map_err(runtime_error)?;
            Ok(chunk.map_or(Dynamic::UNIT, Dynamic::from))
        })
    });
    engine.register_fn("read_line", |handle: ImmutableString| {
        with_current(|interp| {
            let line = io::read_line(interp, &handle).map_err(runtime_error)?;
            Ok(line.map_or(Dynamic::UNIT, Dynamic::from))
        })
    });
    engine.register_fn("close", |handle: ImmutableString| {
        with_current(|interp| Ok(io::close(interp, &handle)))
    });

    // Dynamic hook registration
    engine.register_fn("on_load", |func: FnPtr| register_hook(HookKind::Load, func));
    engine.register_fn("on_check", |func: FnPtr| register_hook(HookKind::Check, func));
    engine.register_fn("on_init", |func: FnPtr| register_hook(HookKind::Init, func));
    engine.register_fn("on_unload", |func: FnPtr| register_hook(HookKind::Unload, func));
}
