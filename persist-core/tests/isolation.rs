//! Namespace isolation, persistence across runs and restoration of the
//! process view scripts observe.

use persist_core::{RuntimeConfig, Runtime};

const COUNTER: &[u8] = br#"
let count = if is_def_var("count") { count + 1 } else { 1 };
count
"#;

fn runtime() -> Runtime {
    Runtime::new("host", RuntimeConfig::default())
}

#[test]
fn test_globals_persist_across_runs() {
    let rt = runtime();
    let unit = rt.compile("counter", None, COUNTER).unwrap();

    for expected in ["1", "2", "3"] {
        let result = rt.run(&unit, None, None);
        assert!(result.is_success(), "{result:?}");
        assert_eq!(result.value.as_deref(), Some(expected));
    }
}

#[test]
fn test_units_do_not_share_globals() {
    let rt = runtime();
    let a = rt.compile("a", None, COUNTER).unwrap();
    let b = rt.compile("b", None, COUNTER).unwrap();

    rt.run(&a, None, None);
    rt.run(&a, None, None);
    assert_eq!(rt.run(&b, None, None).value.as_deref(), Some("1"));
    assert_eq!(rt.run(&a, None, None).value.as_deref(), Some("3"));

    let spy = rt.compile("spy", None, br#"is_def_var("count")"#).unwrap();
    assert_eq!(rt.run(&spy, None, None).value.as_deref(), Some("false"));
}

#[test]
fn test_namespaces_are_private_and_distinct() {
    let rt = runtime();
    let a = rt.compile("a", None, b"namespace()").unwrap();
    let b = rt.compile("b", None, b"namespace()").unwrap();

    let ns_a = rt.unit_namespace(&a).unwrap();
    let ns_b = rt.unit_namespace(&b).unwrap();
    assert_ne!(ns_a, ns_b);
    assert!(ns_a.starts_with("Persist::Private::_p"));

    assert_eq!(rt.run(&a, None, None).value.as_deref(), Some(ns_a.as_str()));
    assert_eq!(rt.namespace_count(), 2);
}

#[test]
fn test_unload_erases_namespace() {
    let rt = runtime();
    let unit = rt.compile("gone", None, COUNTER).unwrap();
    rt.run(&unit, None, None);
    let ns = rt.unit_namespace(&unit).unwrap();
    assert_eq!(rt.namespace_count(), 1);
    assert!(rt.has_namespace(&ns));

    rt.unload(unit).unwrap();
    assert_eq!(rt.namespace_count(), 0);
    assert!(!rt.has_namespace(&ns));
    assert_eq!(rt.loaded_units(), 0);
    assert!(rt.run(&unit, None, None).message.is_some());
    assert!(rt.unload(unit).is_err());
}

#[test]
fn test_run_sees_unit_name_args_and_env() {
    let rt = runtime();
    let unit = rt
        .compile(
            "show.rhai",
            None,
            br#"`${program_name()}|${argc()}|${argv()[1]}|${env("COLOR")}|${env_keys().len()}`"#,
        )
        .unwrap();
    let args = rt.args_new(false, ["first", "second"]);
    let env = rt.env_new(false, ["COLOR=blue", "SHAPE=round", "BROKEN"]);

    let result = rt.run(&unit, Some(&args), Some(&env));
    assert_eq!(result.value.as_deref(), Some("show.rhai|2|second|blue|2"));
}

#[test]
fn test_absent_env_and_args_are_empty() {
    let rt = runtime();
    let unit = rt
        .compile("empty", None, br#"`${argc()}|${env_keys().len()}|${type_of(env("HOME"))}`"#)
        .unwrap();
    assert_eq!(rt.run(&unit, None, None).value.as_deref(), Some("0|0|()"));
}

#[test]
fn test_process_view_restored_after_run() {
    let rt = runtime();
    let before_env = rt.visible_env();
    let before_name = rt.program_name();

    let unit = rt
        .compile(
            "mutator",
            None,
            br#"
            set_env("ADDED", "1");
            unset_env("COLOR");
            local_env("SHAPE", "square");
            scope_enter();
            local_env("NESTED", "x");
            env("SHAPE")
            "#,
        )
        .unwrap();
    let env = rt.env_new(false, ["COLOR=blue", "SHAPE=round"]);

    let result = rt.run(&unit, None, Some(&env));
    assert_eq!(result.value.as_deref(), Some("square"));

    assert_eq!(rt.visible_env(), before_env);
    assert_eq!(rt.program_name(), before_name);
    assert_eq!(rt.scope_depth(), 0);

    // The context itself is untouched by what the script did
    assert_eq!(rt.env_get(&env, "COLOR").unwrap().as_deref(), Some("blue"));
    assert_eq!(rt.env_len(&env).unwrap(), 2);
}

#[test]
fn test_process_view_restored_after_error() {
    let rt = runtime();
    let before_env = rt.visible_env();
    let unit = rt
        .compile("fails", None, br#"scope_enter(); set_env("LEAK", "1"); throw "boom";"#)
        .unwrap();

    let result = rt.run(&unit, None, None);
    assert_eq!(result.message.as_deref(), Some("boom"));
    assert_eq!(rt.visible_env(), before_env);
    assert_eq!(rt.scope_depth(), 0);
}

#[test]
fn test_script_cannot_leave_runtime_scopes() {
    let rt = runtime();
    let unit = rt
        .compile("unbalanced", None, b"scope_enter(); scope_leave(); scope_leave();")
        .unwrap();

    let result = rt.run(&unit, None, None);
    let message = result.message.unwrap();
    assert!(message.contains("scope_leave"), "{message}");
    assert_eq!(rt.scope_depth(), 0);
    assert_eq!(rt.program_name(), "host");
}

#[test]
fn test_tainted_inputs_are_marked() {
    let rt = runtime();
    let unit = rt
        .compile(
            "taint",
            None,
            br#"`${is_tainted(env("SECRET"))}|${is_tainted(argv()[0])}|${is_tainted("literal")}`"#,
        )
        .unwrap();

    let tainted_env = rt.env_new(true, ["SECRET=hunter2"]);
    let tainted_args = rt.args_new(true, ["--flag"]);
    let result = rt.run(&unit, Some(&tainted_args), Some(&tainted_env));
    assert_eq!(result.value.as_deref(), Some("true|true|false"));

    let clean_env = rt.env_new(false, ["SECRET=hunter2"]);
    let clean_args = rt.args_new(false, ["--flag"]);
    let result = rt.run(&unit, Some(&clean_args), Some(&clean_env));
    assert_eq!(result.value.as_deref(), Some("false|false|false"));
}

#[test]
fn test_env_at_rest_is_host_environment() {
    std::env::set_var("PERSIST_ISOLATION_PROBE", "present");
    let rt = runtime();
    assert_eq!(
        rt.visible_env().get("PERSIST_ISOLATION_PROBE").map(String::as_str),
        Some("present")
    );
}

#[test]
fn test_compile_sees_given_env() {
    let rt = runtime();
    let env = rt.env_new(false, ["MODE=compile"]);
    let unit = rt
        .compile(
            "hooked",
            Some(&env),
            br#"
            fn on_init() {
                if env("MODE") != "compile" { throw "compile env not visible"; }
                set_env("SEEN", env("MODE"));
            }
            1
            "#,
        )
        .unwrap();
    assert!(rt.run(&unit, None, None).is_success());
    assert!(!rt.visible_env().contains_key("SEEN"));
}

#[test]
fn test_runtimes_are_independent() {
    let a = runtime();
    let b = runtime();
    let unit_a = a.compile("counter", None, COUNTER).unwrap();
    let unit_b = b.compile("counter", None, COUNTER).unwrap();

    a.run(&unit_a, None, None);
    a.run(&unit_a, None, None);
    assert_eq!(b.run(&unit_b, None, None).value.as_deref(), Some("1"));
    assert_eq!(a.unit_namespace(&unit_a).unwrap(), b.unit_namespace(&unit_b).unwrap());
}
