//! Named I/O handles backed by host callbacks, encodings, taint checks and
//! the per-line execution modes.

use persist_core::{
    ArgLoopMode, IoCallbacks, LogLevel, LogSink, RuntimeConfig, Runtime, RuntimeError, TaintMode,
    UnicodeFlags, WarningsMode,
};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

type Buffer = Rc<RefCell<Vec<u8>>>;

#[derive(Default)]
struct RecordingSink {
    messages: RefCell<Vec<(LogLevel, String)>>,
}

impl RecordingSink {
    fn contains(&self, needle: &str) -> bool {
        self.messages.borrow().iter().any(|(_, m)| m.contains(needle))
    }
}

impl LogSink for RecordingSink {
    fn log(&self, level: LogLevel, message: &str) {
        self.messages.borrow_mut().push((level, message.to_string()));
    }

    fn fatal(&self, code: i32, message: &str) -> ! {
        panic!("fatal {code}: {message}")
    }
}

fn runtime() -> Runtime {
    Runtime::new("host", RuntimeConfig::default())
}

fn recorded(config: RuntimeConfig) -> (Runtime, Rc<RecordingSink>) {
    let sink = Rc::new(RecordingSink::default());
    let rt = Runtime::with_sink("host", config, sink.clone());
    (rt, sink)
}

fn writer(buffer: &Buffer) -> IoCallbacks {
    let sink = Rc::clone(buffer);
    IoCallbacks::new().on_write(move |bytes| {
        sink.borrow_mut().extend_from_slice(bytes);
        bytes.len() as isize
    })
}

fn capture(rt: &Runtime, name: &str) -> Buffer {
    let buffer = Buffer::default();
    rt.io_override(name, writer(&buffer)).unwrap();
    buffer
}

fn reader(data: &str) -> IoCallbacks {
    let pending = RefCell::new(data.as_bytes().to_vec());
    IoCallbacks::new().on_read(move |buf| {
        let mut pending = pending.borrow_mut();
        let n = pending.len().min(buf.len());
        buf[..n].copy_from_slice(&pending[..n]);
        pending.drain(..n);
        n as isize
    })
}

#[test]
fn test_write_only_handle_receives_bytes_once() {
    let rt = runtime();
    let calls = Rc::new(Cell::new(0));
    let buffer = Buffer::default();
    let (counter, sink) = (Rc::clone(&calls), Rc::clone(&buffer));
    rt.io_override(
        "out",
        IoCallbacks::new().on_write(move |bytes| {
            counter.set(counter.get() + 1);
            sink.borrow_mut().extend_from_slice(bytes);
            bytes.len() as isize
        }),
    )
    .unwrap();

    assert_eq!(rt.io_mode("out"), Some(">"));
    assert_eq!(rt.io_mode("STDIN"), Some("<"));

    let unit = rt.compile("hello", None, br#"write("out", "hello")"#).unwrap();
    let result = rt.run(&unit, None, None);
    assert_eq!(result.value.as_deref(), Some("5"));
    assert_eq!(buffer.borrow().as_slice(), b"hello");
    assert_eq!(calls.get(), 1);
}

#[test]
fn test_override_needs_a_callback() {
    let rt = runtime();
    let err = rt.io_override("out", IoCallbacks::new()).unwrap_err();
    assert!(matches!(err, RuntimeError::NoCallbacks(ref name) if name == "out"));
    assert_eq!(err.errno(), libc::EINVAL);
    assert!(!rt.io_is_open("out"));
}

#[test]
fn test_read_callbacks_feed_script() {
    let rt = runtime();
    rt.io_override("in", reader("one\ntwo\nthree")).unwrap();
    assert_eq!(rt.io_mode("in"), Some("<"));
    let unit = rt
        .compile(
            "reader",
            None,
            br#"
            let a = read_line("in");
            let b = read_line("in");
            let c = read("in", 3);
            let d = read_line("in");
            let e = read_line("in");
            `${a}${b}${c}|${d}|${type_of(e)}`
            "#,
        )
        .unwrap();
    assert_eq!(rt.run(&unit, None, None).value.as_deref(), Some("one\ntwo\nthr|ee|()"));
}

#[test]
fn test_zero_length_read_skips_callback() {
    let rt = runtime();
    let calls = Rc::new(Cell::new(0));
    let counter = Rc::clone(&calls);
    rt.io_override(
        "in",
        IoCallbacks::new().on_read(move |buf| {
            counter.set(counter.get() + 1);
            buf[0] = b'x';
            1
        }),
    )
    .unwrap();
    let unit = rt
        .compile("empty", None, br#"let s = read("in", 0); `${type_of(s)}:${s.len()}`"#)
        .unwrap();
    assert_eq!(rt.run(&unit, None, None).value.as_deref(), Some("string:0"));
    assert_eq!(calls.get(), 0);
}

#[test]
fn test_utf8_read_keeps_split_character() {
    let rt = Runtime::new(
        "host",
        RuntimeConfig {
            unicode: UnicodeFlags::INPUT_DEFAULT,
            ..RuntimeConfig::default()
        },
    );
    rt.io_override("in", reader("é€a")).unwrap();
    let unit = rt
        .compile(
            "split",
            None,
            br#"
            let a = read("in", 1);
            let b = read("in", 1);
            let c = read("in", 1);
            let d = read("in", 1);
            `${a}|${b}|${c}|${type_of(d)}`
            "#,
        )
        .unwrap();
    assert_eq!(rt.run(&unit, None, None).value.as_deref(), Some("é|€|a|()"));
}

#[test]
fn test_read_from_write_only_handle_fails() {
    let rt = runtime();
    let _out = capture(&rt, "out");
    let unit = rt.compile("bad", None, br#"read_line("out")"#).unwrap();
    let message = rt.run(&unit, None, None).message.unwrap();
    assert!(message.contains("out"), "{message}");
}

#[test]
fn test_unopened_handle_fails() {
    let rt = runtime();
    let unit = rt.compile("nowhere", None, br#"write("nowhere", "x")"#).unwrap();
    let message = rt.run(&unit, None, None).message.unwrap();
    assert!(message.contains("unopened handle nowhere"), "{message}");
}

#[test]
fn test_stdout_override_captures_print() {
    let rt = runtime();
    let out = capture(&rt, "STDOUT");
    let unit = rt.compile("printer", None, br#"print("hi"); print(42);"#).unwrap();
    assert!(rt.run(&unit, None, None).is_success());
    assert_eq!(out.borrow().as_slice(), b"hi\n42\n");
}

#[test]
fn test_stderr_override_captures_warn() {
    let rt = runtime();
    let err = capture(&rt, "STDERR");
    let unit = rt.compile("warner", None, br#"warn("careful")"#).unwrap();
    rt.run(&unit, None, None);
    assert_eq!(err.borrow().as_slice(), b"careful\n");
}

#[test]
fn test_force_none_silences_warn() {
    let rt = Runtime::new(
        "host",
        RuntimeConfig {
            warnings: WarningsMode::ForceNone,
            ..RuntimeConfig::default()
        },
    );
    let err = capture(&rt, "STDERR");
    let unit = rt.compile("warner", None, br#"warn("careful")"#).unwrap();
    rt.run(&unit, None, None);
    assert!(err.borrow().is_empty());
}

#[test]
fn test_close_runs_callback_once() {
    let rt = runtime();
    let closes = Rc::new(Cell::new(0));
    let counter = Rc::clone(&closes);
    let handle = rt
        .io_override(
            "out",
            IoCallbacks::new()
                .on_write(|bytes| bytes.len() as isize)
                .on_close(move || counter.set(counter.get() + 1)),
        )
        .unwrap();

    rt.io_close(handle).unwrap();
    assert_eq!(closes.get(), 1);
    assert!(!rt.io_is_open("out"));
    assert!(rt.io_close(handle).is_err());
    assert_eq!(closes.get(), 1);
}

#[test]
fn test_script_close() {
    let rt = runtime();
    let closes = Rc::new(Cell::new(0));
    let counter = Rc::clone(&closes);
    rt.io_override(
        "out",
        IoCallbacks::new()
            .on_write(|bytes| bytes.len() as isize)
            .on_close(move || counter.set(counter.get() + 1)),
    )
    .unwrap();

    let unit = rt
        .compile("closer", None, br#"`${close("out")}|${close("out")}`"#)
        .unwrap();
    assert_eq!(rt.run(&unit, None, None).value.as_deref(), Some("true|false"));
    assert_eq!(closes.get(), 1);
}

#[test]
fn test_reentrant_close_is_ignored() {
    let rt = Rc::new(runtime());
    let slot: Rc<Cell<Option<persist_core::IoHandle>>> = Rc::new(Cell::new(None));
    let nested = Rc::new(Cell::new(None));
    let closes = Rc::new(Cell::new(0));

    let (weak, inner_slot, inner_nested, counter) = (
        Rc::downgrade(&rt),
        Rc::clone(&slot),
        Rc::clone(&nested),
        Rc::clone(&closes),
    );
    let handle = rt
        .io_override(
            "out",
            IoCallbacks::new()
                .on_write(|bytes| bytes.len() as isize)
                .on_close(move || {
                    counter.set(counter.get() + 1);
                    if let (Some(rt), Some(handle)) = (weak.upgrade(), inner_slot.get()) {
                        inner_nested.set(Some(rt.io_close(handle).is_err()));
                    }
                }),
        )
        .unwrap();
    slot.set(Some(handle));

    rt.io_close(handle).unwrap();
    assert_eq!(closes.get(), 1);
    assert_eq!(nested.get(), Some(true));
}

#[test]
fn test_override_replaces_open_handle() {
    let rt = runtime();
    let closed = Rc::new(Cell::new(false));
    let flag = Rc::clone(&closed);
    let first = Buffer::default();
    let sink = Rc::clone(&first);
    rt.io_override(
        "out",
        IoCallbacks::new()
            .on_write(move |bytes| {
                sink.borrow_mut().extend_from_slice(bytes);
                bytes.len() as isize
            })
            .on_close(move || flag.set(true)),
    )
    .unwrap();

    let second = capture(&rt, "out");
    assert!(closed.get());

    let unit = rt.compile("w", None, br#"write("out", "x")"#).unwrap();
    rt.run(&unit, None, None);
    assert!(first.borrow().is_empty());
    assert_eq!(second.borrow().as_slice(), b"x");
}

#[test]
fn test_stderr_replacement_keeps_descriptor() {
    let rt = runtime();
    let _first = capture(&rt, "STDERR");
    let second = capture(&rt, "STDERR");
    // Descriptor 2 survived both closes
    assert_ne!(unsafe { libc::fcntl(libc::STDERR_FILENO, libc::F_GETFD) }, -1);

    let unit = rt.compile("warner", None, br#"warn("still here")"#).unwrap();
    rt.run(&unit, None, None);
    assert_eq!(second.borrow().as_slice(), b"still here\n");
}

#[test]
fn test_destroy_closes_redirected_handles() {
    let rt = runtime();
    let closed = Rc::new(Cell::new(false));
    let flag = Rc::clone(&closed);
    rt.io_override(
        "out",
        IoCallbacks::new()
            .on_write(|bytes| bytes.len() as isize)
            .on_close(move || flag.set(true)),
    )
    .unwrap();
    rt.destroy();
    assert!(closed.get());
}

#[test]
fn test_tainted_write_is_fatal_under_fatal_mode() {
    let rt = Runtime::new(
        "host",
        RuntimeConfig {
            taint: TaintMode::Fatal,
            ..RuntimeConfig::default()
        },
    );
    let out = capture(&rt, "out");
    let unit = rt
        .compile("leak", None, br#"write("out", env("SECRET"))"#)
        .unwrap();
    let env = rt.env_new(true, ["SECRET=hunter2"]);

    let message = rt.run(&unit, None, Some(&env)).message.unwrap();
    assert!(message.contains("Insecure dependency"), "{message}");
    assert!(out.borrow().is_empty());

    // Untainted data passes
    let clean = rt.env_new(false, ["SECRET=hunter2"]);
    assert!(rt.run(&unit, None, Some(&clean)).is_success());
    assert_eq!(out.borrow().as_slice(), b"hunter2");
}

#[test]
fn test_tainted_write_warns_under_warn_mode() {
    let (rt, sink) = recorded(RuntimeConfig {
        taint: TaintMode::Warn,
        warnings: WarningsMode::Enable,
        ..RuntimeConfig::default()
    });
    let out = capture(&rt, "out");
    let unit = rt.compile("leak", None, br#"write("out", argv()[0])"#).unwrap();
    let args = rt.args_new(true, ["payload"]);

    assert!(rt.run(&unit, Some(&args), None).is_success());
    assert_eq!(out.borrow().as_slice(), b"payload");
    assert!(sink.contains("Insecure dependency in write to out"));
}

#[test]
fn test_single_byte_output_by_default() {
    let (rt, sink) = recorded(RuntimeConfig {
        warnings: WarningsMode::Enable,
        ..RuntimeConfig::default()
    });
    let out = capture(&rt, "out");
    let unit = rt.compile("latin", None, "write(\"out\", \"é\")".as_bytes()).unwrap();
    assert_eq!(rt.run(&unit, None, None).value.as_deref(), Some("1"));
    assert_eq!(out.borrow().as_slice(), &[0xE9]);
    assert!(!sink.contains("Wide character"));

    let wide = rt.compile("wide", None, "write(\"out\", \"€\")".as_bytes()).unwrap();
    rt.run(&wide, None, None);
    assert_eq!(&out.borrow()[1..], "€".as_bytes());
    assert!(sink.contains("Wide character in write to out"));
}

#[test]
fn test_utf8_output_when_flagged() {
    let rt = Runtime::new(
        "host",
        RuntimeConfig {
            unicode: UnicodeFlags::OUTPUT_DEFAULT,
            ..RuntimeConfig::default()
        },
    );
    let out = capture(&rt, "out");
    let unit = rt.compile("utf8", None, "write(\"out\", \"é\")".as_bytes()).unwrap();
    assert_eq!(rt.run(&unit, None, None).value.as_deref(), Some("2"));
    assert_eq!(out.borrow().as_slice(), "é".as_bytes());
}

#[test]
fn test_argv_decoding_follows_flag() {
    let latin = runtime();
    let unit = latin.compile("len", None, b"argv()[0].len()").unwrap();
    let args = latin.args_new(false, ["é"]);
    assert_eq!(latin.run(&unit, Some(&args), None).value.as_deref(), Some("2"));

    let utf8 = Runtime::new(
        "host",
        RuntimeConfig {
            unicode: UnicodeFlags::ARGV,
            ..RuntimeConfig::default()
        },
    );
    let unit = utf8.compile("len", None, b"argv()[0].len()").unwrap();
    let args = utf8.args_new(false, ["é"]);
    assert_eq!(utf8.run(&unit, Some(&args), None).value.as_deref(), Some("1"));
}

#[test]
fn test_line_loop_with_print() {
    let rt = Runtime::new(
        "host",
        RuntimeConfig {
            arg_loop: ArgLoopMode::Print,
            ..RuntimeConfig::default()
        },
    );
    rt.io_override("STDIN", reader("alpha\nbeta\n")).unwrap();
    let out = capture(&rt, "STDOUT");

    let unit = rt.compile("upper", None, b"line = line.to_upper();").unwrap();
    assert!(rt.run(&unit, None, None).is_success());
    assert_eq!(out.borrow().as_slice(), b"ALPHA\nBETA\n");
}

#[test]
fn test_line_loop_without_print() {
    let rt = Runtime::new(
        "host",
        RuntimeConfig {
            arg_loop: ArgLoopMode::NoPrint,
            ..RuntimeConfig::default()
        },
    );
    rt.io_override("STDIN", reader("a\nb\nc")).unwrap();
    let out = capture(&rt, "STDOUT");

    let unit = rt
        .compile(
            "count",
            None,
            br#"let total = if is_def_var("total") { total + 1 } else { 1 }; total"#,
        )
        .unwrap();
    assert_eq!(rt.run(&unit, None, None).value.as_deref(), Some("3"));
    assert!(out.borrow().is_empty());
}
