//! persist - run a script through a persistent runtime
//!
//! Compiles SCRIPT once and runs it COUNT times with the given arguments
//! and the process environment, then unloads it and exits with the status
//! of the last run.

use anyhow::{bail, Context, Result};
use persist_core::{init_logging, RuntimeConfig, Runtime, TaintMode, WarningsMode};
use std::ffi::OsString;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use tracing::info;

/// Exit status for a run that raised an error.
const EXIT_FAILURE: i32 = 255;

fn print_help() {
    println!("persist - persistent script runtime v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("USAGE:");
    println!("  persist [OPTIONS] SCRIPT [ARGS...]");
    println!();
    println!("OPTIONS:");
    println!("  -I DIR        Add DIR to the module include path (repeatable)");
    println!("  -M MODULE     Load MODULE before compiling SCRIPT (repeatable)");
    println!("  -n COUNT      Run the compiled script COUNT times (default 1)");
    println!("  -c FILE       Read the runtime configuration from a JSON file");
    println!("  -w            Enable runtime warnings");
    println!("  -T            Fail on writes of tainted data");
    println!("  -t            Warn on writes of tainted data");
    println!("  -s            Print runtime statistics to stderr on exit");
    println!("  -h, --help    Print this help message");
    println!("  -v, --version Print version information");
}

#[derive(Debug, Default)]
struct Options {
    include: Vec<PathBuf>,
    modules: Vec<String>,
    count: usize,
    config: Option<PathBuf>,
    warnings: bool,
    taint: Option<TaintMode>,
    stats: bool,
    script: PathBuf,
    args: Vec<OsString>,
}

fn value(args: &mut impl Iterator<Item = OsString>, flag: &str) -> Result<OsString> {
    args.next()
        .with_context(|| format!("option '{flag}' needs a value"))
}

/// Returns `None` when help or version output was requested.
fn parse(mut args: impl Iterator<Item = OsString>) -> Result<Option<Options>> {
    let mut opts = Options {
        count: 1,
        ..Options::default()
    };

    while let Some(arg) = args.next() {
        let text = arg.to_string_lossy().into_owned();
        match text.as_str() {
            "-h" | "--help" => {
                print_help();
                return Ok(None);
            }
            "-v" | "--version" => {
                println!("persist {}", env!("CARGO_PKG_VERSION"));
                return Ok(None);
            }
            "-I" => opts.include.push(value(&mut args, "-I")?.into()),
            "-M" => opts
                .modules
                .push(value(&mut args, "-M")?.to_string_lossy().into_owned()),
            "-n" => {
                let count = value(&mut args, "-n")?;
                opts.count = count
                    .to_string_lossy()
                    .parse()
                    .with_context(|| format!("invalid count '{}'", count.to_string_lossy()))?;
            }
            "-c" => opts.config = Some(value(&mut args, "-c")?.into()),
            "-w" => opts.warnings = true,
            "-T" => opts.taint = Some(TaintMode::Fatal),
            "-t" => opts.taint = Some(TaintMode::Warn),
            "-s" => opts.stats = true,
            flag if flag.starts_with('-') && flag.len() > 1 => {
                bail!("unrecognized argument '{flag}'\nRun 'persist --help' for usage information.")
            }
            _ => {
                opts.script = arg.into();
                opts.args = args.collect();
                return Ok(Some(opts));
            }
        }
    }
    bail!("no script given\nRun 'persist --help' for usage information.")
}

fn config(opts: &Options) -> Result<RuntimeConfig> {
    let mut config = match &opts.config {
        Some(path) => RuntimeConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => RuntimeConfig::default(),
    };
    if opts.warnings {
        config.warnings = WarningsMode::Enable;
    }
    if let Some(taint) = opts.taint {
        config.taint = taint;
    }
    Ok(config)
}

fn run(opts: &Options) -> Result<i32> {
    let runtime = Runtime::new("persist", config(opts)?);
    for dir in &opts.include {
        runtime.add_include_path(dir);
    }
    for module in &opts.modules {
        let result = runtime.load_module(module, None);
        if let Some(message) = result.message {
            bail!("module {module}: {message}");
        }
    }

    let env = runtime.env_new(true, std::env::vars().map(|(k, v)| format!("{k}={v}")));
    let args = runtime.args_new(true, opts.args.iter().map(|a| a.as_bytes()));

    let unit = match runtime.compile_file(&opts.script, Some(&env)) {
        Ok(unit) => unit,
        Err(result) => {
            eprintln!("{}", result.message.unwrap_or_default());
            return Ok(EXIT_FAILURE);
        }
    };

    let mut status = 0;
    for iteration in 0..opts.count {
        let result = runtime.run(&unit, Some(&args), Some(&env));
        info!(iteration, status = result.status, "Run complete");
        status = match result.message {
            Some(message) => {
                eprintln!("{message}");
                EXIT_FAILURE
            }
            None => result.status,
        };
    }

    runtime.unload(unit)?;
    if opts.stats {
        eprint!("{}", runtime.metrics().report());
    }
    runtime.destroy();
    Ok(status)
}

fn main() -> Result<()> {
    init_logging()?;

    let Some(opts) = parse(std::env::args_os().skip(1))? else {
        return Ok(());
    };
    let status = run(&opts)?;
    std::process::exit(status);
}
