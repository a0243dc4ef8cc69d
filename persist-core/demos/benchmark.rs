//! Persist Performance Benchmark
//!
//! Shows what a persistent runtime saves over compiling per request:
//! - Compile-per-run versus compile-once
//! - Module cache reuse across units
//! - Compile/unload churn

use anyhow::{bail, Result};
use persist_core::{init_logging, RuntimeConfig, Runtime};
use std::time::Instant;

const HANDLER: &[u8] = br#"
let served = if is_def_var("served") { served + 1 } else { 1 };
let total = 0;
for i in 0..200 { total += i * argc(); }
total
"#;

fn main() -> Result<()> {
    init_logging()?;

    println!("Persist Performance Benchmark Suite");
    println!("===========================================================\n");

    let runtime = Runtime::new("benchmark", RuntimeConfig::default());

    println!("Benchmark 1: Compile Per Run vs Compile Once");
    println!("-----------------------------------------------------------");
    benchmark_compile_once(&runtime)?;
    println!();

    println!("Benchmark 2: Module Cache");
    println!("-----------------------------------------------------------");
    benchmark_module_cache(&runtime)?;
    println!();

    println!("Benchmark 3: Compile/Unload Churn");
    println!("-----------------------------------------------------------");
    benchmark_churn(&runtime)?;
    println!();

    println!("Final Performance Report");
    println!("-----------------------------------------------------------");
    print!("{}", runtime.metrics().report());

    runtime.destroy();
    Ok(())
}

fn benchmark_compile_once(runtime: &Runtime) -> Result<()> {
    const REQUESTS: usize = 500;
    let args = runtime.args_new(false, ["x", "y", "z"]);

    let start = Instant::now();
    for i in 0..REQUESTS {
        let unit = match runtime.compile(&format!("fresh-{i}"), None, HANDLER) {
            Ok(unit) => unit,
            Err(result) => bail!("compile failed: {:?}", result.message),
        };
        runtime.run(&unit, Some(&args), None);
        runtime.unload(unit)?;
    }
    let fresh = start.elapsed();

    let unit = match runtime.compile("persistent", None, HANDLER) {
        Ok(unit) => unit,
        Err(result) => bail!("compile failed: {:?}", result.message),
    };
    let start = Instant::now();
    for _ in 0..REQUESTS {
        runtime.run(&unit, Some(&args), None);
    }
    let persistent = start.elapsed();
    runtime.unload(unit)?;

    println!("  {REQUESTS} requests, compiling each:   {fresh:?}");
    println!("  {REQUESTS} requests, compiled once:    {persistent:?}");
    if !persistent.is_zero() {
        println!(
            "  Speedup: {:.1}x",
            fresh.as_secs_f64() / persistent.as_secs_f64()
        );
    }
    Ok(())
}

fn benchmark_module_cache(runtime: &Runtime) -> Result<()> {
    const UNITS: usize = 100;
    let dir = std::env::temp_dir().join(format!("persist-bench-{}", std::process::id()));
    std::fs::create_dir_all(dir.join("Bench"))?;
    std::fs::write(
        dir.join("Bench/Math.rhai"),
        "fn square(x) { x * x }\nfn cube(x) { x * x * x }\n",
    )?;
    runtime.add_include_path(&dir);

    let start = Instant::now();
    let mut units = Vec::with_capacity(UNITS);
    for i in 0..UNITS {
        let source = format!(r#"import "Bench::Math" as m; m::square({i}) + m::cube(2)"#);
        match runtime.compile(&format!("importer-{i}"), None, source.as_bytes()) {
            Ok(unit) => units.push(unit),
            Err(result) => bail!("compile failed: {:?}", result.message),
        }
    }
    let elapsed = start.elapsed();
    for unit in units {
        runtime.unload(unit)?;
    }
    std::fs::remove_dir_all(&dir)?;

    let stats = runtime.module_cache_stats();
    println!("  {UNITS} importing units compiled in {elapsed:?}");
    println!(
        "  Cache hits: {}, misses: {}, cached modules: {}",
        stats.hits, stats.misses, stats.cached_count
    );
    Ok(())
}

fn benchmark_churn(runtime: &Runtime) -> Result<()> {
    const CYCLES: usize = 1000;

    let start = Instant::now();
    for i in 0..CYCLES {
        let unit = match runtime.compile(&format!("churn-{i}"), None, b"fn on_unload() {} 1") {
            Ok(unit) => unit,
            Err(result) => bail!("compile failed: {:?}", result.message),
        };
        runtime.unload(unit)?;
    }
    let elapsed = start.elapsed();

    println!("  {CYCLES} compile+unload cycles in {elapsed:?}");
    println!("  Namespaces still allocated: {}", runtime.namespace_count());
    Ok(())
}
