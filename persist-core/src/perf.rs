//! Performance Monitoring
//!
//! Lightweight counters for the operations a persistent runtime exists to
//! make cheap: compiling once, then running many times.
//!
//! # Design Goals:
//! - Plain atomic counters, no locks
//! - Zero allocation on the recording path

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Counters kept by every runtime.
#[derive(Debug, Default)]
pub struct RuntimeMetrics {
    compiles: AtomicU64,
    compile_time_ns: AtomicU64,
    compile_failures: AtomicU64,

    runs: AtomicU64,
    run_time_ns: AtomicU64,

    unloads: AtomicU64,

    module_loads: AtomicU64,
    module_load_time_ns: AtomicU64,

    hooks_run: AtomicU64,
}

impl RuntimeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn add_duration(count: &AtomicU64, total_ns: &AtomicU64, duration: Duration) {
        count.fetch_add(1, Ordering::Relaxed);
        total_ns.fetch_add(
            u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
    }

    pub fn record_compile(&self, duration: Duration) {
        Self::add_duration(&self.compiles, &self.compile_time_ns, duration);
    }

    pub fn record_compile_failure(&self) {
        self.compile_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_run(&self, duration: Duration) {
        Self::add_duration(&self.runs, &self.run_time_ns, duration);
    }

    pub fn record_unload(&self) {
        self.unloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_module_load(&self, duration: Duration) {
        Self::add_duration(&self.module_loads, &self.module_load_time_ns, duration);
    }

    pub fn record_hook(&self) {
        self.hooks_run.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of current metrics
    pub fn snapshot(&self) -> PerfSnapshot {
        PerfSnapshot {
            compiles: self.compiles.load(Ordering::Relaxed),
            avg_compile_ms: avg_duration_ms(&self.compiles, &self.compile_time_ns),
            compile_failures: self.compile_failures.load(Ordering::Relaxed),
            runs: self.runs.load(Ordering::Relaxed),
            avg_run_ms: avg_duration_ms(&self.runs, &self.run_time_ns),
            unloads: self.unloads.load(Ordering::Relaxed),
            module_loads: self.module_loads.load(Ordering::Relaxed),
            avg_module_load_ms: avg_duration_ms(&self.module_loads, &self.module_load_time_ns),
            hooks_run: self.hooks_run.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.compiles,
            &self.compile_time_ns,
            &self.compile_failures,
            &self.runs,
            &self.run_time_ns,
            &self.unloads,
            &self.module_loads,
            &self.module_load_time_ns,
            &self.hooks_run,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

fn avg_duration_ms(count: &AtomicU64, total_ns: &AtomicU64) -> f64 {
    let c = count.load(Ordering::Relaxed);
    if c == 0 {
        return 0.0;
    }
    let total = total_ns.load(Ordering::Relaxed);
    (total as f64) / (c as f64) / 1_000_000.0
}

/// A point-in-time snapshot of [`RuntimeMetrics`].
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct PerfSnapshot {
    pub compiles: u64,
    pub avg_compile_ms: f64,
    pub compile_failures: u64,
    pub runs: u64,
    pub avg_run_ms: f64,
    pub unloads: u64,
    pub module_loads: u64,
    pub avg_module_load_ms: f64,
    pub hooks_run: u64,
}

impl PerfSnapshot {
    /// Human-readable report, one operation per line.
    pub fn report(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "compiles:     {:>8} (avg {:>8.3} ms, {} failed)",
            self.compiles, self.avg_compile_ms, self.compile_failures
        );
        let _ = writeln!(out, "runs:         {:>8} (avg {:>8.3} ms)", self.runs, self.avg_run_ms);
        let _ = writeln!(out, "unloads:      {:>8}", self.unloads);
        let _ = writeln!(
            out,
            "module loads: {:>8} (avg {:>8.3} ms)",
            self.module_loads, self.avg_module_load_ms
        );
        let _ = writeln!(out, "hooks run:    {:>8}", self.hooks_run);
        out
    }
}

/// A scoped timer that records its duration on drop
pub struct ScopedTimer<'a> {
    start: Instant,
    metrics: &'a RuntimeMetrics,
    metric_type: TimerType,
}

#[derive(Debug, Clone, Copy)]
pub enum TimerType {
    Compile,
    Run,
    ModuleLoad,
}

impl<'a> ScopedTimer<'a> {
    pub fn new(metrics: &'a RuntimeMetrics, metric_type: TimerType) -> Self {
        Self {
            start: Instant::now(),
            metrics,
            metric_type,
        }
    }
}

impl Drop for ScopedTimer<'_> {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        match self.metric_type {
            TimerType::Compile => self.metrics.record_compile(duration),
            TimerType::Run => self.metrics.record_run(duration),
            TimerType::ModuleLoad => self.metrics.record_module_load(duration),
        }
    }
}
