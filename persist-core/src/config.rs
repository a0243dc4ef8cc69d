//! Runtime Configuration
//!
//! A [`RuntimeConfig`] is fixed when a runtime boots.  It can be built in
//! code, decoded from the classic flag word with [`RuntimeConfig::from_bits`],
//! or loaded from a JSON document.
//!
//! # Flag word layout:
//! - `0x3`: warnings (enable, force all, force none)
//! - `0x30`: taint checking (warn, fatal)
//! - `0x40`: unsafe mode
//! - `0x300`: argument loop (no print, print)
//! - `0x770000`: unicode channels

use crate::error::{RuntimeError, RuntimeResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

const WARNINGS_MASK: u32 = 0x3;
const TAINT_MASK: u32 = 0x30;
const UNSAFE_BIT: u32 = 0x40;
const ARG_LOOP_MASK: u32 = 0x300;
const UNICODE_MASK: u32 = 0x77_0000;

/// How diagnostics are reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningsMode {
    /// Script `warn` is printed, runtime diagnostics are not.
    #[default]
    Off,
    /// Runtime diagnostics go to the log sink.
    Enable,
    /// Like `Enable`, and script `debug` output is copied to `STDERR`.
    ForceAll,
    /// Every diagnostic is suppressed, script `warn` included.
    ForceNone,
}

impl WarningsMode {
    fn from_bits(bits: u32) -> Self {
        match bits & WARNINGS_MASK {
            0x1 => Self::Enable,
            0x2 => Self::ForceAll,
            0x3 => Self::ForceNone,
            _ => Self::Off,
        }
    }

    fn bits(self) -> u32 {
        match self {
            Self::Off => 0,
            Self::Enable => 0x1,
            Self::ForceAll => 0x2,
            Self::ForceNone => 0x3,
        }
    }

    /// Whether runtime diagnostics reach the sink.
    pub fn diagnostics(self) -> bool {
        matches!(self, Self::Enable | Self::ForceAll)
    }
}

/// What happens when tainted data reaches an output handle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaintMode {
    #[default]
    Off,
    Warn,
    Fatal,
}

impl TaintMode {
    fn from_bits(bits: u32) -> RuntimeResult<Self> {
        match bits & TAINT_MASK {
            0 => Ok(Self::Off),
            0x10 => Ok(Self::Warn),
            0x20 => Ok(Self::Fatal),
            other => Err(RuntimeError::Config(format!(
                "taint bits {other:#x} select both warn and fatal"
            ))),
        }
    }

    fn bits(self) -> u32 {
        match self {
            Self::Off => 0,
            Self::Warn => 0x10,
            Self::Fatal => 0x20,
        }
    }
}

/// Implicit per-line loop over `STDIN` around the unit body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgLoopMode {
    #[default]
    Off,
    /// Run the body once per line with `line` bound.
    NoPrint,
    /// As `NoPrint`, then write `line` back to `STDOUT`.
    Print,
}

impl ArgLoopMode {
    fn from_bits(bits: u32) -> RuntimeResult<Self> {
        match bits & ARG_LOOP_MASK {
            0 => Ok(Self::Off),
            0x100 => Ok(Self::NoPrint),
            0x200 => Ok(Self::Print),
            other => Err(RuntimeError::Config(format!(
                "argument loop bits {other:#x} select both print modes"
            ))),
        }
    }

    fn bits(self) -> u32 {
        match self {
            Self::Off => 0,
            Self::NoPrint => 0x100,
            Self::Print => 0x200,
        }
    }
}

/// Channels that carry UTF-8 instead of single-byte text.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnicodeFlags(u32);

impl UnicodeFlags {
    pub const NONE: Self = Self(0);
    pub const STDIN: Self = Self(0x1_0000);
    pub const STDOUT: Self = Self(0x2_0000);
    pub const STDERR: Self = Self(0x4_0000);
    pub const STDALL: Self = Self(0x7_0000);
    /// Default for handles opened for input.
    pub const INPUT_DEFAULT: Self = Self(0x10_0000);
    /// Default for handles opened for output.
    pub const OUTPUT_DEFAULT: Self = Self(0x20_0000);
    pub const IO_DEFAULT: Self = Self(0x30_0000);
    /// Decode argument bytes as UTF-8.
    pub const ARGV: Self = Self(0x40_0000);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for UnicodeFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for UnicodeFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for UnicodeFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(UnicodeFlags, &str); 6] = [
            (UnicodeFlags::STDIN, "STDIN"),
            (UnicodeFlags::STDOUT, "STDOUT"),
            (UnicodeFlags::STDERR, "STDERR"),
            (UnicodeFlags::INPUT_DEFAULT, "INPUT_DEFAULT"),
            (UnicodeFlags::OUTPUT_DEFAULT, "OUTPUT_DEFAULT"),
            (UnicodeFlags::ARGV, "ARGV"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            write!(f, "UnicodeFlags(NONE)")
        } else {
            write!(f, "UnicodeFlags({})", names.join(" | "))
        }
    }
}

/// Safety limits applied to the embedded engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineLimits {
    /// Maximum nested function call depth.
    pub max_call_levels: usize,
    /// Maximum expression nesting depth (global, inside functions). 0 lifts it.
    pub max_expr_depth: (usize, usize),
    /// Maximum string length in bytes. 0 lifts it.
    pub max_string_size: usize,
}

impl EngineLimits {
    /// Limits for ordinary operation.
    pub fn guarded() -> Self {
        Self {
            max_call_levels: 64,
            max_expr_depth: (64, 32),
            max_string_size: 16 * 1024 * 1024,
        }
    }

    /// Limits for unsafe mode: everything lifted except the call depth,
    /// which still protects the host stack.
    pub fn lifted() -> Self {
        Self {
            max_call_levels: 1024,
            max_expr_depth: (0, 0),
            max_string_size: 0,
        }
    }
}

/// Configuration fixed at runtime creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub warnings: WarningsMode,
    pub taint: TaintMode,
    /// Lift the engine's safety limits.
    pub unsafe_mode: bool,
    pub arg_loop: ArgLoopMode,
    pub unicode: UnicodeFlags,
}

impl RuntimeConfig {
    /// Decode the classic flag word.
    ///
    /// Bits outside the known fields are rejected, as are contradictory
    /// combinations inside one field.
    pub fn from_bits(bits: u32) -> RuntimeResult<Self> {
        let known = WARNINGS_MASK | TAINT_MASK | UNSAFE_BIT | ARG_LOOP_MASK | UNICODE_MASK;
        if bits & !known != 0 {
            return Err(RuntimeError::Config(format!(
                "unknown flag bits {:#x}",
                bits & !known
            )));
        }

        Ok(Self {
            warnings: WarningsMode::from_bits(bits),
            taint: TaintMode::from_bits(bits)?,
            unsafe_mode: bits & UNSAFE_BIT != 0,
            arg_loop: ArgLoopMode::from_bits(bits)?,
            unicode: UnicodeFlags(bits & UNICODE_MASK),
        })
    }

    /// Encode back into the classic flag word.
    pub fn bits(&self) -> u32 {
        let unsafe_bit = if self.unsafe_mode { UNSAFE_BIT } else { 0 };
        self.warnings.bits()
            | self.taint.bits()
            | unsafe_bit
            | self.arg_loop.bits()
            | self.unicode.bits()
    }

    /// Parse a JSON configuration document.
    pub fn from_json(text: &str) -> RuntimeResult<Self> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| RuntimeError::Config(e.to_string()))?;
        if config.unicode.bits() & !UNICODE_MASK != 0 {
            return Err(RuntimeError::Config(format!(
                "unknown unicode bits {:#x}",
                config.unicode.bits() & !UNICODE_MASK
            )));
        }
        Ok(config)
    }

    /// Load a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> RuntimeResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&text)
    }

    /// Engine limits implied by `unsafe_mode`.
    pub fn limits(&self) -> EngineLimits {
        if self.unsafe_mode {
            EngineLimits::lifted()
        } else {
            EngineLimits::guarded()
        }
    }

    /// Whether text read from the named handle is UTF-8.
    pub fn utf8_input(&self, handle: &str) -> bool {
        match handle {
            "STDIN" => self.unicode.contains(UnicodeFlags::STDIN),
            _ => self.unicode.contains(UnicodeFlags::INPUT_DEFAULT),
        }
    }

    /// Whether text written to the named handle is UTF-8.
    pub fn utf8_output(&self, handle: &str) -> bool {
        match handle {
            "STDOUT" => self.unicode.contains(UnicodeFlags::STDOUT),
            "STDERR" => self.unicode.contains(UnicodeFlags::STDERR),
            _ => self.unicode.contains(UnicodeFlags::OUTPUT_DEFAULT),
        }
    }

    /// Whether argument bytes decode as UTF-8.
    pub fn utf8_argv(&self) -> bool {
        self.unicode.contains(UnicodeFlags::ARGV)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.bits(), 0);
        assert_eq!(config.warnings, WarningsMode::Off);
        assert_eq!(config.limits(), EngineLimits::guarded());
    }

    #[test]
    fn test_from_bits() {
        let config = RuntimeConfig::from_bits(0x1 | 0x20 | 0x40 | 0x200 | 0x7_0000).unwrap();
        assert_eq!(config.warnings, WarningsMode::Enable);
        assert_eq!(config.taint, TaintMode::Fatal);
        assert!(config.unsafe_mode);
        assert_eq!(config.arg_loop, ArgLoopMode::Print);
        assert!(config.unicode.contains(UnicodeFlags::STDALL));
        assert_eq!(config.limits(), EngineLimits::lifted());
    }

    #[test]
    fn test_bits_survive_decode() {
        for bits in [0, 0x3, 0x10, 0x140, 0x30_0000 | 0x40_0000] {
            assert_eq!(RuntimeConfig::from_bits(bits).unwrap().bits(), bits);
        }
    }

    #[test]
    fn test_contradictory_bits_rejected() {
        assert!(RuntimeConfig::from_bits(0x30).is_err());
        assert!(RuntimeConfig::from_bits(0x300).is_err());
        assert!(RuntimeConfig::from_bits(0x8000_0000).is_err());
    }

    #[test]
    fn test_unicode_channels() {
        let config = RuntimeConfig {
            unicode: UnicodeFlags::STDOUT | UnicodeFlags::INPUT_DEFAULT,
            ..RuntimeConfig::default()
        };
        assert!(config.utf8_output("STDOUT"));
        assert!(!config.utf8_output("STDERR"));
        assert!(!config.utf8_output("log"));
        assert!(config.utf8_input("log"));
        assert!(!config.utf8_input("STDIN"));
        assert!(!config.utf8_argv());
    }

    #[test]
    fn test_from_json() {
        let config = RuntimeConfig::from_json(
            r#"{ "warnings": "force_all", "taint": "warn", "unicode": 4194304 }"#,
        )
        .unwrap();
        assert_eq!(config.warnings, WarningsMode::ForceAll);
        assert_eq!(config.taint, TaintMode::Warn);
        assert!(config.utf8_argv());
        assert_eq!(config.arg_loop, ArgLoopMode::Off);
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(RuntimeConfig::from_json("{ \"warnings\": \"loud\" }").is_err());
        assert!(RuntimeConfig::from_json("{ \"unicode\": 1 }").is_err());
    }

    #[test]
    fn test_unicode_debug() {
        assert_eq!(format!("{:?}", UnicodeFlags::NONE), "UnicodeFlags(NONE)");
        assert_eq!(
            format!("{:?}", UnicodeFlags::STDIN | UnicodeFlags::ARGV),
            "UnicodeFlags(STDIN | ARGV)"
        );
    }
}
