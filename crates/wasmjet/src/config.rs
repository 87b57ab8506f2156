//! Engine configuration.

use std::fmt;
use std::str::FromStr;

/// Optimization level handed to the native code generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptLevel {
    None,
    #[default]
    Speed,
    SpeedAndSize,
}

impl OptLevel {
    /// The name the code generator's `opt_level` setting expects.
    pub(crate) fn as_setting(self) -> &'static str {
        match self {
            OptLevel::None => "none",
            OptLevel::Speed => "speed",
            OptLevel::SpeedAndSize => "speed_and_size",
        }
    }
}

impl FromStr for OptLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" | "0" => Ok(OptLevel::None),
            "speed" | "2" => Ok(OptLevel::Speed),
            "speed_and_size" | "s" => Ok(OptLevel::SpeedAndSize),
            other => Err(format!(
                "unknown optimization level '{other}' (expected none, speed or speed_and_size)"
            )),
        }
    }
}

impl fmt::Display for OptLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_setting())
    }
}

/// Configuration shared by everything compiled and instantiated through one
/// [`Engine`](crate::Engine).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Reserve 8 GiB plus a guard page for every memory and drop inline
    /// bounds checks, relying on the fault handler instead.
    pub guard_page_elision: bool,
    /// Maximum pages for memories declared without one.
    pub default_max_memory_pages: u32,
    /// Maximum elements for tables declared without one.
    pub default_max_table_elements: u32,
    pub opt_level: OptLevel,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            guard_page_elision: cfg!(target_pointer_width = "64"),
            default_max_memory_pages: 16384,
            default_max_table_elements: 1 << 20,
            opt_level: OptLevel::default(),
        }
    }
}
