//! Output utilities.

use serde::Serialize;

/// Output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// YAML format (default).
    #[default]
    Yaml,
    /// JSON format.
    Json,
}

impl OutputFormat {
    pub fn from_flag(json: bool) -> Self {
        if json { Self::Json } else { Self::Yaml }
    }

    /// Prints `value` to stdout.
    pub fn write<T: Serialize>(self, value: &T) -> anyhow::Result<()> {
        let output = match self {
            OutputFormat::Yaml => serde_yaml::to_string(value)?,
            OutputFormat::Json => serde_json::to_string_pretty(value)?,
        };
        println!("{}", output.trim_end());
        Ok(())
    }
}
