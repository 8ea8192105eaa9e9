use log::LevelFilter;
use serde::{Deserialize, Serialize};

/// Logger configuration, read from the `[logger]` table of the title config.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct LoggerConfig {
    /// Level for this tool and the script crates.
    pub app_level_filter: LevelFilter,
    /// Level for everything else.
    pub level_filter: LevelFilter,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            app_level_filter: LevelFilter::Info,
            level_filter: LevelFilter::Warn,
        }
    }
}

impl LoggerConfig {
    /// Install the global logger. `RUST_LOG` still takes precedence.
    pub fn init(&self) {
        let mut builder = env_logger::Builder::new();
        builder.filter_level(self.level_filter);
        for module in ["luca_disassembler", "luca_script", "luca_nls"] {
            builder.filter_module(module, self.app_level_filter);
        }
        builder.parse_default_env();
        if builder.try_init().is_err() {
            log::debug!("logger already initialised");
        }
    }
}

/// The parts of a title config file only this tool reads.
#[derive(Serialize, Deserialize, Debug, Default)]
#[serde(default)]
pub struct ToolConfig {
    pub logger: LoggerConfig,
}

impl ToolConfig {
    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }
}
