//! Scanner configuration, loadable from a TOML file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration that can be loaded from `leakhound.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Directory of additional rule files; overrides built-ins by id.
    #[serde(default)]
    pub external_rule_dir: Option<PathBuf>,

    /// Paths to skip (glob patterns).
    #[serde(default)]
    pub skip_paths: Vec<String>,

    /// Rule IDs whose detections are dropped from reports.
    #[serde(default)]
    pub disabled_rules: Vec<String>,
}

impl Config {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load config from default locations, or return defaults.
    pub fn load_default() -> Self {
        if let Ok(config) = Self::load(Path::new("leakhound.toml")) {
            return config;
        }

        if let Some(home) = dirs::home_dir() {
            if let Ok(config) = Self::load(&home.join(".leakhound.toml")) {
                return config;
            }
        }

        Self::with_defaults()
    }

    /// Defaults that keep vendored and generated trees out of scans.
    pub fn with_defaults() -> Self {
        Self {
            external_rule_dir: None,
            skip_paths: vec![
                "**/.git/**".to_string(),
                "**/node_modules/**".to_string(),
                "**/vendor/**".to_string(),
                "**/tmp/**".to_string(),
                "**/log/**".to_string(),
                "**/coverage/**".to_string(),
            ],
            disabled_rules: Vec::new(),
        }
    }
}

/// Generate a commented default config file.
pub fn generate_default_config() -> String {
    let defaults = Config::with_defaults();
    let mut out = String::from(
        "# Leakhound configuration\n\
         #\n\
         # external_rule_dir = \"./leakhound-rules\"\n\n",
    );
    out.push_str(&toml::to_string_pretty(&defaults).unwrap_or_default());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_skip_vendored_trees() {
        let config = Config::with_defaults();
        assert!(config.skip_paths.iter().any(|p| p.contains("node_modules")));
        assert!(config.disabled_rules.is_empty());
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "external_rule_dir = \"/opt/rules\"\ndisabled_rules = [\"ruby_lang_busy_sleep\"]"
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(
            config.external_rule_dir.as_deref(),
            Some(Path::new("/opt/rules"))
        );
        assert_eq!(config.disabled_rules, vec!["ruby_lang_busy_sleep"]);
    }

    #[test]
    fn test_generate_default_config_round_trips() {
        let generated = generate_default_config();
        let stripped: String = generated
            .lines()
            .filter(|l| !l.trim_start().starts_with('#'))
            .collect::<Vec<_>>()
            .join("\n");
        let parsed: Config = toml::from_str(&stripped).unwrap();
        assert!(!parsed.skip_paths.is_empty());
    }
}
