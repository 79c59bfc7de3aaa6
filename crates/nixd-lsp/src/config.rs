//! Server configuration: the `nixd` section of `workspace/configuration`
//! or a `.nixd.json` file. Unknown keys are ignored; malformed input is
//! logged and ignored so the previous configuration persists.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub eval: EvalConfig,
    pub options: OptionsConfig,
    pub formatting: FormattingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EvalConfig {
    /// Maximum number of evaluator workers kept alive.
    pub workers: usize,
    /// How deep diagnostics force the evaluated result.
    pub depth: usize,
}

impl Default for EvalConfig {
    fn default() -> Self {
        EvalConfig {
            workers: 3,
            depth: 8,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OptionsConfig {
    /// Route declaration and attr-name completion to option workers.
    pub enable: bool,
    /// File evaluated to the option tree the option workers serve.
    pub target: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FormattingConfig {
    /// External formatter command line; stdin in, stdout out.
    pub command: String,
}

impl Default for FormattingConfig {
    fn default() -> Self {
        FormattingConfig {
            command: "nixpkgs-fmt".to_string(),
        }
    }
}

pub fn parse_config(json: &str) -> Result<Config, serde_json::Error> {
    serde_json::from_str(json)
}

/// Read a JSON config file. Any failure keeps the caller's previous
/// configuration; startup never fails on config.
pub fn load_file(path: &Path) -> Option<Config> {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(err) => {
            tracing::warn!("cannot read config {}: {err}", path.display());
            return None;
        }
    };
    match parse_config(&text) {
        Ok(config) => Some(config),
        Err(err) => {
            tracing::warn!("ignoring malformed config {}: {err}", path.display());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.eval.workers, 3);
        assert!(!config.options.enable);
        assert_eq!(config.formatting.command, "nixpkgs-fmt");
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config = parse_config(r#"{ "eval": { "workers": 1 } }"#).unwrap();
        assert_eq!(config.eval.workers, 1);
        assert_eq!(config.eval.depth, EvalConfig::default().depth);
        assert_eq!(config.formatting.command, "nixpkgs-fmt");
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let config = parse_config(r#"{ "surprise": true, "options": { "enable": true } }"#);
        assert!(config.unwrap().options.enable);
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(parse_config("{ nope").is_err());
    }

    #[test]
    fn load_file_swallows_errors() {
        assert!(load_file(Path::new("/definitely/not/here.json")).is_none());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nixd.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(load_file(&path).is_none());

        std::fs::write(&path, r#"{ "eval": { "workers": 7 } }"#).unwrap();
        assert_eq!(load_file(&path).unwrap().eval.workers, 7);
    }
}
