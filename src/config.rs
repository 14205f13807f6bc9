use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use tracing::warn;

use crate::inference::{snapshot::ModelSource, DEFAULT_TEMPERATURE};

pub const DEFAULT_EMBED_MODEL: &str = "sentence-transformers/all-MiniLM-L6-v2";
pub const DEFAULT_CHAT_MODEL: &str = "Qwen/Qwen2.5-1.5B-Instruct";

/// Sidecar configuration, read from the environment (and `.env` if present).
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub embed_model_id: String,
    pub embed_model_dir: Option<PathBuf>,
    pub chat_model_id: String,
    pub chat_model_dir: Option<PathBuf>,
    /// `cpu`, `cuda` or `cuda:N`.
    pub device: String,
    pub temperature: f64,
    pub seed: Option<u64>,
    pub chat_template_path: Option<PathBuf>,
    pub preload: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 9000,
            embed_model_id: DEFAULT_EMBED_MODEL.into(),
            embed_model_dir: None,
            chat_model_id: DEFAULT_CHAT_MODEL.into(),
            chat_model_dir: None,
            device: "cpu".into(),
            temperature: DEFAULT_TEMPERATURE,
            seed: None,
            chat_template_path: None,
            preload: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| dotenvy::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            host: var("SIDECAR_HOST").unwrap_or(defaults.host),
            port: parsed(&var, "SIDECAR_PORT", defaults.port),
            embed_model_id: var("EMBED_MODEL_ID").unwrap_or(defaults.embed_model_id),
            embed_model_dir: var("EMBED_MODEL_DIR").map(PathBuf::from),
            chat_model_id: var("CHAT_MODEL_ID").unwrap_or(defaults.chat_model_id),
            chat_model_dir: var("CHAT_MODEL_DIR").map(PathBuf::from),
            device: var("SIDECAR_DEVICE").unwrap_or(defaults.device),
            temperature: parsed(&var, "SIDECAR_TEMPERATURE", defaults.temperature),
            seed: var("SIDECAR_SEED").and_then(|raw| parse_or_warn("SIDECAR_SEED", &raw)),
            chat_template_path: var("CHAT_TEMPLATE_PATH").map(PathBuf::from),
            preload: parsed(&var, "SIDECAR_PRELOAD", defaults.preload),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn embed_source(&self) -> ModelSource {
        ModelSource::from_parts(self.embed_model_dir.clone(), &self.embed_model_id)
    }

    pub fn chat_source(&self) -> ModelSource {
        ModelSource::from_parts(self.chat_model_dir.clone(), &self.chat_model_id)
    }
}

fn parsed<T>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr,
    T::Err: Display,
{
    var(key)
        .and_then(|raw| parse_or_warn(key, &raw))
        .unwrap_or(default)
}

fn parse_or_warn<T>(key: &str, raw: &str) -> Option<T>
where
    T: FromStr,
    T::Err: Display,
{
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(err) => {
            warn!("ignoring invalid {key}={raw:?}: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_match_sidecar_contract() {
        let cfg = config_from(&[]);
        assert_eq!(cfg.bind_addr(), "0.0.0.0:9000");
        assert_eq!(cfg.temperature, 0.2);
        assert_eq!(cfg.device, "cpu");
        assert!(!cfg.preload);
        assert_eq!(cfg.embed_source().describe(), format!("{DEFAULT_EMBED_MODEL}@main"));
        assert_eq!(cfg.chat_source().describe(), format!("{DEFAULT_CHAT_MODEL}@main"));
    }

    #[test]
    fn overrides_and_local_dirs() {
        let cfg = config_from(&[
            ("SIDECAR_PORT", "9100"),
            ("SIDECAR_SEED", "42"),
            ("SIDECAR_PRELOAD", "true"),
            ("CHAT_MODEL_DIR", "models/qwen"),
        ]);
        assert_eq!(cfg.port, 9100);
        assert_eq!(cfg.seed, Some(42));
        assert!(cfg.preload);
        assert!(matches!(cfg.chat_source(), ModelSource::Local(p) if p == PathBuf::from("models/qwen")));
    }

    #[test]
    fn invalid_numbers_fall_back_to_defaults() {
        let cfg = config_from(&[
            ("SIDECAR_PORT", "ninety"),
            ("SIDECAR_TEMPERATURE", "warm"),
            ("SIDECAR_SEED", "-1"),
            ("SIDECAR_HOST", "  "),
        ]);
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.temperature, 0.2);
        assert_eq!(cfg.seed, None);
        assert_eq!(cfg.host, "0.0.0.0");
    }
}
