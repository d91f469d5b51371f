//! Extender configuration, mirroring the original plugin's `TerminusArgs`
//! defaulting/validation.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("oversubscriptionRatio must be >= 1.0, got {0}")]
    InvalidRatio(f64),
}

pub type Result<T> = std::result::Result<T, Error>;

pub const MAX_NODE_SCORE: i64 = 100;
pub const PHYSICAL_RED_LINE: f64 = 0.95;
const DEFAULT_AI_WEIGHT: u8 = 30;

#[derive(Debug, Clone)]
pub struct ExtenderConfig {
    pub namespace: String,
    pub oversubscription_ratio: f64,
    pub use_ai: bool,
    pub ai_weight_ratio: u8,
    pub model_type: String,
    pub model_name: String,
    pub openai_api_key: String,
    pub openai_api_url: String,
}

impl ExtenderConfig {
    /// Apply the same defaulting/clamping rules as the original
    /// `SetDefaults`, then validate.
    pub fn with_defaults(mut self) -> Result<Self> {
        if self.namespace.is_empty() {
            self.namespace = "kube-system".to_string();
        }
        if self.oversubscription_ratio == 0.0 {
            self.oversubscription_ratio = 1.0;
        }
        if self.oversubscription_ratio < 1.0 {
            return Err(Error::InvalidRatio(self.oversubscription_ratio));
        }
        if self.ai_weight_ratio > 100 {
            self.ai_weight_ratio = DEFAULT_AI_WEIGHT;
        }
        Ok(self)
    }

    /// `use_ai` only takes effect once every model setting is populated,
    /// matching the original's all-or-nothing validation.
    pub fn ai_fully_configured(&self) -> bool {
        self.use_ai
            && !self.model_type.is_empty()
            && !self.model_name.is_empty()
            && !self.openai_api_key.is_empty()
            && !self.openai_api_url.is_empty()
    }
}

impl Default for ExtenderConfig {
    fn default() -> Self {
        Self {
            namespace: "kube-system".to_string(),
            oversubscription_ratio: 1.0,
            use_ai: false,
            ai_weight_ratio: DEFAULT_AI_WEIGHT,
            model_type: String::new(),
            model_name: String::new(),
            openai_api_key: String::new(),
            openai_api_url: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_fields_are_zero_or_empty() {
        let config = ExtenderConfig {
            namespace: String::new(),
            oversubscription_ratio: 0.0,
            ai_weight_ratio: 150,
            ..Default::default()
        }
        .with_defaults()
        .unwrap();
        assert_eq!(config.namespace, "kube-system");
        assert_eq!(config.oversubscription_ratio, 1.0);
        assert_eq!(config.ai_weight_ratio, DEFAULT_AI_WEIGHT);
    }

    #[test]
    fn rejects_ratio_below_one() {
        let config = ExtenderConfig { oversubscription_ratio: 0.5, ..Default::default() };
        assert!(config.with_defaults().is_err());
    }

    #[test]
    fn ai_requires_every_field() {
        let mut config = ExtenderConfig { use_ai: true, ..Default::default() };
        assert!(!config.ai_fully_configured());
        config.model_type = "openai".to_string();
        config.model_name = "gpt-4".to_string();
        config.openai_api_key = "key".to_string();
        assert!(!config.ai_fully_configured());
        config.openai_api_url = "https://api.openai.com/v1/chat/completions".to_string();
        assert!(config.ai_fully_configured());
    }
}
