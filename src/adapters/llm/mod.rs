//! LLM provider adapters.

pub mod anthropic;

pub use anthropic::AnthropicProvider;

use std::sync::Arc;

use crate::adapters::mock::MockLlmProvider;
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::LlmConfig;
use crate::domain::ports::LlmProvider;

/// Create the provider named by `config.provider`.
pub fn create_provider(config: &LlmConfig) -> DomainResult<Arc<dyn LlmProvider>> {
    match config.provider.to_ascii_lowercase().as_str() {
        "anthropic" => Ok(Arc::new(AnthropicProvider::new(config.clone())?)),
        "mock" => Ok(Arc::new(MockLlmProvider::new())),
        other => Err(DomainError::InvalidConfiguration(format!(
            "unknown llm provider '{other}' (expected anthropic or mock)"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_provider_rejected() {
        let config = LlmConfig {
            provider: "openai".to_string(),
            ..Default::default()
        };
        let err = create_provider(&config).err().unwrap();
        assert!(matches!(err, DomainError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_mock_provider_needs_no_key() {
        let config = LlmConfig {
            provider: "mock".to_string(),
            ..Default::default()
        };
        assert_eq!(create_provider(&config).unwrap().name(), "mock");
    }

    #[test]
    fn test_anthropic_provider_builds_without_key() {
        let provider = temp_env::with_var_unset("ANTHROPIC_API_KEY", || {
            create_provider(&LlmConfig::default())
        });
        assert_eq!(provider.unwrap().name(), "anthropic");
    }
}
