pub mod echo;
pub mod http;
pub mod traits;

pub use echo::EchoEngine;
pub use http::HttpEngine;
pub use traits::{ReasoningEngine, ReasoningInput, ReasoningOutcome, ToolCall};

use std::sync::Arc;
use std::time::Duration;

use crate::config::EngineConfig;

/// Factory: create the configured reasoning engine.
pub fn create_engine(config: &EngineConfig) -> anyhow::Result<Arc<dyn ReasoningEngine>> {
    match config.kind.as_str() {
        "echo" => Ok(Arc::new(EchoEngine)),
        "http" => {
            let Some(url) = config.url.as_deref().filter(|u| !u.trim().is_empty()) else {
                anyhow::bail!("engine.url is required when engine.kind = \"http\"");
            };
            Ok(Arc::new(HttpEngine::new(
                url,
                config.api_token.as_deref(),
                Duration::from_secs(config.timeout_secs),
            )))
        }
        other if other.trim().is_empty() => {
            anyhow::bail!("engine.kind cannot be empty. Supported values: echo, http")
        }
        other => anyhow::bail!("Unknown engine kind '{other}'. Supported values: echo, http"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_echo() {
        let engine = create_engine(&EngineConfig::default()).unwrap();
        assert_eq!(engine.name(), "echo");
    }

    #[test]
    fn factory_http_needs_url() {
        let cfg = EngineConfig {
            kind: "http".into(),
            url: None,
            ..EngineConfig::default()
        };
        match create_engine(&cfg) {
            Err(err) => assert!(err.to_string().contains("engine.url")),
            Ok(_) => panic!("http engine without url should error"),
        }
    }

    #[test]
    fn factory_unknown_errors() {
        let cfg = EngineConfig {
            kind: "quantum".into(),
            ..EngineConfig::default()
        };
        match create_engine(&cfg) {
            Err(err) => assert!(err.to_string().contains("Unknown engine kind")),
            Ok(_) => panic!("unknown engine should error"),
        }
    }
}
