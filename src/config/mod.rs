pub mod schema;

pub use schema::{
    EngineConfig, GatewayConfig, RecordSyncConfig, SessionConfig, StoreConfig, TenantConfig,
    TurnstileConfig,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reexported_config_default_is_constructible() {
        let config = TurnstileConfig::default();

        assert!(config.tenants.is_empty());
        assert!(config.session.lock_ttl_secs > config.session.persist_margin_secs);
        assert!(config.gateway.webhook_secret.is_none());
    }
}
