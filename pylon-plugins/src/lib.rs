pub mod rate_limit;
pub mod request_id;
pub mod security_headers;

use pylon_plugin::registry::PluginRegistry;
use std::sync::Arc;

/// Register all built-in plugins.
pub fn register_all(registry: &mut PluginRegistry) {
    registry.register(Arc::new(request_id::RequestIdPlugin));
    registry.register(Arc::new(rate_limit::RateLimitPlugin));
    registry.register(Arc::new(security_headers::SecurityHeadersPlugin));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_all() {
        let mut reg = PluginRegistry::new();
        register_all(&mut reg);
        assert!(reg.get("request-id").is_some());
        assert!(reg.get("rate-limit").is_some());
        assert!(reg.get("security-headers").is_some());
    }
}
