use weir_core::config::GatewayConfig;

/// Check a request's bearer token against the configured gateway token.
///
/// No configured token means the gateway is open; intended for local
/// development only.
pub fn authorize(config: &GatewayConfig, bearer: Option<&str>) -> bool {
    match &config.token {
        Some(expected) => bearer == Some(expected.as_str()),
        None => true,
    }
}
