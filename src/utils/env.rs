/// Environment variable prefix used by this crate
pub const ENV_PREFIX: &str = "SUBSYNC_";

/// Get environment variable with SUBSYNC_ prefix, falling back to unprefixed version
///
/// This helper checks for `SUBSYNC_{key}` first, then falls back to `{key}`
/// so hosting platforms that inject plain names keep working.
///
/// # Examples
///
/// ```rust,ignore
/// // Checks SUBSYNC_PRICE_PRO_MONTHLY first, then PRICE_PRO_MONTHLY
/// let price = get_env_with_prefix("PRICE_PRO_MONTHLY");
/// ```
pub fn get_env_with_prefix(key: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{key}"))
        .or_else(|_| std::env::var(key))
        .ok()
        .filter(|value| !value.trim().is_empty())
}

/// Parse a prefixed environment variable, ignoring values that fail to parse
pub fn parse_env_with_prefix<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = get_env_with_prefix(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(
                target: "subscription_sync::config",
                key = key,
                value = %raw,
                "Ignoring unparseable environment variable"
            );
            None
        }
    }
}
