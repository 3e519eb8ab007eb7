//! Environment-driven configuration bootstrap.
//!
//! Unlike the desktop build this project started from, there is no
//! user-editable settings file: the handful of values needed to boot the
//! process come from the environment, and everything an operator tunes at
//! runtime (failover thresholds, keywords, providers) lives in the database
//! as rows, reachable through the admin surface instead.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Settings {
    pub admin_username: String,
    pub admin_password: String,
    pub jwt_secret: String,
    pub listen_addr: String,
    pub log_level: String,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

pub fn load() -> Settings {
    Settings {
        admin_username: env_or("ADMIN_USERNAME", "admin"),
        admin_password: env_or("ADMIN_PASSWORD", "admin"),
        jwt_secret: env_or("JWT_SECRET", "change-me-in-production"),
        listen_addr: env_or("GATEWAY_LISTEN_ADDR", "127.0.0.1:8787"),
        log_level: env_or("GATEWAY_LOG_LEVEL", "info"),
    }
}

/// Per-operation upstream timeouts.
pub const EMBEDDINGS_TIMEOUT: Duration = Duration::from_secs(60);
pub const IMAGE_GENERATION_TIMEOUT: Duration = Duration::from_secs(120);
pub const CHAT_TIMEOUT: Duration = Duration::from_secs(300);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable_when_env_unset() {
        std::env::remove_var("ADMIN_USERNAME");
        std::env::remove_var("GATEWAY_LISTEN_ADDR");
        let settings = load();
        assert_eq!(settings.admin_username, "admin");
        assert_eq!(settings.listen_addr, "127.0.0.1:8787");
    }
}
