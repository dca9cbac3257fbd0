//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence
//! (highest to lowest):
//! 1. Two environment variables spelled out in the wire contract verbatim:
//!    `REDIS_ENABLED` and `ZERV_MAX_ACTIVE_SESSION_TIMEOUT_IN_MINS`.
//! 2. Environment variables (prefix: `ZERV_`, e.g. `ZERV_AUTH_SECRET`)
//! 3. Current working directory: ./config.toml
//! 4. XDG config directory: ~/.config/zerv-core/{service_name}/config.toml
//! 5. System directory: /etc/zerv-core/{service_name}/config.toml
//! 6. Default values

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::middleware::request_tracking::RequestTrackingConfig;

/// Default tenant active-session timeout, in minutes, per spec.md ("default 12*60").
pub const DEFAULT_TENANT_SESSION_TIMEOUT_MINS: u32 = 12 * 60;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Service-level configuration (bind port, timeout).
    pub service: ServiceConfig,

    /// Authentication state-machine / session policy (§6 "Configuration options").
    pub auth: AuthConfig,

    /// Middleware configuration.
    #[serde(default)]
    pub middleware: MiddlewareConfig,

    /// Cluster key/value store configuration (optional; absence forces the
    /// Local cache backend regardless of `REDIS_ENABLED`).
    #[serde(default)]
    pub redis: Option<RedisConfig>,

    /// `NODE_ENV`, used as a suffix for the local cache persistence file name.
    #[serde(default = "default_node_env")]
    pub node_env: String,
}

/// Service-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name.
    pub name: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Environment (dev, staging, production).
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// Authentication / session policy, mirroring spec.md §6's "Configuration options".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Signing/verification secret. No default: a missing secret is a
    /// configuration error at startup.
    pub secret: String,

    /// Auth-code lifetime in seconds (default 5).
    #[serde(default = "default_code_expires_in_secs")]
    pub code_expires_in_secs: i64,

    /// Advisory `dur` hint, in minutes (default 1440).
    #[serde(default = "default_token_refresh_interval_in_mins")]
    pub token_refresh_interval_in_mins: i64,

    /// Socket "authenticate-or-die" timeout in milliseconds (default 5000).
    #[serde(default = "default_auth_timeout_ms")]
    pub auth_timeout_ms: u64,

    /// Local-session garbage-collection period/threshold in minutes (default 5).
    #[serde(default = "default_inactive_local_user_session_timeout_in_mins")]
    pub inactive_local_user_session_timeout_in_mins: i64,

    /// Fallback tenant active-session timeout in minutes, read from
    /// `ZERV_MAX_ACTIVE_SESSION_TIMEOUT_IN_MINS` (default 720).
    #[serde(default = "default_tenant_session_timeout_mins")]
    pub tenant_session_timeout_default_mins: i64,

    /// Maximum accepted socket payload size in bytes (default ~100 MB),
    /// carried for parity with spec.md even though the transport that would
    /// enforce it is an external collaborator.
    #[serde(default = "default_max_http_buffer_size")]
    pub max_http_buffer_size: usize,
}

/// Cluster key/value store (Redis) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Whether the cluster backend is enabled. Sourced from `REDIS_ENABLED`
    /// in addition to the structured config layer.
    #[serde(default = "default_false")]
    pub enabled: bool,

    /// Redis host, sourced from `REDIS_HOST`.
    #[serde(default = "default_redis_host")]
    pub host: String,

    /// Redis port, sourced from `REDIS_PORT`.
    #[serde(default = "default_redis_port")]
    pub port: u16,

    /// Maximum number of pooled connections.
    #[serde(default = "default_redis_max_connections")]
    pub max_connections: usize,

    /// Connection timeout in seconds.
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Maximum retry attempts establishing the initial connection.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between retry attempts in seconds.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

impl RedisConfig {
    /// Standard `redis://host:port` connection URL.
    pub fn url(&self) -> String {
        format!("redis://{}:{}", self.host, self.port)
    }
}

/// Middleware configuration (request tracking, body limits, CORS).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiddlewareConfig {
    /// Request tracking configuration (request IDs, header propagation).
    #[serde(default)]
    pub request_tracking: RequestTrackingConfig,

    /// Request body size limit in MB.
    #[serde(default = "default_body_limit_mb")]
    pub body_limit_mb: usize,

    /// Enable panic recovery middleware.
    #[serde(default = "default_true")]
    pub catch_panic: bool,

    /// Enable compression.
    #[serde(default = "default_true")]
    pub compression: bool,

    /// CORS configuration.
    #[serde(default = "default_cors_mode")]
    pub cors_mode: String,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            request_tracking: RequestTrackingConfig::default(),
            body_limit_mb: default_body_limit_mb(),
            catch_panic: true,
            compression: true,
            cors_mode: default_cors_mode(),
        }
    }
}

// Default value functions

fn default_port() -> u16 {
    8080
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_timeout() -> u64 {
    30
}
fn default_environment() -> String {
    "dev".to_string()
}
fn default_node_env() -> String {
    std::env::var("NODE_ENV").unwrap_or_else(|_| "development".to_string())
}
fn default_code_expires_in_secs() -> i64 {
    5
}
fn default_token_refresh_interval_in_mins() -> i64 {
    1440
}
fn default_auth_timeout_ms() -> u64 {
    5000
}
fn default_inactive_local_user_session_timeout_in_mins() -> i64 {
    5
}
fn default_tenant_session_timeout_mins() -> i64 {
    std::env::var("ZERV_MAX_ACTIVE_SESSION_TIMEOUT_IN_MINS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_TENANT_SESSION_TIMEOUT_MINS as i64)
}
fn default_max_http_buffer_size() -> usize {
    100 * 1024 * 1024
}
fn default_redis_host() -> String {
    std::env::var("REDIS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}
fn default_redis_port() -> u16 {
    std::env::var("REDIS_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(6379)
}
fn default_redis_max_connections() -> usize {
    20
}
fn default_connection_timeout() -> u64 {
    10
}
fn default_max_retries() -> u32 {
    5
}
fn default_retry_delay() -> u64 {
    2
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_body_limit_mb() -> usize {
    10
}
fn default_cors_mode() -> String {
    "permissive".to_string()
}

fn env_flag_enabled(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|v| {
        matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

impl Config {
    /// Load configuration from all sources for a service name inferred from
    /// the binary name.
    pub fn load() -> Result<Self> {
        let service_name = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "zerv-core".to_string());

        Self::load_for_service(&service_name)
    }

    /// Load configuration for a specific service name.
    pub fn load_for_service(service_name: &str) -> Result<Self> {
        let config_paths = Self::find_config_paths(service_name);

        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        for path in config_paths.iter().rev() {
            if path.exists() {
                tracing::info!("Loading configuration from: {}", path.display());
                figment = figment.merge(Toml::file(path));
            }
        }

        figment = figment.merge(Env::prefixed("ZERV_").split("_"));

        let mut config: Config = figment.extract()?;
        config.apply_literal_env_vars();
        Ok(config)
    }

    /// Load configuration from a specific file, bypassing XDG directories.
    pub fn load_from(path: &str) -> Result<Self> {
        let mut config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("ZERV_").split("_"))
            .extract()?;
        config.apply_literal_env_vars();
        Ok(config)
    }

    /// Layer the two literal environment variables spec.md §6 names
    /// (`REDIS_ENABLED`, `ZERV_MAX_ACTIVE_SESSION_TIMEOUT_IN_MINS`) on top of
    /// whatever figment resolved, so they win regardless of prefixing.
    fn apply_literal_env_vars(&mut self) {
        if let Some(enabled) = env_flag_enabled("REDIS_ENABLED") {
            let redis = self.redis.get_or_insert_with(|| RedisConfig {
                enabled,
                host: default_redis_host(),
                port: default_redis_port(),
                max_connections: default_redis_max_connections(),
                connection_timeout_secs: default_connection_timeout(),
                max_retries: default_max_retries(),
                retry_delay_secs: default_retry_delay(),
            });
            redis.enabled = enabled;
        }

        if let Ok(mins) = std::env::var("ZERV_MAX_ACTIVE_SESSION_TIMEOUT_IN_MINS") {
            if let Ok(mins) = mins.parse::<i64>() {
                self.auth.tenant_session_timeout_default_mins = mins;
            }
        }
    }

    fn find_config_paths(service_name: &str) -> Vec<PathBuf> {
        let mut paths = Vec::new();

        paths.push(PathBuf::from("config.toml"));

        let xdg_dirs = xdg::BaseDirectories::with_prefix("zerv-core");
        let config_file_path = Path::new(service_name).join("config.toml");
        if let Ok(path) = xdg_dirs.place_config_file(&config_file_path) {
            paths.push(path);
        }

        paths.push(
            PathBuf::from("/etc/zerv-core")
                .join(service_name)
                .join("config.toml"),
        );

        paths
    }

    /// Where a service's config file should live in production.
    pub fn recommended_path(service_name: &str) -> PathBuf {
        let xdg_dirs = xdg::BaseDirectories::with_prefix("zerv-core");
        let config_file_path = Path::new(service_name).join("config.toml");
        xdg_dirs
            .place_config_file(&config_file_path)
            .unwrap_or_else(|_| {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| String::from("~")))
                    .join(".config/zerv-core")
                    .join(service_name)
                    .join("config.toml")
            })
    }

    /// Redis connection URL, if the cluster backend is configured.
    pub fn redis_url(&self) -> Option<String> {
        self.redis.as_ref().map(|r| r.url())
    }

    /// Whether the cluster cache backend should be used: an explicit
    /// `RedisConfig` must be present AND enabled (§4.B "Selection is
    /// determined at call time").
    pub fn cluster_cache_enabled(&self) -> bool {
        self.redis.as_ref().is_some_and(|r| r.enabled)
    }

    /// The auth-code timeout as a [`Duration`].
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth.auth_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                name: "zerv-core".to_string(),
                port: default_port(),
                log_level: default_log_level(),
                timeout_secs: default_timeout(),
                environment: default_environment(),
            },
            auth: AuthConfig {
                secret: String::new(),
                code_expires_in_secs: default_code_expires_in_secs(),
                token_refresh_interval_in_mins: default_token_refresh_interval_in_mins(),
                auth_timeout_ms: default_auth_timeout_ms(),
                inactive_local_user_session_timeout_in_mins:
                    default_inactive_local_user_session_timeout_in_mins(),
                tenant_session_timeout_default_mins: default_tenant_session_timeout_mins(),
                max_http_buffer_size: default_max_http_buffer_size(),
            },
            middleware: MiddlewareConfig::default(),
            redis: None,
            node_env: default_node_env(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service.port, 8080);
        assert_eq!(config.auth.code_expires_in_secs, 5);
        assert_eq!(config.auth.token_refresh_interval_in_mins, 1440);
        assert_eq!(config.auth.inactive_local_user_session_timeout_in_mins, 5);
        assert!(!config.cluster_cache_enabled());
    }

    #[test]
    fn test_redis_url() {
        let redis = RedisConfig {
            enabled: true,
            host: "cache.internal".to_string(),
            port: 6380,
            max_connections: 10,
            connection_timeout_secs: 5,
            max_retries: 3,
            retry_delay_secs: 1,
        };
        assert_eq!(redis.url(), "redis://cache.internal:6380");
    }

    #[test]
    fn test_cluster_cache_enabled_requires_explicit_flag() {
        let mut config = Config::default();
        assert!(!config.cluster_cache_enabled());
        config.redis = Some(RedisConfig {
            enabled: false,
            host: default_redis_host(),
            port: default_redis_port(),
            max_connections: default_redis_max_connections(),
            connection_timeout_secs: default_connection_timeout(),
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay(),
        });
        assert!(!config.cluster_cache_enabled());
        config.redis.as_mut().unwrap().enabled = true;
        assert!(config.cluster_cache_enabled());
    }
}
