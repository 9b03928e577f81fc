use std::env;

use anyhow::{anyhow, bail, Result};

/// Models relayed when `ALLOWED_MODELS` is not set.
pub const DEFAULT_ALLOWED_MODELS: [&str; 2] =
    ["z-ai/glm-4.5-air:free", "qwen/qwen2.5-vl-32b-instruct:free"];

const DEFAULT_UPSTREAM_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
const DEFAULT_APP_URL: &str = "http://localhost:3001";

#[derive(Debug, Clone)]
pub struct RotationConfig {
    pub max_bytes: Option<u64>,
    pub keep: usize,
    pub compress: bool,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Bearer key for the upstream completion API. Required.
    pub api_key: String,
    pub upstream_url: String,
    /// Public URL of this deployment, sent upstream as the referer.
    pub app_url: String,
    pub allowed_models: Vec<String>,
    /// CORS origin allow-list. Empty allows any origin, which is refused in
    /// production.
    pub allowed_origins: Vec<String>,
    pub production: bool,
    pub rate_limit_window_secs: u64,
    pub rate_limit_max: usize,
    pub csrf_token_ttl_secs: u64,
    /// Maximum accepted JSON body size in bytes.
    pub max_request_bytes: usize,
    pub upstream_timeout_ms: u64,
    pub log_file: Option<String>,
    pub rotation: RotationConfig,
}

impl AppConfig {
    /// Read configuration from the environment:
    ///
    /// * `OPENROUTER_API_KEY` (required) – upstream credential.
    /// * `UPSTREAM_URL`, `APP_URL`, `ALLOWED_MODELS`, `ALLOWED_ORIGINS` (csv).
    /// * `APP_ENV` – `production` enables Secure cookies and mandatory origins.
    /// * `RATE_LIMIT_WINDOW_SECS` / `RATE_LIMIT_MAX` – proxy endpoint budget.
    /// * `CSRF_TOKEN_TTL_SECS`, `MAX_REQUEST_BYTES`, `UPSTREAM_TIMEOUT_MS`.
    /// * `LOG_FILE` plus `LOG_MAX_BYTES` / `LOG_ROTATE_KEEP` /
    ///   `LOG_ROTATE_COMPRESS` for the JSONL request log.
    pub fn from_env() -> Result<Self> {
        let api_key = env::var("OPENROUTER_API_KEY")
            .map_err(|_| anyhow!("Missing OPENROUTER_API_KEY in environment"))?;
        if api_key.trim().is_empty() {
            bail!("OPENROUTER_API_KEY must not be empty");
        }

        let production = env::var("APP_ENV")
            .map(|v| v.trim().eq_ignore_ascii_case("production"))
            .unwrap_or(false);

        let allowed_origins = parse_csv("ALLOWED_ORIGINS");
        if production && allowed_origins.is_empty() {
            bail!("ALLOWED_ORIGINS must be set in production");
        }

        let mut allowed_models = parse_csv("ALLOWED_MODELS");
        if allowed_models.is_empty() {
            allowed_models = DEFAULT_ALLOWED_MODELS
                .iter()
                .map(|m| m.to_string())
                .collect();
        }

        let rotation = RotationConfig {
            max_bytes: parse_optional_u64("LOG_MAX_BYTES")?,
            keep: parse_optional_u64("LOG_ROTATE_KEEP")?.unwrap_or(1) as usize,
            compress: parse_bool_env("LOG_ROTATE_COMPRESS")?.unwrap_or(false),
        };

        Ok(Self {
            api_key,
            upstream_url: env::var("UPSTREAM_URL")
                .unwrap_or_else(|_| DEFAULT_UPSTREAM_URL.to_string()),
            app_url: env::var("APP_URL").unwrap_or_else(|_| DEFAULT_APP_URL.to_string()),
            allowed_models,
            allowed_origins,
            production,
            rate_limit_window_secs: parse_optional_u64("RATE_LIMIT_WINDOW_SECS")?.unwrap_or(60),
            rate_limit_max: parse_optional_u64("RATE_LIMIT_MAX")?.unwrap_or(15) as usize,
            csrf_token_ttl_secs: parse_optional_u64("CSRF_TOKEN_TTL_SECS")?.unwrap_or(3_600),
            max_request_bytes: parse_optional_u64("MAX_REQUEST_BYTES")?.unwrap_or(50 * 1024)
                as usize,
            upstream_timeout_ms: parse_optional_u64("UPSTREAM_TIMEOUT_MS")?
                .unwrap_or(crate::upstream::DEFAULT_UPSTREAM_TIMEOUT_MS),
            log_file: env::var("LOG_FILE").ok(),
            rotation,
        })
    }
}

fn parse_csv(var: &str) -> Vec<String> {
    env::var(var)
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn parse_optional_u64(var: &str) -> Result<Option<u64>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a positive integer", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool_env(var: &str) -> Result<Option<bool>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value)
            .map(Some)
            .ok_or_else(|| anyhow!("{} must be a boolean (true/false/1/0)", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;
    use std::sync::Mutex;

    static ENV_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    const ALL_VARS: [&str; 15] = [
        "OPENROUTER_API_KEY",
        "UPSTREAM_URL",
        "APP_URL",
        "ALLOWED_MODELS",
        "ALLOWED_ORIGINS",
        "APP_ENV",
        "RATE_LIMIT_WINDOW_SECS",
        "RATE_LIMIT_MAX",
        "CSRF_TOKEN_TTL_SECS",
        "MAX_REQUEST_BYTES",
        "UPSTREAM_TIMEOUT_MS",
        "LOG_FILE",
        "LOG_MAX_BYTES",
        "LOG_ROTATE_KEEP",
        "LOG_ROTATE_COMPRESS",
    ];

    fn clear_env() {
        for var in ALL_VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn requires_api_key() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        let err = AppConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("OPENROUTER_API_KEY"));
    }

    #[test]
    fn parses_environment_defaults() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        std::env::set_var("OPENROUTER_API_KEY", "sk-test");

        let cfg = AppConfig::from_env().unwrap();
        assert_eq!(cfg.allowed_models, DEFAULT_ALLOWED_MODELS.to_vec());
        assert!(cfg.allowed_origins.is_empty());
        assert!(!cfg.production);
        assert_eq!(cfg.rate_limit_window_secs, 60);
        assert_eq!(cfg.rate_limit_max, 15);
        assert_eq!(cfg.csrf_token_ttl_secs, 3_600);
        assert_eq!(cfg.max_request_bytes, 50 * 1024);
        assert_eq!(cfg.upstream_timeout_ms, 30_000);
        assert!(cfg.log_file.is_none());
        assert_eq!(cfg.rotation.keep, 1);

        clear_env();
    }

    #[test]
    fn production_without_origins_is_refused() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        std::env::set_var("OPENROUTER_API_KEY", "sk-test");
        std::env::set_var("APP_ENV", "production");

        let err = AppConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("ALLOWED_ORIGINS"));

        clear_env();
    }

    #[test]
    fn parses_full_configuration() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        std::env::set_var("OPENROUTER_API_KEY", "sk-test");
        std::env::set_var("UPSTREAM_URL", "http://127.0.0.1:9/v1/chat/completions");
        std::env::set_var("APP_URL", "https://chat.example.com");
        std::env::set_var("ALLOWED_MODELS", "alpha/one:free, beta/two:free");
        std::env::set_var("ALLOWED_ORIGINS", "https://chat.example.com");
        std::env::set_var("APP_ENV", "production");
        std::env::set_var("RATE_LIMIT_WINDOW_SECS", "30");
        std::env::set_var("RATE_LIMIT_MAX", "5");
        std::env::set_var("CSRF_TOKEN_TTL_SECS", "120");
        std::env::set_var("MAX_REQUEST_BYTES", "1024");
        std::env::set_var("UPSTREAM_TIMEOUT_MS", "5000");
        std::env::set_var("LOG_FILE", "/tmp/requests.log");
        std::env::set_var("LOG_MAX_BYTES", "4096");
        std::env::set_var("LOG_ROTATE_KEEP", "3");
        std::env::set_var("LOG_ROTATE_COMPRESS", "true");

        let cfg = AppConfig::from_env().unwrap();
        assert_eq!(cfg.upstream_url, "http://127.0.0.1:9/v1/chat/completions");
        assert_eq!(cfg.app_url, "https://chat.example.com");
        assert_eq!(
            cfg.allowed_models,
            vec!["alpha/one:free".to_string(), "beta/two:free".to_string()]
        );
        assert!(cfg.production);
        assert_eq!(cfg.rate_limit_window_secs, 30);
        assert_eq!(cfg.rate_limit_max, 5);
        assert_eq!(cfg.csrf_token_ttl_secs, 120);
        assert_eq!(cfg.max_request_bytes, 1024);
        assert_eq!(cfg.upstream_timeout_ms, 5000);
        assert_eq!(cfg.log_file.as_deref(), Some("/tmp/requests.log"));
        assert_eq!(cfg.rotation.max_bytes, Some(4096));
        assert_eq!(cfg.rotation.keep, 3);
        assert!(cfg.rotation.compress);

        clear_env();
    }

    #[test]
    fn rejects_non_numeric_limits() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        std::env::set_var("OPENROUTER_API_KEY", "sk-test");
        std::env::set_var("RATE_LIMIT_MAX", "lots");

        let err = AppConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("RATE_LIMIT_MAX"));

        clear_env();
    }
}
