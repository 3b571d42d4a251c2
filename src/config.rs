//! Runtime configuration from environment variables, optionally seeded from a
//! `.env` file. Values already present in the process environment win.

use log::info;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::client::RetryPolicy;
use crate::models::pointt::GatewayId;
use crate::tokens::TokenState;

pub const DEFAULT_TOKENS_FILE: &str = "tokens.json";
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 1800;
pub const DEFAULT_BULK_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 800;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_TOKEN_EXPIRY_MARGIN_SECS: u64 = 300;

#[derive(Debug, Clone)]
pub struct Config {
    /// Initial refresh token from the identity provider's browser login.
    pub refresh_token: Option<String>,
    /// Rotated tokens are persisted here and preferred over `refresh_token`.
    pub tokens_file: PathBuf,
    pub gateway_id: Option<GatewayId>,
    pub sync_interval: Duration,
    /// Attempts for both bulk retry layers (empty payload and network).
    pub bulk_max_attempts: NonZeroU32,
    pub retry_base_delay: Duration,
    pub http_timeout: Duration,
    pub token_expiry_margin: Duration,
    pub readings_file: Option<PathBuf>,
}

fn parse_or<T: FromStr>(value: Option<String>, key: &str, default: T) -> Result<T, String> {
    match value {
        Some(s) if !s.trim().is_empty() => s
            .trim()
            .parse::<T>()
            .map_err(|_| format!("{} has an invalid value: {}", key, s.trim())),
        _ => Ok(default),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let tokens_file = non_empty(lookup("IVT_TOKENS_FILE")).unwrap_or_else(|| DEFAULT_TOKENS_FILE.to_string());

        let sync_secs = parse_or(lookup("SYNC_INTERVAL_SECS"), "SYNC_INTERVAL_SECS", DEFAULT_SYNC_INTERVAL_SECS)?;
        if sync_secs == 0 {
            return Err("SYNC_INTERVAL_SECS must be greater than zero".to_string());
        }
        let attempts = parse_or(lookup("BULK_MAX_ATTEMPTS"), "BULK_MAX_ATTEMPTS", DEFAULT_BULK_MAX_ATTEMPTS)?;
        let bulk_max_attempts =
            NonZeroU32::new(attempts).ok_or_else(|| "BULK_MAX_ATTEMPTS must be at least 1".to_string())?;
        let retry_ms = parse_or(lookup("RETRY_BASE_DELAY_MS"), "RETRY_BASE_DELAY_MS", DEFAULT_RETRY_BASE_DELAY_MS)?;
        let timeout_secs = parse_or(lookup("HTTP_TIMEOUT_SECS"), "HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT_SECS)?;
        let margin_secs = parse_or(
            lookup("TOKEN_EXPIRY_MARGIN_SECS"),
            "TOKEN_EXPIRY_MARGIN_SECS",
            DEFAULT_TOKEN_EXPIRY_MARGIN_SECS,
        )?;

        Ok(Config {
            refresh_token: non_empty(lookup("IVT_REFRESH_TOKEN")),
            tokens_file: PathBuf::from(tokens_file),
            gateway_id: non_empty(lookup("IVT_GATEWAY_ID")).map(GatewayId),
            sync_interval: Duration::from_secs(sync_secs),
            bulk_max_attempts,
            retry_base_delay: Duration::from_millis(retry_ms),
            http_timeout: Duration::from_secs(timeout_secs),
            token_expiry_margin: Duration::from_secs(margin_secs),
            readings_file: non_empty(lookup("READINGS_FILE")).map(PathBuf::from),
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.bulk_max_attempts,
            base_delay: self.retry_base_delay,
        }
    }

    /// Tokens file when present (it holds the latest rotation), else the
    /// configured refresh token.
    pub fn initial_token_state(&self) -> Result<TokenState, String> {
        if self.tokens_file.is_file() {
            let state = TokenState::load(&self.tokens_file)?;
            if !state.refresh_token.trim().is_empty() {
                info!("Using tokens from {}", self.tokens_file.display());
                return Ok(state);
            }
        }
        match &self.refresh_token {
            Some(token) => Ok(TokenState::from_refresh_token(token.clone())),
            None => Err(format!(
                "Missing refresh token: set IVT_REFRESH_TOKEN or provide {}",
                self.tokens_file.display()
            )),
        }
    }
}

pub fn load_env_file(path: &Path) -> Result<(), String> {
    let file = File::open(path).map_err(|e| format!("failed to open {}: {}", path.display(), e))?;
    let reader = BufReader::new(file);

    for (index, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| format!("failed to read {} at line {}: {}", path.display(), index + 1, e))?;
        match parse_env_assignment(&line) {
            Ok(Some((key, value))) => {
                // Keep values already supplied via the process environment.
                if std::env::var_os(&key).is_none() {
                    // Updating process-level environment variables is unsafe on some targets.
                    unsafe {
                        std::env::set_var(key, value);
                    }
                }
            }
            Ok(None) => {}
            Err(e) => return Err(format!("{}:{}: {}", path.display(), index + 1, e)),
        }
    }

    Ok(())
}

fn parse_env_assignment(line: &str) -> Result<Option<(String, String)>, String> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }

    let without_export = trimmed
        .strip_prefix("export ")
        .map(str::trim_start)
        .unwrap_or(trimmed);

    let (key, value_part) = without_export
        .split_once('=')
        .ok_or_else(|| "missing '=' in assignment".to_string())?;
    let key = key.trim();
    if key.is_empty() {
        return Err("environment variable name cannot be empty".to_string());
    }
    if key.chars().any(char::is_whitespace) {
        return Err(format!("environment variable name contains whitespace: {}", key));
    }

    Ok(Some((key.to_string(), parse_env_value(value_part)?)))
}

fn parse_env_value(raw: &str) -> Result<String, String> {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix('"') {
        parse_quoted(rest, '"', true)
    } else if let Some(rest) = trimmed.strip_prefix('\'') {
        parse_quoted(rest, '\'', false)
    } else {
        let value = trimmed.split('#').next().unwrap_or_default().trim_end();
        Ok(value.to_string())
    }
}

fn parse_quoted(input: &str, quote: char, escapes: bool) -> Result<String, String> {
    let mut result = String::new();
    let mut chars = input.chars();
    let mut escape = false;

    while let Some(ch) = chars.next() {
        if escape {
            result.push(match ch {
                'n' => '\n',
                'r' => '\r',
                't' => '\t',
                other => other,
            });
            escape = false;
        } else if escapes && ch == '\\' {
            escape = true;
        } else if ch == quote {
            let remainder = chars.as_str().trim();
            return if remainder.is_empty() || remainder.starts_with('#') {
                Ok(result)
            } else {
                Err(format!("unexpected characters after closing {} quote", quote))
            };
        } else {
            result.push(ch);
        }
    }

    Err(format!("unterminated {}-quoted value", quote))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config, String> {
        let vars = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let cfg = config(&[("IVT_REFRESH_TOKEN", " refresh-1 ")]).unwrap();
        assert_eq!(cfg.refresh_token.as_deref(), Some("refresh-1"));
        assert_eq!(cfg.tokens_file, PathBuf::from("tokens.json"));
        assert_eq!(cfg.gateway_id, None);
        assert_eq!(cfg.sync_interval, Duration::from_secs(1800));
        assert_eq!(cfg.retry_policy(), RetryPolicy::default());
        assert_eq!(cfg.http_timeout, Duration::from_secs(30));
        assert_eq!(cfg.token_expiry_margin, Duration::from_secs(300));
        assert_eq!(cfg.readings_file, None);
    }

    #[test]
    fn overrides_and_validation() {
        let cfg = config(&[
            ("IVT_GATEWAY_ID", "101503333"),
            ("SYNC_INTERVAL_SECS", "600"),
            ("BULK_MAX_ATTEMPTS", "5"),
            ("RETRY_BASE_DELAY_MS", "0"),
            ("READINGS_FILE", "/tmp/readings.json"),
        ])
        .unwrap();
        assert_eq!(cfg.gateway_id, Some(GatewayId("101503333".into())));
        assert_eq!(cfg.sync_interval, Duration::from_secs(600));
        assert_eq!(cfg.bulk_max_attempts.get(), 5);
        assert_eq!(cfg.retry_base_delay, Duration::ZERO);
        assert_eq!(cfg.readings_file, Some(PathBuf::from("/tmp/readings.json")));

        assert!(config(&[("BULK_MAX_ATTEMPTS", "0")]).is_err());
        assert!(config(&[("SYNC_INTERVAL_SECS", "0")]).is_err());
        assert!(config(&[("HTTP_TIMEOUT_SECS", "soon")]).unwrap_err().contains("HTTP_TIMEOUT_SECS"));
    }

    #[test]
    fn initial_tokens_prefer_the_tokens_file() {
        let dir = std::env::temp_dir().join(format!("config-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("tokens.json");
        let tokens_file = path.to_str().unwrap();

        let cfg = config(&[("IVT_TOKENS_FILE", tokens_file), ("IVT_REFRESH_TOKEN", "from-env")]).unwrap();
        assert_eq!(cfg.initial_token_state().unwrap().refresh_token, "from-env");

        std::fs::write(&path, r#"{"access_token":"a","refresh_token":"from-file","expires_at":1700000000}"#).unwrap();
        assert_eq!(cfg.initial_token_state().unwrap().refresh_token, "from-file");

        std::fs::remove_dir_all(&dir).unwrap();
        let cfg = config(&[("IVT_TOKENS_FILE", tokens_file)]).unwrap();
        assert!(cfg.initial_token_state().unwrap_err().contains("IVT_REFRESH_TOKEN"));
    }

    #[test]
    fn env_assignments() {
        assert_eq!(parse_env_assignment("  # comment").unwrap(), None);
        assert_eq!(parse_env_assignment("").unwrap(), None);
        assert_eq!(
            parse_env_assignment("export IVT_GATEWAY_ID=101 # main unit").unwrap(),
            Some(("IVT_GATEWAY_ID".into(), "101".into()))
        );
        assert_eq!(
            parse_env_assignment(r#"IVT_REFRESH_TOKEN="a\"b=c\n""#).unwrap(),
            Some(("IVT_REFRESH_TOKEN".into(), "a\"b=c\n".into()))
        );
        assert_eq!(
            parse_env_assignment(r"READINGS_FILE='C:\data\r.json'").unwrap(),
            Some(("READINGS_FILE".into(), r"C:\data\r.json".into()))
        );
        assert_eq!(parse_env_assignment("EMPTY=").unwrap(), Some(("EMPTY".into(), String::new())));
        assert!(parse_env_assignment("NO_EQUALS").is_err());
        assert!(parse_env_assignment("BAD KEY=1").is_err());
        assert!(parse_env_assignment(r#"X="unterminated"#).is_err());
        assert!(parse_env_assignment(r#"X="a" trailing"#).is_err());
    }
}
