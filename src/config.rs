use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Tunables shared by the auction core, independent of how the process is run.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct EngineSettings {
    pub max_payload_bytes: usize,
    pub response_mapping_ttl_secs: u64,
    pub retry_sweep_interval_secs: u64,
    pub webhook_max_age_secs: u64,
    pub max_concurrent_pings: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_payload_bytes: 64 * 1024,
            response_mapping_ttl_secs: 60,
            retry_sweep_interval_secs: 30,
            webhook_max_age_secs: 300,
            max_concurrent_pings: 32,
        }
    }
}

impl EngineSettings {
    pub fn response_mapping_ttl(&self) -> Duration {
        Duration::from_secs(self.response_mapping_ttl_secs)
    }

    pub fn retry_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.retry_sweep_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub port: u16,
    /// JSON file holding a `BuyerConfig` array, loaded at startup.
    pub buyers_config_path: Option<String>,
    /// Per-buyer webhook HMAC secrets.
    pub webhook_secrets: HashMap<String, String>,
    pub engine: EngineSettings,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = EngineSettings::default();

        let config = Self {
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a valid number between 1-65535"))?,
            buyers_config_path: std::env::var("BUYERS_CONFIG_PATH")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            webhook_secrets: parse_secrets(&std::env::var("WEBHOOK_SECRETS").unwrap_or_default())?,
            engine: EngineSettings {
                max_payload_bytes: positive_var("MAX_PAYLOAD_BYTES", defaults.max_payload_bytes)?,
                response_mapping_ttl_secs: positive_var(
                    "RESPONSE_MAPPING_TTL_SECS",
                    defaults.response_mapping_ttl_secs,
                )?,
                retry_sweep_interval_secs: positive_var(
                    "RETRY_SWEEP_INTERVAL_SECS",
                    defaults.retry_sweep_interval_secs,
                )?,
                webhook_max_age_secs: positive_var(
                    "WEBHOOK_MAX_AGE_SECS",
                    defaults.webhook_max_age_secs,
                )?,
                max_concurrent_pings: positive_var(
                    "MAX_CONCURRENT_PINGS",
                    defaults.max_concurrent_pings,
                )?,
            },
        };

        // Log successful configuration load (without secret values)
        tracing::info!("Configuration loaded successfully");
        tracing::debug!("Server Port: {}", config.port);
        if let Some(ref path) = config.buyers_config_path {
            tracing::info!("Buyer configuration file: {}", path);
        }
        tracing::debug!(
            "Webhook secrets configured for {} buyer(s)",
            config.webhook_secrets.len()
        );
        tracing::debug!("Engine settings: {:?}", config.engine);

        Ok(config)
    }
}

/// Reads a positive integer variable, falling back to `default` when unset.
fn positive_var<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => {
            let value: T = raw
                .trim()
                .parse()
                .map_err(|_| anyhow::anyhow!("{} must be a positive integer", name))?;
            if value <= T::default() {
                anyhow::bail!("{} must be greater than zero", name);
            }
            Ok(value)
        }
        _ => Ok(default),
    }
}

/// Parses `buyer_id=secret,buyer_id=secret`.
pub fn parse_secrets(raw: &str) -> anyhow::Result<HashMap<String, String>> {
    let mut secrets = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (buyer, secret) = pair.split_once('=').ok_or_else(|| {
            anyhow::anyhow!("WEBHOOK_SECRETS entry '{}' must be buyer=secret", pair)
        })?;
        let (buyer, secret) = (buyer.trim(), secret.trim());
        if buyer.is_empty() || secret.is_empty() {
            anyhow::bail!("WEBHOOK_SECRETS entries cannot have an empty buyer or secret");
        }
        secrets.insert(buyer.to_string(), secret.to_string());
    }
    Ok(secrets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_secrets() {
        let secrets = parse_secrets(" acme=abc , globex=x=y ").unwrap();
        assert_eq!(secrets["acme"], "abc");
        assert_eq!(secrets["globex"], "x=y");
        assert!(parse_secrets("").unwrap().is_empty());
        assert!(parse_secrets("no-separator").is_err());
        assert!(parse_secrets("=secret").is_err());
    }

    #[test]
    fn test_engine_defaults() {
        let settings = EngineSettings::default();
        assert_eq!(settings.max_payload_bytes, 65_536);
        assert_eq!(settings.response_mapping_ttl(), Duration::from_secs(60));
        assert_eq!(settings.retry_sweep_interval(), Duration::from_secs(30));
    }
}
