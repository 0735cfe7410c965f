use crate::domain::Decimal;
use chrono_tz::Tz;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_path: String,
    pub hub_api_url: String,
    pub hub_token_file: Option<String>,
    pub market_timezone: Tz,
    pub vat_rate: Decimal,
    pub aconto_fallback_price_per_kwh: Decimal,
    pub poll_interval: Duration,
    pub effectuation_interval: Duration,
    pub settlement_interval: Duration,
    pub billing_interval: Duration,
    /// How long a settlement run or a claimed hub send may stay in flight
    /// before another caller may take it over.
    pub in_flight_lease: Duration,
    pub gateway: GatewayConfig,
}

/// Retry and timeout budget for calls to the market hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayConfig {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub call_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            call_timeout: Duration::from_millis(10_000),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_map(std::env::vars().collect())
    }

    pub fn from_env_map(env_map: HashMap<String, String>) -> Result<Self, ConfigError> {
        let port = parse_or(&env_map, "PORT", 8080u16, "must be a valid u16")?;

        let database_path = required(&env_map, "DATABASE_PATH")?;
        let hub_api_url = required(&env_map, "HUB_API_URL")?;
        let hub_token_file = env_map
            .get("HUB_TOKEN_FILE")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let market_timezone = env_map
            .get("MARKET_TIMEZONE")
            .map(|s| s.as_str())
            .unwrap_or("Europe/Copenhagen")
            .parse::<Tz>()
            .map_err(|e| ConfigError::InvalidValue("MARKET_TIMEZONE".to_string(), e.to_string()))?;

        let vat_rate = decimal_or(&env_map, "VAT_RATE", "0.25")?;
        if vat_rate.is_negative() {
            return Err(ConfigError::InvalidValue(
                "VAT_RATE".to_string(),
                "must not be negative".to_string(),
            ));
        }
        let aconto_fallback_price_per_kwh =
            decimal_or(&env_map, "ACONTO_FALLBACK_PRICE_PER_KWH", "2.5")?;

        let poll_interval = millis_or(&env_map, "POLL_INTERVAL_MS", 5_000)?;
        let effectuation_interval = millis_or(&env_map, "EFFECTUATION_INTERVAL_MS", 60_000)?;
        let settlement_interval = millis_or(&env_map, "SETTLEMENT_INTERVAL_MS", 300_000)?;
        let billing_interval = millis_or(&env_map, "BILLING_INTERVAL_MS", 300_000)?;
        let in_flight_lease = millis_or(&env_map, "IN_FLIGHT_LEASE_MS", 900_000)?;

        let max_attempts = parse_or(&env_map, "GATEWAY_MAX_ATTEMPTS", 5u32, "must be a valid u32")?;
        if max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "GATEWAY_MAX_ATTEMPTS".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        let gateway = GatewayConfig {
            max_attempts,
            initial_backoff: millis_or(&env_map, "GATEWAY_INITIAL_BACKOFF_MS", 200)?,
            call_timeout: millis_or(&env_map, "GATEWAY_TIMEOUT_MS", 10_000)?,
        };

        Ok(Config {
            port,
            database_path,
            hub_api_url,
            hub_token_file,
            market_timezone,
            vat_rate,
            aconto_fallback_price_per_kwh,
            poll_interval,
            effectuation_interval,
            settlement_interval,
            billing_interval,
            in_flight_lease,
            gateway,
        })
    }
}

fn required(env_map: &HashMap<String, String>, key: &str) -> Result<String, ConfigError> {
    env_map
        .get(key)
        .cloned()
        .ok_or_else(|| ConfigError::MissingEnv(key.to_string()))
}

fn parse_or<T: std::str::FromStr>(
    env_map: &HashMap<String, String>,
    key: &str,
    default: T,
    hint: &str,
) -> Result<T, ConfigError> {
    match env_map.get(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidValue(key.to_string(), hint.to_string())),
        None => Ok(default),
    }
}

fn decimal_or(
    env_map: &HashMap<String, String>,
    key: &str,
    default: &str,
) -> Result<Decimal, ConfigError> {
    let raw = env_map.get(key).map(|s| s.as_str()).unwrap_or(default);
    Decimal::from_str_canonical(raw)
        .map_err(|_| ConfigError::InvalidValue(key.to_string(), "must be a decimal".to_string()))
}

fn millis_or(
    env_map: &HashMap<String, String>,
    key: &str,
    default: u64,
) -> Result<Duration, ConfigError> {
    let ms = parse_or(env_map, key, default, "must be milliseconds as u64")?;
    if ms == 0 {
        return Err(ConfigError::InvalidValue(
            key.to_string(),
            "must be greater than zero".to_string(),
        ));
    }
    Ok(Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn setup_required_env() -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("DATABASE_PATH".to_string(), "/tmp/test.db".to_string());
        map.insert(
            "HUB_API_URL".to_string(),
            "https://hub.example.test".to_string(),
        );
        map
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_env_map(setup_required_env()).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.market_timezone, chrono_tz::Europe::Copenhagen);
        assert_eq!(config.vat_rate, Decimal::from_str("0.25").unwrap());
        assert_eq!(config.poll_interval, Duration::from_millis(5_000));
        assert_eq!(config.in_flight_lease, Duration::from_millis(900_000));
        assert_eq!(config.gateway, GatewayConfig::default());
        assert!(config.hub_token_file.is_none());
    }

    #[test]
    fn test_missing_database_path() {
        let mut env_map = setup_required_env();
        env_map.remove("DATABASE_PATH");
        let result = Config::from_env_map(env_map);
        match result {
            Err(ConfigError::MissingEnv(s)) => assert_eq!(s, "DATABASE_PATH"),
            _ => panic!("Expected MissingEnv error"),
        }
    }

    #[test]
    fn test_missing_hub_api_url() {
        let mut env_map = setup_required_env();
        env_map.remove("HUB_API_URL");
        let result = Config::from_env_map(env_map);
        match result {
            Err(ConfigError::MissingEnv(s)) => assert_eq!(s, "HUB_API_URL"),
            _ => panic!("Expected MissingEnv error"),
        }
    }

    #[test]
    fn test_invalid_port() {
        let mut env_map = setup_required_env();
        env_map.insert("PORT".to_string(), "not_a_number".to_string());
        let result = Config::from_env_map(env_map);
        match result {
            Err(ConfigError::InvalidValue(k, _)) => assert_eq!(k, "PORT"),
            _ => panic!("Expected InvalidValue error"),
        }
    }

    #[test]
    fn test_invalid_timezone() {
        let mut env_map = setup_required_env();
        env_map.insert("MARKET_TIMEZONE".to_string(), "Mars/Olympus".to_string());
        let result = Config::from_env_map(env_map);
        match result {
            Err(ConfigError::InvalidValue(k, _)) => assert_eq!(k, "MARKET_TIMEZONE"),
            _ => panic!("Expected InvalidValue error"),
        }
    }

    #[test]
    fn test_invalid_vat_rate() {
        let mut env_map = setup_required_env();
        env_map.insert("VAT_RATE".to_string(), "quarter".to_string());
        let result = Config::from_env_map(env_map);
        match result {
            Err(ConfigError::InvalidValue(k, _)) => assert_eq!(k, "VAT_RATE"),
            _ => panic!("Expected InvalidValue error"),
        }
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut env_map = setup_required_env();
        env_map.insert("POLL_INTERVAL_MS".to_string(), "0".to_string());
        let result = Config::from_env_map(env_map);
        match result {
            Err(ConfigError::InvalidValue(k, _)) => assert_eq!(k, "POLL_INTERVAL_MS"),
            _ => panic!("Expected InvalidValue error"),
        }
    }

    #[test]
    fn test_zero_max_attempts_rejected() {
        let mut env_map = setup_required_env();
        env_map.insert("GATEWAY_MAX_ATTEMPTS".to_string(), "0".to_string());
        assert!(matches!(
            Config::from_env_map(env_map),
            Err(ConfigError::InvalidValue(k, _)) if k == "GATEWAY_MAX_ATTEMPTS"
        ));
    }
}
