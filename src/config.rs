use crate::domain::Decimal;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Config {
    pub rpc_port: u16,
    pub database_path: String,
    /// Base URL of the persistence service's trades RPC. When unset the
    /// router queries the store directly (single-process deployment).
    pub persistence_service_url: Option<String>,
    pub bus_partitions: usize,
    pub batch_interval_ms: u64,
    pub memory_retention_ms: i64,
    pub queried_range_retention_ms: i64,
    pub market_buffer_size: usize,
    pub wait_timeout_ms: u64,
    pub trading_fee_per_mwh: Decimal,
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
        let rpc_port = parse_with_default(&env_map, "RPC_PORT", "8080")?;

        let database_path = env_map
            .get("DATABASE_PATH")
            .cloned()
            .ok_or_else(|| ConfigError::MissingEnv("DATABASE_PATH".to_string()))?;

        let persistence_service_url = env_map
            .get("PERSISTENCE_SERVICE_URL")
            .map(|s| s.trim().trim_end_matches('/').to_string())
            .filter(|s| !s.is_empty());

        let bus_partitions: usize = parse_with_default(&env_map, "BUS_PARTITIONS", "3")?;
        if bus_partitions == 0 {
            return Err(ConfigError::InvalidValue(
                "BUS_PARTITIONS".to_string(),
                "must be >= 1".to_string(),
            ));
        }

        let batch_interval_ms = parse_with_default(&env_map, "BATCH_INTERVAL_MS", "10000")?;
        let memory_retention_ms = parse_with_default(&env_map, "MEMORY_RETENTION_MS", "10000")?;
        let queried_range_retention_ms =
            parse_with_default(&env_map, "QUERIED_RANGE_RETENTION_MS", "60000")?;
        let market_buffer_size = parse_with_default(&env_map, "MARKET_BUFFER_SIZE", "100")?;
        let wait_timeout_ms = parse_with_default(&env_map, "WAIT_TIMEOUT_MS", "3000")?;

        let fee_raw = env_map
            .get("TRADING_FEE_PER_MWH")
            .map(|s| s.as_str())
            .unwrap_or("0.13");
        let trading_fee_per_mwh = Decimal::from_str_canonical(fee_raw).map_err(|_| {
            ConfigError::InvalidValue(
                "TRADING_FEE_PER_MWH".to_string(),
                "must be a decimal number".to_string(),
            )
        })?;

        Ok(Config {
            rpc_port,
            database_path,
            persistence_service_url,
            bus_partitions,
            batch_interval_ms,
            memory_retention_ms,
            queried_range_retention_ms,
            market_buffer_size,
            wait_timeout_ms,
            trading_fee_per_mwh,
        })
    }
}

fn parse_with_default<T: std::str::FromStr>(
    env_map: &HashMap<String, String>,
    key: &str,
    default: &str,
) -> Result<T, ConfigError> {
    env_map
        .get(key)
        .map(|s| s.as_str())
        .unwrap_or(default)
        .parse::<T>()
        .map_err(|_| {
            ConfigError::InvalidValue(
                key.to_string(),
                format!("must parse as {}", std::any::type_name::<T>()),
            )
        })
}
