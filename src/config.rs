use bluer::Address;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use tokio::time::Duration;

pub const DEFAULT_NAME_PREFIX: &str = "BluVib";
pub const DEFAULT_DISCOVERY_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_STREAM_CAPACITY: usize = 200;

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub sensors: HashMap<Address, String>,
    pub name_prefix: String,
    pub discovery_timeout: Duration,
    pub write_timeout: Duration,
    pub read_timeout: Duration,
    pub stream_capacity: usize,
    pub apply: Vec<(String, String)>,
    pub commit_after_apply: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            sensors: HashMap::new(),
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
            discovery_timeout: Duration::from_secs(DEFAULT_DISCOVERY_TIMEOUT_SECS),
            write_timeout: Duration::from_secs(DEFAULT_WRITE_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS),
            stream_capacity: DEFAULT_STREAM_CAPACITY,
            apply: Vec::new(),
            commit_after_apply: false,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        // Load environment variables
        dotenv::dotenv().ok();

        let mut sensors = HashMap::new();

        // Try BLUVIB_SENSORS format first
        if let Ok(list) = env::var("BLUVIB_SENSORS") {
            debug!("Found BLUVIB_SENSORS: '{}'", list);
            sensors = parse_sensor_list(&list);
        } else {
            // Fallback to individual environment variables
            debug!("BLUVIB_SENSORS environment variable not found, trying individual variables");
            for (key, value) in env::vars() {
                if let Some(index) = key
                    .strip_prefix("BLUVIB_SENSOR_")
                    .and_then(|s| s.strip_suffix("_ADDRESS"))
                {
                    let name_key = format!("BLUVIB_SENSOR_{}_NAME", index);
                    let name = env::var(&name_key).unwrap_or_else(|_| format!("Sensor {}", index));
                    match Address::from_str(value.trim()) {
                        Ok(address) => {
                            sensors.insert(address, name);
                        }
                        Err(_) => warn!("Ignoring {}: '{}' is not a device address", key, value),
                    }
                }
            }
        }

        info!("Total sensors configured: {}", sensors.len());
        for (address, name) in &sensors {
            debug!("Sensor: {} -> {}", address, name);
        }

        let apply = match env::var("BLUVIB_APPLY") {
            Ok(list) => parse_assignments(&list),
            Err(_) => Vec::new(),
        };

        Ok(SessionConfig {
            sensors,
            name_prefix: env::var("BLUVIB_NAME_PREFIX")
                .unwrap_or_else(|_| DEFAULT_NAME_PREFIX.to_string()),
            discovery_timeout: Duration::from_secs(env_number(
                "BLUVIB_DISCOVERY_TIMEOUT_SECS",
                DEFAULT_DISCOVERY_TIMEOUT_SECS,
            )?),
            write_timeout: Duration::from_secs(env_number(
                "BLUVIB_WRITE_TIMEOUT_SECS",
                DEFAULT_WRITE_TIMEOUT_SECS,
            )?),
            read_timeout: Duration::from_secs(env_number(
                "BLUVIB_READ_TIMEOUT_SECS",
                DEFAULT_READ_TIMEOUT_SECS,
            )?),
            stream_capacity: env_number("BLUVIB_STREAM_CAPACITY", DEFAULT_STREAM_CAPACITY as u64)?
                as usize,
            apply,
            commit_after_apply: matches!(
                env::var("BLUVIB_COMMIT").as_deref(),
                Ok("1") | Ok("true") | Ok("yes")
            ),
        })
    }
}

fn env_number(key: &str, default: u64) -> Result<u64, Box<dyn std::error::Error>> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| format!("{} must be a whole number, got '{}'", key, value).into()),
        Err(_) => Ok(default),
    }
}

/// Parse `ADDRESS=Name` pairs separated by commas; unparsable entries are skipped.
pub fn parse_sensor_list(list: &str) -> HashMap<Address, String> {
    let mut sensors = HashMap::new();
    for (address, name) in parse_assignments(list) {
        match Address::from_str(&address) {
            Ok(parsed) => {
                sensors.insert(parsed, name);
            }
            Err(_) => warn!("Ignoring sensor entry: '{}' is not a device address", address),
        }
    }
    sensors
}

/// Parse `key=value` pairs separated by commas.
pub fn parse_assignments(list: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for pair in list.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        if let Some((key, value)) = pair.split_once('=') {
            let key = key.trim();
            let value = value.trim();
            if !key.is_empty() && !value.is_empty() {
                pairs.push((key.to_string(), value.to_string()));
            }
        } else {
            warn!("Failed to split pair: '{}'", pair);
        }
    }
    pairs
}
