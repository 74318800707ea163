use std::str::FromStr;

use chrono::{DateTime, Utc};

pub mod config;

/// Reads environment variable and parses it to the desired type
///
/// Panics if the environment variable is not set
///
/// # Arguments
/// * `key` - The environment variable key
///
/// # Returns
/// * `T` - The parsed environment variable
pub fn read_env_variable<T: FromStr>(key: &str) -> T {
    match std::env::var(key) {
        Ok(value) => parse_env_variable(key, value),
        Err(_) => panic!("{} environment variable not set", key),
    }
}

/// Reads environment variable and parses it to the desired type wrapped in an Option
///
/// # Arguments
/// * `key` - The environment variable key
///
/// # Returns
/// * `Option<T>` - The parsed environment variable
pub fn read_optional_env_variable<T: FromStr>(key: &str) -> Option<T> {
    match std::env::var(key) {
        Ok(value) => Some(parse_env_variable(key, value)),
        Err(_) => None,
    }
}

/// Parses an environment variable to the desired type
///
/// Panics if the parsing fails
///
/// # Arguments
/// * `key` - The environment variable key, only used for the panic message
/// * `value` - The environment variable value
fn parse_env_variable<T: FromStr>(key: &str, value: String) -> T {
    match value.parse() {
        Ok(parsed) => parsed,
        Err(_) => panic!("Failed to parse environment variable {}", key),
    }
}

/// Reads environment variable and parses it to the desired type with a default value
///
/// If the environment variable is not set, the default value is returned.
///
/// # Arguments
/// * `key` - The environment variable key
/// * `default_value` - The default value
///
/// # Returns
/// * `T` - The parsed environment variable or the default value
pub fn read_env_variable_with_default_value<T: FromStr>(key: &str, default_value: T) -> T {
    match read_optional_env_variable(key) {
        Some(value) => value,
        None => default_value,
    }
}

/// Converts a timestamp (seconds) to a DateTime<Utc>.
///
/// Panics if the timestamp is invalid.
///
/// # Arguments
/// * `timestamp` - The timestamp in seconds
///
/// # Returns
/// * `DateTime<Utc>` - The DateTime<Utc> representation of the timestamp
pub fn date_time_from_timestamp(timestamp: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(timestamp, 0).unwrap_or_else(|| panic!("Invalid timestamp {timestamp}"))
}

/// Converts a byte slice to a lowercase hex string, as used for `DeviceRecord::raw_hex`.
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{:02x}", byte)).collect()
}

/// Converts a hex string to a byte vector. Mostly used in tests, where raw packets are
/// written out as hex strings for readability.
pub fn hex_to_bytes(input: &str) -> Vec<u8> {
    (0..input.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&input[i..i + 2], 16).expect("invalid hex string"))
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::{LocalResult, TimeZone};

    use super::*;

    #[test]
    fn test_date_time_from_timestamp() {
        let now = match chrono::Utc.with_ymd_and_hms(2024, 11, 13, 8, 5, 32) {
            LocalResult::None => panic!("Invalid date time"),
            LocalResult::Single(dt) => dt,
            LocalResult::Ambiguous(_, _) => panic!("Ambiguous date time"),
        };
        let timestamp = now.timestamp();
        let date_time = date_time_from_timestamp(timestamp);

        assert_eq!(date_time, now);
    }

    #[test]
    fn test_hex_round_trip() {
        let bytes = vec![0x78, 0x78, 0x0d, 0x01];
        let hex = bytes_to_hex(&bytes);
        assert_eq!(hex, "78780d01");
        assert_eq!(hex_to_bytes(&hex), bytes);
    }
}
