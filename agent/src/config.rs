//! Spawner agent settings.

use shared::{Properties, DEFAULT_MASTER_PORT};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub master_addr: String,
    /// Master key presented in the hello, if the master requires one
    pub credentials: Option<String>,
    pub region: String,
    /// Concurrent process limit; 0 lets the master pick its default
    pub max_processes: u32,
    /// Tags matched against `cap.` launch options
    pub capabilities: Properties,
    /// Game-server executable started for every launch
    pub executable: PathBuf,
    /// Arguments placed before the generated ones
    pub extra_args: Vec<String>,
    pub heartbeat_interval: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            master_addr: format!("127.0.0.1:{}", DEFAULT_MASTER_PORT),
            credentials: None,
            region: String::new(),
            max_processes: 5,
            capabilities: Properties::new(),
            executable: PathBuf::from("room-stub"),
            extra_args: Vec::new(),
            heartbeat_interval: Duration::from_secs(2),
        }
    }
}

/// Parses a `key=value` pair given on the command line.
pub fn parse_key_value(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_value() {
        assert_eq!(
            parse_key_value("cap.map=arena"),
            Ok(("cap.map".to_string(), "arena".to_string()))
        );
        assert_eq!(
            parse_key_value("room.password="),
            Ok(("room.password".to_string(), String::new()))
        );
        assert_eq!(
            parse_key_value("a=b=c"),
            Ok(("a".to_string(), "b=c".to_string()))
        );
        assert!(parse_key_value("=x").is_err());
        assert!(parse_key_value("novalue").is_err());
    }
}
