// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for tessera-connector.

use std::str::FromStr;
use std::time::Duration;

use tessera_core::{EntityRetryProcessConfiguration, StateMachineConfig};

/// Connector configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Participant id this connector negotiates as
    pub participant_id: String,
    /// Address counter-parties send protocol messages to
    pub protocol_address: String,
    /// SQLite URL; in-memory stores when unset
    pub database_url: Option<String>,
    /// Distinguishes replicas of one participant sharing a database; random
    /// per process when unset
    pub instance_id: Option<String>,
    pub iteration_wait: Duration,
    pub batch_size: usize,
    pub max_concurrency: usize,
    /// Longest a single state handler may run before it counts as a
    /// retryable failure
    pub handler_timeout: Duration,
    pub drain_timeout: Duration,
    /// Retries of a failing send before the process is terminated
    pub send_retry_limit: u32,
    pub send_retry_base_delay: Duration,
    pub send_retry_max_delay: Duration,
    pub lease_duration: Duration,
}

impl ConnectorConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let participant_id = std::env::var("TESSERA_PARTICIPANT_ID")
            .map_err(|_| ConfigError::MissingEnvVar("TESSERA_PARTICIPANT_ID"))?;

        let protocol_address = std::env::var("TESSERA_PROTOCOL_ADDRESS")
            .unwrap_or_else(|_| format!("loopback://{participant_id}"));

        let database_url = std::env::var("TESSERA_DATABASE_URL")
            .ok()
            .filter(|url| !url.is_empty());

        let instance_id = std::env::var("TESSERA_INSTANCE_ID")
            .ok()
            .filter(|id| !id.is_empty());

        Ok(Self {
            participant_id,
            protocol_address,
            database_url,
            instance_id,
            iteration_wait: millis("TESSERA_STATE_MACHINE_ITERATION_WAIT_MS", 1000)?,
            batch_size: parse("TESSERA_STATE_MACHINE_BATCH_SIZE", 20)?,
            max_concurrency: parse("TESSERA_STATE_MACHINE_MAX_CONCURRENCY", 16)?,
            handler_timeout: millis("TESSERA_HANDLER_TIMEOUT_MS", 30_000)?,
            drain_timeout: millis("TESSERA_DRAIN_TIMEOUT_MS", 10_000)?,
            send_retry_limit: parse("TESSERA_SEND_RETRY_LIMIT", 7)?,
            send_retry_base_delay: millis("TESSERA_SEND_RETRY_BASE_DELAY_MS", 1000)?,
            send_retry_max_delay: millis("TESSERA_SEND_RETRY_MAX_DELAY_MS", 60_000)?,
            lease_duration: millis("TESSERA_LEASE_DURATION_MS", 60_000)?,
        })
    }

    pub fn state_machine(&self) -> StateMachineConfig {
        StateMachineConfig {
            iteration_wait: self.iteration_wait,
            batch_size: self.batch_size,
            max_concurrency: self.max_concurrency,
            handler_timeout: self.handler_timeout,
            drain_timeout: self.drain_timeout,
        }
    }

    pub fn send_retry(&self) -> EntityRetryProcessConfiguration {
        EntityRetryProcessConfiguration::exponential(
            self.send_retry_limit,
            self.send_retry_base_delay,
            self.send_retry_max_delay,
        )
    }
}

fn parse<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            name,
            value: raw.clone(),
        }),
        Err(_) => Ok(default),
    }
}

fn millis(name: &'static str, default: u64) -> Result<Duration, ConfigError> {
    parse(name, default).map(Duration::from_millis)
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// A variable is set but cannot be parsed.
    #[error("Invalid value '{value}' for {name}")]
    Invalid { name: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    const OPTIONAL: [&str; 12] = [
        "TESSERA_PROTOCOL_ADDRESS",
        "TESSERA_DATABASE_URL",
        "TESSERA_INSTANCE_ID",
        "TESSERA_HANDLER_TIMEOUT_MS",
        "TESSERA_STATE_MACHINE_ITERATION_WAIT_MS",
        "TESSERA_STATE_MACHINE_BATCH_SIZE",
        "TESSERA_STATE_MACHINE_MAX_CONCURRENCY",
        "TESSERA_DRAIN_TIMEOUT_MS",
        "TESSERA_SEND_RETRY_LIMIT",
        "TESSERA_SEND_RETRY_BASE_DELAY_MS",
        "TESSERA_SEND_RETRY_MAX_DELAY_MS",
        "TESSERA_LEASE_DURATION_MS",
    ];

    #[test]
    fn test_missing_participant_id() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.remove("TESSERA_PARTICIPANT_ID");

        let err = ConnectorConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar("TESSERA_PARTICIPANT_ID")));
    }

    #[test]
    fn test_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("TESSERA_PARTICIPANT_ID", "consumer-a");
        for key in OPTIONAL {
            guard.remove(key);
        }

        let config = ConnectorConfig::from_env().unwrap();
        assert_eq!(config.protocol_address, "loopback://consumer-a");
        assert_eq!(config.database_url, None);
        assert_eq!(config.iteration_wait, Duration::from_millis(1000));
        assert_eq!(config.batch_size, 20);
        assert_eq!(config.max_concurrency, 16);
        assert_eq!(config.instance_id, None);
        assert_eq!(config.state_machine().handler_timeout, Duration::from_secs(30));
        assert_eq!(config.send_retry_limit, 7);
        assert_eq!(config.send_retry_max_delay, Duration::from_secs(60));
        assert_eq!(config.lease_duration, Duration::from_secs(60));
        assert_eq!(config.send_retry().retry_limit(), 7);
    }

    #[test]
    fn test_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        for key in OPTIONAL {
            guard.remove(key);
        }
        guard.set("TESSERA_PARTICIPANT_ID", "provider-b");
        guard.set("TESSERA_DATABASE_URL", "sqlite:///var/lib/tessera/provider.db");
        guard.set("TESSERA_STATE_MACHINE_BATCH_SIZE", "5");
        guard.set("TESSERA_SEND_RETRY_LIMIT", "2");
        guard.set("TESSERA_LEASE_DURATION_MS", "1500");
        guard.set("TESSERA_HANDLER_TIMEOUT_MS", "2500");
        guard.set("TESSERA_INSTANCE_ID", "replica-2");

        let config = ConnectorConfig::from_env().unwrap();
        assert_eq!(
            config.database_url.as_deref(),
            Some("sqlite:///var/lib/tessera/provider.db")
        );
        assert_eq!(config.state_machine().batch_size, 5);
        assert_eq!(config.send_retry_limit, 2);
        assert_eq!(config.lease_duration, Duration::from_millis(1500));
        assert_eq!(config.state_machine().handler_timeout, Duration::from_millis(2500));
        assert_eq!(config.instance_id.as_deref(), Some("replica-2"));
    }

    #[test]
    fn test_invalid_number() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("TESSERA_PARTICIPANT_ID", "consumer-a");
        guard.set("TESSERA_STATE_MACHINE_MAX_CONCURRENCY", "lots");

        let err = ConnectorConfig::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                name: "TESSERA_STATE_MACHINE_MAX_CONCURRENCY",
                ..
            }
        ));
    }
}
