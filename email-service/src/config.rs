use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use dotenvy::dotenv;
use serde::Deserialize;

use crate::models::{retry::RetryConfig, validation::validate_email_address};

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServiceRole {
    #[default]
    All,
    Api,
    Worker,
}

impl ServiceRole {
    pub fn runs_api(&self) -> bool {
        matches!(self, ServiceRole::All | ServiceRole::Api)
    }

    pub fn runs_workers(&self) -> bool {
        matches!(self, ServiceRole::All | ServiceRole::Worker)
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Postgres,
    Memory,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BrokerBackend {
    #[default]
    Rabbitmq,
    Memory,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    None,
    #[default]
    Opportunistic,
    Required,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Clone, Deserialize, Debug)]
pub struct Config {
    #[serde(default)]
    pub service_role: ServiceRole,
    #[serde(default = "defaults::server_port")]
    pub server_port: u16,
    #[serde(default = "defaults::max_request_bytes")]
    pub max_request_bytes: usize,

    #[serde(default)]
    pub storage_backend: StorageBackend,
    pub database_url: Option<String>,

    pub redis_url: Option<String>,
    #[serde(default = "defaults::template_cache_ttl_seconds")]
    pub template_cache_ttl_seconds: u64,

    #[serde(default)]
    pub broker_backend: BrokerBackend,
    #[serde(default = "defaults::broker_urls")]
    pub broker_urls: Vec<String>,
    #[serde(default = "defaults::main_topic")]
    pub main_topic: String,
    #[serde(default = "defaults::dlq_topic")]
    pub dlq_topic: String,
    #[serde(default = "defaults::consumer_group")]
    pub consumer_group: String,
    #[serde(default = "defaults::prefetch_count")]
    pub prefetch_count: u16,

    #[serde(default = "defaults::smtp_host")]
    pub smtp_host: String,
    #[serde(default = "defaults::smtp_port")]
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    #[serde(default = "defaults::smtp_from")]
    pub smtp_from: String,
    #[serde(default = "defaults::smtp_helo_name")]
    pub smtp_helo_name: String,
    #[serde(default)]
    pub smtp_tls: TlsMode,
    #[serde(default)]
    pub smtp_accept_invalid_certs: bool,
    #[serde(default = "defaults::smtp_dial_timeout_ms")]
    pub smtp_dial_timeout_ms: u64,
    #[serde(default = "defaults::smtp_command_timeout_ms")]
    pub smtp_command_timeout_ms: u64,
    #[serde(default = "defaults::smtp_overall_timeout_ms")]
    pub smtp_overall_timeout_ms: u64,
    #[serde(default = "defaults::smtp_timeout_transient_attempts")]
    pub smtp_timeout_transient_attempts: u32,

    #[serde(default = "defaults::retry_per_message_ceiling")]
    pub retry_per_message_ceiling: u32,
    #[serde(default = "defaults::retry_initial_backoff_ms")]
    pub retry_initial_backoff_ms: u64,
    #[serde(default = "defaults::retry_max_backoff_ms")]
    pub retry_max_backoff_ms: u64,

    #[serde(default = "defaults::dlq_ceiling")]
    pub dlq_ceiling: u32,
    #[serde(default = "defaults::dlq_initial_backoff_ms")]
    pub dlq_initial_backoff_ms: u64,
    #[serde(default = "defaults::dlq_max_backoff_ms")]
    pub dlq_max_backoff_ms: u64,

    #[serde(default = "defaults::publish_max_attempts")]
    pub publish_max_attempts: u32,
    #[serde(default = "defaults::publish_initial_delay_ms")]
    pub publish_initial_delay_ms: u64,

    #[serde(default = "defaults::worker_concurrency")]
    pub worker_concurrency: usize,
    #[serde(default = "defaults::shutdown_grace_seconds")]
    pub shutdown_grace_seconds: u64,

    #[serde(default = "defaults::sweeper_interval_seconds")]
    pub sweeper_interval_seconds: u64,
    #[serde(default = "defaults::sweeper_stale_after_seconds")]
    pub sweeper_stale_after_seconds: u64,
    #[serde(default = "defaults::sweeper_batch_size")]
    pub sweeper_batch_size: u32,

    #[serde(default)]
    pub log_format: LogFormat,
}

/// Connection and timeout settings for the SMTP relay.
#[derive(Clone, Debug)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
    pub helo_name: String,
    pub tls: TlsMode,
    pub accept_invalid_certs: bool,
    pub dial_timeout: Duration,
    pub command_timeout: Duration,
    pub overall_timeout: Duration,
}

impl Config {
    pub fn load() -> Result<Self, Error> {
        dotenv().ok();

        let config = envy::from_env::<Self>()
            .map_err(|e| anyhow!("Invalid or missing environmental variable: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Builds a config from explicit `(NAME, value)` pairs, falling back to defaults.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let config = envy::from_iter::<_, Self>(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into().to_uppercase(), v.into())),
        )
        .map_err(|e| anyhow!("Invalid configuration: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.storage_backend == StorageBackend::Postgres && self.database_url.is_none() {
            return Err(anyhow!("DATABASE_URL is required when STORAGE_BACKEND=postgres"));
        }
        if self.broker_backend == BrokerBackend::Rabbitmq && self.broker_urls.is_empty() {
            return Err(anyhow!("BROKER_URLS must list at least one broker"));
        }
        if self.main_topic == self.dlq_topic {
            return Err(anyhow!("MAIN_TOPIC and DLQ_TOPIC must differ"));
        }
        if self.retry_per_message_ceiling == 0 || self.dlq_ceiling == 0 {
            return Err(anyhow!("retry ceilings must be at least 1"));
        }
        if self.smtp_username.is_some() != self.smtp_password.is_some() {
            return Err(anyhow!("SMTP_USERNAME and SMTP_PASSWORD must be set together"));
        }
        validate_email_address("SMTP_FROM", &self.smtp_from).map_err(|e| anyhow!("{}", e))?;
        let longest_dispatch_ms = self
            .smtp_overall_timeout_ms
            .saturating_add(self.shutdown_grace_seconds.saturating_mul(1000));
        if self.sweeper_stale_after_seconds.saturating_mul(1000) <= longest_dispatch_ms {
            return Err(anyhow!(
                "SWEEPER_STALE_AFTER_SECONDS must exceed SMTP_OVERALL_TIMEOUT_MS plus SHUTDOWN_GRACE_SECONDS ({} ms)",
                longest_dispatch_ms
            ));
        }
        if self.worker_concurrency == 0 {
            return Err(anyhow!("WORKER_CONCURRENCY must be at least 1"));
        }
        Ok(())
    }

    /// Main-topic redelivery: ceiling and `backoff(n)` bounds.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry_per_message_ceiling,
            initial_delay_ms: self.retry_initial_backoff_ms,
            max_delay_ms: self.retry_max_backoff_ms,
            backoff_multiplier: 2,
            jitter_factor: 0.5,
        }
    }

    /// DLQ redelivery: ceiling and backoff bounds.
    pub fn dlq_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.dlq_ceiling,
            initial_delay_ms: self.dlq_initial_backoff_ms,
            max_delay_ms: self.dlq_max_backoff_ms,
            backoff_multiplier: 2,
            jitter_factor: 0.5,
        }
    }

    /// In-process retries around broker publishes made by workers.
    pub fn publish_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.publish_max_attempts.max(1),
            initial_delay_ms: self.publish_initial_delay_ms,
            max_delay_ms: self.publish_initial_delay_ms.saturating_mul(10),
            backoff_multiplier: 2,
            jitter_factor: 0.1,
        }
    }

    pub fn smtp_settings(&self) -> SmtpSettings {
        SmtpSettings {
            host: self.smtp_host.clone(),
            port: self.smtp_port,
            username: self.smtp_username.clone(),
            password: self.smtp_password.clone(),
            from: self.smtp_from.clone(),
            helo_name: self.smtp_helo_name.clone(),
            tls: self.smtp_tls,
            accept_invalid_certs: self.smtp_accept_invalid_certs,
            dial_timeout: Duration::from_millis(self.smtp_dial_timeout_ms),
            command_timeout: Duration::from_millis(self.smtp_command_timeout_ms),
            overall_timeout: Duration::from_millis(self.smtp_overall_timeout_ms),
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }
}

mod defaults {
    pub fn server_port() -> u16 {
        8080
    }
    pub fn max_request_bytes() -> usize {
        25 * 1024 * 1024
    }
    pub fn template_cache_ttl_seconds() -> u64 {
        30
    }
    pub fn broker_urls() -> Vec<String> {
        vec!["amqp://127.0.0.1:5672/%2f".to_string()]
    }
    pub fn main_topic() -> String {
        "email.main".to_string()
    }
    pub fn dlq_topic() -> String {
        "email.dlq".to_string()
    }
    pub fn consumer_group() -> String {
        "email-sender".to_string()
    }
    pub fn prefetch_count() -> u16 {
        1
    }
    pub fn smtp_host() -> String {
        "localhost".to_string()
    }
    pub fn smtp_port() -> u16 {
        587
    }
    pub fn smtp_from() -> String {
        "noreply@example.com".to_string()
    }
    pub fn smtp_helo_name() -> String {
        "localhost".to_string()
    }
    pub fn smtp_dial_timeout_ms() -> u64 {
        10_000
    }
    pub fn smtp_command_timeout_ms() -> u64 {
        30_000
    }
    pub fn smtp_overall_timeout_ms() -> u64 {
        60_000
    }
    pub fn smtp_timeout_transient_attempts() -> u32 {
        2
    }
    pub fn retry_per_message_ceiling() -> u32 {
        3
    }
    pub fn retry_initial_backoff_ms() -> u64 {
        1_000
    }
    pub fn retry_max_backoff_ms() -> u64 {
        30_000
    }
    pub fn dlq_ceiling() -> u32 {
        3
    }
    pub fn dlq_initial_backoff_ms() -> u64 {
        5_000
    }
    pub fn dlq_max_backoff_ms() -> u64 {
        300_000
    }
    pub fn publish_max_attempts() -> u32 {
        3
    }
    pub fn publish_initial_delay_ms() -> u64 {
        100
    }
    pub fn worker_concurrency() -> usize {
        4
    }
    pub fn shutdown_grace_seconds() -> u64 {
        30
    }
    pub fn sweeper_interval_seconds() -> u64 {
        60
    }
    pub fn sweeper_stale_after_seconds() -> u64 {
        600
    }
    pub fn sweeper_batch_size() -> u32 {
        100
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_pairs() -> Vec<(&'static str, &'static str)> {
        vec![("storage_backend", "memory"), ("broker_backend", "memory")]
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::from_pairs(memory_pairs()).unwrap();

        assert_eq!(config.service_role, ServiceRole::All);
        assert_eq!(config.main_topic, "email.main");
        assert_eq!(config.dlq_topic, "email.dlq");
        assert_eq!(config.retry_per_message_ceiling, 3);
        assert_eq!(config.dlq_ceiling, 3);

        let smtp = config.smtp_settings();
        assert_eq!(smtp.dial_timeout, Duration::from_secs(10));
        assert_eq!(smtp.command_timeout, Duration::from_secs(30));
        assert_eq!(smtp.overall_timeout, Duration::from_secs(60));
        assert_eq!(smtp.tls, TlsMode::Opportunistic);

        let retry = config.retry_config();
        assert_eq!(retry.initial_delay_ms, 1_000);
        assert_eq!(retry.max_delay_ms, 30_000);

        let dlq = config.dlq_retry_config();
        assert_eq!(dlq.initial_delay_ms, 5_000);
        assert_eq!(dlq.max_delay_ms, 300_000);
    }

    #[test]
    fn broker_list_is_comma_separated() {
        let mut pairs = memory_pairs();
        pairs.push(("broker_urls", "amqp://a:5672,amqp://b:5672"));

        let config = Config::from_pairs(pairs).unwrap();

        assert_eq!(config.broker_urls, vec!["amqp://a:5672", "amqp://b:5672"]);
    }

    #[test]
    fn postgres_backend_requires_database_url() {
        let result = Config::from_pairs([("broker_backend", "memory")]);
        assert!(result.is_err());
    }

    #[test]
    fn smtp_credentials_come_in_pairs() {
        let mut pairs = memory_pairs();
        pairs.push(("smtp_username", "mailer"));

        assert!(Config::from_pairs(pairs).is_err());
    }

    #[test]
    fn sender_address_must_be_valid() {
        let mut pairs = memory_pairs();
        pairs.push(("smtp_from", "not-an-address"));

        assert!(Config::from_pairs(pairs).is_err());
    }

    #[test]
    fn sweeper_must_not_outrun_a_live_dispatch() {
        let with_stale_after = |seconds: &'static str| {
            let mut pairs = memory_pairs();
            pairs.push(("smtp_overall_timeout_ms", "60000"));
            pairs.push(("shutdown_grace_seconds", "30"));
            pairs.push(("sweeper_stale_after_seconds", seconds));
            Config::from_pairs(pairs)
        };

        assert!(with_stale_after("90").is_err());
        assert!(with_stale_after("91").is_ok());
    }

    #[test]
    fn topics_must_differ() {
        let mut pairs = memory_pairs();
        pairs.push(("main_topic", "same"));
        pairs.push(("dlq_topic", "same"));

        assert!(Config::from_pairs(pairs).is_err());
    }
}
