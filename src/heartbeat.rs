//! Liveness registration with the orchestrator API.
//!
//! Every `heartbeat.interval` the service POSTs its name and public URL to
//! `<api_url>/services/heartbeat`. Too many consecutive failures end the
//! task with an error, which shuts the whole service down.

use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;

use crate::config::Config;

/// Per-request timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const SERVICE_TYPE: &str = "repositories";

#[derive(Error, Debug)]
pub enum HeartbeatError {
    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("Heartbeat failed {failures} times in a row, last error: {last}")]
    TooManyFailures { failures: u32, last: String },
}

#[derive(Debug, Serialize)]
struct Registration<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    service_type: &'a str,
    http_url: &'a str,
}

/// Consecutive failure tracking.
#[derive(Debug, Default)]
struct Failures {
    count: u32,
    max: u32,
}

impl Failures {
    fn new(max: u32) -> Self {
        Self { count: 0, max }
    }

    fn success(&mut self) {
        self.count = 0;
    }

    /// Record a failure; true once the count exceeds the maximum.
    fn failure(&mut self) -> bool {
        self.count += 1;
        self.count > self.max
    }
}

pub struct Heartbeat {
    client: Client,
    endpoint: String,
    token: String,
    name: String,
    http_url: String,
    interval: Duration,
    max_failures: u32,
}

impl Heartbeat {
    /// `None` when no orchestrator API is configured.
    pub fn from_config(config: &Config) -> Result<Option<Self>, HeartbeatError> {
        let Some(api_url) = config.heartbeat.api_url.as_deref() else {
            return Ok(None);
        };
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Some(Self {
            client,
            endpoint: format!("{}/services/heartbeat", api_url.trim_end_matches('/')),
            token: config.heartbeat.token.clone(),
            name: config.heartbeat.name.clone(),
            http_url: config.http.url.clone(),
            interval: config.heartbeat.interval,
            max_failures: config.heartbeat.max_failures,
        }))
    }

    async fn beat(&self) -> Result<(), reqwest::Error> {
        self.client
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .json(&Registration {
                name: &self.name,
                service_type: SERVICE_TYPE,
                http_url: &self.http_url,
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Register until `cancel` fires. Returns an error only when the failure
    /// budget is exhausted.
    pub async fn run(&self, mut cancel: watch::Receiver<bool>) -> Result<(), HeartbeatError> {
        tracing::info!("Heartbeat to {} every {:?}", self.endpoint, self.interval);
        let mut failures = Failures::new(self.max_failures);
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.changed() => return Ok(()),
            }
            if *cancel.borrow() {
                return Ok(());
            }

            match self.beat().await {
                Ok(()) => failures.success(),
                Err(e) => {
                    tracing::warn!(
                        "Heartbeat failed ({}/{}): {}",
                        failures.count + 1,
                        failures.max,
                        e
                    );
                    if failures.failure() {
                        return Err(HeartbeatError::TooManyFailures {
                            failures: failures.count,
                            last: e.to_string(),
                        });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(api_url: Option<&str>, max_failures: u32) -> Config {
        let mut config = Config::default();
        config.heartbeat.api_url = api_url.map(str::to_string);
        config.heartbeat.interval = Duration::from_millis(10);
        config.heartbeat.max_failures = max_failures;
        config
    }

    #[test]
    fn failures_reset_on_success() {
        let mut failures = Failures::new(2);
        assert!(!failures.failure());
        assert!(!failures.failure());
        failures.success();
        assert!(!failures.failure());
        assert!(!failures.failure());
        assert!(failures.failure());
    }

    #[test]
    fn disabled_without_api_url() {
        assert!(Heartbeat::from_config(&config(None, 1)).unwrap().is_none());
    }

    #[test]
    fn endpoint_ignores_trailing_slash() {
        let heartbeat = Heartbeat::from_config(&config(Some("http://api:8081/"), 1))
            .unwrap()
            .unwrap();
        assert_eq!(heartbeat.endpoint, "http://api:8081/services/heartbeat");
    }

    #[tokio::test]
    async fn unreachable_api_is_fatal_after_max_failures() {
        let heartbeat = Heartbeat::from_config(&config(Some("http://127.0.0.1:1"), 1))
            .unwrap()
            .unwrap();
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let result = tokio::time::timeout(Duration::from_secs(10), heartbeat.run(cancel_rx))
            .await
            .unwrap();

        assert!(matches!(
            result,
            Err(HeartbeatError::TooManyFailures { failures: 2, .. })
        ));
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let mut config = config(Some("http://127.0.0.1:1"), 100);
        config.heartbeat.interval = Duration::from_secs(3600);
        let heartbeat = Heartbeat::from_config(&config).unwrap().unwrap();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        cancel_tx.send(true).unwrap();

        // The first tick fires immediately, so one beat may run before the
        // cancellation is observed.
        let result = tokio::time::timeout(Duration::from_secs(15), heartbeat.run(cancel_rx))
            .await
            .unwrap();
        assert!(result.is_ok());
    }
}
