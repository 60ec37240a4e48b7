use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use super::adapter::BrokerAdapter;
use super::error::{ConnectionError, TransportError};
use super::transport::{BrokerChannel, BrokerConnection, Transport};
use crate::metrics::Metrics;

pub const DEFAULT_PORT: u16 = 5672;
pub const DEFAULT_VHOST: &str = "/";
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    host: String,
    port: u16,
    vhost: String,
    credentials: Credentials,
    heartbeat: Option<u16>,
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, port: u16, credentials: Credentials) -> Self {
        Self {
            host: host.into(),
            port,
            vhost: DEFAULT_VHOST.to_string(),
            credentials,
            heartbeat: None,
        }
    }

    pub fn with_vhost(mut self, vhost: impl Into<String>) -> Self {
        self.vhost = vhost.into();
        self
    }

    /// `None` lets the broker negotiate; `Some(0)` asks to disable heartbeats.
    pub fn with_heartbeat(mut self, heartbeat: Option<u16>) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn vhost(&self) -> &str {
        &self.vhost
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn heartbeat(&self) -> Option<u16> {
        self.heartbeat
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Fixed-delay bounded retry used while the broker may still be booting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    retry_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, retry_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            retry_delay,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY)
    }
}

pub struct Connector<'a> {
    transport: &'a dyn Transport,
    metrics: Arc<Metrics>,
}

impl<'a> Connector<'a> {
    pub fn new(transport: &'a dyn Transport, metrics: Arc<Metrics>) -> Self {
        Self { transport, metrics }
    }

    /// Opens the connection and its single channel, retrying up to
    /// `retry.max_attempts()` times with `retry.retry_delay()` between tries.
    ///
    /// Blocks its caller for up to `max_attempts * retry_delay`.
    pub async fn connect(
        &self,
        config: &ConnectionConfig,
        retry: &RetryPolicy,
    ) -> Result<BrokerAdapter, ConnectionError> {
        let endpoint = config.endpoint();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            self.metrics.connection_attempts_total.inc();
            info!(endpoint = %endpoint, attempt, max_attempts = retry.max_attempts(), "Connecting to RabbitMQ");

            match self.open(config).await {
                Ok((connection, channel)) => {
                    info!(
                        endpoint = %endpoint,
                        attempt,
                        channel_id = channel.id(),
                        "Successfully connected to RabbitMQ"
                    );
                    return Ok(BrokerAdapter::new(connection, channel, self.metrics.clone()));
                }
                Err(e) => {
                    self.metrics.connection_failures_total.inc();
                    warn!(endpoint = %endpoint, attempt, error = %e, "Failed to connect to RabbitMQ");

                    if attempt >= retry.max_attempts() {
                        error!(endpoint = %endpoint, attempts = attempt, "RabbitMQ connection attempts exhausted");
                        return Err(ConnectionError::Exhausted {
                            attempts: attempt,
                            source: e,
                        });
                    }

                    tokio::time::sleep(retry.retry_delay()).await;
                }
            }
        }
    }

    async fn open(
        &self,
        config: &ConnectionConfig,
    ) -> Result<(Box<dyn BrokerConnection>, Arc<dyn BrokerChannel>), TransportError> {
        let connection = self.transport.open(config).await?;

        match connection.create_channel().await {
            Ok(channel) => Ok((connection, channel)),
            Err(e) => {
                error!(error = %e, "Failed to create RabbitMQ channel");
                if let Err(close_err) = connection.close().await {
                    warn!(error = %close_err, "Failed to close half-open connection");
                }
                Err(e)
            }
        }
    }
}
