//! Bridge runner for lifecycle management.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use zigbridge_common::{LoggingConfig, TopicBuilder, init_tracing};

use crate::BridgeArgs;
use crate::bus::{BusClient, BusPublisher};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::status::StatusPublisher;

/// How long the core task gets to drain after shutdown was requested.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Bridge runner that manages the lifecycle of a protocol bridge.
///
/// Handles:
/// - Logging initialization
/// - MQTT connection
/// - Task spawning and management
/// - Ordered shutdown on Ctrl+C or SIGTERM
/// - Bridge info publishing
///
/// # Example
///
/// ```ignore
/// use zigbridge_framework::{BridgeArgs, BridgeConfig, BridgeRunner};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let args = BridgeArgs::parse_with_default("zigbee.json5");
///     let config = MyBridgeConfig::load(&args.config)?;
///
///     let mut runner = BridgeRunner::new_with_args("zigbee", config, Some(&args)).await?;
///
///     let cancel = runner.cancel_token();
///     runner.spawn(reader(cancel));
///     let core = tokio::spawn(router.run());
///
///     runner.run_until_shutdown(core, async { intake.shutdown().await }).await
/// }
/// ```
pub struct BridgeRunner<C: BridgeConfig> {
    /// Bridge name for logging and status.
    name: String,
    /// The loaded configuration.
    config: C,
    /// MQTT client.
    bus: BusClient,
    /// Bridge info publisher.
    status: StatusPublisher,
    /// Cancelled when shutdown starts; reader tasks watch it.
    cancel: CancellationToken,
    /// Spawned tasks.
    tasks: Vec<JoinHandle<()>>,
}

impl<C: BridgeConfig> BridgeRunner<C> {
    /// Create a new bridge runner with CLI args for log level override.
    ///
    /// This will:
    /// 1. Initialize logging based on config (with optional CLI override)
    /// 2. Start the MQTT client
    /// 3. Wait up to `mqtt.connect_timeout_secs` for the broker
    ///
    /// An unreachable broker is not fatal; the client keeps retrying and
    /// publishes are queued meanwhile.
    pub async fn new_with_args(
        name: impl Into<String>,
        config: C,
        args: Option<&BridgeArgs>,
    ) -> Result<Self> {
        let name = name.into();
        let version = env!("CARGO_PKG_VERSION").to_string();

        let log_config = match args.and_then(|a| a.log_level.as_ref()) {
            Some(level) => LoggingConfig {
                level: level.clone(),
                ..config.logging().clone()
            },
            None => config.logging().clone(),
        };

        init_tracing(&log_config).map_err(|e| BridgeError::config(e.to_string()))?;

        tracing::info!(bridge = %name, version = %version, "Starting bridge");

        let bus = BusClient::connect(config.mqtt(), config.backoff())?;

        let timeout = Duration::from_secs(config.mqtt().connect_timeout_secs);
        if let Err(e) = bus.wait_connected(timeout).await {
            tracing::warn!(
                error = %e,
                broker = %config.mqtt().broker_addr(),
                "MQTT broker not reachable yet, continuing and retrying in background"
            );
        }

        let status = StatusPublisher::new(
            Arc::new(bus.clone()),
            bus.topics().clone(),
            &name,
            &version,
        );

        Ok(Self {
            name,
            config,
            bus,
            status,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        })
    }

    /// Get a reference to the configuration.
    pub fn config(&self) -> &C {
        &self.config
    }

    /// Get a clone of the MQTT client.
    pub fn bus(&self) -> BusClient {
        self.bus.clone()
    }

    /// Get the MQTT client as a shared publisher.
    pub fn publisher(&self) -> Arc<dyn BusPublisher> {
        Arc::new(self.bus.clone())
    }

    /// Topic builder for the configured base topic.
    pub fn topics(&self) -> TopicBuilder {
        self.bus.topics().clone()
    }

    /// Token cancelled when shutdown begins.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawn a worker task.
    ///
    /// The task will be tracked and aborted on shutdown if still running.
    pub fn spawn<F>(&mut self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        self.tasks.push(handle);
    }

    /// Run until a shutdown signal arrives or the core task exits.
    ///
    /// On a signal:
    /// 1. The cancel token is cancelled so readers stop
    /// 2. `drain` runs (typically enqueues the shutdown event for the core)
    /// 3. The core task is awaited, bounded by a timeout
    /// 4. Remaining tasks are aborted
    /// 5. "offline" is published and the MQTT connection closed
    ///
    /// If the core exits on its own with an error, an "error" status is
    /// published and the error returned.
    pub async fn run_until_shutdown<E, D>(
        mut self,
        mut core: JoinHandle<std::result::Result<(), E>>,
        drain: D,
    ) -> Result<()>
    where
        E: std::fmt::Display + Send + 'static,
        D: Future<Output = ()>,
    {
        if let Err(e) = self.status.publish_running(None) {
            tracing::warn!(error = %e, "Failed to publish running status");
        }

        tracing::info!(
            bridge = %self.name,
            tasks = self.tasks.len(),
            "Bridge running. Press Ctrl+C to stop."
        );

        let early_exit = tokio::select! {
            _ = shutdown_signal() => None,
            joined = &mut core => Some(joined),
        };

        self.cancel.cancel();

        let outcome = match early_exit {
            Some(joined) => core_outcome(joined),
            None => {
                drain.await;
                match tokio::time::timeout(DRAIN_TIMEOUT, &mut core).await {
                    Ok(joined) => core_outcome(joined),
                    Err(_) => {
                        tracing::warn!(
                            timeout_secs = DRAIN_TIMEOUT.as_secs(),
                            "Core task did not drain in time, aborting"
                        );
                        core.abort();
                        Ok(())
                    }
                }
            }
        };

        for task in self.tasks.drain(..) {
            task.abort();
        }

        let published = match &outcome {
            Ok(()) => self.status.publish_offline(),
            Err(e) => self.status.publish_error(e.to_string()),
        };
        if let Err(e) = published {
            tracing::warn!(error = %e, "Failed to publish final status");
        }

        self.bus.disconnect().await?;

        tracing::info!(bridge = %self.name, "Goodbye!");

        outcome
    }
}

fn core_outcome<E: std::fmt::Display>(
    joined: std::result::Result<std::result::Result<(), E>, tokio::task::JoinError>,
) -> Result<()> {
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Core task failed");
            Err(BridgeError::worker(e.to_string()))
        }
        Err(e) => {
            tracing::error!(error = %e, "Core task panicked or was cancelled");
            Err(BridgeError::worker(e.to_string()))
        }
    }
}

/// Resolve on Ctrl+C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
