//! MQTT bridge for Zigbee networks.
//!
//! Reads from the radio adapter and the broker are forwarded into one ordered
//! intake drained by the router.

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mqtt_bridge_zigbee::config::ZigbeeBridgeConfig;
use mqtt_bridge_zigbee::coordinator::Coordinator;
use mqtt_bridge_zigbee::definitions::Definitions;
use mqtt_bridge_zigbee::events::{Event, Intake};
use mqtt_bridge_zigbee::registry::Registry;
use mqtt_bridge_zigbee::router::Router;
use mqtt_bridge_zigbee::transport::Link;
use zigbridge_framework::{BridgeArgs, BridgeConfig, BridgeRunner};

#[tokio::main]
async fn main() -> Result<()> {
    let args = BridgeArgs::parse_with_default("zigbee.json5");

    // Load configuration
    let config = ZigbeeBridgeConfig::load(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    let mut runner = BridgeRunner::new_with_args("zigbee", config, Some(&args))
        .await
        .context("Failed to start bridge")?;
    info!("Loaded configuration from {:?}", args.config);
    let config = runner.config().clone();

    // Persisted state
    let zigbee = &config.zigbee;
    std::fs::create_dir_all(&zigbee.data_dir)
        .with_context(|| format!("Failed to create data directory {:?}", zigbee.data_dir))?;
    let registry = Registry::open(zigbee.devices_path(), zigbee.offline_after())
        .context("Failed to load device registry")?;
    let coordinator =
        Coordinator::load(zigbee.network_path()).context("Failed to load network state")?;
    let definitions = Definitions::load_dir(&zigbee.definitions_dir);

    let (intake, events) = Intake::channel(zigbee.intake_capacity);
    let cancel = runner.cancel_token();

    // The adapter link outlives the router drain, so it gets its own token.
    let link_cancel = CancellationToken::new();
    let (radio, mut link_events, link_task) =
        Link::spawn(zigbee.link_config(), link_cancel.clone()).into_parts();
    info!(port = %zigbee.port, baud_rate = zigbee.baud_rate, "Radio link supervisor started");

    {
        let intake = intake.clone();
        let cancel = cancel.clone();
        runner.spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = link_events.recv() => event,
                };
                let Some(event) = event else { break };
                if !intake.submit(Event::Link(event)).await {
                    break;
                }
            }
            debug!("Radio reader stopped");
        });
    }

    let bus = runner.bus();
    for pattern in runner.topics().command_wildcards() {
        let mut subscription = bus
            .subscribe(&pattern)
            .with_context(|| format!("Failed to subscribe to {}", pattern))?;
        let intake = intake.clone();
        let cancel = cancel.clone();
        runner.spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = subscription.next() => message,
                };
                let Some(message) = message else { break };
                if !intake.submit(Event::Bus(message)).await {
                    break;
                }
            }
            debug!(pattern = %subscription.pattern(), "Bus reader stopped");
        });
    }

    let router = Router::new(
        &config,
        registry,
        coordinator,
        definitions,
        Box::new(radio),
        runner.publisher(),
        Box::new(intake.clone()),
    );
    let core = tokio::spawn(router.run(events));

    let result = runner
        .run_until_shutdown(core, async move { intake.shutdown().await })
        .await;

    link_cancel.cancel();
    if let Err(e) = link_task.await {
        warn!(error = %e, "Radio link supervisor did not stop cleanly");
    }

    result.context("Zigbee bridge failed")?;
    info!("Zigbee bridge stopped");
    Ok(())
}
