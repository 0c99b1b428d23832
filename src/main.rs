use anyhow::Context;
use chrono::Utc;
use lock_agent::device::StaticProbe;
use lock_agent::error::ActuatorError;
use lock_agent::persistence::{EncryptedKvStore, Preferences};
use lock_agent::schedule::SystemClock;
use lock_agent::store::MemoryStore;
use lock_agent::{ActuatorRequest, AgentConfig, AgentContext, AgentEvent, DeviceAgent};
use lockagent_shared::HardwareInfo;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = AgentConfig::from_env();

    let prefs = match &config.state_path {
        Some(path) => {
            let kv = EncryptedKvStore::open(path)
                .with_context(|| format!("opening local store {}", path.display()))?;
            Preferences::new(Arc::new(kv))
        }
        None => Preferences::in_memory(),
    };

    let store = Arc::new(MemoryStore::new());
    let mut probe = StaticProbe::new(
        config.hardware_id.clone(),
        HardwareInfo {
            device_name: "lock-agent".into(),
            model: std::env::consts::ARCH.into(),
            manufacturer: "generic".into(),
            os_version: std::env::consts::OS.into(),
            network_type: "ethernet".into(),
            ..HardwareInfo::default()
        },
    );
    if let Ok(token) = std::env::var("PUSH_TOKEN") {
        probe = probe.with_push_token(token);
    }
    let probe = Arc::new(probe);
    let command_ttl = config.command_ttl;

    let (ctx, channels) = AgentContext::new(config, store.clone(), prefs, probe, Arc::new(SystemClock))
        .context("building agent context")?;

    info!("Lock agent starting: {}", ctx.device_id);
    if let Some(path) = &ctx.config.state_path {
        info!("  Local store: {}", path.display());
    }

    let agent = DeviceAgent::new(ctx);

    tokio::spawn(handle_actuator_requests(channels.actuator_rx));
    tokio::spawn(handle_agent_events(channels.event_rx));

    // Operator-side housekeeping on the in-process store
    let purge_store = store.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            let purged = purge_store.purge_expired(Utc::now(), command_ttl);
            if purged > 0 {
                info!("[STORE] Purged {} expired commands", purged);
            }
        }
    });

    agent.start().await.context("starting agent")?;

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("Shutting down");
    agent.shutdown().await;
    Ok(())
}

/// Stand-in for the overlay/kiosk layer: logs every request
async fn handle_actuator_requests(mut requests: mpsc::Receiver<ActuatorRequest>) {
    while let Some(request) = requests.recv().await {
        match request {
            ActuatorRequest::Lock { lock_type } => info!("[ACT] Lock screen ({})", lock_type),
            ActuatorRequest::ApplyConfig(config) => {
                info!(
                    "[ACT] Apply configuration (lockType={}, lastUpdated={})",
                    config.lock_type, config.last_updated
                );
            }
            ActuatorRequest::CaptureScreenshot { reply } => {
                warn!("[ACT] Screenshot requested but no display is attached");
                let _ = reply.send(Err(ActuatorError::Failed("no display attached".into())));
            }
            other => info!("[ACT] {}", other),
        }
    }
    error!("[ACT] Actuator channel closed");
}

async fn handle_agent_events(mut events: mpsc::UnboundedReceiver<AgentEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            AgentEvent::ConnectionError { message, exhausted: true } => {
                error!("[MAIN] Connection given up: {} (force reconnect required)", message);
            }
            AgentEvent::ConnectionError { message, .. } => warn!("[MAIN] Connection error: {}", message),
            AgentEvent::StatusChanged(status) => info!("[MAIN] Connection status: {}", status),
            other => debug!("[MAIN] {:?}", other),
        }
    }
}
