use std::sync::Arc;

use color_eyre::Result;
use merosslink::config::EngineConfig;
use merosslink::device::session::DeviceSessionHandle;
use merosslink::protocol::namespaces::NamespaceRegistry;
use merosslink::transport::mqtt::MqttTransport;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config = EngineConfig::load_default()?;
    if config.devices.is_empty() {
        warn!("no devices configured, nothing to do");
        return Ok(());
    }

    let registry = Arc::new(NamespaceRegistry::new());
    let mqtt = config
        .broker
        .as_ref()
        .map(|broker| MqttTransport::connect(&broker.address(), &broker.identity(), broker.cloud));

    let mut sessions = Vec::new();
    for device in config.devices {
        let device_id = device.device_id.clone();
        let handle =
            DeviceSessionHandle::spawn(device, registry.clone(), mqtt.clone(), Vec::new())?;
        handle
            .register_parser(
                "Appliance.Control.ToggleX",
                Box::new(move |payload| {
                    info!(device = %device_id, %payload, "switch state");
                }),
            )
            .await?;
        sessions.push(handle);
    }

    info!(count = sessions.len(), "device sessions running, ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    info!("shutting down");
    for session in &mut sessions {
        session.shutdown().await;
    }
    if let Some(mqtt) = &mqtt {
        mqtt.shutdown().await;
    }
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
