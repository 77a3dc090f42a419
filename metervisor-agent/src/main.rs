//! Metervisor agent: runs the supervised meter-polling worker as a daemon.

use metervisor_core::{
    init_observability, install_panic_hook, load_update_from_sources, watch_config_file,
    ConfigManager, ConfigSource, EventBus, LogSink, MeterSupervisorRuntime, SimulatedMeterReader,
    SupervisorEvent,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    install_panic_hook();

    let events = EventBus::default();
    let config = Arc::new(ConfigManager::new(events.clone()));

    let config_path = std::env::var("METERVISOR_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("metervisor.toml"));

    // file and environment layered on top of the built-in defaults
    let boot = load_update_from_sources(Some(config_path.as_path()))?;
    if let Err(err) = config.update(boot, ConfigSource::File) {
        eprintln!("Invalid boot configuration: {}", err);
        std::process::exit(1);
    }

    init_observability(&config.current())?;
    info!("Metervisor agent starting (config: {:?})", config_path);

    watch_config_file(Arc::clone(&config), config_path);

    let runtime = MeterSupervisorRuntime::new(
        Arc::clone(&config),
        events.clone(),
        Arc::new(SimulatedMeterReader::default()),
        Arc::new(LogSink),
    );
    runtime.start().await?;

    let mut bus = events.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
            event = bus.recv() => match event {
                Ok(SupervisorEvent::WorkerUnhealthy { consecutive }) => {
                    warn!(consecutive, "Worker unhealthy");
                }
                Ok(SupervisorEvent::MemoryAlert(alert)) => {
                    warn!("{}", alert.message);
                }
                Ok(SupervisorEvent::EscalationRaised { message, .. }) => {
                    error!("Operator attention required: {}", message);
                }
                Ok(SupervisorEvent::ConfigApplied { version, source }) => {
                    info!("Configuration v{} applied from {}", version, source);
                }
                Ok(_) => {}
                Err(_) => {}
            }
        }
    }

    runtime.stop().await;
    info!("Metervisor agent stopped");
    Ok(())
}
