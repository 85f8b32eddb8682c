//! Flow kernel IPC server — main entry point.

use flow_kernel::devices::{DeviceCatalog, NullDeviceDriver};
use flow_kernel::ipc::IpcServer;
use flow_kernel::llm::EchoLlm;
use flow_kernel::persistence::{JsonFileStore, Store};
use flow_kernel::{Config, Engine};
use std::sync::Arc;

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let config = Config::default();
    flow_kernel::observability::init_tracing();

    let store = JsonFileStore::new(config.persistence.dir.clone());
    let devices = store.load_devices().await.unwrap_or_else(|e| {
        tracing::warn!("failed to load devices.json, starting with an empty catalog: {e}");
        Vec::new()
    });
    let catalog = DeviceCatalog::load(devices);

    let broadcast = Arc::new(flow_kernel::broadcast::ChannelBroadcastSink::new(
        config.ipc.stream_channel_capacity,
    ));
    let engine = Engine::new(
        config.defaults.clone(),
        catalog,
        Arc::new(NullDeviceDriver),
        broadcast,
        Arc::new(EchoLlm),
    );

    flow_kernel::timers::spawn_idle_checker(engine.clone(), std::time::Duration::from_secs(5));

    let addr = config.server.listen_addr.parse()?;
    tracing::info!("Flow kernel IPC server starting on {}", addr);
    let server = IpcServer::new(engine, addr, config.ipc);
    server.serve().await?;

    Ok(())
}
