use std::net::SocketAddr;
use std::sync::Arc;

use edgebus::bus::Bus;
use edgebus::config::load_config;
use edgebus::persistence::SystemMemory;
use edgebus::transport::{ChannelKind, RealtimeChannel, ServerState, start_websocket_server};
use edgebus::utils::logging;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::spawn;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    if let Err(e) = run_server().await {
        logging::init("info");
        error!("Server failed: {e}");
        std::process::exit(1);
    }
}

async fn run_server() -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;
    logging::init(&config.log.level);

    if let Some(listen) = &config.metrics.listen {
        let addr: SocketAddr = listen.parse()?;
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        info!("Prometheus metrics server listening on {addr}");
    }

    let policy = config.delivery.policy();
    let listeners = Arc::new(RealtimeChannel::new(ChannelKind::Message, policy));
    let control = Arc::new(RealtimeChannel::new(ChannelKind::Control, policy));

    let bus = Arc::new(Bus::open(
        &config.bus.disk_directory,
        config.archive.limits(),
        Arc::new(SystemMemory::new()),
        listeners.clone(),
    )?);
    bus.init_routes(&config.routes);

    let sweep = config.delivery.sweep_interval();
    let background = [
        spawn(bus.clone().run_health_loop(config.bus.health_check_interval())),
        spawn(bus.clone().run_speed_loop(config.bus.speed_interval())),
        spawn(listeners.run_sweep_loop(sweep)),
        spawn(control.clone().run_sweep_loop(sweep)),
    ];

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = ServerState {
        bus: bus.clone(),
        control,
    };

    tokio::select! {
        result = start_websocket_server(&addr, state) => match result {
            Ok(()) => error!("WebSocket server exited unexpectedly."),
            Err(e) => error!("WebSocket server failed: {e}"),
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    for task in background {
        task.abort();
    }
    bus.close();
    Ok(())
}
