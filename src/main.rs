use anyhow::Result;
use solar_dispatcher::{api, config, controller, telemetry};
use config::Config;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::load()?;
    let _guard = telemetry::init_tracing(&cfg.logging);

    let (app_state, source) = controller::AppState::new(cfg.clone())?;
    let app = api::router(app_state.clone(), &cfg);
    let addr = cfg.server.socket_addr()?;

    if cfg.server.host == "0.0.0.0" {
        warn!("admin API bound to all interfaces, it has no authentication");
    }

    info!(
        %addr,
        devices = cfg.devices.len(),
        mode = ?cfg.controller.hardware_mode,
        telemetry = ?cfg.telemetry.source,
        "starting solar dispatcher"
    );

    let control = controller::spawn_controller_tasks(app_state.clone(), source);

    let cancel = app_state.cancel.clone();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            telemetry::shutdown_signal().await;
            cancel.cancel();
        })
        .await?;

    if let Err(e) = control.await {
        warn!(error = %e, "control task failed");
    }
    warn!("shutdown complete");
    Ok(())
}
