pub mod constants;
pub mod error;
pub mod modules;
pub mod proxy;

use std::path::PathBuf;
use tracing::{error, info};

use modules::system::{config::AppConfig, logger, scheduler};
use proxy::state::AppState;

pub fn run() {
    // The log directory lives under the data dir, so that one variable is
    // read before the full config (whose parsing wants a live subscriber).
    let data_dir = std::env::var("DATA_DIR")
        .ok()
        .filter(|d| !d.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("./data"));
    logger::init_logger(&data_dir);

    let config = AppConfig::from_env();
    info!(
        "Starting sfrelay on port {} (auth {})",
        config.port,
        if config.auth_enabled() { "on" } else { "off" }
    );

    let runtime = tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime");
    runtime.block_on(async {
        let state = match AppState::build(config) {
            Ok(state) => state,
            Err(e) => {
                error!("[E-STARTUP] failed_to_initialize_state: {}", e);
                std::process::exit(1);
            }
        };

        scheduler::start_scheduler(state.store.clone());

        if let Err(e) = proxy::server::serve(state).await {
            error!("[E-SERVE] server_terminated_with_error: {}", e);
            std::process::exit(1);
        }
        info!("Relay stopped");
    });
}
