//! Media engine startup and SFU wiring

use std::sync::Arc;

use huddle_sfu::engine::loopback::LoopbackEngine;
use huddle_sfu::engine::MediaEngine;
use huddle_sfu::SfuManager;
use tracing::info;

use crate::Config;

/// Container for the running SFU
#[derive(Clone)]
pub struct Services {
    /// Media engine backing every room's router
    pub engine: Arc<LoopbackEngine>,
    /// Signaling and room state
    pub sfu_manager: Arc<SfuManager>,
}

/// Start the media engine and build the SFU manager on top of it.
/// Must be called from within a tokio runtime.
pub fn init_services(config: &Config) -> anyhow::Result<Services> {
    info!("Starting media engine...");
    let engine = Arc::new(LoopbackEngine::started(config.engine.clone())?);

    let sfu_manager = SfuManager::new(config.sfu.clone(), Arc::clone(&engine) as Arc<dyn MediaEngine>);
    info!("SFU manager initialized");

    Ok(Services {
        engine,
        sfu_manager,
    })
}
