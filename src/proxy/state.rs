use std::sync::Arc;

use crate::error::AppResult;
use crate::modules::persistence::store::Store;
use crate::modules::system::config::AppConfig;
use crate::proxy::credential::availability::AvailabilityController;
use crate::proxy::credential::selector::KeySelector;
use crate::proxy::engine::Engine;
use crate::proxy::outbound::OutboundPool;
use crate::proxy::upstream::client::UpstreamClient;

// Axum application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Store,
    pub selector: Arc<KeySelector>,
    pub availability: Arc<AvailabilityController>,
    pub outbound: Arc<OutboundPool>,
    pub upstream: Arc<UpstreamClient>,
    pub engine: Arc<Engine>,
}

impl AppState {
    pub fn build(config: AppConfig) -> AppResult<Self> {
        let store = Store::new(&config.data_dir)?;
        let upstream = Arc::new(UpstreamClient::new(config.upstream_timeout));
        Self::assemble(Arc::new(config), store, upstream)
    }

    /// Wiring entry point shared with the tests, which swap in a store under
    /// a temp directory and an upstream client aimed at a mock server.
    pub fn assemble(
        config: Arc<AppConfig>,
        store: Store,
        upstream: Arc<UpstreamClient>,
    ) -> AppResult<Self> {
        let selector = Arc::new(KeySelector::new(store.clone())?);
        let availability = Arc::new(AvailabilityController::new(
            store.clone(),
            selector.clone(),
        ));
        let outbound = Arc::new(OutboundPool::new(store.clone(), config.upstream_timeout));
        let engine = Arc::new(Engine::new(
            store.clone(),
            config.clone(),
            selector.clone(),
            availability.clone(),
            outbound.clone(),
            upstream.clone(),
        ));
        Ok(Self {
            config,
            store,
            selector,
            availability,
            outbound,
            upstream,
            engine,
        })
    }

    /// Shrinks the engine's retry wait so failure-path tests finish in
    /// milliseconds instead of minutes.
    #[cfg(test)]
    pub(crate) fn tune_engine_waits(
        mut self,
        wait: std::time::Duration,
        poll: std::time::Duration,
    ) -> Self {
        let mut engine = Engine::new(
            self.store.clone(),
            self.config.clone(),
            self.selector.clone(),
            self.availability.clone(),
            self.outbound.clone(),
            self.upstream.clone(),
        );
        engine.retry_wait = wait;
        engine.retry_poll = poll;
        self.engine = Arc::new(engine);
        self
    }
}

impl axum::extract::FromRef<AppState> for Arc<AppConfig> {
    fn from_ref(state: &AppState) -> Self {
        state.config.clone()
    }
}
