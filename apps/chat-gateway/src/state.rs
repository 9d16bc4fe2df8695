//! Shared application state: the singletons (§9 "construct once at startup,
//! pass explicitly to components") every handler and session task borrows.

use std::sync::Arc;

use chat_bus::BusClient;
use chat_identity::{Config, VerifyToken};
use chat_permissions::PermissionEngine;
use chat_presence::PresenceService;
use chat_service::ConversationService;
use chat_store::Store;
use dashmap::DashMap;

use crate::ratelimit::RateLimiter;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub bus: Arc<dyn BusClient>,
    pub presence: PresenceService,
    pub permissions: PermissionEngine,
    pub conversations: ConversationService,
    pub verifier: Arc<dyn VerifyToken>,
    pub config: Arc<Config>,
    pub rate_limiter: RateLimiter,
    /// Live WebSocket session count per user id, used to debounce
    /// offline->online presence flaps on fast reconnect (§4.4 invariant).
    pub live_sessions: Arc<DashMap<String, usize>>,
    /// Per-user handle for the delayed `presence:offline` publish spawned
    /// when a user's last session closes (§4.4's 5s grace window). Aborted
    /// if the user reconnects before it fires.
    pub pending_offline: Arc<DashMap<String, tokio::task::AbortHandle>>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<dyn BusClient>,
        verifier: Arc<dyn VerifyToken>,
        config: Config,
    ) -> Self {
        let permissions =
            PermissionEngine::with_rate_limit_window(store.clone(), config.rate_limit_window);
        let conversations = ConversationService::new(store.clone(), permissions.clone());
        let presence = PresenceService::new(bus.clone());
        let rate_limiter = RateLimiter::new(config.rate_limit_max, config.rate_limit_window_ms);
        Self {
            store,
            bus,
            presence,
            permissions,
            conversations,
            verifier,
            config: Arc::new(config),
            rate_limiter,
            live_sessions: Arc::new(DashMap::new()),
            pending_offline: Arc::new(DashMap::new()),
        }
    }
}
