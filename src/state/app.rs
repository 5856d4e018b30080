use crate::config::AppConfig;
use crate::services::subscription_mgr::SubscriptionMgr;
use crate::state::tunnel::TunnelRegistry;

/// Shared state handed to every route.
#[derive(Clone)]
pub struct AppState {
    pub mgr: SubscriptionMgr,
    pub tunnels: TunnelRegistry,
    pub config: AppConfig,
}

impl AppState {
    pub fn new(mgr: SubscriptionMgr, tunnels: TunnelRegistry, config: AppConfig) -> Self {
        Self {
            mgr,
            tunnels,
            config,
        }
    }
}
