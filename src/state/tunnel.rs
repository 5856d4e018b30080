use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::websocket::WsConnection;

/// Websocket upgrade routes, keyed by connection endpoint (`ws/<id>`).
///
/// Holds weak references only: a connection disappears from the registry once
/// its subscription is deleted.
#[derive(Clone, Default)]
pub struct TunnelRegistry {
    routes: Arc<RwLock<HashMap<String, Weak<WsConnection>>>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, conn: &Arc<WsConnection>) {
        let mut routes = self.routes.write();
        routes.retain(|_, c| c.strong_count() > 0);
        routes.insert(conn.endpoint().to_string(), Arc::downgrade(conn));
    }

    pub fn get(&self, endpoint: &str) -> Option<Arc<WsConnection>> {
        self.routes.read().get(endpoint).and_then(Weak::upgrade)
    }

    pub fn len(&self) -> usize {
        self.routes
            .read()
            .values()
            .filter(|c| c.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::WsConnectionConfig;

    #[tokio::test]
    async fn dropped_connections_are_not_served() {
        let registry = TunnelRegistry::new();
        let conn = WsConnection::new(WsConnectionConfig::default());
        let endpoint = conn.endpoint().to_string();

        registry.register(&conn);
        assert!(registry
            .get(&endpoint)
            .is_some_and(|c| Arc::ptr_eq(&c, &conn)));

        drop(conn);
        assert!(registry.get(&endpoint).is_none());
        assert!(registry.is_empty());
    }
}
