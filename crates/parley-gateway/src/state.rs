use std::sync::Arc;

use parley_db::Database;

use crate::auth::Authenticator;
use crate::connection::ConnectionConfig;
use crate::dispatcher::Dispatcher;
use crate::registry::{Registry, RegistryConfig};
use crate::scheduler::Scheduler;

/// Everything a connection task needs, shared by all of them.
pub type GatewayState = Arc<GatewayStateInner>;

pub struct GatewayStateInner {
    pub db: Arc<Database>,
    pub registry: Registry,
    pub dispatcher: Dispatcher,
    pub scheduler: Scheduler,
    pub config: ConnectionConfig,
}

#[derive(Debug, Clone, Copy)]
pub struct GatewayConfig {
    pub registry: RegistryConfig,
    pub connection: ConnectionConfig,
    /// Max due items handled per scheduler tick.
    pub scheduler_batch: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            connection: ConnectionConfig::default(),
            scheduler_batch: 256,
        }
    }
}

/// Wire the registry, dispatcher and scheduler around one database.
pub fn build(
    db: Arc<Database>,
    authenticator: Arc<dyn Authenticator>,
    config: GatewayConfig,
) -> GatewayState {
    let registry = Registry::new(authenticator, config.registry);
    let dispatcher = Dispatcher::new(registry.clone());
    let scheduler = Scheduler::new(db.clone(), dispatcher.clone(), config.scheduler_batch);

    Arc::new(GatewayStateInner {
        db,
        registry,
        dispatcher,
        scheduler,
        config: config.connection,
    })
}
