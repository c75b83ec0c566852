//! Application state management
//! Wires a platform adapter to the connection manager. Built once at startup
//! and passed to whoever needs it.

use std::sync::Arc;

use anyhow::Result;
use log::info;

use crate::config::AppConfig;
use crate::core::bluetooth::{
    event_channel, AdapterEventReceiver, BluestAdapter, ConnectionManager, PlatformAdapter,
    SimulatedAdapter,
};

/// Application state
pub struct AppState {
    connection_manager: Arc<ConnectionManager>,
}

impl AppState {
    /// Builds the state on the host Bluetooth stack, or on the demo simulator
    /// when `simulate` is set.
    pub async fn new(config: &AppConfig, simulate: bool) -> Result<Self> {
        let (events_tx, events_rx) = event_channel();
        let adapter: Arc<dyn PlatformAdapter> = if simulate {
            info!("Using simulated Bluetooth adapter");
            Arc::new(SimulatedAdapter::demo(events_tx))
        } else {
            info!("Initializing Bluetooth adapter...");
            Arc::new(BluestAdapter::new(events_tx).await?)
        };
        Ok(Self::with_adapter(adapter, events_rx, config).await)
    }

    /// Builds the state around an existing adapter and its event channel.
    pub async fn with_adapter(
        adapter: Arc<dyn PlatformAdapter>,
        events: AdapterEventReceiver,
        config: &AppConfig,
    ) -> Self {
        let connection_manager =
            ConnectionManager::new(adapter, events, config.manager_config()).await;
        Self { connection_manager }
    }

    pub fn connection_manager(&self) -> &Arc<ConnectionManager> {
        &self.connection_manager
    }
}
