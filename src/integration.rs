//! One configured account: owns the bus, store, coordinator, services and sensors
//!
//! Hosts create one [`Integration`] per account and drop it through
//! [`Integration::unload`]; nothing is shared between instances.

use crate::client::{TextNowClient, VendorApi};
use crate::config::Config;
use crate::coordinator::{spawn_polling, Coordinator};
use crate::error::Result;
use crate::events::EventBus;
use crate::sensor::SensorBoard;
use crate::services::Services;
use crate::store::{DocumentStore, JsonFileStore, StateStore};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub struct Integration {
    config: Arc<Config>,
    api: Arc<dyn VendorApi>,
    bus: EventBus,
    store: Arc<StateStore>,
    coordinator: Arc<Coordinator>,
    services: Arc<Services>,
    sensors: Arc<SensorBoard>,
    sensor_task: JoinHandle<()>,
    polling: Mutex<Option<JoinHandle<()>>>,
}

impl Integration {
    /// Build an instance and run the first refresh
    ///
    /// A failed first refresh aborts setup and closes the vendor session.
    pub async fn setup(
        mut config: Config,
        documents: Arc<dyn DocumentStore>,
        api: Arc<dyn VendorApi>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        info!(instance = %config.instance_id, username = %config.username, "Setting up TextNow");

        let bus = EventBus::new();
        let store = Arc::new(StateStore::new(documents));
        let coordinator = Arc::new(Coordinator::new(
            Arc::clone(&config),
            Arc::clone(&store),
            Arc::clone(&api),
            bus.clone(),
        ));
        let services = Arc::new(Services::new(
            Arc::clone(&config),
            Arc::clone(&store),
            Arc::clone(&api),
            bus.clone(),
        ));

        let sensors = match SensorBoard::load(Arc::clone(&store)).await {
            Ok(board) => Arc::new(board),
            Err(e) => {
                api.shutdown().await;
                return Err(e);
            }
        };
        let sensor_task = Arc::clone(&sensors).spawn(&bus);

        if let Err(e) = coordinator.poll_cycle().await {
            error!(instance = %config.instance_id, error = %e, "First refresh failed");
            sensor_task.abort();
            api.shutdown().await;
            return Err(e);
        }

        Ok(Self {
            config,
            api,
            bus,
            store,
            coordinator,
            services,
            sensors,
            sensor_task,
            polling: Mutex::new(None),
        })
    }

    /// Set up against the real vendor API with a JSON state file under `state_dir`
    pub async fn from_config(config: Config) -> Result<Self> {
        let documents = Arc::new(JsonFileStore::for_instance(
            &config.state_dir,
            &config.instance_id,
        ));
        let api = Arc::new(TextNowClient::new(&config));
        Self::setup(config, documents, api).await
    }

    /// Start the polling loop; a second call is a no-op
    pub fn start(&self) {
        let mut polling = self.polling.lock().unwrap_or_else(|p| p.into_inner());
        if polling.is_some() {
            warn!(instance = %self.config.instance_id, "Polling already running");
            return;
        }
        *polling = Some(spawn_polling(
            Arc::clone(&self.coordinator),
            self.config.polling_interval(),
        ));
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    pub fn sensors(&self) -> &Arc<SensorBoard> {
        &self.sensors
    }

    /// Stop background tasks and close the vendor session
    pub async fn unload(self) {
        let polling = self
            .polling
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = polling {
            handle.abort();
            let _ = handle.await;
        }
        self.sensor_task.abort();
        let _ = self.sensor_task.await;

        self.api.shutdown().await;
        info!(instance = %self.config.instance_id, "Unloaded TextNow");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fake::FakeApi;
    use crate::error::Error;
    use crate::store::MemoryDocumentStore;
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_setup_runs_first_refresh() {
        let temp = TempDir::new().unwrap();
        let api = Arc::new(FakeApi::new());
        api.push(json!({"id": 1, "contact_value": "+15551234567", "message": "hi", "message_direction": 1}));

        let integration = Integration::setup(
            Config::for_test(temp.path()),
            Arc::new(MemoryDocumentStore::new()),
            api.clone(),
        )
        .await
        .unwrap();

        assert_eq!(integration.coordinator().last_update_success(), Some(true));
        assert!(integration.store().is_processed("1").await.unwrap());
        integration.unload().await;
        assert!(api.shut_down.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failed_first_refresh_aborts_setup() {
        let temp = TempDir::new().unwrap();
        let api = Arc::new(FakeApi::new());
        api.fail_poll(true);

        let result = Integration::setup(
            Config::for_test(temp.path()),
            Arc::new(MemoryDocumentStore::new()),
            api.clone(),
        )
        .await;
        assert!(matches!(result, Err(Error::UpdateFailed(_))));
        assert!(api.shut_down.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let temp = TempDir::new().unwrap();
        let mut config = Config::for_test(temp.path());
        config.username.clear();
        let result = Integration::setup(
            config,
            Arc::new(MemoryDocumentStore::new()),
            Arc::new(FakeApi::new()),
        )
        .await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_unload() {
        let temp = TempDir::new().unwrap();
        let api = Arc::new(FakeApi::new());
        let integration = Integration::setup(
            Config::for_test(temp.path()),
            Arc::new(MemoryDocumentStore::new()),
            api.clone(),
        )
        .await
        .unwrap();
        integration.start();
        integration.start();

        api.push(json!({"id": "2", "contact_value": "+15551234567", "message": "later", "message_direction": 1}));
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(integration.store().is_processed("2").await.unwrap());

        let bus = integration.bus().clone();
        integration.unload().await;
        assert_eq!(bus.listener_count(), 0);
    }
}
