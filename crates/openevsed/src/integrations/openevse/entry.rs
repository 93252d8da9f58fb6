//! Per-entry lifecycle: connect, register the device and entities, keep them
//! fed, and tear it all down again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use openevse_http::ClientError;
use openevse_http::WsState;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::CONF_NAME;
use super::DOMAIN;
use super::MANUFACTURER;
use super::charger::Charger;
use super::charger::ChargerFactory;
use super::charger::Connection;
use super::coordinator::Coordinator;
use super::coordinator::Snapshot;
use super::coordinator::UpdateFailed;
use super::entities;
use super::entities::Entity;
use super::entities::EntityContext;
use super::entities::View;
use super::firmware::FirmwareCoordinator;
use super::firmware::FirmwareState;
use super::firmware::get_firmware;
use super::passthrough;
use super::passthrough::PassthroughSensors;
use super::services::Service;
use crate::config::OpenEvseConfig;
use crate::engine::ConfigEntry;
use crate::engine::DeviceConnection;
use crate::engine::DeviceIdentifier;
use crate::engine::DeviceInfo;
use crate::engine::EntityCommand;
use crate::engine::FromIntegrationMessage;
use crate::engine::FromIntegrationSender;
use crate::engine::Host;
use crate::engine::RequestError;

/// Firmware needed for the claim, override and limit endpoints.
const SERVICES_MIN_VERSION: &str = "4.1.0";

#[derive(Debug, Error)]
pub enum SetupError {
    /// The charger did not answer the first poll; setup is retried later
    #[error("{host} is not ready: {source}")]
    NotReady {
        host: String,
        #[source]
        source: UpdateFailed,
    },

    #[error(transparent)]
    Client(#[from] anyhow::Error),
}

/// Delay before retry number `tries` (counting from zero).
pub fn retry_delay(tries: u32) -> Duration {
    Duration::from_secs(5 * 2u64.pow(tries.min(4)))
}

/// Everything kept alive for one loaded entry.
pub struct EntryRuntime {
    pub entry_id: String,
    pub name: String,
    pub device_id: String,
    pub charger: Arc<dyn Charger>,
    pub coordinator: Arc<Coordinator>,
    pub firmware: Arc<FirmwareCoordinator>,
    entities: Vec<Arc<dyn Entity>>,
    tasks: Vec<JoinHandle<()>>,
}

impl EntryRuntime {
    pub fn entity_ids(&self) -> impl Iterator<Item = &str> {
        self.entities.iter().map(|e| e.info().entity_id.as_str())
    }

    pub fn owns(&self, entity_id: &str) -> bool {
        self.entity_ids().any(|id| id == entity_id)
    }

    /// Whether the charger is new enough for the domain services.
    pub fn supports_services(&self) -> bool {
        self.charger.version_check(SERVICES_MIN_VERSION)
    }

    /// Run a command, then republish so the change shows without waiting for
    /// the next poll.
    pub async fn command(&self, entity_id: &str, command: EntityCommand) -> Result<(), RequestError> {
        let entity = self
            .entities
            .iter()
            .find(|e| e.info().entity_id == entity_id)
            .ok_or_else(|| RequestError::NotFound(format!("Unknown entity {}", entity_id)))?;

        entity.handle(command, &self.coordinator.snapshot()).await?;
        self.coordinator.rebuild();
        Ok(())
    }

    /// Stop timers and listeners, close the websocket and drop the entities.
    pub async fn unload(&self, tx: &FromIntegrationSender) {
        for task in &self.tasks {
            task.abort();
        }
        self.coordinator.clear_listeners();
        self.firmware.clear_listeners();

        debug!("Checking websocket...");
        if self.charger.ws_state() != WsState::Stopped {
            debug!("Closing websocket");
            self.charger.ws_disconnect().await;
        }
        self.charger.close().await;

        for entity in &self.entities {
            let entity_id = entity.info().entity_id.clone();
            if let Err(e) = tx.send(FromIntegrationMessage::EntityRemoved { entity_id }).await {
                warn!("Failed to remove entity: {}", e);
            }
        }
        info!("Unloaded {} ({})", self.name, self.entry_id);
    }
}

impl Drop for EntryRuntime {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Push the rendered state of every entity to the engine. Runs inside
/// coordinator listeners, so it never waits on the channel.
///
/// A state that does not fit in the channel is dropped with a warning and only
/// shows up again with the next accepted write of the coordinator.
fn publish_states(
    tx: &FromIntegrationSender,
    entities: &[Arc<dyn Entity>],
    charger: &dyn Charger,
    snapshot: &Snapshot,
    firmware: &FirmwareState,
) {
    let view = View {
        snapshot,
        firmware,
        charger,
    };
    for entity in entities {
        let rendered = entity.render(&view);
        let msg = FromIntegrationMessage::StateChanged {
            entity_id: entity.info().entity_id.clone(),
            state: rendered.state,
            attributes: rendered.attributes,
        };
        if let Err(e) = tx.try_send(msg) {
            warn!("Failed to send state for {}: {}", entity.info().entity_id, e);
        }
    }
}

fn poll_task<F, Fut>(period: Duration, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately and setup has just refreshed
        interval.tick().await;
        loop {
            interval.tick().await;
            tick().await;
        }
    })
}

/// Bring one entry up.
pub async fn setup_entry(
    host: &Host,
    settings: &OpenEvseConfig,
    factory: &ChargerFactory,
    entry: &ConfigEntry,
) -> Result<EntryRuntime, SetupError> {
    let connection = Connection::from_entry(entry);
    let charger = factory(&connection)?;
    let name = entry
        .data
        .get(CONF_NAME)
        .and_then(|v| v.as_str())
        .unwrap_or(&entry.title)
        .to_string();

    let coordinator = Coordinator::new(name.clone(), charger.clone());
    let firmware = FirmwareCoordinator::new(charger.clone());

    let first = coordinator.refresh().await;
    if let Err(e) = firmware.refresh().await {
        debug!("Initial firmware check failed: {}", e);
    }
    if let Err(source) = first {
        return Err(SetupError::NotReady {
            host: connection.host,
            source,
        });
    }

    let (model, sw_version) = get_firmware(charger.as_ref()).await;
    let serial = match charger.test_and_get().await {
        Ok(identity) => identity.serial,
        Err(ClientError::MissingSerial) => {
            info!("Unable to find serial number.");
            entry.entry_id.clone()
        }
        Err(e) => {
            warn!("Unable to read serial number: {}", e);
            entry.entry_id.clone()
        }
    };

    let device = host.devices.get_or_create(
        &entry.entry_id,
        DeviceInfo {
            identifiers: vec![DeviceIdentifier::new(DOMAIN, serial)],
            connections: vec![DeviceConnection::new(DOMAIN, entry.entry_id.clone())],
            name: name.clone(),
            manufacturer: Some(MANUFACTURER.to_string()),
            model: Some(model).filter(|m| !m.is_empty()),
            sw_version: Some(sw_version).filter(|v| !v.is_empty()),
            configuration_url: Some(charger.url()),
        },
    );

    if let Err(e) = coordinator.refresh().await {
        debug!("Second refresh of {} failed: {}", name, e);
    }
    if let Err(e) = charger.ws_start() {
        warn!("Unable to start websocket for {}: {}", name, e);
    }

    let ctx = EntityContext {
        entry_id: entry.entry_id.clone(),
        name: name.clone(),
        device_id: device.id.clone(),
        charger: charger.clone(),
    };
    let entities = entities::build(&ctx, &coordinator.snapshot());
    for entity in &entities {
        let msg = FromIntegrationMessage::EntityDiscovered {
            info: entity.info().clone(),
            integration_name: DOMAIN.to_string(),
        };
        if let Err(e) = host.tx.send(msg).await {
            warn!("Failed to announce {}: {}", entity.info().entity_id, e);
        }
    }
    publish_states(
        &host.tx,
        &entities,
        charger.as_ref(),
        &coordinator.snapshot(),
        &firmware.state(),
    );

    {
        let tx = host.tx.clone();
        let shared = entities.clone();
        let charger = charger.clone();
        let firmware = Arc::downgrade(&firmware);
        coordinator.add_listener(Box::new(move |snapshot| {
            let firmware = firmware.upgrade().map(|f| f.state()).unwrap_or_default();
            publish_states(&tx, &shared, charger.as_ref(), snapshot, &firmware);
        }));
    }
    {
        let tx = host.tx.clone();
        let shared = entities.clone();
        let charger = charger.clone();
        let main = Arc::downgrade(&coordinator);
        let own = Arc::downgrade(&firmware);
        firmware.add_listener(Box::new(move || {
            if let (Some(main), Some(own)) = (main.upgrade(), own.upgrade()) {
                publish_states(&tx, &shared, charger.as_ref(), &main.snapshot(), &own.state());
            }
        }));
    }

    let mut tasks = Vec::new();
    {
        let coordinator = coordinator.clone();
        tasks.push(poll_task(settings.scan_interval, move || {
            let coordinator = coordinator.clone();
            async move {
                if let Err(e) = coordinator.refresh().await {
                    warn!("Update of {} failed: {}", coordinator.name(), e);
                }
            }
        }));
    }
    {
        let firmware = firmware.clone();
        tasks.push(poll_task(settings.firmware_interval, move || {
            let firmware = firmware.clone();
            async move {
                // Already logged by the firmware coordinator
                if let Err(e) = firmware.refresh().await {
                    debug!("Firmware poll failed: {}", e);
                }
            }
        }));
    }

    let sensors = PassthroughSensors::from_entry(entry);
    if !sensors.is_empty() {
        debug!("Tracking external sensors for {}: {:?}", name, sensors);
        tasks.push(passthrough::spawn(host, charger.clone(), sensors));
    }

    info!("Set up {} at {}", name, charger.host());
    Ok(EntryRuntime {
        entry_id: entry.entry_id.clone(),
        name,
        device_id: device.id.clone(),
        charger,
        coordinator,
        firmware,
        entities,
        tasks,
    })
}

enum EntrySlot {
    Loaded(Arc<EntryRuntime>),
    /// First poll failed; a task keeps trying with backoff
    Retrying {
        task: JoinHandle<()>,
        generation: u64,
    },
}

#[derive(Default)]
struct Slots {
    entries: HashMap<String, EntrySlot>,
    services_registered: bool,
    next_generation: u64,
}

impl Slots {
    fn is_retry(&self, entry_id: &str, generation: u64) -> bool {
        matches!(
            self.entries.get(entry_id),
            Some(EntrySlot::Retrying { generation: g, .. }) if *g == generation
        )
    }
}

/// Owns every entry of the integration, loaded or waiting for its charger.
pub struct EntryManager {
    host: Host,
    settings: OpenEvseConfig,
    factory: ChargerFactory,
    slots: Mutex<Slots>,
}

impl EntryManager {
    pub fn new(host: Host, settings: OpenEvseConfig, factory: ChargerFactory) -> Arc<Self> {
        Arc::new(Self {
            host,
            settings,
            factory,
            slots: Mutex::new(Slots::default()),
        })
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn factory(&self) -> &ChargerFactory {
        &self.factory
    }

    /// Set an entry up. A charger that does not answer yet is retried in the
    /// background and the error is still returned to the caller.
    pub async fn load(self: &Arc<Self>, entry: &ConfigEntry) -> Result<(), SetupError> {
        info!("Setting up {} ({})", entry.title, entry.entry_id);
        match setup_entry(&self.host, &self.settings, &self.factory, entry).await {
            Ok(runtime) => {
                self.install(runtime).await;
                Ok(())
            }
            Err(err @ SetupError::NotReady { .. }) => {
                warn!("{}", err);
                let mut slots = self.slots.lock().await;
                slots.next_generation += 1;
                let generation = slots.next_generation;
                let task = self.schedule_retry(entry.entry_id.clone(), generation);
                let previous = slots
                    .entries
                    .insert(entry.entry_id.clone(), EntrySlot::Retrying { task, generation });
                if let Some(EntrySlot::Retrying { task, .. }) = previous {
                    task.abort();
                }
                Err(err)
            }
            Err(err) => {
                error!("Failed to set up {}: {}", entry.entry_id, err);
                Err(err)
            }
        }
    }

    async fn install(&self, runtime: EntryRuntime) {
        let mut slots = self.slots.lock().await;
        let previous = slots
            .entries
            .insert(runtime.entry_id.clone(), EntrySlot::Loaded(Arc::new(runtime)));
        if let Some(EntrySlot::Retrying { task, .. }) = previous {
            task.abort();
        }
        self.sync_services(&mut slots).await;
    }

    /// Install a runtime set up by retry `generation`. When the entry was
    /// unloaded (or reloaded) in the meantime the runtime is torn down instead.
    async fn adopt(&self, runtime: EntryRuntime, generation: u64) {
        let mut slots = self.slots.lock().await;
        if !slots.is_retry(&runtime.entry_id, generation) {
            debug!("Retry of {} was cancelled, discarding", runtime.entry_id);
            drop(slots);
            runtime.unload(&self.host.tx).await;
            return;
        }
        slots
            .entries
            .insert(runtime.entry_id.clone(), EntrySlot::Loaded(Arc::new(runtime)));
        self.sync_services(&mut slots).await;
    }

    async fn forget_retry(&self, entry_id: &str, generation: u64) {
        let mut slots = self.slots.lock().await;
        if slots.is_retry(entry_id, generation) {
            slots.entries.remove(entry_id);
        }
    }

    /// The returned task may be aborted at any await. A finished setup is
    /// handed to `adopt` on its own task so the abort cannot drop it halfway.
    fn schedule_retry(self: &Arc<Self>, entry_id: String, generation: u64) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut tries = 0;
            loop {
                let delay = retry_delay(tries);
                info!("Retrying setup of {} in {}s", entry_id, delay.as_secs());
                tokio::time::sleep(delay).await;

                let Some(entry) = manager.host.entries.get(&entry_id) else {
                    debug!("Entry {} is gone, giving up", entry_id);
                    manager.forget_retry(&entry_id, generation).await;
                    return;
                };
                match setup_entry(&manager.host, &manager.settings, &manager.factory, &entry).await {
                    Ok(runtime) => {
                        let manager = manager.clone();
                        tokio::spawn(async move { manager.adopt(runtime, generation).await });
                        return;
                    }
                    Err(err @ SetupError::NotReady { .. }) => {
                        warn!("{}", err);
                        tries += 1;
                    }
                    Err(err) => {
                        error!("Failed to set up {}: {}", entry_id, err);
                        manager.forget_retry(&entry_id, generation).await;
                        return;
                    }
                }
            }
        })
    }

    /// Tear an entry down. Returns false when it was not known.
    pub async fn unload(&self, entry_id: &str) -> bool {
        debug!("Attempting to unload {} from the {} integration", entry_id, DOMAIN);
        let mut slots = self.slots.lock().await;
        let found = match slots.entries.remove(entry_id) {
            Some(EntrySlot::Loaded(runtime)) => {
                runtime.unload(&self.host.tx).await;
                true
            }
            Some(EntrySlot::Retrying { task, .. }) => {
                task.abort();
                true
            }
            None => false,
        };
        self.sync_services(&mut slots).await;
        found
    }

    pub async fn reload(self: &Arc<Self>, entry_id: &str) -> Result<(), SetupError> {
        self.unload(entry_id).await;
        let entry = self
            .host
            .entries
            .get(entry_id)
            .ok_or_else(|| anyhow::anyhow!("Config entry {} does not exist", entry_id))?;
        self.load(&entry).await
    }

    pub async fn unload_all(&self) {
        let ids: Vec<String> = self.slots.lock().await.entries.keys().cloned().collect();
        for id in ids {
            self.unload(&id).await;
        }
    }

    pub async fn runtime(&self, entry_id: &str) -> Option<Arc<EntryRuntime>> {
        match self.slots.lock().await.entries.get(entry_id) {
            Some(EntrySlot::Loaded(runtime)) => Some(runtime.clone()),
            _ => None,
        }
    }

    pub async fn is_retrying(&self, entry_id: &str) -> bool {
        matches!(
            self.slots.lock().await.entries.get(entry_id),
            Some(EntrySlot::Retrying { .. })
        )
    }

    /// Loaded entry owning `entity_id`.
    pub async fn owner_of(&self, entity_id: &str) -> Option<Arc<EntryRuntime>> {
        self.slots
            .lock()
            .await
            .entries
            .values()
            .find_map(|slot| match slot {
                EntrySlot::Loaded(runtime) if runtime.owns(entity_id) => Some(runtime.clone()),
                _ => None,
            })
    }

    /// Chargers of the loaded entries, keyed by entry id.
    pub async fn chargers(&self) -> HashMap<String, Arc<dyn Charger>> {
        self.slots
            .lock()
            .await
            .entries
            .iter()
            .filter_map(|(id, slot)| match slot {
                EntrySlot::Loaded(runtime) => Some((id.clone(), runtime.charger.clone())),
                EntrySlot::Retrying { .. } => None,
            })
            .collect()
    }

    /// Services exist while at least one loaded charger supports them.
    async fn sync_services(&self, slots: &mut Slots) {
        let wanted = slots.entries.values().any(|slot| match slot {
            EntrySlot::Loaded(runtime) => runtime.supports_services(),
            EntrySlot::Retrying { .. } => false,
        });
        if wanted == slots.services_registered {
            return;
        }

        for service in Service::all() {
            let msg = if wanted {
                FromIntegrationMessage::ServiceRegistered {
                    domain: DOMAIN.to_string(),
                    service: service.to_string(),
                    supports_response: service.supports_response(),
                    integration_name: DOMAIN.to_string(),
                }
            } else {
                FromIntegrationMessage::ServiceRemoved {
                    domain: DOMAIN.to_string(),
                    service: service.to_string(),
                }
            };
            if let Err(e) = self.host.tx.send(msg).await {
                warn!("Failed to update service {}: {}", service, e);
            }
        }
        slots.services_registered = wanted;
    }
}
