use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use arc_swap::ArcSwap;
use serde_json::Map;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::device::DeviceEntry;
use super::device::DeviceRegistry;
use super::entity::EntityCommand;
use super::entries::ConfigEntries;
use super::entries::ConfigEntry;
use super::entries::StoreError;
use super::event::Event;
use super::flow::FlowOutcome;
use super::flow::FlowSource;
use super::flow::FlowStep;
use super::integration::FromIntegrationReceiver;
use super::integration::FromIntegrationSender;
use super::integration::Host;
use super::integration::Integration;
use super::integration::ToIntegrationSender;
use super::message::DiagnosticsTarget;
use super::message::FromIntegrationMessage;
use super::message::Reply;
use super::message::RequestError;
use super::message::ToIntegrationMessage;
use super::services::ServiceCall;
use super::services::ServiceDescription;
use super::services::ServiceError;
use super::services::ServiceRegistry;
use super::state::EntityState;
use super::state::State;
use crate::engine::IntegrationContext;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("No integration found for entity: {0}")]
    UnknownEntity(String),

    #[error("Integration channel not found: {0}")]
    UnknownIntegration(String),

    #[error("Config entry {0} not found")]
    UnknownEntry(String),

    #[error("Device {0} not found")]
    UnknownDevice(String),

    #[error("Flow {0} not found")]
    UnknownFlow(String),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Integration '{0}' dropped the request")]
    NoReply(String),
}

/// openevsed engine
///
/// This structure handles the flow of events, sending requests to the correct
/// integration, and maintaining a view of the world with State.
pub struct Engine {
    /// Centralized state snapshot (readers load the Arc, writers swap in a new one)
    state: Arc<ArcSwap<State>>,

    /// Map of entity_id -> integration name for routing commands
    entity_integration_map: std::sync::Mutex<HashMap<String, String>>,

    /// Communication channels to integrations, keyed by integration name (= domain)
    integration_channels: std::sync::Mutex<HashMap<String, ToIntegrationSender>>,

    /// Receive messages from integrations (events)
    message_rx: Mutex<FromIntegrationReceiver>,

    /// Sender for integrations to report events back to the engine
    message_tx: FromIntegrationSender,

    /// State change bus
    events: broadcast::Sender<Event>,

    devices: Arc<DeviceRegistry>,
    entries: Arc<ConfigEntries>,
    services: ServiceRegistry,

    /// In-progress flows: flow_id -> domain
    flows: std::sync::Mutex<HashMap<String, String>>,

    /// Handles for integration tasks
    integration_handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// Capacity for the integration→engine message channel
/// Provides backpressure when integrations send faster than the engine can process
const FROM_INTEGRATION_CHANNEL_SIZE: usize = 1024;

/// Events a slow subscriber may fall behind by before it starts losing them
const EVENT_CHANNEL_SIZE: usize = 256;

fn lock<T>(m: &std::sync::Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Engine {
    /// Create a new Engine backed by the given config entry store
    pub fn new(entries: Arc<ConfigEntries>) -> Self {
        let (message_tx, message_rx) = mpsc::channel(FROM_INTEGRATION_CHANNEL_SIZE);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            state: Arc::new(ArcSwap::new(Arc::default())),
            entity_integration_map: std::sync::Mutex::new(HashMap::new()),
            integration_channels: std::sync::Mutex::new(HashMap::new()),
            message_rx: Mutex::new(message_rx),
            message_tx,
            events,
            devices: Arc::new(DeviceRegistry::new()),
            entries,
            services: ServiceRegistry::new(),
            flows: std::sync::Mutex::new(HashMap::new()),
            integration_handles: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Facilities handed to integrations at setup
    pub fn host(&self) -> Host {
        Host {
            tx: self.message_tx.clone(),
            devices: self.devices.clone(),
            entries: self.entries.clone(),
            events: self.events.clone(),
            state: self.state.clone(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Register integrations from configuration
    ///
    /// Runs every registered factory; factories return `None` for integrations
    /// that are disabled.
    pub fn register_integrations_from_config(
        &mut self,
        cfg: &crate::config::Config,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let ctx = IntegrationContext { config: cfg };
        for constr in super::integration::REGISTRY {
            let integration = match constr(&ctx) {
                Ok(Some(i)) => i,
                Err(e) => {
                    error!("failed to setup integration: {}", e);
                    continue;
                }
                Ok(None) => continue,
            };
            let name = integration.name().to_string();
            self.register_integration(name, integration);
        }

        Ok(())
    }

    /// Register an integration with the engine
    ///
    /// This spawns the integration in a background task, wires up channels,
    /// and starts its setup process.
    pub fn register_integration(&mut self, name: String, mut integration: Box<dyn Integration>) {
        let (to_integration_tx, mut to_integration_rx) = mpsc::unbounded_channel();
        let host = self.host();

        self.integration_channels
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), to_integration_tx);

        // Spawn integration task
        let handle = tokio::spawn(async move {
            if let Err(e) = integration.setup(host).await {
                warn!("Integration '{}' setup failed: {}", name, e);
                return;
            }

            // Process requests from engine
            while let Some(msg) = to_integration_rx.recv().await {
                if let Err(e) = integration.handle_message(msg).await {
                    warn!("Integration '{}' failed to handle message: {}", name, e);
                }
            }

            if let Err(e) = integration.shutdown().await {
                warn!("Integration '{}' shutdown failed: {}", name, e);
            }
        });

        self.integration_handles
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    /// Send a message to an integration by name
    fn send_to(&self, integration: &str, msg: ToIntegrationMessage) -> Result<(), EngineError> {
        let channels = lock(&self.integration_channels);
        let tx = channels
            .get(integration)
            .ok_or_else(|| EngineError::UnknownIntegration(integration.to_string()))?;
        tx.send(msg)
            .map_err(|_| EngineError::UnknownIntegration(integration.to_string()))
    }

    /// Send a request and wait for the integration's answer
    async fn request<T>(
        &self,
        integration: &str,
        build: impl FnOnce(Reply<T>) -> ToIntegrationMessage,
    ) -> Result<T, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send_to(integration, build(reply))?;
        let answer = rx
            .await
            .map_err(|_| EngineError::NoReply(integration.to_string()))?;
        Ok(answer?)
    }

    /// Send a command to an entity
    ///
    /// Routes the command to the integration that owns the entity.
    pub async fn entity_command(
        &self,
        entity_id: &str,
        command: EntityCommand,
    ) -> Result<(), EngineError> {
        let integration = lock(&self.entity_integration_map)
            .get(entity_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownEntity(entity_id.to_string()))?;

        debug!("Sending {:?} to {}", command, entity_id);
        let entity_id = entity_id.to_string();
        self.request(&integration, |reply| ToIntegrationMessage::EntityCommand {
            entity_id,
            command,
            reply,
        })
        .await
    }

    /// Call a registered service
    ///
    /// Returns the service response when `return_response` is set.
    pub async fn call_service(
        &self,
        call: ServiceCall,
        return_response: bool,
    ) -> Result<Option<Value>, EngineError> {
        let description = self.services.resolve(&call, return_response)?;
        info!("Calling service {}.{}", call.domain, call.service);
        self.request(&description.integration, |reply| {
            ToIntegrationMessage::ServiceCall {
                call,
                return_response,
                reply,
            }
        })
        .await
    }

    pub fn list_services(&self) -> Vec<ServiceDescription> {
        self.services.all()
    }

    pub fn devices(&self) -> Vec<Arc<DeviceEntry>> {
        self.devices.all()
    }

    pub fn config_entries(&self) -> Vec<ConfigEntry> {
        self.entries.all()
    }

    /// Unload a config entry, then delete it and its devices
    pub async fn remove_config_entry(&self, entry_id: &str) -> Result<(), EngineError> {
        let entry = self
            .entries
            .get(entry_id)
            .ok_or_else(|| EngineError::UnknownEntry(entry_id.to_string()))?;

        let id = entry_id.to_string();
        self.request(&entry.domain, |reply| ToIntegrationMessage::RemoveEntry {
            entry_id: id,
            reply,
        })
        .await?;

        self.entries.remove(entry_id).await?;
        let removed = self.devices.remove_config_entry(entry_id);
        info!(
            "Removed config entry {} and {} device(s)",
            entry_id,
            removed.len()
        );
        Ok(())
    }

    pub async fn entry_diagnostics(&self, entry_id: &str) -> Result<Value, EngineError> {
        let entry = self
            .entries
            .get(entry_id)
            .ok_or_else(|| EngineError::UnknownEntry(entry_id.to_string()))?;

        let target = DiagnosticsTarget::ConfigEntry(entry.entry_id);
        self.request(&entry.domain, |reply| ToIntegrationMessage::Diagnostics {
            target,
            reply,
        })
        .await
    }

    pub async fn device_diagnostics(&self, device_id: &str) -> Result<Value, EngineError> {
        let device = self
            .devices
            .get(device_id)
            .ok_or_else(|| EngineError::UnknownDevice(device_id.to_string()))?;
        let entry = device
            .config_entries
            .iter()
            .find_map(|id| self.entries.get(id))
            .ok_or_else(|| EngineError::UnknownDevice(device_id.to_string()))?;

        let target = DiagnosticsTarget::Device {
            entry_id: entry.entry_id,
            device_id: device.id.clone(),
        };
        self.request(&entry.domain, |reply| ToIntegrationMessage::Diagnostics {
            target,
            reply,
        })
        .await
    }

    /// Start a config flow for `domain`
    ///
    /// `Reconfigure` and `Options` flows need the entry they act on.
    pub async fn config_flow_start(
        &self,
        domain: &str,
        source: FlowSource,
        entry_id: Option<String>,
        data: Option<Value>,
    ) -> Result<FlowOutcome, EngineError> {
        if let Some(entry_id) = &entry_id {
            match self.entries.get(entry_id) {
                Some(entry) if entry.domain == domain => {}
                _ => return Err(EngineError::UnknownEntry(entry_id.clone())),
            }
        } else if matches!(source, FlowSource::Reconfigure | FlowSource::Options) {
            return Err(EngineError::Request(RequestError::Invalid(format!(
                "{} flows require an entry_id",
                source
            ))));
        }

        let flow_id = ulid::Ulid::new().to_string().to_lowercase();
        debug!("Starting {} flow {} for {}", source, flow_id, domain);
        self.advance_flow(
            domain,
            flow_id,
            FlowStep::Start {
                source,
                entry_id,
                data,
            },
        )
        .await
    }

    /// Continue a flow that is showing a form
    pub async fn config_flow_continue(
        &self,
        flow_id: &str,
        data: Value,
    ) -> Result<FlowOutcome, EngineError> {
        let domain = lock(&self.flows)
            .get(flow_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownFlow(flow_id.to_string()))?;

        self.advance_flow(&domain, flow_id.to_string(), FlowStep::Continue { data })
            .await
    }

    async fn advance_flow(
        &self,
        domain: &str,
        flow_id: String,
        step: FlowStep,
    ) -> Result<FlowOutcome, EngineError> {
        let id = flow_id.clone();
        let result = self
            .request(domain, |reply| ToIntegrationMessage::ConfigFlow {
                flow_id: id,
                step,
                reply,
            })
            .await;

        let mut flows = lock(&self.flows);
        match &result {
            Ok(r) if r.is_form() => {
                flows.insert(flow_id.clone(), domain.to_string());
            }
            _ => {
                flows.remove(&flow_id);
            }
        }

        Ok(FlowOutcome {
            flow_id,
            result: result?,
        })
    }

    /// Set an entity's state from outside any integration (e.g. an external
    /// sensor reading pushed over the API).
    pub fn set_state(
        &self,
        entity_id: &str,
        state: impl Into<String>,
        attributes: Map<String, Value>,
    ) -> EntityState {
        let new_state = EntityState::new(entity_id, state, attributes);
        self.write_state(entity_id, Some(new_state.clone()));
        new_state
    }

    /// Run the engine's main event loop
    ///
    /// Processes incoming events from integrations and updates state.
    pub async fn run(&self) -> Result<(), Box<dyn Error + Send>> {
        info!("Engine starting");

        let mut rx = self.message_rx.lock().await;
        while let Some(msg) = rx.recv().await {
            if let Err(e) = self.handle_event(msg).await {
                warn!("Error handling event: {}", e);
            }
        }

        info!("Engine shutting down");
        Ok(())
    }

    /// Close every integration channel and wait for the integrations to shut down
    pub async fn shutdown(&self) {
        lock(&self.integration_channels).clear();
        let handles: Vec<_> = lock(&self.integration_handles).drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Integration task failed: {}", e);
            }
        }
    }

    /// Get a snapshot of the current engine state.
    ///
    /// Clones the `Arc` (atomic refcount bump), essentially free.
    pub fn state_snapshot(&self) -> Arc<State> {
        self.state.load_full()
    }

    /// Store a new state (or remove it with `None`) and publish the change.
    /// Writes that change nothing but the timestamp are dropped.
    fn write_state(&self, entity_id: &str, new_state: Option<EntityState>) {
        let unchanged = match (self.state.load().get(entity_id), &new_state) {
            (Some(old), Some(new)) => old.same_as(new),
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            return;
        }

        let previous = self.state.rcu(|state| {
            let mut state = State::clone(state);
            match &new_state {
                Some(s) => {
                    state.entities.insert(entity_id.to_string(), s.clone());
                }
                None => {
                    state.entities.remove(entity_id);
                }
            }
            state
        });

        // No subscribers is fine
        let _ = self.events.send(Event::StateChanged {
            entity_id: entity_id.to_string(),
            old_state: previous.get(entity_id).cloned(),
            new_state,
        });
    }

    /// Handle an event from an integration
    async fn handle_event(&self, msg: FromIntegrationMessage) -> Result<(), Box<dyn Error + Send>> {
        match msg {
            FromIntegrationMessage::EntityDiscovered {
                info,
                integration_name,
            } => {
                info!(
                    "Entity discovered: {} (from {})",
                    info.entity_id, integration_name
                );

                // State is not populated until the first state-change message arrives.
                lock(&self.entity_integration_map).insert(info.entity_id, integration_name);
            }
            FromIntegrationMessage::EntityRemoved { entity_id } => {
                info!("Entity removed: {}", entity_id);
                self.write_state(&entity_id, None);
                lock(&self.entity_integration_map).remove(&entity_id);
            }
            FromIntegrationMessage::StateChanged {
                entity_id,
                state,
                attributes,
            } => {
                debug!("State changed: {} -> {}", entity_id, state);
                let new_state = EntityState::new(entity_id.clone(), state, attributes);
                self.write_state(&entity_id, Some(new_state));
            }
            FromIntegrationMessage::ServiceRegistered {
                domain,
                service,
                supports_response,
                integration_name,
            } => {
                debug!("Service registered: {}.{}", domain, service);
                self.services.register(ServiceDescription {
                    domain,
                    service,
                    supports_response,
                    integration: integration_name,
                });
            }
            FromIntegrationMessage::ServiceRemoved { domain, service } => {
                debug!("Service removed: {}.{}", domain, service);
                self.services.remove(&domain, &service);
            }
        }
        Ok(())
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(Arc::new(ConfigEntries::in_memory()))
    }
}
