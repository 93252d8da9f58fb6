use std::error::Error;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use linkme::distributed_slice;
use tokio::sync::broadcast;
use tokio::sync::mpsc;

use super::device::DeviceRegistry;
use super::entries::ConfigEntries;
use super::event::Event;
use super::message::FromIntegrationMessage;
use super::message::ToIntegrationMessage;
use super::state::EntityState;
use super::state::State;
use crate::config::Config;

/// Channel types for messages FROM integrations TO the engine
/// These are bounded channels to provide backpressure
pub type FromIntegrationSender = mpsc::Sender<FromIntegrationMessage>;
pub type FromIntegrationReceiver = mpsc::Receiver<FromIntegrationMessage>;

/// Channel types for messages FROM the engine TO integrations (unbounded - engine must not block)
pub type ToIntegrationSender = mpsc::UnboundedSender<ToIntegrationMessage>;

/// Result type for integration factory functions
pub type IntegrationFactoryResult = anyhow::Result<Option<Box<dyn Integration>>>;

pub struct IntegrationContext<'a> {
    pub config: &'a Config,
}

#[distributed_slice]
pub static REGISTRY: [fn(&IntegrationContext) -> IntegrationFactoryResult];

/// Engine facilities handed to an integration at setup.
#[derive(Clone)]
pub struct Host {
    /// Report entities, state changes and services back to the engine
    pub tx: FromIntegrationSender,
    pub devices: Arc<DeviceRegistry>,
    pub entries: Arc<ConfigEntries>,
    pub(super) events: broadcast::Sender<Event>,
    pub(super) state: Arc<ArcSwap<State>>,
}

impl Host {
    /// Subscribe to state change events for every entity.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Current state of an entity, if it has reported one.
    pub fn state(&self, entity_id: &str) -> Option<EntityState> {
        self.state.load().get(entity_id).cloned()
    }
}

/// Integration trait that all integrations must implement
#[async_trait]
pub trait Integration: Send + Sync {
    /// Get the name/identifier of this integration, also its domain
    fn name(&self) -> &str;

    /// Set up the integration - load config entries, create entities, etc.
    ///
    /// The integration receives the host facilities, including the sender to
    /// report events back to the engine (discovery, state changes, etc.)
    async fn setup(&mut self, host: Host) -> Result<(), Box<dyn Error + Send>>;

    /// Handle a request from the engine
    ///
    /// Requests carrying a reply channel must always be answered, even on failure.
    async fn handle_message(
        &mut self,
        msg: ToIntegrationMessage,
    ) -> Result<(), Box<dyn Error + Send>>;

    /// Shut down the integration gracefully
    async fn shutdown(&mut self) -> Result<(), Box<dyn Error + Send>>;
}
