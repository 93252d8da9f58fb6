//! Type-safe message system for openevsed
//!
//! Messages are split by direction to enforce correct usage at compile time:
//! - `FromIntegrationMessage`: Events from integrations to the engine
//! - `ToIntegrationMessage`: Requests from the engine to integrations
//!
//! Requests that need an answer carry a `oneshot` sender for the reply.

use serde_json::Map;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;

use super::entity::EntityCommand;
use super::entity::EntityInfo;
use super::flow::FlowResult;
use super::flow::FlowStep;
use super::services::ServiceCall;
use super::services::SupportsResponse;

/// Failure reported by an integration while answering a request.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RequestError {
    /// The caller supplied something unacceptable
    #[error("{0}")]
    Invalid(String),

    /// The request referred to something that does not exist
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Failed(String),
}

pub type Reply<T> = oneshot::Sender<Result<T, RequestError>>;

/// Target of a diagnostics request.
#[derive(Debug, Clone, PartialEq)]
pub enum DiagnosticsTarget {
    ConfigEntry(String),
    Device { entry_id: String, device_id: String },
}

/// Messages FROM integrations TO the engine (events/state updates)
pub enum FromIntegrationMessage {
    /// An entity was created
    EntityDiscovered {
        info: EntityInfo,
        integration_name: String,
    },

    /// An entity was removed (entry unloaded, etc.)
    EntityRemoved { entity_id: String },

    /// An entity's state changed
    StateChanged {
        entity_id: String,
        state: String,
        attributes: Map<String, Value>,
    },

    ServiceRegistered {
        domain: String,
        service: String,
        supports_response: SupportsResponse,
        integration_name: String,
    },

    ServiceRemoved { domain: String, service: String },
}

impl std::fmt::Debug for FromIntegrationMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FromIntegrationMessage::EntityDiscovered {
                info,
                integration_name,
            } => f
                .debug_struct("EntityDiscovered")
                .field("entity_id", &info.entity_id)
                .field("integration_name", integration_name)
                .finish(),
            FromIntegrationMessage::EntityRemoved { entity_id } => f
                .debug_struct("EntityRemoved")
                .field("entity_id", entity_id)
                .finish(),
            FromIntegrationMessage::StateChanged {
                entity_id,
                state,
                attributes,
            } => f
                .debug_struct("StateChanged")
                .field("entity_id", entity_id)
                .field("state", state)
                .field("attributes", &attributes.len())
                .finish(),
            FromIntegrationMessage::ServiceRegistered {
                domain,
                service,
                supports_response,
                ..
            } => f
                .debug_struct("ServiceRegistered")
                .field("service", &format!("{}.{}", domain, service))
                .field("supports_response", supports_response)
                .finish(),
            FromIntegrationMessage::ServiceRemoved { domain, service } => f
                .debug_struct("ServiceRemoved")
                .field("service", &format!("{}.{}", domain, service))
                .finish(),
        }
    }
}

/// Messages FROM the engine TO integrations (requests)
#[derive(Debug)]
pub enum ToIntegrationMessage {
    /// Perform an action on one of the integration's entities
    EntityCommand {
        entity_id: String,
        command: EntityCommand,
        reply: Reply<()>,
    },

    /// Run one of the integration's services
    ServiceCall {
        call: ServiceCall,
        return_response: bool,
        reply: Reply<Option<Value>>,
    },

    /// Advance a config, options or discovery flow
    ConfigFlow {
        flow_id: String,
        step: FlowStep,
        reply: Reply<FlowResult>,
    },

    Diagnostics {
        target: DiagnosticsTarget,
        reply: Reply<Value>,
    },

    /// Unload a config entry ahead of its deletion
    RemoveEntry { entry_id: String, reply: Reply<()> },
}
