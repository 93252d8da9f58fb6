mod device;
mod engine;
mod entity;
mod entries;
mod event;
mod flow;
mod integration;
mod message;
mod services;
pub mod state;

pub use device::DeviceConnection;
pub use device::DeviceEntry;
pub use device::DeviceIdentifier;
pub use device::DeviceInfo;
pub use device::DeviceRegistry;
pub use engine::Engine;
pub use engine::EngineError;
pub use entity::EntityCommand;
pub use entity::EntityCommandError;
pub use entity::EntityInfo;
pub use entity::Platform;
pub use entries::ConfigEntries;
pub use entries::ConfigEntry;
pub use entries::StoreError;
pub use event::Event;
pub use flow::FlowOutcome;
pub use flow::FlowResult;
pub use flow::FlowSource;
pub use flow::FlowStep;
pub use integration::FromIntegrationSender;
pub use integration::Host;
pub use integration::Integration;
pub use integration::IntegrationContext;
pub use integration::IntegrationFactoryResult;
pub use integration::REGISTRY as INTEGRATION_REGISTRY;
pub use message::DiagnosticsTarget;
pub use message::FromIntegrationMessage;
pub use message::Reply;
pub use message::RequestError;
pub use message::ToIntegrationMessage;
pub use services::ServiceCall;
pub use services::ServiceDescription;
pub use services::ServiceError;
pub use services::SupportsResponse;
pub use state::EntityState;
pub use state::State;
