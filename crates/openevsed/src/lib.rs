pub mod api;
pub mod config;
mod engine;
mod integrations;

pub use config::Config;
pub use config::Diagnostic;
pub use config::LogLevel;
pub use config::format_diagnostics;
pub use engine::ConfigEntries;
pub use engine::ConfigEntry;
pub use engine::Engine;
pub use engine::EngineError;
pub use engine::EntityState;
pub use engine::Event;
pub use engine::FlowOutcome;
pub use engine::FlowResult;
pub use engine::FlowSource;
pub use engine::State;
