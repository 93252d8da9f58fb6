use super::state::EntityState;

/// Events published on the engine's broadcast bus.
///
/// Distinct from `FromIntegrationMessage` (transport-level). The engine converts
/// messages into events once the state store has been updated.
#[derive(Debug, Clone)]
pub enum Event {
    /// An entity's state or attributes changed. `new_state` is `None` when the
    /// entity was removed, `old_state` is `None` on first report.
    StateChanged {
        entity_id: String,
        old_state: Option<EntityState>,
        new_state: Option<EntityState>,
    },
}
