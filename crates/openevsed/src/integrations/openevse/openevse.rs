use std::error::Error;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::DOMAIN;
use super::charger::ChargerFactory;
use super::config_flow::ConfigFlows;
use super::diagnostics;
use super::entry::EntryManager;
use super::services;
use crate::config::OpenEvseConfig;
use crate::engine::DiagnosticsTarget;
use crate::engine::Host;
use crate::engine::Integration;
use crate::engine::RequestError;
use crate::engine::ToIntegrationMessage;

/// OpenEVSE integration for openevsed
///
/// Every config entry of the `openevse` domain is one charger. Entries are
/// loaded at setup and whenever a config flow creates one.
pub struct OpenEvseIntegration {
    settings: OpenEvseConfig,
    factory: ChargerFactory,
    manager: Option<Arc<EntryManager>>,
    flows: ConfigFlows,
}

impl OpenEvseIntegration {
    pub fn new(settings: &OpenEvseConfig, factory: ChargerFactory) -> Self {
        Self {
            settings: settings.clone(),
            factory,
            manager: None,
            flows: ConfigFlows::default(),
        }
    }

    fn manager(&self) -> Result<&Arc<EntryManager>, RequestError> {
        self.manager
            .as_ref()
            .ok_or_else(|| RequestError::Failed(format!("{} is not set up", DOMAIN)))
    }

    async fn diagnostics(&self, target: DiagnosticsTarget) -> Result<Value, RequestError> {
        let manager = self.manager()?;
        match target {
            DiagnosticsTarget::ConfigEntry(entry_id) => manager
                .host()
                .entries
                .get(&entry_id)
                .map(|entry| diagnostics::entry_diagnostics(&entry))
                .ok_or_else(|| RequestError::NotFound(format!("Config entry {} does not exist", entry_id))),
            DiagnosticsTarget::Device {
                entry_id,
                device_id,
            } => match manager.runtime(&entry_id).await {
                Some(runtime) if runtime.device_id == device_id => Ok(
                    diagnostics::device_diagnostics(&runtime.coordinator.snapshot()),
                ),
                _ => Err(RequestError::NotFound(format!(
                    "Device {} is not loaded for entry {}",
                    device_id, entry_id
                ))),
            },
        }
    }
}

#[async_trait]
impl Integration for OpenEvseIntegration {
    fn name(&self) -> &str {
        DOMAIN
    }

    async fn setup(&mut self, host: Host) -> Result<(), Box<dyn Error + Send>> {
        let entries = host.entries.by_domain(DOMAIN);
        let manager = EntryManager::new(host, self.settings.clone(), self.factory.clone());
        self.manager = Some(manager.clone());

        info!("Loading {} OpenEVSE config entries", entries.len());
        for entry in &entries {
            // Failures are logged by the manager; unready chargers keep retrying
            let _ = manager.load(entry).await;
        }
        Ok(())
    }

    async fn handle_message(
        &mut self,
        msg: ToIntegrationMessage,
    ) -> Result<(), Box<dyn Error + Send>> {
        match msg {
            ToIntegrationMessage::EntityCommand {
                entity_id,
                command,
                reply,
            } => {
                debug!("Handling {:?} for {}", command, entity_id);
                let result = match self.manager() {
                    Ok(manager) => match manager.owner_of(&entity_id).await {
                        Some(runtime) => runtime.command(&entity_id, command).await,
                        None => Err(RequestError::NotFound(format!("Unknown entity {}", entity_id))),
                    },
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            ToIntegrationMessage::ServiceCall {
                call,
                return_response,
                reply,
            } => {
                let result = match self.manager() {
                    Ok(manager) => {
                        let chargers = manager.chargers().await;
                        services::handle(&call, &manager.host().devices, &chargers).await
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result.map(|response| response.filter(|_| return_response)));
            }
            ToIntegrationMessage::ConfigFlow {
                flow_id,
                step,
                reply,
            } => {
                let result = match self.manager.clone() {
                    Some(manager) => self.flows.step(&manager, &flow_id, step).await,
                    None => Err(RequestError::Failed(format!("{} is not set up", DOMAIN))),
                };
                let _ = reply.send(result);
            }
            ToIntegrationMessage::Diagnostics { target, reply } => {
                let _ = reply.send(self.diagnostics(target).await);
            }
            ToIntegrationMessage::RemoveEntry { entry_id, reply } => {
                let result = match self.manager() {
                    Ok(manager) => {
                        if !manager.unload(&entry_id).await {
                            warn!("Entry {} was not loaded", entry_id);
                        }
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), Box<dyn Error + Send>> {
        info!("OpenEVSE integration shutting down");
        if let Some(manager) = self.manager.take() {
            manager.unload_all().await;
        }
        Ok(())
    }
}
