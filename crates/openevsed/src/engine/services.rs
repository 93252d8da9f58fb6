use dashmap::DashMap;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Whether a service returns data to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupportsResponse {
    None,
    Optional,
    Only,
}

/// A request to run `domain.service` with `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCall {
    pub domain: String,
    pub service: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceDescription {
    pub domain: String,
    pub service: String,
    pub supports_response: SupportsResponse,
    /// Integration that handles calls to this service
    pub integration: String,
}

#[derive(Debug, Error, PartialEq)]
pub enum ServiceError {
    #[error("Service {domain}.{service} not found")]
    NotFound { domain: String, service: String },

    #[error("Service {domain}.{service} does not return responses")]
    ResponseNotSupported { domain: String, service: String },

    #[error("Service {domain}.{service} must be called with return_response")]
    ResponseRequired { domain: String, service: String },
}

/// Registered services keyed by `(domain, service)`.
#[derive(Default)]
pub struct ServiceRegistry {
    services: DashMap<(String, String), ServiceDescription>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, description: ServiceDescription) {
        let key = (description.domain.clone(), description.service.clone());
        self.services.insert(key, description);
    }

    pub fn remove(&self, domain: &str, service: &str) -> Option<ServiceDescription> {
        self.services
            .remove(&(domain.to_string(), service.to_string()))
            .map(|(_, d)| d)
    }

    /// All services sorted by domain then name.
    pub fn all(&self) -> Vec<ServiceDescription> {
        let mut all: Vec<_> = self.services.iter().map(|r| r.value().clone()).collect();
        all.sort_by(|a, b| (&a.domain, &a.service).cmp(&(&b.domain, &b.service)));
        all
    }

    /// Resolve the service for a call, enforcing its response contract.
    pub fn resolve(
        &self,
        call: &ServiceCall,
        return_response: bool,
    ) -> Result<ServiceDescription, ServiceError> {
        let description = self
            .services
            .get(&(call.domain.clone(), call.service.clone()))
            .map(|r| r.value().clone())
            .ok_or_else(|| ServiceError::NotFound {
                domain: call.domain.clone(),
                service: call.service.clone(),
            })?;

        match (description.supports_response, return_response) {
            (SupportsResponse::None, true) => Err(ServiceError::ResponseNotSupported {
                domain: call.domain.clone(),
                service: call.service.clone(),
            }),
            (SupportsResponse::Only, false) => Err(ServiceError::ResponseRequired {
                domain: call.domain.clone(),
                service: call.service.clone(),
            }),
            _ => Ok(description),
        }
    }
}
