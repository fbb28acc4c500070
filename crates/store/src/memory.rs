use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dag_contracts::{ServiceAssociations, SubService};
use tokio::sync::RwLock;

use crate::{ServiceField, ServiceFields, ServiceStore, StoreError};

/// A map-backed store for tests and local tooling. Counts `get_by_path`
/// calls so callers can observe cache behaviour.
#[derive(Clone, Default)]
pub struct InMemoryServiceStore {
    services: Arc<RwLock<HashMap<String, ServiceAssociations>>>,
    loads: Arc<AtomicU64>,
}

impl InMemoryServiceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, associations: ServiceAssociations) {
        self.services
            .write()
            .await
            .insert(associations.service.service_path.clone(), associations);
    }

    pub async fn remove(&self, path: &str) {
        self.services.write().await.remove(path);
    }

    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ServiceStore for InMemoryServiceStore {
    async fn get_by_path(&self, path: &str) -> Result<ServiceAssociations, StoreError> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        self.services
            .read()
            .await
            .get(path)
            .filter(|a| a.service.deleted_at == 0)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn get_sub_services(&self, service_id: &str) -> Result<Vec<SubService>, StoreError> {
        let services = self.services.read().await;
        Ok(services
            .values()
            .filter(|a| a.service.service_id == service_id)
            .flat_map(|a| a.sub_services.iter().cloned())
            .collect())
    }

    async fn is_path_used(
        &self,
        path: &str,
        exclude_id: Option<&str>,
    ) -> Result<bool, StoreError> {
        let services = self.services.read().await;
        Ok(services.get(path).is_some_and(|a| {
            a.service.deleted_at == 0 && Some(a.service.service_id.as_str()) != exclude_id
        }))
    }

    async fn get_fields(
        &self,
        method: &str,
        path: &str,
        fields: &[ServiceField],
    ) -> Result<ServiceFields, StoreError> {
        let services = self.services.read().await;
        let service = services
            .get(path)
            .map(|a| &a.service)
            .filter(|s| s.deleted_at == 0 && s.http_method.eq_ignore_ascii_case(method))
            .ok_or(StoreError::NotFound)?;

        Ok(fields
            .iter()
            .map(|field| {
                let value = match field {
                    ServiceField::ServiceId => Some(service.service_id.clone()),
                    ServiceField::ServiceName => Some(service.service_name.clone()),
                    ServiceField::ServiceType => Some(service.service_type.as_str().to_string()),
                    ServiceField::Status => Some(service.status.as_str().to_string()),
                    ServiceField::CreateModel => Some(service.create_model.as_str().to_string()),
                    ServiceField::DepartmentId => Some(service.department_id.clone()),
                    ServiceField::AppId => service.app_id.clone(),
                    ServiceField::TimeoutSeconds => Some(service.timeout_seconds.to_string()),
                    ServiceField::RateLimitPerSecond => {
                        Some(service.rate_limit_per_second.to_string())
                    }
                };
                (*field, value)
            })
            .collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
