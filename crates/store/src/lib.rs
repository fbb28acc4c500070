//! Read access to published service definitions and write access for call
//! records.
//!
//! The gateway never mutates definitions; the only writes are call records
//! and the per-day counters that go with them.

use std::collections::BTreeMap;

use async_trait::async_trait;
use dag_contracts::{ServiceAssociations, SubService};

mod call_record;
mod memory;
mod postgres;

pub use call_record::{CallRecordWriter, record_date};
pub use memory::InMemoryServiceStore;
pub use postgres::PgServiceStore;

#[derive(Debug)]
pub enum StoreError {
    NotFound,
    Timeout,
    /// A stored value could not be mapped onto the data model.
    Corrupt(String),
    Sqlx(sqlx::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound)
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound => write!(f, "service not found"),
            StoreError::Timeout => write!(f, "store operation timed out"),
            StoreError::Corrupt(detail) => write!(f, "store row is malformed: {}", detail),
            StoreError::Sqlx(err) => write!(f, "store sql error: {}", err),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<sqlx::Error> for StoreError {
    fn from(value: sqlx::Error) -> Self {
        match value {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            other => StoreError::Sqlx(other),
        }
    }
}

/// Columns of the service row that can be read without resolving the whole
/// definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ServiceField {
    ServiceId,
    ServiceName,
    ServiceType,
    Status,
    CreateModel,
    DepartmentId,
    AppId,
    TimeoutSeconds,
    RateLimitPerSecond,
}

impl ServiceField {
    pub(crate) fn column(self) -> &'static str {
        match self {
            ServiceField::ServiceId => "service_id",
            ServiceField::ServiceName => "service_name",
            ServiceField::ServiceType => "service_type",
            ServiceField::Status => "status",
            ServiceField::CreateModel => "create_model",
            ServiceField::DepartmentId => "department_id",
            ServiceField::AppId => "app_id",
            ServiceField::TimeoutSeconds => "timeout_seconds",
            ServiceField::RateLimitPerSecond => "rate_limit_per_second",
        }
    }
}

pub type ServiceFields = BTreeMap<ServiceField, Option<String>>;

#[async_trait]
pub trait ServiceStore: Send + Sync {
    /// Resolves the live (not soft-deleted) service at `path` with every
    /// relation loaded.
    async fn get_by_path(&self, path: &str) -> Result<ServiceAssociations, StoreError>;

    async fn get_sub_services(&self, service_id: &str) -> Result<Vec<SubService>, StoreError>;

    /// True when a live service other than `exclude_id` owns `path`.
    async fn is_path_used(&self, path: &str, exclude_id: Option<&str>)
    -> Result<bool, StoreError>;

    /// Reads selected columns of the live service bound to `method` and
    /// `path`. Values are rendered as text.
    async fn get_fields(
        &self,
        method: &str,
        path: &str,
        fields: &[ServiceField],
    ) -> Result<ServiceFields, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}
