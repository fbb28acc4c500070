use std::time::Duration;

use async_trait::async_trait;
use dag_contracts::{
    CreateModel, DataType, Operator, ParamType, Service, ServiceAssociations, ServiceDataSource,
    ServiceParam, ServiceResponseFilter, ServiceScriptModel, ServiceStatus, ServiceType,
    SortOrder, SubService,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::Instrument;

use crate::{ServiceField, ServiceFields, ServiceStore, StoreError};

const SERVICE_COLUMNS: &str = "service_id, service_name, service_path, http_method, service_type, status, publish_status, create_model, timeout_seconds, rate_limit_per_second, backend_host, backend_path, department_id, app_id, deleted_at";

#[derive(Clone)]
pub struct PgServiceStore {
    pool: PgPool,
    query_timeout: Duration,
}

impl PgServiceStore {
    pub async fn connect(db_url: &str, query_timeout: Duration) -> Result<Self, StoreError> {
        let pool = tokio::time::timeout(
            Duration::from_secs(2),
            PgPoolOptions::new().max_connections(16).connect(db_url),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        Ok(Self::from_pool(pool, query_timeout))
    }

    pub fn from_pool(pool: PgPool, query_timeout: Duration) -> Self {
        Self {
            pool,
            query_timeout,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn load_service(&self, path: &str) -> Result<Service, StoreError> {
        let sql = format!(
            "SELECT {} FROM service WHERE service_path = $1 AND deleted_at = 0 LIMIT 1",
            SERVICE_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(path)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound)?;
        service_from_row(&row)
    }

    async fn load_params(&self, service_id: &str) -> Result<Vec<ServiceParam>, StoreError> {
        let rows = sqlx::query(
            "SELECT param_type, en_name, cn_name, data_type, required, default_value, operator, sort, masking, sequence FROM service_param WHERE service_id = $1 ORDER BY sequence, en_name",
        )
        .bind(service_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(param_from_row).collect()
    }

    async fn load_data_source(
        &self,
        service_id: &str,
    ) -> Result<Option<ServiceDataSource>, StoreError> {
        let row = sqlx::query(
            "SELECT data_view_id, catalog_name, data_schema_name, data_table_name FROM service_data_source WHERE service_id = $1 LIMIT 1",
        )
        .bind(service_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<ServiceDataSource, StoreError> {
            Ok(ServiceDataSource {
                data_view_id: text(&row, "data_view_id")?,
                catalog_name: text(&row, "catalog_name")?,
                data_schema_name: text(&row, "data_schema_name")?,
                data_table_name: text(&row, "data_table_name")?,
            })
        })
        .transpose()
    }

    async fn load_script_model(
        &self,
        service_id: &str,
    ) -> Result<Option<ServiceScriptModel>, StoreError> {
        let row = sqlx::query(
            "SELECT script, page_size FROM service_script_model WHERE service_id = $1 LIMIT 1",
        )
        .bind(service_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<ServiceScriptModel, StoreError> {
            let page_size: Option<i32> = row.try_get("page_size")?;
            Ok(ServiceScriptModel {
                script: text(&row, "script")?,
                page_size: page_size.and_then(|p| u32::try_from(p).ok()).unwrap_or(0),
            })
        })
        .transpose()
    }

    async fn load_response_filters(
        &self,
        service_id: &str,
    ) -> Result<Vec<ServiceResponseFilter>, StoreError> {
        let rows = sqlx::query(
            "SELECT param, operator, value FROM service_response_filter WHERE service_id = $1 ORDER BY param",
        )
        .bind(service_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<ServiceResponseFilter, StoreError> {
                let raw = text(row, "operator")?;
                let operator = Operator::parse(&raw).ok_or_else(|| {
                    StoreError::Corrupt(format!("unknown response filter operator `{}`", raw))
                })?;
                Ok(ServiceResponseFilter {
                    param: text(row, "param")?,
                    operator,
                    value: text(row, "value")?,
                })
            })
            .collect()
    }

    async fn load_sub_services(&self, service_id: &str) -> Result<Vec<SubService>, StoreError> {
        let rows = sqlx::query(
            "SELECT sub_service_id, service_id, name, row_filter_clause FROM sub_service WHERE service_id = $1 AND deleted_at = 0",
        )
        .bind(service_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<SubService, StoreError> {
                Ok(SubService {
                    sub_service_id: text(row, "sub_service_id")?,
                    service_id: text(row, "service_id")?,
                    name: text(row, "name")?,
                    row_filter_clause: text(row, "row_filter_clause")?,
                })
            })
            .collect()
    }

    async fn with_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(self.query_timeout, fut)
            .await
            .map_err(|_| StoreError::Timeout)?
    }
}

#[async_trait]
impl ServiceStore for PgServiceStore {
    async fn get_by_path(&self, path: &str) -> Result<ServiceAssociations, StoreError> {
        let span = tracing::info_span!("store.resolve", service_path = %path);
        self.with_timeout(async {
            let service = self.load_service(path).await?;
            let id = service.service_id.as_str();
            let (params, data_source, script_model, response_filters, sub_services) = tokio::try_join!(
                self.load_params(id),
                self.load_data_source(id),
                self.load_script_model(id),
                self.load_response_filters(id),
                self.load_sub_services(id),
            )?;

            Ok::<_, StoreError>(ServiceAssociations {
                service,
                data_source,
                script_model,
                params,
                response_filters,
                sub_services,
            })
        })
        .instrument(span)
        .await
    }

    async fn get_sub_services(&self, service_id: &str) -> Result<Vec<SubService>, StoreError> {
        self.with_timeout(self.load_sub_services(service_id)).await
    }

    async fn is_path_used(
        &self,
        path: &str,
        exclude_id: Option<&str>,
    ) -> Result<bool, StoreError> {
        self.with_timeout(async {
            let row = sqlx::query(
                "SELECT EXISTS (SELECT 1 FROM service WHERE service_path = $1 AND deleted_at = 0 AND ($2::text IS NULL OR service_id <> $2)) AS used",
            )
            .bind(path)
            .bind(exclude_id)
            .fetch_one(&self.pool)
            .await?;
            Ok::<_, StoreError>(row.try_get::<bool, _>("used")?)
        })
        .await
    }

    async fn get_fields(
        &self,
        method: &str,
        path: &str,
        fields: &[ServiceField],
    ) -> Result<ServiceFields, StoreError> {
        if fields.is_empty() {
            return Ok(ServiceFields::new());
        }

        // Column names come from the closed `ServiceField` set.
        let columns = fields
            .iter()
            .map(|f| format!("{0}::text AS {0}", f.column()))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {} FROM service WHERE service_path = $1 AND upper(http_method) = upper($2) AND deleted_at = 0 LIMIT 1",
            columns
        );

        self.with_timeout(async {
            let row = sqlx::query(&sql)
                .bind(path)
                .bind(method)
                .fetch_optional(&self.pool)
                .await?
                .ok_or(StoreError::NotFound)?;

            let mut out = ServiceFields::new();
            for field in fields {
                let value: Option<String> = row.try_get(field.column())?;
                out.insert(*field, value);
            }
            Ok::<_, StoreError>(out)
        })
        .await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.with_timeout(async {
            sqlx::query("SELECT 1").execute(&self.pool).await?;
            Ok::<_, StoreError>(())
        })
        .await
    }
}

fn text(row: &PgRow, column: &str) -> Result<String, StoreError> {
    let value: Option<String> = row.try_get(column)?;
    Ok(value.unwrap_or_default())
}

fn service_from_row(row: &PgRow) -> Result<Service, StoreError> {
    let raw_type = text(row, "service_type")?;
    let service_type = ServiceType::parse(&raw_type)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown service_type `{}`", raw_type)))?;
    let raw_model = text(row, "create_model")?;
    let create_model = match CreateModel::parse(&raw_model) {
        Some(model) => model,
        // Register services carry no query model.
        None if service_type == ServiceType::Register => CreateModel::Wizard,
        None => {
            return Err(StoreError::Corrupt(format!(
                "unknown create_model `{}`",
                raw_model
            )));
        }
    };

    let timeout_seconds: Option<i64> = row.try_get("timeout_seconds")?;
    let rate_limit: Option<i32> = row.try_get("rate_limit_per_second")?;
    let app_id: Option<String> = row.try_get("app_id")?;

    Ok(Service {
        service_id: text(row, "service_id")?,
        service_name: text(row, "service_name")?,
        service_path: text(row, "service_path")?,
        http_method: text(row, "http_method")?.to_ascii_uppercase(),
        service_type,
        status: ServiceStatus::parse(&text(row, "status")?),
        publish_status: text(row, "publish_status")?,
        create_model,
        timeout_seconds: timeout_seconds
            .and_then(|t| u64::try_from(t).ok())
            .unwrap_or(0),
        rate_limit_per_second: rate_limit.and_then(|r| u32::try_from(r).ok()).unwrap_or(0),
        backend_host: text(row, "backend_host")?,
        backend_path: text(row, "backend_path")?,
        department_id: text(row, "department_id")?,
        app_id: app_id.filter(|a| !a.trim().is_empty()),
        deleted_at: row.try_get("deleted_at")?,
    })
}

fn param_from_row(row: &PgRow) -> Result<ServiceParam, StoreError> {
    let raw_param_type = text(row, "param_type")?;
    let param_type = ParamType::parse(&raw_param_type)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown param_type `{}`", raw_param_type)))?;
    let raw_data_type = text(row, "data_type")?;
    let data_type = DataType::parse(&raw_data_type)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown data_type `{}`", raw_data_type)))?;

    let operator = match text(row, "operator")?.trim() {
        "" => None,
        raw => Some(
            Operator::parse(raw)
                .ok_or_else(|| StoreError::Corrupt(format!("unknown operator `{}`", raw)))?,
        ),
    };
    let default_value: Option<String> = row.try_get("default_value")?;
    let masking: Option<String> = row.try_get("masking")?;
    let sequence: Option<i32> = row.try_get("sequence")?;

    Ok(ServiceParam {
        param_type,
        en_name: text(row, "en_name")?,
        cn_name: text(row, "cn_name")?,
        data_type,
        required: parse_required(&text(row, "required")?),
        default_value,
        operator: if param_type == ParamType::Request {
            operator
        } else {
            None
        },
        sort: SortOrder::parse(&text(row, "sort")?),
        masking: masking.filter(|m| !m.trim().is_empty()),
        sequence: sequence.unwrap_or(0),
        data_protection_query: false,
    })
}

fn parse_required(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "yes" | "y" | "true" | "1"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_flag_accepts_stored_spellings() {
        assert!(parse_required("yes"));
        assert!(parse_required(" YES "));
        assert!(parse_required("1"));
        assert!(!parse_required("no"));
        assert!(!parse_required(""));
    }

    #[test]
    fn field_columns_are_plain_identifiers() {
        for field in [
            ServiceField::ServiceId,
            ServiceField::ServiceName,
            ServiceField::ServiceType,
            ServiceField::Status,
            ServiceField::CreateModel,
            ServiceField::DepartmentId,
            ServiceField::AppId,
            ServiceField::TimeoutSeconds,
            ServiceField::RateLimitPerSecond,
        ] {
            assert!(
                field
                    .column()
                    .bytes()
                    .all(|b| b.is_ascii_lowercase() || b == b'_')
            );
        }
    }
}
