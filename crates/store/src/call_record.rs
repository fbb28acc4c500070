use std::time::Duration;

use chrono::{DateTime, Local, NaiveDate};
use dag_contracts::CallRecord;
use sqlx::PgPool;
use ulid::Ulid;

use crate::StoreError;

#[derive(Clone)]
pub struct CallRecordWriter {
    pool: PgPool,
    write_timeout: Duration,
}

impl CallRecordWriter {
    pub fn new(pool: PgPool, write_timeout: Duration) -> Self {
        Self {
            pool,
            write_timeout,
        }
    }

    /// Inserts the record, then bumps the per-day counter of its service.
    pub async fn write(&self, record: &CallRecord) -> Result<(), StoreError> {
        let record_id = Ulid::new().to_string();

        tokio::time::timeout(
            self.write_timeout,
            sqlx::query(
                "INSERT INTO service_call_record (record_id, service_id, service_name, service_path, service_department_id, remote_address, forward_for, user_identification, app_id, call_start_time, call_end_time, status_code, call_status, error_message) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14)",
            )
            .bind(&record_id)
            .bind(&record.service_id)
            .bind(&record.service_name)
            .bind(&record.service_path)
            .bind(&record.service_department_id)
            .bind(&record.remote_address)
            .bind(&record.forward_for)
            .bind(&record.user_identification)
            .bind(&record.app_id)
            .bind(record.call_start_time_ms)
            .bind(record.call_end_time_ms)
            .bind(i32::from(record.status_code))
            .bind(record.call_status)
            .bind(&record.error_message)
            .execute(&self.pool),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        if record.service_id.is_empty() {
            return Ok(());
        }
        self.bump_daily_counter(record).await
    }

    async fn bump_daily_counter(&self, record: &CallRecord) -> Result<(), StoreError> {
        let (success, fail): (i64, i64) = if record.succeeded() { (1, 0) } else { (0, 1) };
        let date = record_date(record.call_end_time_ms).to_string();

        tokio::time::timeout(
            self.write_timeout,
            sqlx::query(
                "INSERT INTO service_daily_record (service_id, record_date, service_name, service_path, department_id, success_count, fail_count) VALUES ($1, $2::date, $3, $4, $5, $6, $7) ON CONFLICT (service_id, record_date) DO UPDATE SET success_count = service_daily_record.success_count + EXCLUDED.success_count, fail_count = service_daily_record.fail_count + EXCLUDED.fail_count",
            )
            .bind(&record.service_id)
            .bind(&date)
            .bind(&record.service_name)
            .bind(&record.service_path)
            .bind(&record.service_department_id)
            .bind(success)
            .bind(fail)
            .execute(&self.pool),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        Ok(())
    }
}

/// Local calendar day of a unix millisecond timestamp.
pub fn record_date(epoch_ms: i64) -> NaiveDate {
    DateTime::from_timestamp_millis(epoch_ms)
        .map(|utc| utc.with_timezone(&Local).date_naive())
        .unwrap_or_else(|| Local::now().date_naive())
}
