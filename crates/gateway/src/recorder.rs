use std::sync::Arc;

use async_trait::async_trait;
use dag_contracts::CallRecord;
use dag_store::{CallRecordWriter, StoreError};
use tokio::sync::{Mutex, mpsc};

/// Where finished call records end up.
#[async_trait]
pub trait CallRecordSink: Send + Sync {
    async fn write(&self, record: &CallRecord) -> Result<(), StoreError>;
}

#[async_trait]
impl CallRecordSink for CallRecordWriter {
    async fn write(&self, record: &CallRecord) -> Result<(), StoreError> {
        CallRecordWriter::write(self, record).await
    }
}

/// Keeps records in memory; used by tests and local tooling.
#[derive(Clone, Default)]
pub struct MemoryCallRecordSink {
    records: Arc<Mutex<Vec<CallRecord>>>,
}

impl MemoryCallRecordSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<CallRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl CallRecordSink for MemoryCallRecordSink {
    async fn write(&self, record: &CallRecord) -> Result<(), StoreError> {
        self.records.lock().await.push(record.clone());
        Ok(())
    }
}

/// Hands records to a single background writer over a bounded queue. A full
/// queue drops the record instead of stalling the request.
#[derive(Clone)]
pub struct CallRecorder {
    tx: Option<mpsc::Sender<CallRecord>>,
}

impl CallRecorder {
    /// Must be called from within a tokio runtime.
    pub fn spawn(sink: Arc<dyn CallRecordSink>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<CallRecord>(capacity.max(1));
        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                match sink.write(&record).await {
                    Ok(()) => crate::metrics::observe_call_record("written"),
                    Err(err) => {
                        crate::metrics::observe_call_record("failed");
                        tracing::warn!(
                            service_id = %record.service_id,
                            error = %err,
                            "call record write failed"
                        );
                    }
                }
            }
        });
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn record(&self, record: CallRecord) {
        let Some(tx) = self.tx.as_ref() else {
            crate::metrics::observe_call_record("skipped");
            return;
        };
        if let Err(err) = tx.try_send(record) {
            crate::metrics::observe_call_record("dropped");
            let record = match err {
                mpsc::error::TrySendError::Full(record)
                | mpsc::error::TrySendError::Closed(record) => record,
            };
            tracing::warn!(service_id = %record.service_id, "call record dropped");
        }
    }
}
