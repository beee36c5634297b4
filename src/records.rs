//! Durable call record interface.

use async_trait::async_trait;
use serde::Serialize;

use crate::error::RecordError;
use crate::types::{CallId, CallStatus};

/// The single write the call core makes per call attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallRecord {
    pub call_id: CallId,
    pub status: CallStatus,
    pub duration_seconds: u32,
}

/// External store of call metadata.
///
/// The write is idempotent on the store side and tolerant of network
/// failure: the core logs a failed write and moves on — losing the record
/// must never block teardown.
#[async_trait]
pub trait CallRecordSink: Send + Sync {
    async fn write(&self, record: CallRecord) -> Result<(), RecordError>;
}
