//! Offline operation log for field-collected audit records.
//!
//! Edits made while disconnected are captured as an ordered, append-only
//! log of operations rather than whole-array replacement: each operation
//! carries a client-generated `op_id`, a status
//! (`Pending | Syncing | Applied | Failed`), and the full record. The
//! server acknowledges each operation independently, so a partial batch
//! failure leaves only the failed operations queued.
//!
//! Records created offline get a `temp_<millis>` identifier; the applied
//! ack carries the server-assigned id and the reconciliation happens
//! exactly once: replaying the same ack is a no-op, keyed on `op_id`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::epoch_millis;

/// Prefix for identifiers assigned locally before a sync.
pub const TEMP_ID_PREFIX: &str = "temp_";

/// Build a temporary record id from a timestamp.
pub fn temp_id(now_ms: u64) -> String {
    format!("{TEMP_ID_PREFIX}{now_ms}")
}

/// Whether an id is a not-yet-reconciled temporary id.
pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

/// Finding severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Kind of field record, derived from the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordKind {
    DataPoint,
    Area,
    Finding,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::DataPoint => "data_point",
            RecordKind::Area => "area",
            RecordKind::Finding => "finding",
        }
    }
}

/// Payload of a field record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RecordBody {
    DataPoint {
        name: String,
        value: f64,
        unit: String,
        recorded_at_ms: u64,
    },
    Area {
        name: String,
        square_feet: f64,
    },
    Finding {
        title: String,
        severity: Severity,
        description: String,
    },
}

/// A data point, area, or finding collected in the field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRecord {
    /// Server-assigned uuid string, or `temp_<millis>` until synced.
    pub id: String,
    pub audit_id: Uuid,
    pub body: RecordBody,
    pub updated_at_ms: u64,
}

impl FieldRecord {
    pub fn kind(&self) -> RecordKind {
        match self.body {
            RecordBody::DataPoint { .. } => RecordKind::DataPoint,
            RecordBody::Area { .. } => RecordKind::Area,
            RecordBody::Finding { .. } => RecordKind::Finding,
        }
    }

    pub fn has_temp_id(&self) -> bool {
        is_temp_id(&self.id)
    }
}

/// What an operation does to its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Create,
    Update,
    Delete,
}

/// Lifecycle of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpStatus {
    Pending,
    Syncing,
    Applied,
    Failed,
}

/// One queued create/update/delete against a field record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Client-generated id; the idempotency key for acks and replay.
    pub op_id: Uuid,
    pub kind: OpKind,
    pub record: FieldRecord,
    pub status: OpStatus,
    pub queued_at_ms: u64,
    pub error: Option<String>,
}

/// Wire payload: the batch of operations sent on flush.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncBatch {
    pub ops: Vec<Operation>,
}

/// Per-operation outcome in an ack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpOutcome {
    /// Applied; `assigned_id` is set when a temp id was replaced.
    Applied { assigned_id: Option<String> },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpResult {
    pub op_id: Uuid,
    pub outcome: OpOutcome,
}

/// Wire payload: acknowledgement for a sync batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncAck {
    pub results: Vec<OpResult>,
}

/// Client-local sync status, one per session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncState {
    pub syncing: bool,
    pub last_synced_at_ms: Option<u64>,
    pub pending_sync: bool,
    pub error: Option<String>,
}

impl SyncState {
    pub fn begin_sync(&mut self) {
        self.syncing = true;
        self.error = None;
    }

    pub fn complete_at(&mut self, now_ms: u64, still_pending: bool) {
        self.syncing = false;
        self.last_synced_at_ms = Some(now_ms);
        self.pending_sync = still_pending;
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.syncing = false;
        self.error = Some(error.into());
    }
}

/// Summary of an applied ack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckSummary {
    pub applied: usize,
    pub failed: usize,
    /// Temp id → server-assigned id, for callers holding record references.
    pub id_mappings: Vec<(String, String)>,
}

/// The ordered offline operation log.
///
/// Appends preserve queue order; a second save of the same record while
/// still offline updates the queued operation in place instead of
/// appending a duplicate.
#[derive(Debug, Default)]
pub struct OfflineLog {
    ops: Vec<Operation>,
}

impl OfflineLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted operations (storage recovery).
    ///
    /// Operations that were mid-flight when the process died go back to
    /// `Pending` so the next flush retries them.
    pub fn from_ops(ops: Vec<Operation>) -> Self {
        let mut log = Self { ops };
        log.reset_in_flight();
        log
    }

    /// Return in-flight operations to `Pending`.
    ///
    /// Called when the batch they were sent in will never be acked, e.g.
    /// the connection dropped before the ack arrived.
    pub fn reset_in_flight(&mut self) {
        for op in &mut self.ops {
            if op.status == OpStatus::Syncing {
                op.status = OpStatus::Pending;
            }
        }
    }

    /// Queue a create/update for a record at `now_ms`.
    ///
    /// A record without an id gets a `temp_<now>` id and a `Create`
    /// operation; a record with an id gets an `Update` unless a queued
    /// operation for that id already exists, in which case that operation's
    /// payload is replaced in place.
    pub fn upsert_at(&mut self, mut record: FieldRecord, now_ms: u64) -> Operation {
        record.updated_at_ms = now_ms;

        if record.id.is_empty() {
            // Two creates in the same millisecond must not share an id
            let mut id = temp_id(now_ms);
            let mut n = 1u32;
            while self.ops.iter().any(|op| op.record.id == id) {
                id = format!("{}_{n}", temp_id(now_ms));
                n += 1;
            }
            record.id = id;
        } else if let Some(existing) = self
            .ops
            .iter_mut()
            .find(|op| op.record.id == record.id && op.status != OpStatus::Applied)
        {
            existing.record = record;
            existing.status = OpStatus::Pending;
            existing.error = None;
            return existing.clone();
        }

        let kind = if record.has_temp_id() { OpKind::Create } else { OpKind::Update };
        let op = Operation {
            op_id: Uuid::new_v4(),
            kind,
            record,
            status: OpStatus::Pending,
            queued_at_ms: now_ms,
            error: None,
        };
        self.ops.push(op.clone());
        op
    }

    pub fn upsert(&mut self, record: FieldRecord) -> Operation {
        self.upsert_at(record, epoch_millis())
    }

    /// Queue a delete at `now_ms`.
    ///
    /// Deleting a record that only exists as a queued, not-yet-sent create
    /// cancels the create instead; the server never needs to hear about it.
    /// A create already in flight gets a trailing delete: its temp id is
    /// rewritten to the server-assigned one when the create's ack lands.
    pub fn delete_at(&mut self, record: FieldRecord, now_ms: u64) -> Option<Operation> {
        if is_temp_id(&record.id) {
            let before = self.ops.len();
            self.ops.retain(|op| {
                !(op.record.id == record.id
                    && op.kind == OpKind::Create
                    && op.status == OpStatus::Pending)
            });
            if self.ops.len() < before {
                return None;
            }
        }

        let op = Operation {
            op_id: Uuid::new_v4(),
            kind: OpKind::Delete,
            record,
            status: OpStatus::Pending,
            queued_at_ms: now_ms,
            error: None,
        };
        self.ops.push(op.clone());
        Some(op)
    }

    pub fn delete(&mut self, record: FieldRecord) -> Option<Operation> {
        self.delete_at(record, epoch_millis())
    }

    /// Take the batch to flush: every `Pending` or previously `Failed`
    /// operation, marked `Syncing`, in queue order.
    pub fn take_batch(&mut self) -> Vec<Operation> {
        let mut batch = Vec::new();
        for op in &mut self.ops {
            if matches!(op.status, OpStatus::Pending | OpStatus::Failed) {
                op.status = OpStatus::Syncing;
                batch.push(op.clone());
            }
        }
        batch
    }

    /// Apply a server ack.
    ///
    /// Applied operations leave the log (reconciling temp ids exactly
    /// once); failed ones keep their error and return to the retryable
    /// set. Results for unknown or already-settled `op_id`s are ignored,
    /// which is what makes replayed acks harmless.
    pub fn apply_ack(&mut self, ack: &SyncAck) -> AckSummary {
        let mut summary = AckSummary::default();

        for result in &ack.results {
            let Some(op) = self
                .ops
                .iter_mut()
                .find(|op| op.op_id == result.op_id && op.status == OpStatus::Syncing)
            else {
                continue;
            };

            match &result.outcome {
                OpOutcome::Applied { assigned_id } => {
                    op.status = OpStatus::Applied;
                    summary.applied += 1;
                    if let Some(new_id) = assigned_id {
                        summary
                            .id_mappings
                            .push((op.record.id.clone(), new_id.clone()));
                    }
                }
                OpOutcome::Failed { reason } => {
                    op.status = OpStatus::Failed;
                    op.error = Some(reason.clone());
                    summary.failed += 1;
                }
            }
        }

        // Rewrite any still-queued ops that reference a reconciled temp id
        for (old, new) in &summary.id_mappings {
            for op in &mut self.ops {
                if op.record.id == *old {
                    op.record.id = new.clone();
                }
            }
        }

        self.ops.retain(|op| op.status != OpStatus::Applied);
        summary
    }

    /// Operations awaiting a flush (pending or failed-and-retryable).
    pub fn pending(&self) -> Vec<&Operation> {
        self.ops
            .iter()
            .filter(|op| matches!(op.status, OpStatus::Pending | OpStatus::Failed))
            .collect()
    }

    pub fn has_pending(&self) -> bool {
        self.ops
            .iter()
            .any(|op| matches!(op.status, OpStatus::Pending | OpStatus::Failed))
    }

    /// All operations in queue order.
    pub fn ops(&self) -> &[Operation] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn clear(&mut self) {
        self.ops.clear();
    }
}
