//! Tamper-evident run history.
//!
//! Every execution attempt, including the ones stopped by preflight or a
//! permission denial, becomes one immutable [`RunRecord`]. Records form a hash
//! chain: each record's hash covers its own canonical serialization followed
//! by the previous record's hash, so editing or deleting any stored record is
//! detectable by [`store::AuditStore::verify_chain`].
//!
//! Appends go through a single writer task ([`writer::AuditWriter`]) so the
//! chain can only advance one record at a time. Reads go straight to the
//! store.

pub mod store;
pub mod writer;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::catalog::{Capability, PrivilegeLevel};
use crate::error::{EngineError, EngineResult};
use crate::executor::{ExecutionResult, ExecutionStatus};

pub use store::AuditStore;
pub use writer::AuditWriter;

/// `previous_record_hash` of the first record in a chain.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

pub const EXPORT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
    Cancelled,
    TimedOut,
    PermissionDenied,
    PreflightFailed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::TimedOut => "timed_out",
            RunStatus::PermissionDenied => "permission_denied",
            RunStatus::PreflightFailed => "preflight_failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(RunStatus::Success),
            "failed" => Some(RunStatus::Failed),
            "cancelled" => Some(RunStatus::Cancelled),
            "timed_out" => Some(RunStatus::TimedOut),
            "permission_denied" => Some(RunStatus::PermissionDenied),
            "preflight_failed" => Some(RunStatus::PreflightFailed),
            _ => None,
        }
    }
}

impl From<ExecutionStatus> for RunStatus {
    fn from(status: ExecutionStatus) -> Self {
        match status {
            ExecutionStatus::Completed => RunStatus::Success,
            ExecutionStatus::Failed | ExecutionStatus::NotFound => RunStatus::Failed,
            ExecutionStatus::TimedOut => RunStatus::TimedOut,
            ExecutionStatus::Cancelled => RunStatus::Cancelled,
            ExecutionStatus::PermissionDenied | ExecutionStatus::AutomationDenied => {
                RunStatus::PermissionDenied
            }
            ExecutionStatus::PreflightFailed => RunStatus::PreflightFailed,
        }
    }
}

/// A stored, immutable audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Position in the chain, starting at 1.
    pub sequence: i64,
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub capability_id: String,
    pub capability_title: String,
    pub privilege_level: PrivilegeLevel,
    pub arguments: BTreeMap<String, String>,
    pub duration_ms: u64,
    pub exit_code: Option<i32>,
    pub status: RunStatus,
    pub stdout_preview: String,
    pub stderr_preview: String,
    /// Overflow file holding the complete stream, when it was too large to inline.
    pub stdout_pointer: Option<String>,
    pub stderr_pointer: Option<String>,
    pub output_size_bytes: u64,
    pub parsed_summary: String,
    pub previous_record_hash: String,
    pub record_hash: String,
}

/// Hashed fields, in hashing order. Both hash fields are excluded; the
/// previous hash is appended to the serialized bytes instead.
#[derive(Serialize)]
struct Canonical<'a> {
    sequence: i64,
    id: &'a str,
    timestamp: String,
    capability_id: &'a str,
    capability_title: &'a str,
    privilege_level: &'a str,
    arguments: &'a BTreeMap<String, String>,
    duration_ms: u64,
    exit_code: Option<i32>,
    status: &'a str,
    stdout_preview: &'a str,
    stderr_preview: &'a str,
    stdout_pointer: Option<&'a str>,
    stderr_pointer: Option<&'a str>,
    output_size_bytes: u64,
    parsed_summary: &'a str,
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl RunRecord {
    pub fn canonical_json(&self) -> String {
        let canonical = Canonical {
            sequence: self.sequence,
            id: &self.id,
            timestamp: format_timestamp(&self.timestamp),
            capability_id: &self.capability_id,
            capability_title: &self.capability_title,
            privilege_level: self.privilege_level.as_str(),
            arguments: &self.arguments,
            duration_ms: self.duration_ms,
            exit_code: self.exit_code,
            status: self.status.as_str(),
            stdout_preview: &self.stdout_preview,
            stderr_preview: &self.stderr_preview,
            stdout_pointer: self.stdout_pointer.as_deref(),
            stderr_pointer: self.stderr_pointer.as_deref(),
            output_size_bytes: self.output_size_bytes,
            parsed_summary: &self.parsed_summary,
        };
        // Plain strings, integers and a string map: serialization cannot fail.
        serde_json::to_string(&canonical).unwrap_or_default()
    }

    /// SHA-256 over the canonical JSON followed by the previous hash, hex encoded.
    pub fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_json().as_bytes());
        hasher.update(self.previous_record_hash.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Everything needed to append a record; the store assigns the chain fields
/// and decides where large output goes.
#[derive(Debug, Clone)]
pub struct RecordDraft {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub capability_id: String,
    pub capability_title: String,
    pub privilege_level: PrivilegeLevel,
    pub arguments: BTreeMap<String, String>,
    pub duration_ms: u64,
    pub exit_code: Option<i32>,
    pub status: RunStatus,
    pub stdout: String,
    pub stderr: String,
    pub output_size_bytes: u64,
    pub parsed_summary: String,
}

impl RecordDraft {
    pub fn from_result(result: &ExecutionResult, capability: &Capability) -> Self {
        let parsed_summary = match (&result.message, result.success) {
            (Some(message), false) => message.clone(),
            _ => result.parsed.summary(),
        };
        Self {
            id: result.execution_id.clone(),
            timestamp: result.timestamp.trunc_subsecs(3),
            capability_id: capability.id.clone(),
            capability_title: capability.title.clone(),
            privilege_level: capability.privilege,
            arguments: result.arguments.clone(),
            duration_ms: result.duration_ms,
            exit_code: result.exit_code,
            status: result.status.into(),
            stdout: result.stdout.clone(),
            stderr: result.stderr.clone(),
            output_size_bytes: result.stdout_bytes + result.stderr_bytes,
            parsed_summary,
        }
    }
}

/// Filter for history queries. Unset fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditFilter {
    pub capability_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub status: Option<RunStatus>,
}

/// Inclusive range of chain sequences. Unset bounds are open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainRange {
    pub from_sequence: Option<i64>,
    pub to_sequence: Option<i64>,
}

impl ChainRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(from: i64, to: i64) -> Self {
        Self {
            from_sequence: Some(from),
            to_sequence: Some(to),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakReason {
    /// The stored hash does not match the record's contents.
    HashMismatch,
    /// The record does not point at its predecessor's hash.
    LinkMismatch,
    /// A sequence number is absent.
    MissingRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainBreak {
    pub sequence: i64,
    pub record_id: Option<String>,
    pub reason: BreakReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub valid: bool,
    pub records_checked: usize,
    pub first_invalid: Option<ChainBreak>,
}

impl ChainVerification {
    fn broken(records_checked: usize, chain_break: ChainBreak) -> Self {
        Self {
            valid: false,
            records_checked,
            first_invalid: Some(chain_break),
        }
    }
}

/// Where the first record of a verified slice must attach.
#[derive(Debug, Clone, Default)]
pub struct ChainAnchor {
    pub sequence: Option<i64>,
    pub previous_hash: Option<String>,
}

/// Verify a contiguous slice of records, ordered by sequence.
pub fn verify_records(records: &[RunRecord], anchor: ChainAnchor) -> ChainVerification {
    let mut expected_seq = anchor.sequence;
    let mut expected_prev = anchor.previous_hash;

    for (checked, record) in records.iter().enumerate() {
        if let Some(seq) = expected_seq {
            if record.sequence != seq {
                return ChainVerification::broken(
                    checked,
                    ChainBreak {
                        sequence: seq,
                        record_id: None,
                        reason: BreakReason::MissingRecord,
                    },
                );
            }
        }
        if let Some(prev) = &expected_prev {
            if &record.previous_record_hash != prev {
                return ChainVerification::broken(
                    checked,
                    ChainBreak {
                        sequence: record.sequence,
                        record_id: Some(record.id.clone()),
                        reason: BreakReason::LinkMismatch,
                    },
                );
            }
        }
        if record.compute_hash() != record.record_hash {
            return ChainVerification::broken(
                checked,
                ChainBreak {
                    sequence: record.sequence,
                    record_id: Some(record.id.clone()),
                    reason: BreakReason::HashMismatch,
                },
            );
        }
        expected_seq = Some(record.sequence + 1);
        expected_prev = Some(record.record_hash.clone());
    }

    ChainVerification {
        valid: true,
        records_checked: records.len(),
        first_invalid: None,
    }
}

/// Self-contained export of a slice of the chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditExport {
    pub format_version: u32,
    pub genesis_hash: String,
    pub exported_at: DateTime<Utc>,
    pub range: ChainRange,
    /// Hash the first exported record links to.
    pub anchor_hash: String,
    pub records: Vec<RunRecord>,
}

impl AuditExport {
    pub fn to_json(&self) -> EngineResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(data: &str) -> EngineResult<Self> {
        Ok(serde_json::from_str(data)?)
    }
}

/// Verify an export without access to the database.
pub fn verify_export(export: &AuditExport) -> ChainVerification {
    let anchor = ChainAnchor {
        sequence: export.records.first().map(|r| r.sequence),
        previous_hash: Some(export.anchor_hash.clone()),
    };
    verify_records(&export.records, anchor)
}

/// Handle combining the writer (appends) with the store (reads).
#[derive(Clone)]
pub struct AuditLog {
    store: Arc<AuditStore>,
    writer: AuditWriter,
}

impl AuditLog {
    /// Start the writer task on the current Tokio runtime. With `retention`
    /// set, the writer also prunes records older than that age every hour.
    pub fn start(store: Arc<AuditStore>, capacity: usize, retention: Option<chrono::Duration>) -> Self {
        let (writer, task) = writer::create(store.clone(), capacity, retention);
        tokio::spawn(task);
        Self { store, writer }
    }

    pub fn store(&self) -> &Arc<AuditStore> {
        &self.store
    }

    pub async fn append(&self, draft: RecordDraft) -> EngineResult<RunRecord> {
        self.writer.append(draft).await
    }

    pub async fn fetch(&self, filter: AuditFilter, limit: usize, offset: usize) -> EngineResult<Vec<RunRecord>> {
        self.read(move |store| store.fetch(&filter, limit, offset)).await
    }

    pub async fn count(&self, filter: AuditFilter) -> EngineResult<u64> {
        self.read(move |store| store.count(&filter)).await
    }

    pub async fn latest(&self) -> EngineResult<Option<RunRecord>> {
        self.read(|store| store.latest()).await
    }

    pub async fn verify_chain(&self, range: ChainRange) -> EngineResult<ChainVerification> {
        self.read(move |store| store.verify_chain(range)).await
    }

    pub async fn export(&self, range: ChainRange) -> EngineResult<AuditExport> {
        self.read(move |store| store.export(range)).await
    }

    pub async fn prune_before(&self, cutoff: DateTime<Utc>) -> EngineResult<usize> {
        self.read(move |store| store.prune_before(cutoff)).await
    }

    async fn read<T, F>(&self, f: F) -> EngineResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&AuditStore) -> EngineResult<T> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| EngineError::AuditPersistenceFailed(format!("audit task failed: {}", e)))?
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn draft(id: &str, capability_id: &str, status: RunStatus) -> RecordDraft {
        RecordDraft {
            id: id.into(),
            timestamp: Utc::now().trunc_subsecs(3),
            capability_id: capability_id.into(),
            capability_title: format!("Title of {}", capability_id),
            privilege_level: PrivilegeLevel::User,
            arguments: BTreeMap::from([("path".to_string(), "/tmp".to_string())]),
            duration_ms: 12,
            exit_code: Some(0),
            status,
            stdout: "ok\n".into(),
            stderr: String::new(),
            output_size_bytes: 3,
            parsed_summary: "ok".into(),
        }
    }

    fn record(sequence: i64, previous: &str) -> RunRecord {
        let mut r = RunRecord {
            sequence,
            id: format!("r{}", sequence),
            timestamp: Utc::now().trunc_subsecs(3),
            capability_id: "disk.usage".into(),
            capability_title: "Disk usage".into(),
            privilege_level: PrivilegeLevel::User,
            arguments: BTreeMap::new(),
            duration_ms: 5,
            exit_code: Some(0),
            status: RunStatus::Success,
            stdout_preview: String::new(),
            stderr_preview: String::new(),
            stdout_pointer: None,
            stderr_pointer: None,
            output_size_bytes: 0,
            parsed_summary: "no output".into(),
            previous_record_hash: previous.into(),
            record_hash: String::new(),
        };
        r.record_hash = r.compute_hash();
        r
    }

    fn chain(n: i64) -> Vec<RunRecord> {
        let mut records: Vec<RunRecord> = Vec::new();
        for seq in 1..=n {
            let prev = records
                .last()
                .map(|r| r.record_hash.clone())
                .unwrap_or_else(|| GENESIS_HASH.to_string());
            records.push(record(seq, &prev));
        }
        records
    }

    fn genesis_anchor() -> ChainAnchor {
        ChainAnchor {
            sequence: Some(1),
            previous_hash: Some(GENESIS_HASH.into()),
        }
    }

    #[test]
    fn genesis_is_64_zeros() {
        assert_eq!(GENESIS_HASH.len(), 64);
        assert!(GENESIS_HASH.chars().all(|c| c == '0'));
    }

    #[test]
    fn hash_is_hex_sha256_and_covers_previous() {
        let a = record(1, GENESIS_HASH);
        assert_eq!(a.record_hash.len(), 64);
        assert!(a.record_hash.chars().all(|c| c.is_ascii_hexdigit()));

        let mut b = a.clone();
        b.previous_record_hash = "f".repeat(64);
        assert_ne!(a.compute_hash(), b.compute_hash());
    }

    #[test]
    fn canonical_json_sorts_arguments_and_fixes_timestamp_precision() {
        let mut r = record(1, GENESIS_HASH);
        r.arguments = BTreeMap::from([
            ("zeta".to_string(), "1".to_string()),
            ("alpha".to_string(), "2".to_string()),
        ]);
        let json = r.canonical_json();
        assert!(json.starts_with(r#"{"sequence":1,"id":"r1","timestamp":""#));
        assert!(json.find("alpha").unwrap() < json.find("zeta").unwrap());
        assert!(!json.contains("record_hash"));

        let ts = format_timestamp(&r.timestamp);
        assert!(ts.ends_with('Z'));
        assert_eq!(ts.len(), "2024-01-01T00:00:00.000Z".len());
    }

    #[test]
    fn intact_chain_verifies() {
        let records = chain(4);
        let v = verify_records(&records, genesis_anchor());
        assert!(v.valid);
        assert_eq!(v.records_checked, 4);
    }

    #[test]
    fn edited_record_is_hash_mismatch() {
        let mut records = chain(3);
        records[1].stdout_preview = "forged".into();
        let v = verify_records(&records, genesis_anchor());
        assert!(!v.valid);
        let b = v.first_invalid.unwrap();
        assert_eq!(b.sequence, 2);
        assert_eq!(b.reason, BreakReason::HashMismatch);
        assert_eq!(v.records_checked, 1);
    }

    #[test]
    fn rehashed_record_breaks_next_link() {
        let mut records = chain(3);
        records[1].stdout_preview = "forged".into();
        records[1].record_hash = records[1].compute_hash();
        let b = verify_records(&records, genesis_anchor()).first_invalid.unwrap();
        assert_eq!(b.sequence, 3);
        assert_eq!(b.reason, BreakReason::LinkMismatch);
    }

    #[test]
    fn deleted_record_is_missing() {
        let mut records = chain(3);
        records.remove(1);
        let b = verify_records(&records, genesis_anchor()).first_invalid.unwrap();
        assert_eq!(b.sequence, 2);
        assert_eq!(b.reason, BreakReason::MissingRecord);
        assert_eq!(b.record_id, None);
    }

    #[test]
    fn export_round_trips_and_verifies_offline() {
        let records = chain(3);
        let export = AuditExport {
            format_version: EXPORT_FORMAT_VERSION,
            genesis_hash: GENESIS_HASH.into(),
            exported_at: Utc::now(),
            range: ChainRange::all(),
            anchor_hash: GENESIS_HASH.into(),
            records,
        };
        let parsed = AuditExport::from_json(&export.to_json().unwrap()).unwrap();
        assert!(verify_export(&parsed).valid);

        let mut tampered = parsed;
        tampered.records[2].exit_code = Some(1);
        assert!(!verify_export(&tampered).valid);
    }

    #[test]
    fn status_mapping() {
        assert_eq!(RunStatus::from(ExecutionStatus::Completed), RunStatus::Success);
        assert_eq!(
            RunStatus::from(ExecutionStatus::AutomationDenied),
            RunStatus::PermissionDenied
        );
        assert_eq!(RunStatus::parse("timed_out"), Some(RunStatus::TimedOut));
        assert_eq!(RunStatus::parse("bogus"), None);
    }
}
