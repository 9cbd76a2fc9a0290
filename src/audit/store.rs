use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use super::{
    format_timestamp, verify_records, AuditExport, AuditFilter, BreakReason, ChainAnchor, ChainBreak,
    ChainRange, ChainVerification, RecordDraft, RunRecord, RunStatus, EXPORT_FORMAT_VERSION, GENESIS_HASH,
};
use crate::catalog::PrivilegeLevel;
use crate::config::{AuditConfig, EngineConfig};
use crate::error::{EngineError, EngineResult};
use crate::process::OutputStream;
use crate::util::{atomic_write, truncate_utf8};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS run_records (
        seq                  INTEGER PRIMARY KEY,
        id                   TEXT    NOT NULL UNIQUE,
        timestamp            TEXT    NOT NULL,
        capability_id        TEXT    NOT NULL,
        capability_title     TEXT    NOT NULL,
        privilege_level      TEXT    NOT NULL,
        arguments            TEXT    NOT NULL,
        duration_ms          INTEGER NOT NULL,
        exit_code            INTEGER,
        status               TEXT    NOT NULL,
        stdout_preview       TEXT    NOT NULL,
        stderr_preview       TEXT    NOT NULL,
        stdout_pointer       TEXT,
        stderr_pointer       TEXT,
        output_size_bytes    INTEGER NOT NULL,
        parsed_summary       TEXT    NOT NULL,
        previous_record_hash TEXT    NOT NULL,
        record_hash          TEXT    NOT NULL,
        created_at           TEXT    NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
    );

    CREATE INDEX IF NOT EXISTS idx_run_capability ON run_records(capability_id);
    CREATE INDEX IF NOT EXISTS idx_run_timestamp  ON run_records(timestamp);
    CREATE INDEX IF NOT EXISTS idx_run_status     ON run_records(status);
    CREATE INDEX IF NOT EXISTS idx_run_created_at ON run_records(created_at);

    CREATE TRIGGER IF NOT EXISTS run_records_immutable
    BEFORE UPDATE ON run_records
    BEGIN
        SELECT RAISE(ABORT, 'run records are immutable');
    END;

    CREATE TABLE IF NOT EXISTS audit_meta (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
";

const COLUMNS: &str = "seq, id, timestamp, capability_id, capability_title, privilege_level, arguments, \
     duration_ms, exit_code, status, stdout_preview, stderr_preview, stdout_pointer, stderr_pointer, \
     output_size_bytes, parsed_summary, previous_record_hash, record_hash";

/// Highest sequence removed by retention pruning.
const META_PRUNED_THROUGH: &str = "pruned_through";

/// SQLite-backed run history.
///
/// Records are only ever inserted; an `UPDATE` trigger rejects modification
/// and deletion happens solely through [`prune_before`](Self::prune_before),
/// which removes a prefix of the chain.
pub struct AuditStore {
    db: Mutex<Connection>,
    overflow_dir: Option<PathBuf>,
    spill_threshold: usize,
    preview_bytes: usize,
}

impl AuditStore {
    /// Open (or create) the audit database in the configured data directory.
    pub fn open(config: &EngineConfig) -> EngineResult<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let conn = Connection::open(config.database_path())?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn, Some(config.overflow_path()), &config.audit)
    }

    /// Volatile store used when the database file cannot be opened. Large
    /// output is kept as a preview only.
    pub fn open_in_memory(config: &AuditConfig) -> EngineResult<Self> {
        Self::init(Connection::open_in_memory()?, None, config)
    }

    /// Open the configured database, degrading to memory on failure.
    pub fn open_or_in_memory(config: &EngineConfig) -> EngineResult<(Self, Option<String>)> {
        match Self::open(config) {
            Ok(store) => Ok((store, None)),
            Err(e) => {
                let warning = format!(
                    "Audit database at {} unavailable ({}); history will not survive a restart",
                    config.database_path().display(),
                    e
                );
                log::error!("{}", warning);
                Ok((Self::open_in_memory(&config.audit)?, Some(warning)))
            }
        }
    }

    fn init(conn: Connection, overflow_dir: Option<PathBuf>, config: &AuditConfig) -> EngineResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            db: Mutex::new(conn),
            overflow_dir,
            spill_threshold: config.spill_threshold_bytes,
            preview_bytes: config.preview_bytes,
        })
    }

    pub fn is_persistent(&self) -> bool {
        self.overflow_dir.is_some()
    }

    fn lock(&self) -> EngineResult<MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|e| EngineError::AuditPersistenceFailed(format!("Lock error: {}", e)))
    }

    /// Inline preview plus, when the stream is over the threshold, the path
    /// of the overflow file holding all of it.
    fn spill(&self, record_id: &str, stream: OutputStream, text: &str) -> (String, Option<String>) {
        if text.len() <= self.spill_threshold {
            return (text.to_string(), None);
        }
        let preview = truncate_utf8(text, self.preview_bytes).to_string();

        let Some(dir) = &self.overflow_dir else {
            log::warn!(
                "{} of {} is {} bytes; keeping a preview only",
                stream.as_str(),
                record_id,
                text.len()
            );
            return (preview, None);
        };

        let path = dir.join(format!("{}.{}.log", record_id, stream.as_str()));
        let written = std::fs::create_dir_all(dir).and_then(|_| atomic_write(&path, text.as_bytes()));
        match written {
            Ok(()) => (preview, Some(path.to_string_lossy().into_owned())),
            Err(e) => {
                log::error!("Failed to write overflow file {}: {}", path.display(), e);
                (preview, None)
            }
        }
    }

    /// Append one record, linking it to the current chain head.
    pub fn append(&self, draft: RecordDraft) -> EngineResult<RunRecord> {
        let (stdout_preview, stdout_pointer) = self.spill(&draft.id, OutputStream::Stdout, &draft.stdout);
        let (stderr_preview, stderr_pointer) = self.spill(&draft.id, OutputStream::Stderr, &draft.stderr);

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let head: Option<(i64, String)> = tx
            .query_row(
                "SELECT seq, record_hash FROM run_records ORDER BY seq DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (sequence, previous_record_hash) = match head {
            Some((seq, hash)) => (seq + 1, hash),
            None => (1, GENESIS_HASH.to_string()),
        };

        let mut record = RunRecord {
            sequence,
            id: draft.id,
            timestamp: draft.timestamp,
            capability_id: draft.capability_id,
            capability_title: draft.capability_title,
            privilege_level: draft.privilege_level,
            arguments: draft.arguments,
            duration_ms: draft.duration_ms,
            exit_code: draft.exit_code,
            status: draft.status,
            stdout_preview,
            stderr_preview,
            stdout_pointer,
            stderr_pointer,
            output_size_bytes: draft.output_size_bytes,
            parsed_summary: draft.parsed_summary,
            previous_record_hash,
            record_hash: String::new(),
        };
        record.record_hash = record.compute_hash();

        tx.execute(
            &format!(
                "INSERT INTO run_records ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
                COLUMNS
            ),
            params![
                record.sequence,
                record.id,
                format_timestamp(&record.timestamp),
                record.capability_id,
                record.capability_title,
                record.privilege_level.as_str(),
                serde_json::to_string(&record.arguments)?,
                record.duration_ms as i64,
                record.exit_code,
                record.status.as_str(),
                record.stdout_preview,
                record.stderr_preview,
                record.stdout_pointer,
                record.stderr_pointer,
                record.output_size_bytes as i64,
                record.parsed_summary,
                record.previous_record_hash,
                record.record_hash,
            ],
        )?;
        tx.commit()?;

        log::debug!(
            "Appended run record {} (seq {}) for {}",
            record.id,
            record.sequence,
            record.capability_id
        );
        Ok(record)
    }

    /// Records matching `filter`, newest first.
    pub fn fetch(&self, filter: &AuditFilter, limit: usize, offset: usize) -> EngineResult<Vec<RunRecord>> {
        let (where_clause, values) = filter_sql(filter);
        let sql = format!(
            "SELECT {} FROM run_records{} ORDER BY seq DESC LIMIT {} OFFSET {}",
            COLUMNS,
            where_clause,
            limit.min(10_000),
            offset
        );

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(values.iter()), row_to_record)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn count(&self, filter: &AuditFilter) -> EngineResult<u64> {
        let (where_clause, values) = filter_sql(filter);
        let sql = format!("SELECT COUNT(*) FROM run_records{}", where_clause);
        let conn = self.lock()?;
        let n: i64 = conn.query_row(&sql, rusqlite::params_from_iter(values.iter()), |row| row.get(0))?;
        Ok(n as u64)
    }

    pub fn latest(&self) -> EngineResult<Option<RunRecord>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {} FROM run_records ORDER BY seq DESC LIMIT 1", COLUMNS);
        Ok(conn.query_row(&sql, [], row_to_record).optional()?)
    }

    pub fn get(&self, id: &str) -> EngineResult<Option<RunRecord>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {} FROM run_records WHERE id = ?1", COLUMNS);
        Ok(conn.query_row(&sql, params![id], row_to_record).optional()?)
    }

    /// Complete stream content of a spilled record.
    pub fn read_overflow(&self, pointer: &str) -> EngineResult<String> {
        let path = Path::new(pointer);
        let inside = self
            .overflow_dir
            .as_ref()
            .is_some_and(|dir| path.parent() == Some(dir.as_path()));
        if !inside {
            return Err(EngineError::AuditPersistenceFailed(format!(
                "{} is not an overflow file of this store",
                pointer
            )));
        }
        Ok(std::fs::read_to_string(path)?)
    }

    fn records_in(conn: &Connection, range: ChainRange) -> EngineResult<Vec<RunRecord>> {
        let sql = format!(
            "SELECT {} FROM run_records WHERE seq >= ?1 AND seq <= ?2 ORDER BY seq ASC",
            COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![range.from_sequence.unwrap_or(1), range.to_sequence.unwrap_or(i64::MAX)],
            row_to_record,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn pruned_through(conn: &Connection) -> EngineResult<i64> {
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM audit_meta WHERE key = ?1",
                params![META_PRUNED_THROUGH],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    /// Where records in `range` must attach, or the break if the predecessor
    /// of the range has gone missing.
    fn anchor_for(conn: &Connection, range: ChainRange) -> EngineResult<Result<ChainAnchor, ChainBreak>> {
        let from = range.from_sequence.unwrap_or(1).max(1);
        let pruned = Self::pruned_through(conn)?;

        if from <= pruned + 1 {
            // Start of the retained chain. Its link into the pruned prefix
            // cannot be checked; the genesis link can.
            return Ok(Ok(ChainAnchor {
                sequence: Some(pruned + 1),
                previous_hash: (pruned == 0).then(|| GENESIS_HASH.to_string()),
            }));
        }

        let prev: Option<String> = conn
            .query_row(
                "SELECT record_hash FROM run_records WHERE seq = ?1",
                params![from - 1],
                |row| row.get(0),
            )
            .optional()?;
        Ok(match prev {
            Some(hash) => Ok(ChainAnchor {
                sequence: Some(from),
                previous_hash: Some(hash),
            }),
            None => Err(ChainBreak {
                sequence: from - 1,
                record_id: None,
                reason: BreakReason::MissingRecord,
            }),
        })
    }

    /// Recompute every hash and link in `range`.
    pub fn verify_chain(&self, range: ChainRange) -> EngineResult<ChainVerification> {
        let conn = self.lock()?;
        let anchor = match Self::anchor_for(&conn, range)? {
            Ok(anchor) => anchor,
            Err(chain_break) => {
                return Ok(ChainVerification {
                    valid: false,
                    records_checked: 0,
                    first_invalid: Some(chain_break),
                })
            }
        };
        let records = Self::records_in(&conn, range)?;
        let verification = verify_records(&records, anchor);
        if !verification.valid {
            log::warn!("Audit chain verification failed: {:?}", verification.first_invalid);
        }
        Ok(verification)
    }

    pub fn export(&self, range: ChainRange) -> EngineResult<AuditExport> {
        let conn = self.lock()?;
        let records = Self::records_in(&conn, range)?;
        let anchor_hash = records
            .first()
            .map(|r| r.previous_record_hash.clone())
            .unwrap_or_else(|| GENESIS_HASH.to_string());
        Ok(AuditExport {
            format_version: EXPORT_FORMAT_VERSION,
            genesis_hash: GENESIS_HASH.to_string(),
            exported_at: Utc::now(),
            range,
            anchor_hash,
            records,
        })
    }

    /// Delete records older than `cutoff` along with their overflow files.
    ///
    /// Only a prefix of the chain is removed and the newest record is always
    /// kept, so the remaining records still verify and new appends still link
    /// to a stored hash.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> EngineResult<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let last_old: Option<i64> = tx.query_row(
            "SELECT MAX(seq) FROM run_records WHERE timestamp < ?1
               AND seq < (SELECT MAX(seq) FROM run_records)",
            params![format_timestamp(&cutoff)],
            |row| row.get(0),
        )?;
        let Some(through) = last_old else {
            return Ok(0);
        };

        let pointers: Vec<Option<String>> = {
            let mut stmt = tx.prepare(
                "SELECT stdout_pointer, stderr_pointer FROM run_records WHERE seq <= ?1",
            )?;
            let rows = stmt.query_map(params![through], |row| {
                Ok([row.get::<_, Option<String>>(0)?, row.get::<_, Option<String>>(1)?])
            })?;
            let pairs = rows.collect::<Result<Vec<_>, _>>()?;
            pairs.into_iter().flatten().collect()
        };

        let deleted = tx.execute("DELETE FROM run_records WHERE seq <= ?1", params![through])?;
        tx.execute(
            "INSERT INTO audit_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![META_PRUNED_THROUGH, through.to_string()],
        )?;
        tx.commit()?;

        for pointer in pointers.into_iter().flatten() {
            if let Err(e) = std::fs::remove_file(&pointer) {
                log::debug!("Could not remove overflow file {}: {}", pointer, e);
            }
        }

        log::info!("Audit retention: pruned {} run records (through seq {})", deleted, through);
        Ok(deleted)
    }
}

fn filter_sql(filter: &AuditFilter) -> (String, Vec<String>) {
    let mut conditions: Vec<String> = Vec::new();
    let mut values: Vec<String> = Vec::new();

    if let Some(ref capability_id) = filter.capability_id {
        values.push(capability_id.clone());
        conditions.push(format!("capability_id = ?{}", values.len()));
    }
    if let Some(ref since) = filter.since {
        values.push(format_timestamp(since));
        conditions.push(format!("timestamp >= ?{}", values.len()));
    }
    if let Some(ref until) = filter.until {
        values.push(format_timestamp(until));
        conditions.push(format!("timestamp <= ?{}", values.len()));
    }
    if let Some(status) = filter.status {
        values.push(status.as_str().to_string());
        conditions.push(format!("status = ?{}", values.len()));
    }

    if conditions.is_empty() {
        (String::new(), values)
    } else {
        (format!(" WHERE {}", conditions.join(" AND ")), values)
    }
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    let timestamp: String = row.get(2)?;
    let timestamp = DateTime::parse_from_rfc3339(&timestamp)
        .map_err(|e| conversion_error(2, format!("bad timestamp '{}': {}", timestamp, e)))?
        .with_timezone(&Utc);

    let privilege: String = row.get(5)?;
    let privilege_level = PrivilegeLevel::parse(&privilege)
        .ok_or_else(|| conversion_error(5, format!("unknown privilege level '{}'", privilege)))?;

    let arguments: String = row.get(6)?;
    let arguments = serde_json::from_str(&arguments)
        .map_err(|e| conversion_error(6, format!("bad arguments: {}", e)))?;

    let status: String = row.get(9)?;
    let status = RunStatus::parse(&status)
        .ok_or_else(|| conversion_error(9, format!("unknown status '{}'", status)))?;

    Ok(RunRecord {
        sequence: row.get(0)?,
        id: row.get(1)?,
        timestamp,
        capability_id: row.get(3)?,
        capability_title: row.get(4)?,
        privilege_level,
        arguments,
        duration_ms: row.get::<_, i64>(7)? as u64,
        exit_code: row.get(8)?,
        status,
        stdout_preview: row.get(10)?,
        stderr_preview: row.get(11)?,
        stdout_pointer: row.get(12)?,
        stderr_pointer: row.get(13)?,
        output_size_bytes: row.get::<_, i64>(14)? as u64,
        parsed_summary: row.get(15)?,
        previous_record_hash: row.get(16)?,
        record_hash: row.get(17)?,
    })
}
