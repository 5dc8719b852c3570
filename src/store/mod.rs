// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The durable store: a SQLite database holding the processing queue, group
//! membership, registered calibration tables and performance samples.
//!
//! This is the single source of truth for all pipeline state. Every group
//! state transition is a single guarded `UPDATE ... WHERE state = ...` whose
//! affected-row count decides the outcome, so transitions are linearizable
//! for all observers without any locking beyond the store itself. No caller
//! ever implements a transition as a read followed by a write.

mod error;

use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ValueRef};
use rusqlite::{params, Connection, OptionalExtension};
use strum_macros::{Display, EnumString};

pub use error::StoreError;

use crate::time::unix_now;

/// The queue schema version stored in the `meta` table. Bump when the schema
/// changes and add a migration arm in `migrate`.
const SCHEMA_VERSION: i64 = 1;

/// How many pending candidates a claim attempt walks before giving up for
/// this poll.
const CLAIM_CANDIDATES: usize = 16;

/// Cap on the exponent used for backoff arithmetic inside SQL; 2^30 seconds
/// is already far beyond any sane delay ceiling.
const BACKOFF_SHIFT_CAP: u32 = 30;

/// Lifecycle states of an observation group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum GroupState {
    Collecting,
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl FromSql for GroupState {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        GroupState::from_str(s).map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// One time-windowed observation unit.
#[derive(Debug, Clone)]
pub struct GroupRecord {
    pub group_key: String,
    pub state: GroupState,
    pub received_at: f64,
    pub last_update: f64,
    pub expected_count: usize,
    pub has_calibrator: bool,
    /// Calibrator names whose transits overlap this group's window, in
    /// transit order.
    pub calibrators: Vec<String>,
    pub retry_count: u32,
    /// Set on terminal stage failures: the group is failed and may never be
    /// re-queued, regardless of remaining retry budget.
    pub terminal: bool,
    /// Set when the group was force-completed with partial membership.
    pub partial: bool,
    /// Unix-seconds timestamp before which a failed group is not eligible
    /// for re-queueing.
    pub not_before: f64,
    pub error: Option<String>,
}

/// One input file's membership in a group.
#[derive(Debug, Clone)]
pub struct MemberRecord {
    pub group_key: String,
    pub member_idx: usize,
    pub path: String,
    pub size_bytes: u64,
    pub discovered_at: f64,
}

/// Outcome of recording a member file, for the assembler to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberObservation {
    /// The member was recorded for the first time.
    Recorded,
    /// This (group, index, path) is already recorded; a no-op.
    AlreadyRecorded,
    /// The index is already held by a different file. The new file is
    /// ignored; overwriting an index silently is never allowed.
    IndexOccupied { existing_path: String },
    /// The file is already recorded under a different group or index.
    PathElsewhere {
        existing_group: String,
        existing_idx: usize,
    },
}

/// One registered calibration table.
#[derive(Debug, Clone)]
pub struct CalTableRecord {
    pub set_name: String,
    pub path: String,
    pub kind: String,
    pub order_index: i64,
    pub created_at: f64,
    pub valid_start_mjd: f64,
    pub valid_end_mjd: f64,
    pub active: bool,
}

/// A calibration table to be written by registration. The kind string and
/// order index come from the registry's application taxonomy.
#[derive(Debug, Clone)]
pub struct NewCalTable {
    pub path: String,
    pub kind: String,
    pub order_index: i64,
}

/// Per-set summary for the operator surface.
#[derive(Debug, Clone)]
pub struct CalSetSummary {
    pub set_name: String,
    pub n_tables: usize,
    pub n_active: usize,
    pub created_at: f64,
}

/// Timing breakdown for one group that reached a terminal state.
#[derive(Debug, Clone)]
pub struct PerfSample {
    pub group_key: String,
    /// Stage name to wall seconds, in execution order.
    pub stage_seconds: Vec<(String, f64)>,
    pub total_seconds: f64,
    pub recorded_at: f64,
}

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (creating if necessary) the state database at `path`.
    pub fn open(path: &Path) -> Result<Store, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::CreateDir(parent.display().to_string(), e))?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// An in-memory store, for tests.
    pub fn open_in_memory() -> Result<Store, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Store, StoreError> {
        // WAL keeps readers unblocked while a writer holds the database; the
        // busy timeout covers external processes inspecting the same file.
        let _ = conn.pragma_update(None, "journal_mode", "wal");
        conn.pragma_update(None, "foreign_keys", "on")?;
        conn.busy_timeout(std::time::Duration::from_secs(30))?;
        let store = Store {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn ensure_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS processing_queue (
                group_key      TEXT PRIMARY KEY,
                state          TEXT NOT NULL,
                received_at    REAL NOT NULL,
                last_update    REAL NOT NULL,
                expected_count INTEGER NOT NULL,
                has_calibrator INTEGER NOT NULL DEFAULT 0,
                calibrators    TEXT NOT NULL DEFAULT '[]',
                retry_count    INTEGER NOT NULL DEFAULT 0,
                terminal       INTEGER NOT NULL DEFAULT 0,
                partial        INTEGER NOT NULL DEFAULT 0,
                not_before     REAL NOT NULL DEFAULT 0,
                error          TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_queue_state
                ON processing_queue(state);
            CREATE INDEX IF NOT EXISTS idx_queue_received
                ON processing_queue(received_at);

            CREATE TABLE IF NOT EXISTS subband_files (
                group_key     TEXT NOT NULL,
                member_idx    INTEGER NOT NULL,
                path          TEXT NOT NULL,
                size_bytes    INTEGER NOT NULL,
                discovered_at REAL NOT NULL,
                PRIMARY KEY (group_key, member_idx),
                FOREIGN KEY (group_key) REFERENCES processing_queue(group_key)
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_subband_files_path
                ON subband_files(path);

            CREATE TABLE IF NOT EXISTS caltables (
                id              INTEGER PRIMARY KEY,
                set_name        TEXT NOT NULL,
                path            TEXT NOT NULL UNIQUE,
                table_kind      TEXT NOT NULL,
                order_index     INTEGER NOT NULL,
                created_at      REAL NOT NULL,
                valid_start_mjd REAL NOT NULL,
                valid_end_mjd   REAL NOT NULL,
                active          INTEGER NOT NULL DEFAULT 1,
                UNIQUE (set_name, order_index)
            );
            CREATE INDEX IF NOT EXISTS idx_caltables_window
                ON caltables(valid_start_mjd, valid_end_mjd);

            CREATE TABLE IF NOT EXISTS performance_metrics (
                group_key     TEXT PRIMARY KEY,
                stage_seconds TEXT NOT NULL,
                total_seconds REAL NOT NULL,
                recorded_at   REAL NOT NULL
            );

            CREATE TABLE IF NOT EXISTS meta (
                schema_version INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    /// Bring an existing database up to the current schema. Opening the same
    /// database twice is a no-op.
    fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let version: Option<i64> = conn
            .query_row("SELECT schema_version FROM meta", [], |row| row.get(0))
            .optional()?;
        match version {
            None => {
                conn.execute("INSERT INTO meta (schema_version) VALUES (?1)", [SCHEMA_VERSION])?;
            }
            Some(v) if v == SCHEMA_VERSION => (),
            Some(v) if v < SCHEMA_VERSION => {
                // Future ALTER TABLE migrations slot in here, one arm per
                // version step.
                conn.execute("UPDATE meta SET schema_version = ?1", [SCHEMA_VERSION])?;
            }
            Some(v) => {
                return Err(StoreError::SchemaTooNew {
                    found: v,
                    supported: SCHEMA_VERSION,
                })
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Group assembly
    // ------------------------------------------------------------------

    /// Create the group row if it doesn't exist yet, in state `collecting`.
    /// Returns whether the row was created by this call.
    pub fn ensure_group(
        &self,
        group_key: &str,
        expected_count: usize,
        has_calibrator: bool,
        calibrators: &[String],
    ) -> Result<bool, StoreError> {
        let now = unix_now();
        let calibrators_json = serde_json::to_string(calibrators)?;
        let conn = self.conn()?;
        let changed = conn.execute(
            "INSERT OR IGNORE INTO processing_queue
             (group_key, state, received_at, last_update, expected_count,
              has_calibrator, calibrators)
             VALUES (?1, 'collecting', ?2, ?2, ?3, ?4, ?5)",
            params![
                group_key,
                now,
                expected_count as i64,
                has_calibrator,
                calibrators_json
            ],
        )?;
        Ok(changed == 1)
    }

    /// Record a member file for a group. The decision of what to do about
    /// anomalies is the assembler's; this only reports what it found. The
    /// check-and-insert runs under the store lock and is atomic with respect
    /// to every other member observation.
    pub fn insert_member(
        &self,
        group_key: &str,
        member_idx: usize,
        path: &str,
        size_bytes: u64,
    ) -> Result<MemberObservation, StoreError> {
        let now = unix_now();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let by_path: Option<(String, usize)> = tx
            .query_row(
                "SELECT group_key, member_idx FROM subband_files WHERE path = ?1",
                [path],
                |row| Ok((row.get(0)?, row.get::<_, i64>(1)? as usize)),
            )
            .optional()?;
        if let Some((existing_group, existing_idx)) = by_path {
            tx.commit()?;
            return Ok(if existing_group == group_key && existing_idx == member_idx {
                MemberObservation::AlreadyRecorded
            } else {
                MemberObservation::PathElsewhere {
                    existing_group,
                    existing_idx,
                }
            });
        }

        let by_idx: Option<String> = tx
            .query_row(
                "SELECT path FROM subband_files WHERE group_key = ?1 AND member_idx = ?2",
                params![group_key, member_idx as i64],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(existing_path) = by_idx {
            tx.commit()?;
            return Ok(MemberObservation::IndexOccupied { existing_path });
        }

        tx.execute(
            "INSERT INTO subband_files
             (group_key, member_idx, path, size_bytes, discovered_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![group_key, member_idx as i64, path, size_bytes as i64, now],
        )?;
        tx.execute(
            "UPDATE processing_queue SET last_update = ?2 WHERE group_key = ?1",
            params![group_key, now],
        )?;
        tx.commit()?;
        Ok(MemberObservation::Recorded)
    }

    pub fn member_count(&self, group_key: &str) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM subband_files WHERE group_key = ?1",
            [group_key],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    /// `collecting -> pending` once membership is complete. The membership
    /// count is evaluated inside the UPDATE itself, so completion detection
    /// is a single atomic store operation. Returns whether the transition
    /// fired.
    pub fn mark_pending_if_complete(&self, group_key: &str) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE processing_queue
             SET state = 'pending', last_update = ?2
             WHERE group_key = ?1
               AND state = 'collecting'
               AND (SELECT COUNT(*) FROM subband_files WHERE group_key = ?1)
                   >= expected_count",
            params![group_key, unix_now()],
        )?;
        Ok(changed == 1)
    }

    /// `collecting -> pending` regardless of membership, marking the group
    /// partial. Driven by an external timeout signal when partial data is
    /// acceptable.
    pub fn force_complete(&self, group_key: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE processing_queue
             SET state = 'pending', partial = 1, last_update = ?2
             WHERE group_key = ?1 AND state = 'collecting'",
            params![group_key, unix_now()],
        )?;
        if changed == 1 {
            Ok(())
        } else if self.group(group_key)?.is_some() {
            Err(StoreError::InvalidTransition {
                group: group_key.to_string(),
                expected: "collecting",
                to: "pending",
            })
        } else {
            Err(StoreError::GroupNotFound(group_key.to_string()))
        }
    }

    // ------------------------------------------------------------------
    // Claiming and terminal transitions
    // ------------------------------------------------------------------

    /// Claim the oldest eligible pending group: `pending -> in_progress`.
    ///
    /// The claim is a conditional update guarded on the group still being
    /// pending; zero affected rows means another worker won the race, which
    /// is a normal outcome, and the next candidate is tried.
    pub fn claim_next_pending(&self) -> Result<Option<GroupRecord>, StoreError> {
        let now = unix_now();
        let conn = self.conn()?;
        let candidates: Vec<String> = {
            let mut stmt = conn.prepare(
                "SELECT group_key FROM processing_queue
                 WHERE state = 'pending' AND not_before <= ?1
                 ORDER BY received_at ASC, group_key ASC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![now, CLAIM_CANDIDATES as i64], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };
        for key in candidates {
            let won = conn.execute(
                "UPDATE processing_queue
                 SET state = 'in_progress', last_update = ?2
                 WHERE group_key = ?1 AND state = 'pending'",
                params![key, now],
            )?;
            if won == 1 {
                return Ok(Some(Self::fetch_group(&conn, &key)?.ok_or_else(|| {
                    StoreError::GroupNotFound(key.clone())
                })?));
            }
        }
        Ok(None)
    }

    /// `in_progress -> completed`. A group must have been claimed before it
    /// can complete; anything else is a transition violation.
    pub fn mark_completed(&self, group_key: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE processing_queue
             SET state = 'completed', error = NULL, last_update = ?2
             WHERE group_key = ?1 AND state = 'in_progress'",
            params![group_key, unix_now()],
        )?;
        if changed == 1 {
            Ok(())
        } else {
            Err(StoreError::InvalidTransition {
                group: group_key.to_string(),
                expected: "in_progress",
                to: "completed",
            })
        }
    }

    /// `in_progress -> failed` for a retryable failure: increments the retry
    /// count and stamps the earliest re-queue time with exponential backoff.
    /// The backoff is computed inside the UPDATE from the pre-increment retry
    /// count, so the whole failure is one atomic store operation.
    pub fn mark_failed_retryable(
        &self,
        group_key: &str,
        error: &str,
        initial_delay_s: f64,
        max_delay_s: f64,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE processing_queue
             SET state = 'failed',
                 retry_count = retry_count + 1,
                 error = ?2,
                 last_update = ?3,
                 not_before = ?3 + MIN(?4 * (1 << MIN(retry_count, ?6)), ?5)
             WHERE group_key = ?1 AND state = 'in_progress'",
            params![
                group_key,
                error,
                unix_now(),
                initial_delay_s,
                max_delay_s,
                BACKOFF_SHIFT_CAP
            ],
        )?;
        if changed == 1 {
            Ok(())
        } else {
            Err(StoreError::InvalidTransition {
                group: group_key.to_string(),
                expected: "in_progress",
                to: "failed",
            })
        }
    }

    /// `in_progress -> failed` with the terminal marker set: the group is
    /// permanently failed and excluded from re-queueing regardless of budget.
    pub fn mark_failed_terminal(&self, group_key: &str, error: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE processing_queue
             SET state = 'failed', terminal = 1, error = ?2, last_update = ?3
             WHERE group_key = ?1 AND state = 'in_progress'",
            params![group_key, error, unix_now()],
        )?;
        if changed == 1 {
            Ok(())
        } else {
            Err(StoreError::InvalidTransition {
                group: group_key.to_string(),
                expected: "in_progress",
                to: "failed",
            })
        }
    }

    // ------------------------------------------------------------------
    // Sweeps
    // ------------------------------------------------------------------

    /// `failed -> pending` for every non-terminal failed group whose backoff
    /// has elapsed and whose retry count is within budget. Returns the keys
    /// re-queued.
    pub fn requeue_eligible_failed(&self, max_retries: u32) -> Result<Vec<String>, StoreError> {
        let now = unix_now();
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "UPDATE processing_queue
             SET state = 'pending', last_update = ?1
             WHERE state = 'failed'
               AND terminal = 0
               AND retry_count < ?2
               AND not_before <= ?1
             RETURNING group_key",
        )?;
        let keys = stmt
            .query_map(params![now, max_retries], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(keys)
    }

    /// Sweep abandoned in-progress groups: anything without an update for
    /// `stale_after_s` is treated as a retryable failure (the owning worker
    /// is presumed dead). This is the only reclamation mechanism for
    /// orphaned claims.
    pub fn requeue_stale_in_progress(
        &self,
        stale_after_s: f64,
        initial_delay_s: f64,
        max_delay_s: f64,
    ) -> Result<Vec<String>, StoreError> {
        let now = unix_now();
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "UPDATE processing_queue
             SET state = 'failed',
                 retry_count = retry_count + 1,
                 error = 'worker lost: no update for ' || CAST(?2 AS TEXT) || ' s',
                 last_update = ?1,
                 not_before = ?1 + MIN(?3 * (1 << MIN(retry_count, ?5)), ?4)
             WHERE state = 'in_progress' AND last_update < ?1 - ?2
             RETURNING group_key",
        )?;
        let keys = stmt
            .query_map(
                params![now, stale_after_s, initial_delay_s, max_delay_s, BACKOFF_SHIFT_CAP],
                |row| row.get(0),
            )?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(keys)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn group(&self, group_key: &str) -> Result<Option<GroupRecord>, StoreError> {
        let conn = self.conn()?;
        Self::fetch_group(&conn, group_key)
    }

    fn fetch_group(conn: &Connection, group_key: &str) -> Result<Option<GroupRecord>, StoreError> {
        let record = conn
            .query_row(
                "SELECT group_key, state, received_at, last_update, expected_count,
                        has_calibrator, calibrators, retry_count, terminal, partial,
                        not_before, error
                 FROM processing_queue WHERE group_key = ?1",
                [group_key],
                |row| {
                    Ok((
                        GroupRecord {
                            group_key: row.get(0)?,
                            state: row.get(1)?,
                            received_at: row.get(2)?,
                            last_update: row.get(3)?,
                            expected_count: row.get::<_, i64>(4)? as usize,
                            has_calibrator: row.get(5)?,
                            calibrators: Vec::new(),
                            retry_count: row.get::<_, i64>(7)? as u32,
                            terminal: row.get(8)?,
                            partial: row.get(9)?,
                            not_before: row.get(10)?,
                            error: row.get(11)?,
                        },
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()?;
        match record {
            None => Ok(None),
            Some((mut group, calibrators_json)) => {
                group.calibrators = serde_json::from_str(&calibrators_json)?;
                Ok(Some(group))
            }
        }
    }

    pub fn members(&self, group_key: &str) -> Result<Vec<MemberRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT group_key, member_idx, path, size_bytes, discovered_at
             FROM subband_files WHERE group_key = ?1 ORDER BY member_idx ASC",
        )?;
        let members = stmt
            .query_map([group_key], |row| {
                Ok(MemberRecord {
                    group_key: row.get(0)?,
                    member_idx: row.get::<_, i64>(1)? as usize,
                    path: row.get(2)?,
                    size_bytes: row.get::<_, i64>(3)? as u64,
                    discovered_at: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(members)
    }

    /// Failed groups that remain candidates for eventual re-queueing: not
    /// terminal and within the retry budget. Used to decide when a draining
    /// run is actually finished.
    pub fn count_retry_candidates(&self, max_retries: u32) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM processing_queue
             WHERE state = 'failed' AND terminal = 0 AND retry_count < ?1",
            [max_retries],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    pub fn counts_by_state(&self) -> Result<Vec<(GroupState, usize)>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT state, COUNT(*) FROM processing_queue GROUP BY state ORDER BY state",
        )?;
        let counts = stmt
            .query_map([], |row| {
                Ok((row.get::<_, GroupState>(0)?, row.get::<_, i64>(1)? as usize))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(counts)
    }

    // ------------------------------------------------------------------
    // Performance samples
    // ------------------------------------------------------------------

    /// Record the timing breakdown for a group reaching a terminal state.
    /// At most one sample per group; a retried group overwrites its earlier
    /// failed attempt's sample.
    pub fn record_perf_sample(
        &self,
        group_key: &str,
        stage_seconds: &[(String, f64)],
        total_seconds: f64,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(stage_seconds)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO performance_metrics
             (group_key, stage_seconds, total_seconds, recorded_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![group_key, json, total_seconds, unix_now()],
        )?;
        Ok(())
    }

    pub fn perf_sample(&self, group_key: &str) -> Result<Option<PerfSample>, StoreError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT stage_seconds, total_seconds, recorded_at
                 FROM performance_metrics WHERE group_key = ?1",
                [group_key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, f64>(2)?,
                    ))
                },
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((json, total_seconds, recorded_at)) => Ok(Some(PerfSample {
                group_key: group_key.to_string(),
                stage_seconds: serde_json::from_str(&json)?,
                total_seconds,
                recorded_at,
            })),
        }
    }

    // ------------------------------------------------------------------
    // Calibration tables
    // ------------------------------------------------------------------

    /// Write all rows of a calibration set in one transaction, active.
    /// Upserts by path and by (set, order), so re-registering a set after an
    /// earlier rolled-back attempt reactivates it with a fresh creation time.
    pub fn insert_cal_set(
        &self,
        set_name: &str,
        tables: &[NewCalTable],
        valid_start_mjd: f64,
        valid_end_mjd: f64,
    ) -> Result<(), StoreError> {
        let now = unix_now();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for t in tables {
            tx.execute(
                "INSERT OR REPLACE INTO caltables
                 (set_name, path, table_kind, order_index, created_at,
                  valid_start_mjd, valid_end_mjd, active)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1)",
                params![
                    set_name,
                    t.path,
                    t.kind,
                    t.order_index,
                    now,
                    valid_start_mjd,
                    valid_end_mjd
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Deactivate every table of a set. Used for registration rollback and
    /// explicit retirement; rows are never deleted. Returns how many rows
    /// were deactivated.
    pub fn deactivate_cal_set(&self, set_name: &str) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE caltables SET active = 0 WHERE set_name = ?1 AND active = 1",
            [set_name],
        )?;
        Ok(changed)
    }

    /// The active tables of one named set, in application order.
    pub fn cal_set(&self, set_name: &str) -> Result<Vec<CalTableRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT set_name, path, table_kind, order_index, created_at,
                    valid_start_mjd, valid_end_mjd, active
             FROM caltables
             WHERE set_name = ?1 AND active = 1
             ORDER BY order_index ASC",
        )?;
        let rows = stmt
            .query_map([set_name], Self::cal_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// The winning active set for an epoch: among active sets whose
    /// `[start, end)` window contains the epoch, the most recently created
    /// (set name descending as a deterministic tie-break). Returns the set
    /// name and its tables in application order.
    pub fn active_applylist(
        &self,
        epoch_mjd: f64,
    ) -> Result<Option<(String, Vec<CalTableRecord>)>, StoreError> {
        let conn = self.conn()?;
        let winner: Option<String> = conn
            .query_row(
                "SELECT set_name FROM caltables
                 WHERE active = 1
                   AND valid_start_mjd <= ?1
                   AND ?1 < valid_end_mjd
                 GROUP BY set_name
                 ORDER BY MAX(created_at) DESC, set_name DESC
                 LIMIT 1",
                [epoch_mjd],
                |row| row.get(0),
            )
            .optional()?;
        let set_name = match winner {
            None => return Ok(None),
            Some(name) => name,
        };
        let tables = cal_set_rows(&conn, &set_name)?;
        Ok(Some((set_name, tables)))
    }

    pub fn list_cal_sets(&self) -> Result<Vec<CalSetSummary>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT set_name,
                    COUNT(*),
                    SUM(CASE WHEN active = 1 THEN 1 ELSE 0 END),
                    MAX(created_at)
             FROM caltables
             GROUP BY set_name
             ORDER BY MAX(created_at) DESC",
        )?;
        let sets = stmt
            .query_map([], |row| {
                Ok(CalSetSummary {
                    set_name: row.get(0)?,
                    n_tables: row.get::<_, i64>(1)? as usize,
                    n_active: row.get::<_, i64>(2)? as usize,
                    created_at: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sets)
    }

    fn cal_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CalTableRecord> {
        Ok(CalTableRecord {
            set_name: row.get(0)?,
            path: row.get(1)?,
            kind: row.get(2)?,
            order_index: row.get(3)?,
            created_at: row.get(4)?,
            valid_start_mjd: row.get(5)?,
            valid_end_mjd: row.get(6)?,
            active: row.get(7)?,
        })
    }
}

// `active_applylist` already holds the connection guard and the store mutex
// is not re-entrant, so the set query takes the borrowed connection directly.
fn cal_set_rows(conn: &Connection, set_name: &str) -> Result<Vec<CalTableRecord>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT set_name, path, table_kind, order_index, created_at,
                valid_start_mjd, valid_end_mjd, active
         FROM caltables
         WHERE set_name = ?1 AND active = 1
         ORDER BY order_index ASC",
    )?;
    let rows = stmt
        .query_map([set_name], Store::cal_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
