//! SQLite-backed store.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use slotshare_id::{CommitId, CoordinatorId, EpochIndex, ProviderId, RecordId};
use slotshare_schedule::Schedule;
use tracing::debug;

use super::{IngestBatch, ScheduleStore, StoreError, StoreResult};
use crate::epoch::{Checkpoint, Epoch, EpochPhase};
use crate::model::{ContributionRecord, FrozenSnapshot, PoolInfo, ScoreState, SubjectKey, WeightVector};

/// SQLite store.
///
/// The connection sits behind a mutex so the store can be shared with the
/// async control loop; every operation is a short synchronous call.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.busy_timeout(Duration::from_secs(5))?;

        Self::with_connection(conn)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("connection lock poisoned".to_string()))
    }
}

fn init_schema(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schedules (
            epoch INTEGER PRIMARY KEY,
            digest TEXT NOT NULL,
            body TEXT NOT NULL,
            degraded INTEGER NOT NULL,
            expires_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS pool_info (
            coordinator_id TEXT PRIMARY KEY,
            endpoint TEXT NOT NULL,
            last_seen INTEGER NOT NULL,
            consecutive_failures INTEGER NOT NULL DEFAULT 0,
            stale INTEGER NOT NULL DEFAULT 0,
            expires_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS score_state (
            provider_id TEXT NOT NULL,
            coordinator_id TEXT NOT NULL,
            ema TEXT NOT NULL,
            last_update_epoch INTEGER NOT NULL,
            decayed_through INTEGER,
            PRIMARY KEY (provider_id, coordinator_id)
        );

        CREATE TABLE IF NOT EXISTS cursors (
            coordinator_id TEXT PRIMARY KEY,
            cursor TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS processed_records (
            record_id TEXT PRIMARY KEY,
            epoch INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_processed_epoch ON processed_records(epoch);

        CREATE TABLE IF NOT EXISTS deferred_records (
            record_id TEXT PRIMARY KEY,
            block INTEGER NOT NULL,
            body TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS snapshots (
            epoch INTEGER PRIMARY KEY,
            body TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS weights (
            epoch INTEGER PRIMARY KEY,
            commit_id TEXT NOT NULL,
            body TEXT NOT NULL,
            committed_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS checkpoint (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            epoch_index INTEGER NOT NULL,
            start_block INTEGER NOT NULL,
            length_blocks INTEGER NOT NULL,
            phase TEXT NOT NULL,
            next_poll_block INTEGER NOT NULL,
            version INTEGER NOT NULL
        );
        "#,
    )?;

    debug!("Store schema initialized");
    Ok(())
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn expires_at(ttl: Duration) -> i64 {
    now_ms().saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn to_u64(v: i64) -> StoreResult<u64> {
    u64::try_from(v).map_err(|_| StoreError::Corrupt(format!("negative value {v}")))
}

fn parse_key<T>(s: &str) -> StoreResult<T>
where
    T: FromStr,
    T::Err: Display,
{
    s.parse()
        .map_err(|e| StoreError::Corrupt(format!("invalid key {s:?}: {e}")))
}

fn upsert_state(conn: &Connection, state: &ScoreState) -> StoreResult<()> {
    conn.execute(
        r#"
        INSERT INTO score_state (provider_id, coordinator_id, ema, last_update_epoch, decayed_through)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(provider_id, coordinator_id) DO UPDATE SET
            ema = excluded.ema,
            last_update_epoch = excluded.last_update_epoch,
            decayed_through = excluded.decayed_through
        "#,
        params![
            state.subject.provider.as_str(),
            state.subject.coordinator.as_str(),
            serde_json::to_string(&state.ema)?,
            to_i64(state.last_update_epoch.value()),
            state.decayed_through.map(|e| to_i64(e.value())),
        ],
    )?;
    Ok(())
}

impl ScheduleStore for SqliteStore {
    fn put_schedule(&self, schedule: &Schedule, ttl: Duration) -> StoreResult<()> {
        let digest = schedule.digest();
        let body = serde_json::to_string(schedule)?;
        let epoch = to_i64(schedule.epoch.value());

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT digest FROM schedules WHERE epoch = ?1 AND expires_at > ?2",
                params![epoch, now_ms()],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(stored) if stored == digest.as_str() => {
                debug!(epoch = %schedule.epoch, digest = %digest, "Schedule already persisted");
                return Ok(());
            }
            Some(stored) => {
                return Err(StoreError::Conflict(format!(
                    "epoch {} already has schedule {stored}",
                    schedule.epoch
                )));
            }
            None => {}
        }

        tx.execute(
            "INSERT OR REPLACE INTO schedules (epoch, digest, body, degraded, expires_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![epoch, digest.as_str(), body, schedule.degraded, expires_at(ttl)],
        )?;
        tx.commit()?;

        debug!(epoch = %schedule.epoch, digest = %digest, "Schedule persisted");
        Ok(())
    }

    fn get_schedule(&self, epoch: EpochIndex) -> StoreResult<Option<Schedule>> {
        let conn = self.conn()?;
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT digest, body FROM schedules WHERE epoch = ?1 AND expires_at > ?2",
                params![to_i64(epoch.value()), now_ms()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((digest, body)) = row else {
            return Ok(None);
        };

        let schedule: Schedule = serde_json::from_str(&body)?;
        if schedule.digest().as_str() != digest {
            return Err(StoreError::Corrupt(format!(
                "schedule for epoch {epoch} does not match its digest"
            )));
        }
        Ok(Some(schedule))
    }

    fn put_pool_info(&self, info: &PoolInfo, ttl: Duration) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO pool_info (coordinator_id, endpoint, last_seen, consecutive_failures, stale, expires_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(coordinator_id) DO UPDATE SET
                endpoint = excluded.endpoint,
                last_seen = excluded.last_seen,
                consecutive_failures = excluded.consecutive_failures,
                stale = excluded.stale,
                expires_at = excluded.expires_at
            "#,
            params![
                info.coordinator_id.as_str(),
                info.endpoint,
                info.last_seen.timestamp_millis(),
                info.consecutive_failures,
                info.stale,
                expires_at(ttl),
            ],
        )?;
        Ok(())
    }

    fn list_pool_info(&self) -> StoreResult<Vec<PoolInfo>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT coordinator_id, endpoint, last_seen, consecutive_failures, stale
             FROM pool_info WHERE expires_at > ?1 ORDER BY coordinator_id",
        )?;

        let rows = stmt
            .query_map(params![now_ms()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, u32>(3)?,
                    row.get::<_, bool>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, endpoint, last_seen, failures, stale)| {
                Ok(PoolInfo {
                    coordinator_id: parse_key(&id)?,
                    endpoint,
                    last_seen: DateTime::<Utc>::from_timestamp_millis(last_seen).ok_or_else(
                        || StoreError::Corrupt(format!("invalid last_seen {last_seen}")),
                    )?,
                    consecutive_failures: failures,
                    stale,
                })
            })
            .collect()
    }

    fn load_score_states(&self) -> StoreResult<Vec<ScoreState>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT provider_id, coordinator_id, ema, last_update_epoch, decayed_through
             FROM score_state ORDER BY provider_id, coordinator_id",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(provider, coordinator, ema, last_update, decayed)| {
                Ok(ScoreState {
                    subject: SubjectKey {
                        provider: parse_key::<ProviderId>(&provider)?,
                        coordinator: parse_key::<CoordinatorId>(&coordinator)?,
                    },
                    ema: serde_json::from_str(&ema)?,
                    last_update_epoch: EpochIndex::new(to_u64(last_update)?),
                    decayed_through: decayed.map(to_u64).transpose()?.map(EpochIndex::new),
                })
            })
            .collect()
    }

    fn load_cursors(&self) -> StoreResult<BTreeMap<CoordinatorId, String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT coordinator_id, cursor FROM cursors")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, cursor)| Ok((parse_key(&id)?, cursor)))
            .collect()
    }

    fn processed_since(&self, epoch: EpochIndex) -> StoreResult<Vec<(RecordId, EpochIndex)>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT record_id, epoch FROM processed_records WHERE epoch >= ?1")?;
        let rows = stmt
            .query_map(params![to_i64(epoch.value())], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, epoch)| Ok((parse_key(&id)?, EpochIndex::new(to_u64(epoch)?))))
            .collect()
    }

    fn prune_processed(&self, before: EpochIndex) -> StoreResult<usize> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM processed_records WHERE epoch < ?1",
            params![to_i64(before.value())],
        )?;
        Ok(removed)
    }

    fn load_deferred(&self) -> StoreResult<Vec<ContributionRecord>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT body FROM deferred_records ORDER BY block, record_id")?;
        let bodies = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        bodies
            .iter()
            .map(|body| serde_json::from_str(body).map_err(Into::into))
            .collect()
    }

    fn apply_batch(&self, batch: &IngestBatch) -> StoreResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        for state in &batch.states {
            upsert_state(&tx, state)?;
        }

        let epoch = to_i64(batch.epoch.value());
        for id in &batch.processed {
            tx.execute(
                "INSERT OR IGNORE INTO processed_records (record_id, epoch) VALUES (?1, ?2)",
                params![id.as_str(), epoch],
            )?;
        }

        for record in &batch.deferred {
            tx.execute(
                "INSERT OR IGNORE INTO deferred_records (record_id, block, body) VALUES (?1, ?2, ?3)",
                params![
                    record.record_id.as_str(),
                    to_i64(record.block),
                    serde_json::to_string(record)?
                ],
            )?;
        }

        for id in &batch.released {
            tx.execute(
                "DELETE FROM deferred_records WHERE record_id = ?1",
                params![id.as_str()],
            )?;
        }

        if let Some((coordinator, cursor)) = &batch.cursor {
            tx.execute(
                r#"
                INSERT INTO cursors (coordinator_id, cursor) VALUES (?1, ?2)
                ON CONFLICT(coordinator_id) DO UPDATE SET cursor = excluded.cursor
                "#,
                params![coordinator.as_str(), cursor],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    fn put_snapshot(&self, snapshot: &FrozenSnapshot, states: &[ScoreState]) -> StoreResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        for state in states {
            upsert_state(&tx, state)?;
        }
        tx.execute(
            "INSERT OR IGNORE INTO snapshots (epoch, body) VALUES (?1, ?2)",
            params![
                to_i64(snapshot.epoch.value()),
                serde_json::to_string(snapshot)?
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn get_snapshot(&self, epoch: EpochIndex) -> StoreResult<Option<FrozenSnapshot>> {
        let conn = self.conn()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM snapshots WHERE epoch = ?1",
                params![to_i64(epoch.value())],
                |row| row.get(0),
            )
            .optional()?;

        body.map(|b| serde_json::from_str(&b).map_err(Into::into))
            .transpose()
    }

    fn put_weights(&self, weights: &WeightVector, commit_id: &CommitId) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO weights (epoch, commit_id, body, committed_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                to_i64(weights.epoch.value()),
                commit_id.to_string(),
                serde_json::to_string(weights)?,
                now_ms(),
            ],
        )?;
        Ok(())
    }

    fn get_weights(&self, epoch: EpochIndex) -> StoreResult<Option<WeightVector>> {
        let conn = self.conn()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM weights WHERE epoch = ?1",
                params![to_i64(epoch.value())],
                |row| row.get(0),
            )
            .optional()?;

        body.map(|b| serde_json::from_str(&b).map_err(Into::into))
            .transpose()
    }

    fn load_checkpoint(&self) -> StoreResult<Option<Checkpoint>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT epoch_index, start_block, length_blocks, phase, next_poll_block, version
                 FROM checkpoint WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((index, start, length, phase, next_poll, version)) = row else {
            return Ok(None);
        };

        let phase = EpochPhase::parse(&phase)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown epoch phase {phase:?}")))?;

        Ok(Some(Checkpoint {
            epoch: Epoch {
                index: EpochIndex::new(to_u64(index)?),
                start_block: to_u64(start)?,
                length_blocks: to_u64(length)?,
            },
            phase,
            next_poll_block: to_u64(next_poll)?,
            version: to_u64(version)?,
        }))
    }

    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> StoreResult<()> {
        let conn = self.conn()?;
        let epoch = &checkpoint.epoch;

        let changed = if checkpoint.version == 0 {
            conn.execute(
                r#"
                INSERT OR IGNORE INTO checkpoint
                    (id, epoch_index, start_block, length_blocks, phase, next_poll_block, version)
                VALUES (1, ?1, ?2, ?3, ?4, ?5, 0)
                "#,
                params![
                    to_i64(epoch.index.value()),
                    to_i64(epoch.start_block),
                    to_i64(epoch.length_blocks),
                    checkpoint.phase.as_str(),
                    to_i64(checkpoint.next_poll_block),
                ],
            )?
        } else {
            conn.execute(
                r#"
                UPDATE checkpoint SET
                    epoch_index = ?1,
                    start_block = ?2,
                    length_blocks = ?3,
                    phase = ?4,
                    next_poll_block = ?5,
                    version = ?6
                WHERE id = 1 AND version = ?7
                "#,
                params![
                    to_i64(epoch.index.value()),
                    to_i64(epoch.start_block),
                    to_i64(epoch.length_blocks),
                    checkpoint.phase.as_str(),
                    to_i64(checkpoint.next_poll_block),
                    to_i64(checkpoint.version),
                    to_i64(checkpoint.version - 1),
                ],
            )?
        };

        if changed == 0 {
            return Err(StoreError::Conflict(format!(
                "checkpoint version {} was superseded",
                checkpoint.version
            )));
        }
        Ok(())
    }

    fn purge_expired(&self) -> StoreResult<usize> {
        let conn = self.conn()?;
        let now = now_ms();
        let schedules = conn.execute("DELETE FROM schedules WHERE expires_at <= ?1", params![now])?;
        let pools = conn.execute("DELETE FROM pool_info WHERE expires_at <= ?1", params![now])?;
        if schedules + pools > 0 {
            debug!(schedules, pools, "Purged expired rows");
        }
        Ok(schedules + pools)
    }
}
