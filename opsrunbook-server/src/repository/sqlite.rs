//! SQLite implementation of every store trait.
//!
//! # Schema Versioning
//!
//! The `schema_version` table tracks the schema version. To change the
//! schema, increment `CURRENT_SCHEMA_VERSION` and add a step to
//! `run_migrations()`. Migrations run sequentially from the stored version.
//!
//! # Conditional writes
//!
//! Every "first writer wins" operation is an `INSERT OR IGNORE` against a
//! primary key followed by a check of the affected row count, so the check
//! and the write are one statement.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opsrunbook_core::review_state::transition;
use opsrunbook_core::webhook::FAILED_OUTCOME;
use opsrunbook_core::{
    ActionPlan, ActionResult, DeliveryClaim, DeliveryRecord, DeliveryStore, FindingsPacket,
    IdempotencyLedger, LedgerError, LedgerKey, PacketStore, PlanStore, PrReviewState,
    PullRequestId, PutOutcome, ReviewCommand, ReviewStateStore, ReviewStatus, StoreError,
    Transition,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use super::RepositoryError;

const CURRENT_SCHEMA_VERSION: i64 = 2;

/// SQLite-backed repository.
///
/// One connection behind a mutex; every query runs on
/// `tokio::task::spawn_blocking` so rusqlite never blocks the runtime.
pub struct SqliteRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRepository {
    /// Open (or create) the database at `path` and run pending migrations.
    ///
    /// # Durability
    ///
    /// - `journal_mode = WAL`
    /// - `synchronous = FULL`
    /// - `busy_timeout = 5000ms`
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, RepositoryError> {
        let path_ref = path.as_ref();
        let path_str = path_ref.to_string_lossy();
        let is_in_memory = path_str == ":memory:";

        if !is_in_memory && !path_str.is_empty() {
            if let Some(parent) = path_ref.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        RepositoryError::storage(
                            "create database directory",
                            format!("{}: {}", parent.display(), e),
                        )
                    })?;
                }
            }
        }

        let conn = Connection::open(path_ref)
            .map_err(|e| RepositoryError::storage("open database", e.to_string()))?;

        // The database holds webhook payloads and signatures.
        #[cfg(unix)]
        if !is_in_memory && !path_str.is_empty() {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            if let Err(e) = std::fs::set_permissions(path_ref, permissions) {
                warn!(
                    "Failed to set restrictive permissions on database file: {}",
                    e
                );
            }
        }

        // SQLite silently keeps DELETE mode on filesystems without shared
        // memory, so the returned mode has to be checked. In-memory databases
        // report "memory".
        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| RepositoryError::storage("set journal_mode", e.to_string()))?;

        let journal_mode_ok = journal_mode.eq_ignore_ascii_case("wal")
            || (is_in_memory && journal_mode.eq_ignore_ascii_case("memory"));
        if !journal_mode_ok {
            return Err(RepositoryError::storage(
                "configure journal_mode",
                format!(
                    "SQLite returned journal mode '{}' instead of 'wal'",
                    journal_mode
                ),
            ));
        }

        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            "#,
        )
        .map_err(|e| RepositoryError::storage("configure pragmas", e.to_string()))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| RepositoryError::storage("create schema_version table", e.to_string()))?;

        let current_version: i64 = conn
            .query_row(
                "SELECT version FROM schema_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| RepositoryError::storage("get schema version", e.to_string()))?
            .unwrap_or(0);

        Self::run_migrations(&conn, current_version)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection, from_version: i64) -> Result<(), RepositoryError> {
        if from_version > CURRENT_SCHEMA_VERSION {
            return Err(RepositoryError::storage(
                "schema version",
                format!(
                    "Database schema version {} is newer than supported version {}. \
                     Please upgrade the application.",
                    from_version, CURRENT_SCHEMA_VERSION
                ),
            ));
        }

        if from_version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }

        // v1: incident runs
        if from_version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS findings_packets (
                    incident_id TEXT NOT NULL,
                    run_id TEXT NOT NULL,
                    packet_json TEXT NOT NULL,
                    stored_at TEXT NOT NULL,
                    PRIMARY KEY (incident_id, run_id)
                );

                CREATE TABLE IF NOT EXISTS action_plans (
                    incident_id TEXT NOT NULL,
                    run_id TEXT NOT NULL,
                    fingerprint TEXT NOT NULL,
                    plan_json TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    PRIMARY KEY (incident_id, run_id)
                );

                CREATE TABLE IF NOT EXISTS action_results (
                    incident_id TEXT NOT NULL,
                    run_id TEXT NOT NULL,
                    action_id TEXT NOT NULL,
                    action_type TEXT NOT NULL,
                    status TEXT NOT NULL,
                    result_json TEXT NOT NULL,
                    recorded_at TEXT NOT NULL,
                    PRIMARY KEY (incident_id, run_id, action_id)
                );

                CREATE TABLE IF NOT EXISTS action_attempts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    incident_id TEXT NOT NULL,
                    run_id TEXT NOT NULL,
                    action_id TEXT NOT NULL,
                    status TEXT NOT NULL,
                    result_json TEXT NOT NULL,
                    recorded_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_attempts_key
                    ON action_attempts(incident_id, run_id, action_id);
                "#,
            )
            .map_err(|e| RepositoryError::storage("migration v1", e.to_string()))?;
        }

        // v2: webhook deliveries and PR review state
        if from_version < 2 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS webhook_deliveries (
                    delivery_id TEXT PRIMARY KEY,
                    event_type TEXT NOT NULL,
                    signature TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    received_at TEXT NOT NULL,
                    outcome TEXT,
                    sender_login TEXT,
                    command TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_deliveries_received_at
                    ON webhook_deliveries(received_at);

                CREATE TABLE IF NOT EXISTS pr_review_states (
                    repo_full_name TEXT NOT NULL,
                    pr_number INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    last_command_author TEXT,
                    last_transition_at TEXT NOT NULL,
                    PRIMARY KEY (repo_full_name, pr_number)
                );
                "#,
            )
            .map_err(|e| RepositoryError::storage("migration v2", e.to_string()))?;
        }

        conn.execute(
            "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?1)",
            params![CURRENT_SCHEMA_VERSION],
        )
        .map_err(|e| RepositoryError::storage("update schema version", e.to_string()))?;

        Ok(())
    }

    /// Create a new in-memory SQLite repository (for testing).
    #[cfg(test)]
    pub fn new_in_memory() -> Result<Self, RepositoryError> {
        Self::new(":memory:")
    }

    /// Run `f` against the connection on the blocking pool.
    async fn run<T, F>(&self, operation: &'static str, f: F) -> Result<T, RepositoryError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, RepositoryError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| RepositoryError::storage(operation, "connection mutex poisoned"))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| RepositoryError::storage(operation, e.to_string()))?
    }
}

fn to_json<T: Serialize>(value: &T, what: &str) -> Result<String, RepositoryError> {
    serde_json::to_string(value)
        .map_err(|e| RepositoryError::storage(format!("serialize {}", what), e.to_string()))
}

fn from_json<T: DeserializeOwned>(json: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(json).map_err(|_| RepositoryError::corruption(what))
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| RepositoryError::corruption("timestamp"))
}

fn parse_command(value: Option<String>) -> Result<Option<ReviewCommand>, RepositoryError> {
    match value.as_deref() {
        None => Ok(None),
        Some("stop") => Ok(Some(ReviewCommand::Stop)),
        Some("resume") => Ok(Some(ReviewCommand::Resume)),
        Some(_) => Err(RepositoryError::corruption("delivery command")),
    }
}

/// Collect JSON columns, skipping rows that no longer deserialize.
fn decode_rows<T: DeserializeOwned>(rows: Vec<String>, what: &str) -> Vec<T> {
    rows.into_iter()
        .filter_map(|json| match serde_json::from_str(&json) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Skipping corrupt {} row: {}", what, e);
                None
            }
        })
        .collect()
}

fn query_json_column(
    conn: &Connection,
    operation: &'static str,
    sql: &str,
    args: impl rusqlite::Params,
) -> Result<Vec<String>, RepositoryError> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| RepositoryError::storage(operation, e.to_string()))?;
    let rows = stmt
        .query_map(args, |row| row.get::<_, String>(0))
        .map_err(|e| RepositoryError::storage(operation, e.to_string()))?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(|e| RepositoryError::storage(operation, e.to_string()))?);
    }
    Ok(out)
}

#[async_trait]
impl IdempotencyLedger for SqliteRepository {
    async fn get(&self, key: &LedgerKey) -> Result<Option<ActionResult>, LedgerError> {
        let key = key.clone();
        let json: Option<String> = self
            .run("ledger get", move |conn| {
                conn.query_row(
                    "SELECT result_json FROM action_results
                     WHERE incident_id = ?1 AND run_id = ?2 AND action_id = ?3",
                    params![key.incident_id, key.run_id, key.action_id.0],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| RepositoryError::storage("ledger get", e.to_string()))
            })
            .await?;

        Ok(json
            .map(|j| from_json(&j, "action result"))
            .transpose()?)
    }

    async fn put_if_absent(
        &self,
        key: &LedgerKey,
        result: ActionResult,
    ) -> Result<PutOutcome, LedgerError> {
        let key = key.clone();
        let json = to_json(&result, "action result")?;
        let action_type = result.action_type.as_str();
        let status = result.status.as_str();
        let recorded_at = result.recorded_at.to_rfc3339();

        let existing: Option<String> = self
            .run("ledger put_if_absent", move |conn| {
                let inserted = conn
                    .execute(
                        "INSERT OR IGNORE INTO action_results
                             (incident_id, run_id, action_id, action_type, status, result_json, recorded_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        params![
                            key.incident_id,
                            key.run_id,
                            key.action_id.0,
                            action_type,
                            status,
                            json,
                            recorded_at
                        ],
                    )
                    .map_err(|e| RepositoryError::storage("ledger put_if_absent", e.to_string()))?;
                if inserted == 1 {
                    return Ok(None);
                }

                conn.query_row(
                    "SELECT result_json FROM action_results
                     WHERE incident_id = ?1 AND run_id = ?2 AND action_id = ?3",
                    params![key.incident_id, key.run_id, key.action_id.0],
                    |row| row.get(0),
                )
                .map(Some)
                .map_err(|e| RepositoryError::storage("ledger put_if_absent", e.to_string()))
            })
            .await?;

        match existing {
            None => Ok(PutOutcome {
                accepted: true,
                winning: result,
            }),
            Some(json) => Ok(PutOutcome {
                accepted: false,
                winning: from_json(&json, "action result")?,
            }),
        }
    }

    async fn record_attempt(&self, key: &LedgerKey, result: &ActionResult) -> Result<(), LedgerError> {
        let key = key.clone();
        let json = to_json(result, "action attempt")?;
        let status = result.status.as_str();
        let recorded_at = result.recorded_at.to_rfc3339();

        self.run("ledger record_attempt", move |conn| {
            conn.execute(
                "INSERT INTO action_attempts
                     (incident_id, run_id, action_id, status, result_json, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![key.incident_id, key.run_id, key.action_id.0, status, json, recorded_at],
            )
            .map_err(|e| RepositoryError::storage("ledger record_attempt", e.to_string()))?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn attempts(&self, key: &LedgerKey) -> Result<Vec<ActionResult>, LedgerError> {
        let key = key.clone();
        let rows = self
            .run("ledger attempts", move |conn| {
                query_json_column(
                    conn,
                    "ledger attempts",
                    "SELECT result_json FROM action_attempts
                     WHERE incident_id = ?1 AND run_id = ?2 AND action_id = ?3
                     ORDER BY id",
                    params![key.incident_id, key.run_id, key.action_id.0],
                )
            })
            .await?;
        Ok(decode_rows(rows, "action attempt"))
    }

    async fn results_for_run(
        &self,
        incident_id: &str,
        run_id: &str,
    ) -> Result<Vec<ActionResult>, LedgerError> {
        let (incident_id, run_id) = (incident_id.to_string(), run_id.to_string());
        let rows = self
            .run("ledger results_for_run", move |conn| {
                query_json_column(
                    conn,
                    "ledger results_for_run",
                    "SELECT result_json FROM action_results
                     WHERE incident_id = ?1 AND run_id = ?2
                     ORDER BY action_id",
                    params![incident_id, run_id],
                )
            })
            .await?;
        Ok(decode_rows(rows, "action result"))
    }
}

#[async_trait]
impl PlanStore for SqliteRepository {
    async fn put_plan_if_absent(&self, plan: &ActionPlan) -> Result<(bool, ActionPlan), StoreError> {
        let json = to_json(plan, "action plan")?;
        let incident_id = plan.incident_id.clone();
        let run_id = plan.run_id.clone();
        let fingerprint = plan.fingerprint.clone();
        let created_at = Utc::now().to_rfc3339();

        let existing: Option<String> = self
            .run("put_plan_if_absent", move |conn| {
                let inserted = conn
                    .execute(
                        "INSERT OR IGNORE INTO action_plans
                             (incident_id, run_id, fingerprint, plan_json, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![incident_id, run_id, fingerprint, json, created_at],
                    )
                    .map_err(|e| RepositoryError::storage("put_plan_if_absent", e.to_string()))?;
                if inserted == 1 {
                    return Ok(None);
                }

                conn.query_row(
                    "SELECT plan_json FROM action_plans WHERE incident_id = ?1 AND run_id = ?2",
                    params![incident_id, run_id],
                    |row| row.get(0),
                )
                .map(Some)
                .map_err(|e| RepositoryError::storage("put_plan_if_absent", e.to_string()))
            })
            .await?;

        match existing {
            None => Ok((true, plan.clone())),
            Some(json) => Ok((false, from_json(&json, "action plan")?)),
        }
    }

    async fn get_plan(&self, incident_id: &str, run_id: &str) -> Result<Option<ActionPlan>, StoreError> {
        let (incident_id, run_id) = (incident_id.to_string(), run_id.to_string());
        let json: Option<String> = self
            .run("get_plan", move |conn| {
                conn.query_row(
                    "SELECT plan_json FROM action_plans WHERE incident_id = ?1 AND run_id = ?2",
                    params![incident_id, run_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| RepositoryError::storage("get_plan", e.to_string()))
            })
            .await?;

        Ok(json.map(|j| from_json(&j, "action plan")).transpose()?)
    }
}

#[async_trait]
impl PacketStore for SqliteRepository {
    async fn put_packet(&self, packet: &FindingsPacket) -> Result<(), StoreError> {
        let json = to_json(packet, "findings packet")?;
        let incident_id = packet.incident_id.clone();
        let run_id = packet.run_id.clone();
        let stored_at = Utc::now().to_rfc3339();

        let existing: Option<String> = self
            .run("put_packet", move |conn| {
                let inserted = conn
                    .execute(
                        "INSERT OR IGNORE INTO findings_packets
                             (incident_id, run_id, packet_json, stored_at)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![incident_id, run_id, json, stored_at],
                    )
                    .map_err(|e| RepositoryError::storage("put_packet", e.to_string()))?;
                if inserted == 1 {
                    return Ok(None);
                }

                conn.query_row(
                    "SELECT packet_json FROM findings_packets WHERE incident_id = ?1 AND run_id = ?2",
                    params![incident_id, run_id],
                    |row| row.get(0),
                )
                .map(Some)
                .map_err(|e| RepositoryError::storage("put_packet", e.to_string()))
            })
            .await?;

        let Some(json) = existing else {
            return Ok(());
        };
        let stored: FindingsPacket = from_json(&json, "findings packet")?;
        if &stored == packet {
            Ok(())
        } else {
            Err(StoreError::Conflict(format!(
                "a different packet is already stored for incident {} run {}",
                packet.incident_id, packet.run_id
            )))
        }
    }

    async fn get_packet(
        &self,
        incident_id: &str,
        run_id: &str,
    ) -> Result<Option<FindingsPacket>, StoreError> {
        let (incident_id, run_id) = (incident_id.to_string(), run_id.to_string());
        let json: Option<String> = self
            .run("get_packet", move |conn| {
                conn.query_row(
                    "SELECT packet_json FROM findings_packets WHERE incident_id = ?1 AND run_id = ?2",
                    params![incident_id, run_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| RepositoryError::storage("get_packet", e.to_string()))
            })
            .await?;

        Ok(json.map(|j| from_json(&j, "findings packet")).transpose()?)
    }
}

#[async_trait]
impl DeliveryStore for SqliteRepository {
    async fn try_claim(&self, record: &DeliveryRecord) -> Result<DeliveryClaim, StoreError> {
        let record = record.clone();
        // Both statements run under the connection lock, so a failed delivery
        // is reclaimed by at most one caller.
        let claimed = self
            .run("try_claim", move |conn| {
                let inserted = conn.execute(
                    "INSERT OR IGNORE INTO webhook_deliveries
                         (delivery_id, event_type, signature, payload, received_at, outcome, sender_login, command)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        record.delivery_id,
                        record.event_type,
                        record.signature,
                        record.payload,
                        record.received_at.to_rfc3339(),
                        record.outcome,
                        record.sender_login,
                        record.command.map(|c| c.to_string())
                    ],
                )
                .map_err(|e| RepositoryError::storage("try_claim", e.to_string()))?;
                if inserted == 1 {
                    return Ok(1);
                }
                conn.execute(
                    "UPDATE webhook_deliveries
                     SET event_type = ?2, signature = ?3, payload = ?4, received_at = ?5,
                         outcome = NULL, sender_login = NULL, command = NULL
                     WHERE delivery_id = ?1 AND outcome = ?6",
                    params![
                        record.delivery_id,
                        record.event_type,
                        record.signature,
                        record.payload,
                        record.received_at.to_rfc3339(),
                        FAILED_OUTCOME
                    ],
                )
                .map_err(|e| RepositoryError::storage("try_claim", e.to_string()))
            })
            .await?;

        Ok(if claimed == 1 {
            DeliveryClaim::Claimed
        } else {
            DeliveryClaim::AlreadyRecorded
        })
    }

    async fn record_outcome(
        &self,
        delivery_id: &str,
        outcome: &str,
        sender_login: Option<&str>,
        command: Option<ReviewCommand>,
    ) -> Result<(), StoreError> {
        let delivery_id = delivery_id.to_string();
        let outcome = outcome.to_string();
        let sender_login = sender_login.map(str::to_string);
        let command = command.map(|c| c.to_string());

        let updated = self
            .run("record_outcome", {
                let delivery_id = delivery_id.clone();
                move |conn| {
                    conn.execute(
                        "UPDATE webhook_deliveries
                         SET outcome = ?2, sender_login = ?3, command = ?4
                         WHERE delivery_id = ?1",
                        params![delivery_id, outcome, sender_login, command],
                    )
                    .map_err(|e| RepositoryError::storage("record_outcome", e.to_string()))
                }
            })
            .await?;

        if updated == 0 {
            return Err(StoreError::Storage(format!(
                "delivery {} was never claimed",
                delivery_id
            )));
        }
        Ok(())
    }

    async fn get_delivery(&self, delivery_id: &str) -> Result<Option<DeliveryRecord>, StoreError> {
        let delivery_id = delivery_id.to_string();
        let record = self
            .run("get_delivery", move |conn| {
                let row = conn
                    .query_row(
                        "SELECT delivery_id, event_type, signature, payload, received_at,
                                outcome, sender_login, command
                         FROM webhook_deliveries WHERE delivery_id = ?1",
                        params![delivery_id],
                        |row| {
                            Ok((
                                row.get::<_, String>(0)?,
                                row.get::<_, String>(1)?,
                                row.get::<_, String>(2)?,
                                row.get::<_, String>(3)?,
                                row.get::<_, String>(4)?,
                                row.get::<_, Option<String>>(5)?,
                                row.get::<_, Option<String>>(6)?,
                                row.get::<_, Option<String>>(7)?,
                            ))
                        },
                    )
                    .optional()
                    .map_err(|e| RepositoryError::storage("get_delivery", e.to_string()))?;

                let Some((delivery_id, event_type, signature, payload, received_at, outcome, sender_login, command)) =
                    row
                else {
                    return Ok(None);
                };
                Ok(Some(DeliveryRecord {
                    delivery_id,
                    event_type,
                    signature,
                    payload,
                    received_at: parse_time(&received_at)?,
                    outcome,
                    sender_login,
                    command: parse_command(command)?,
                }))
            })
            .await?;
        Ok(record)
    }
}

fn load_review_state(
    conn: &Connection,
    pr: &PullRequestId,
) -> Result<Option<PrReviewState>, RepositoryError> {
    let row: Option<(String, Option<String>, String)> = conn
        .query_row(
            "SELECT status, last_command_author, last_transition_at FROM pr_review_states
             WHERE repo_full_name = ?1 AND pr_number = ?2",
            params![pr.repo_full_name, pr.pr_number as i64],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()
        .map_err(|e| RepositoryError::storage("get_state", e.to_string()))?;

    let Some((status, last_command_author, last_transition_at)) = row else {
        return Ok(None);
    };
    Ok(Some(PrReviewState {
        pr: pr.clone(),
        status: ReviewStatus::parse(&status)
            .ok_or_else(|| RepositoryError::corruption("review status"))?,
        last_command_author,
        last_transition_at: parse_time(&last_transition_at)?,
    }))
}

#[async_trait]
impl ReviewStateStore for SqliteRepository {
    async fn get_state(&self, pr: &PullRequestId) -> Result<Option<PrReviewState>, StoreError> {
        let pr = pr.clone();
        Ok(self
            .run("get_state", move |conn| load_review_state(conn, &pr))
            .await?)
    }

    async fn apply(
        &self,
        pr: &PullRequestId,
        command: Option<ReviewCommand>,
        author: &str,
        now: DateTime<Utc>,
    ) -> Result<Transition, StoreError> {
        let pr = pr.clone();
        let author = author.to_string();

        Ok(self
            .run("apply review transition", move |conn| {
                let tx = conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .map_err(|e| RepositoryError::storage("begin transition", e.to_string()))?;

                let current = load_review_state(&tx, &pr)?;
                let result = transition(current, &pr, command, &author, now);

                tx.execute(
                    "INSERT INTO pr_review_states
                         (repo_full_name, pr_number, status, last_command_author, last_transition_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(repo_full_name, pr_number) DO UPDATE SET
                         status = excluded.status,
                         last_command_author = excluded.last_command_author,
                         last_transition_at = excluded.last_transition_at",
                    params![
                        pr.repo_full_name,
                        pr.pr_number as i64,
                        result.state.status.as_str(),
                        result.state.last_command_author,
                        result.state.last_transition_at.to_rfc3339()
                    ],
                )
                .map_err(|e| RepositoryError::storage("write transition", e.to_string()))?;

                tx.commit()
                    .map_err(|e| RepositoryError::storage("commit transition", e.to_string()))?;
                Ok(result)
            })
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sample_packet, sample_plan};
    use opsrunbook_core::{ActionReason, ReasonCode, ReviewDecision};

    fn ticket_key(run_id: &str) -> (LedgerKey, ActionResult) {
        let plan = sample_plan(false);
        let action = &plan.actions[0];
        let key = LedgerKey::new("inc-7", run_id, action.action_id().clone());
        let result = ActionResult::success(
            action,
            [("issue_key".to_string(), "OPS-1".to_string())].into(),
            Utc::now(),
        );
        (key, result)
    }

    #[tokio::test]
    async fn test_ledger_get_returns_none_for_missing() {
        let repo = SqliteRepository::new_in_memory().unwrap();
        let (key, _) = ticket_key("run-1");
        assert!(repo.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_if_absent_keeps_first_result() {
        let repo = SqliteRepository::new_in_memory().unwrap();
        let (key, first) = ticket_key("run-1");
        let mut second = first.clone();
        second.external_refs.insert("issue_key".to_string(), "OPS-2".to_string());

        let outcome = repo.put_if_absent(&key, first.clone()).await.unwrap();
        assert!(outcome.accepted);
        let outcome = repo.put_if_absent(&key, second).await.unwrap();
        assert!(!outcome.accepted);
        assert_eq!(outcome.winning, first);
        assert_eq!(repo.get(&key).await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn test_concurrent_put_if_absent_has_one_winner() {
        let repo = Arc::new(SqliteRepository::new_in_memory().unwrap());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let repo = repo.clone();
                tokio::spawn(async move {
                    let (key, mut result) = ticket_key("run-1");
                    result
                        .external_refs
                        .insert("issue_key".to_string(), format!("OPS-{}", i));
                    repo.put_if_absent(&key, result).await.unwrap()
                })
            })
            .collect();

        let mut outcomes = Vec::new();
        for handle in handles {
            outcomes.push(handle.await.unwrap());
        }
        assert_eq!(outcomes.iter().filter(|o| o.accepted).count(), 1);
        let winner = &outcomes.iter().find(|o| o.accepted).unwrap().winning;
        assert!(outcomes.iter().all(|o| &o.winning == winner));
    }

    #[tokio::test]
    async fn test_attempts_are_ordered_and_results_scoped_to_run() {
        let repo = SqliteRepository::new_in_memory().unwrap();
        let (key, success) = ticket_key("run-1");
        let plan = sample_plan(false);
        let failed = ActionResult::failed(
            &plan.actions[0],
            ActionReason::new(ReasonCode::Timeout, "timed out"),
            Utc::now(),
        );

        repo.record_attempt(&key, &failed).await.unwrap();
        repo.record_attempt(&key, &success).await.unwrap();
        assert_eq!(repo.attempts(&key).await.unwrap(), vec![failed, success.clone()]);

        repo.put_if_absent(&key, success).await.unwrap();
        let (other, other_result) = ticket_key("run-2");
        repo.put_if_absent(&other, other_result).await.unwrap();
        assert_eq!(repo.results_for_run("inc-7", "run-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_first_plan_wins() {
        let repo = SqliteRepository::new_in_memory().unwrap();
        let first = sample_plan(false);
        let second = sample_plan(true);
        assert_ne!(first.fingerprint, second.fingerprint);

        assert_eq!(repo.put_plan_if_absent(&first).await.unwrap(), (true, first.clone()));
        assert_eq!(repo.put_plan_if_absent(&second).await.unwrap(), (false, first.clone()));
        assert_eq!(repo.get_plan("inc-7", "run-1").await.unwrap(), Some(first));
        assert_eq!(repo.get_plan("inc-7", "run-2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_packet_conflict_detected() {
        let repo = SqliteRepository::new_in_memory().unwrap();
        let packet = sample_packet();
        repo.put_packet(&packet).await.unwrap();
        repo.put_packet(&packet).await.unwrap();

        let mut changed = packet.clone();
        changed.limits.push("logs truncated".to_string());
        assert!(matches!(
            repo.put_packet(&changed).await,
            Err(StoreError::Conflict(_))
        ));
        assert_eq!(repo.get_packet("inc-7", "run-1").await.unwrap(), Some(packet));
    }

    fn delivery(id: &str) -> DeliveryRecord {
        DeliveryRecord {
            delivery_id: id.to_string(),
            event_type: "issue_comment".to_string(),
            signature: "sha256=abc".to_string(),
            payload: "{}".to_string(),
            received_at: Utc::now(),
            outcome: None,
            sender_login: None,
            command: None,
        }
    }

    #[tokio::test]
    async fn test_delivery_claimed_once_and_outcome_recorded() {
        let repo = SqliteRepository::new_in_memory().unwrap();
        assert_eq!(repo.try_claim(&delivery("d-1")).await.unwrap(), DeliveryClaim::Claimed);
        assert_eq!(
            repo.try_claim(&delivery("d-1")).await.unwrap(),
            DeliveryClaim::AlreadyRecorded
        );

        repo.record_outcome("d-1", "accepted", Some("alice"), Some(ReviewCommand::Stop))
            .await
            .unwrap();
        let stored = repo.get_delivery("d-1").await.unwrap().unwrap();
        assert_eq!(stored.outcome.as_deref(), Some("accepted"));
        assert_eq!(stored.sender_login.as_deref(), Some("alice"));
        assert_eq!(stored.command, Some(ReviewCommand::Stop));

        assert!(repo.record_outcome("d-404", "accepted", None, None).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_delivery_can_be_claimed_once_more() {
        let repo = SqliteRepository::new_in_memory().unwrap();
        assert_eq!(repo.try_claim(&delivery("d-1")).await.unwrap(), DeliveryClaim::Claimed);
        repo.record_outcome("d-1", FAILED_OUTCOME, Some("alice"), Some(ReviewCommand::Stop))
            .await
            .unwrap();

        let mut retry = delivery("d-1");
        retry.signature = "sha256=def".to_string();
        assert_eq!(repo.try_claim(&retry).await.unwrap(), DeliveryClaim::Claimed);
        let stored = repo.get_delivery("d-1").await.unwrap().unwrap();
        assert_eq!(stored.signature, "sha256=def");
        assert_eq!(stored.outcome, None);
        assert_eq!(stored.command, None);

        assert_eq!(
            repo.try_claim(&delivery("d-1")).await.unwrap(),
            DeliveryClaim::AlreadyRecorded
        );
    }

    #[tokio::test]
    async fn test_review_transitions_persist() {
        let repo = SqliteRepository::new_in_memory().unwrap();
        let pr = PullRequestId::new("acme/orders", 7);
        assert!(repo.get_state(&pr).await.unwrap().is_none());

        let t = repo.apply(&pr, Some(ReviewCommand::Stop), "alice", Utc::now()).await.unwrap();
        assert_eq!(t.decision, ReviewDecision::Paused { changed: true });
        let t = repo.apply(&pr, None, "bob", Utc::now()).await.unwrap();
        assert_eq!(t.decision, ReviewDecision::Suppressed);

        let state = repo.get_state(&pr).await.unwrap().unwrap();
        assert_eq!(state.status, ReviewStatus::Paused);
        assert_eq!(state.last_command_author.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("opsrunbook.db");

        {
            let repo = SqliteRepository::new(&path).unwrap();
            repo.put_plan_if_absent(&sample_plan(false)).await.unwrap();
            repo.try_claim(&delivery("d-1")).await.unwrap();
        }

        let repo = SqliteRepository::new(&path).unwrap();
        assert!(repo.get_plan("inc-7", "run-1").await.unwrap().is_some());
        assert_eq!(
            repo.try_claim(&delivery("d-1")).await.unwrap(),
            DeliveryClaim::AlreadyRecorded
        );
    }

    #[test]
    fn test_newer_schema_is_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        let err = SqliteRepository::run_migrations(&conn, CURRENT_SCHEMA_VERSION + 1).unwrap_err();
        assert!(err.to_string().contains("newer than supported"));
    }
}
