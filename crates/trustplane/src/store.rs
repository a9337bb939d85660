//! Persistent store client: bounded connection pool, per-operation timeouts,
//! isolation-level transactions and serialization-failure signalling.
//!
//! Concurrency control is delegated to the store itself (row locks,
//! `ON CONFLICT`); the client's job is to hand out connections with the
//! right timeout, run transactions that commit on `Ok` and roll back on
//! `Err`, and keep serialization conflicts distinguishable so
//! [`with_retry`] can re-run the body.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use rusqlite::{Connection, OpenFlags, Transaction, TransactionBehavior};

use crate::error::{CoreError, StoreError};

/// Pool and timeout settings.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database path or URI.
    pub path: String,
    /// Connections kept open even when idle.
    pub pool_min: usize,
    /// Hard cap on concurrent connections.
    pub pool_max: usize,
    /// Idle connections above `pool_min` are closed after this long.
    pub idle_timeout: Duration,
    /// Connections are recycled after this long regardless of use.
    pub max_lifetime: Duration,
    /// How long a caller waits for a free connection before failing.
    pub checkout_timeout: Duration,
    /// Statement timeout applied when an operation does not override it.
    pub default_timeout: Duration,
    /// Statement timeout for payment transactions. Fail fast.
    pub payment_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "./trustplane.db".to_string(),
            pool_min: 5,
            pool_max: 20,
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(3600),
            checkout_timeout: Duration::from_secs(5),
            default_timeout: Duration::from_secs(30),
            payment_timeout: Duration::from_secs(10),
        }
    }
}

impl StoreConfig {
    pub fn at(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }
}

/// Transaction isolation levels, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    /// Payments and money movement. Conflicts surface as
    /// [`StoreError::Serialization`] and are retriable.
    Serializable,
    /// Multi-row reads that must be mutually consistent.
    RepeatableRead,
    /// Default. Sufficient for append-only writes such as audit entries.
    ReadCommitted,
}

impl IsolationLevel {
    fn behavior(self) -> TransactionBehavior {
        match self {
            IsolationLevel::Serializable => TransactionBehavior::Exclusive,
            IsolationLevel::RepeatableRead => TransactionBehavior::Immediate,
            IsolationLevel::ReadCommitted => TransactionBehavior::Deferred,
        }
    }
}

/// Options for [`Store::transaction`].
#[derive(Debug, Clone, Copy)]
pub struct TxOptions {
    pub isolation: IsolationLevel,
    /// Statement timeout override; the config default applies when `None`.
    pub timeout: Option<Duration>,
    pub readonly: bool,
}

impl TxOptions {
    pub fn read_committed() -> Self {
        Self {
            isolation: IsolationLevel::ReadCommitted,
            timeout: None,
            readonly: false,
        }
    }

    pub fn repeatable_read() -> Self {
        Self {
            isolation: IsolationLevel::RepeatableRead,
            ..Self::read_committed()
        }
    }

    pub fn serializable() -> Self {
        Self {
            isolation: IsolationLevel::Serializable,
            ..Self::read_committed()
        }
    }

    /// Serializable with the short payment timeout.
    pub fn payment(cfg: &StoreConfig) -> Self {
        Self {
            isolation: IsolationLevel::Serializable,
            timeout: Some(cfg.payment_timeout),
            readonly: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn readonly(mut self) -> Self {
        self.readonly = true;
        self
    }
}

struct IdleConn {
    conn: Connection,
    created_at: Instant,
    idle_since: Instant,
}

struct PoolState {
    idle: Vec<IdleConn>,
    open: usize,
}

struct PoolInner {
    cfg: StoreConfig,
    state: Mutex<PoolState>,
    available: Condvar,
}

/// Scoped connection checked out of the pool. Returned on drop.
pub struct ConnHandle {
    pool: Arc<PoolInner>,
    conn: Option<Connection>,
    created_at: Instant,
}

impl ConnHandle {
    pub fn conn(&self) -> &Connection {
        self.conn.as_ref().expect("connection present until drop")
    }

    fn conn_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl Drop for ConnHandle {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if let Ok(mut state) = self.pool.state.lock() {
            if self.created_at.elapsed() < self.pool.cfg.max_lifetime {
                state.idle.push(IdleConn {
                    conn,
                    created_at: self.created_at,
                    idle_since: Instant::now(),
                });
            } else {
                state.open = state.open.saturating_sub(1);
            }
            self.pool.available.notify_one();
        }
    }
}

/// Store health snapshot for the `/health` endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StoreHealth {
    pub is_healthy: bool,
    pub latency_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS teams (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    deleted_at INTEGER
);

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    token_hash TEXT NOT NULL UNIQUE,
    team_id TEXT,
    ip_address TEXT,
    user_agent TEXT,
    created_at INTEGER NOT NULL,
    last_used_at INTEGER NOT NULL,
    revoked_at INTEGER,
    revocation_reason TEXT
);
CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);
CREATE INDEX IF NOT EXISTS idx_sessions_team ON sessions(team_id);

CREATE TABLE IF NOT EXISTS team_memberships (
    id TEXT PRIMARY KEY,
    team_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    role TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    invited_by TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE (team_id, user_id)
);
CREATE INDEX IF NOT EXISTS idx_memberships_user ON team_memberships(user_id);

CREATE TABLE IF NOT EXISTS audit_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type TEXT NOT NULL,
    actor_id TEXT,
    actor_type TEXT NOT NULL,
    resource_type TEXT,
    resource_id TEXT,
    action TEXT NOT NULL,
    details TEXT,
    ip_address TEXT,
    user_agent TEXT,
    request_id TEXT,
    created_at INTEGER NOT NULL,
    hmac_signature TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_event ON audit_logs(event_type);
CREATE INDEX IF NOT EXISTS idx_audit_resource ON audit_logs(resource_type, resource_id);
CREATE INDEX IF NOT EXISTS idx_audit_created ON audit_logs(created_at);

CREATE TABLE IF NOT EXISTS idempotency_keys (
    id TEXT PRIMARY KEY,
    key TEXT NOT NULL,
    user_id TEXT NOT NULL,
    request_hash TEXT NOT NULL,
    status TEXT NOT NULL,
    response TEXT,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    locked_at INTEGER,
    UNIQUE (user_id, key)
);
CREATE INDEX IF NOT EXISTS idx_idempotency_expires ON idempotency_keys(expires_at);

CREATE TABLE IF NOT EXISTS payments (
    id TEXT PRIMARY KEY,
    team_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    amount_cents INTEGER NOT NULL,
    currency TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    external_intent_id TEXT,
    external_charge_id TEXT,
    idempotency_key TEXT NOT NULL UNIQUE,
    error_code TEXT,
    error_message TEXT,
    created_at INTEGER NOT NULL,
    completed_at INTEGER,
    failed_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_payments_team ON payments(team_id);

CREATE TABLE IF NOT EXISTS processed_webhooks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    webhook_id TEXT NOT NULL,
    provider TEXT NOT NULL,
    event_type TEXT,
    payload TEXT NOT NULL,
    status TEXT NOT NULL,
    signature_valid INTEGER NOT NULL,
    received_at INTEGER NOT NULL,
    UNIQUE (webhook_id, provider)
);

CREATE TABLE IF NOT EXISTS account_lockouts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT,
    ip_address TEXT,
    failed_attempts INTEGER NOT NULL DEFAULT 0,
    last_attempt_at INTEGER NOT NULL,
    locked_until INTEGER
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_lockouts_user
    ON account_lockouts(user_id) WHERE user_id IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS idx_lockouts_ip
    ON account_lockouts(ip_address) WHERE ip_address IS NOT NULL AND user_id IS NULL;
"#;

/// Bounded connection pool over the persistent store.
#[derive(Clone)]
pub struct Store {
    pool: Arc<PoolInner>,
}

impl Store {
    /// Open the store, warm the minimum pool and initialize the schema.
    pub fn open(cfg: StoreConfig) -> Result<Self, StoreError> {
        let store = Self {
            pool: Arc::new(PoolInner {
                cfg,
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    open: 0,
                }),
                available: Condvar::new(),
            }),
        };

        let mut warmed = Vec::new();
        for _ in 0..store.pool.cfg.pool_min.max(1) {
            warmed.push(store.open_conn()?);
        }
        warmed[0].execute_batch(SCHEMA)?;

        let mut state = store.lock_state()?;
        state.open = warmed.len();
        let now = Instant::now();
        state.idle.extend(warmed.into_iter().map(|conn| IdleConn {
            conn,
            created_at: now,
            idle_since: now,
        }));
        drop(state);

        tracing::info!(
            min = store.pool.cfg.pool_min,
            max = store.pool.cfg.pool_max,
            "store connection pool initialized"
        );
        Ok(store)
    }

    /// Open an isolated in-memory store. Each call gets a fresh database
    /// shared across the pool's connections.
    pub fn in_memory() -> Result<Self, StoreError> {
        let name = uuid::Uuid::new_v4().simple().to_string();
        Self::open(StoreConfig::at(format!(
            "file:trustplane-{name}?mode=memory&cache=shared"
        )))
    }

    fn open_conn(&self) -> Result<Connection, StoreError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&self.pool.cfg.path, flags)
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Ok(conn)
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, PoolState>, StoreError> {
        self.pool
            .state
            .lock()
            .map_err(|_| StoreError::Connection("pool lock poisoned".to_string()))
    }

    /// Check out a connection with the given statement timeout.
    fn checkout(&self, timeout: Duration, readonly: bool) -> Result<ConnHandle, StoreError> {
        let deadline = Instant::now() + self.pool.cfg.checkout_timeout;
        let mut state = self.lock_state()?;

        loop {
            self.evict_stale(&mut state);

            if let Some(idle) = state.idle.pop() {
                drop(state);
                return self.prepare(idle, timeout, readonly).map_err(|e| {
                    self.release_slot();
                    e
                });
            }

            if state.open < self.pool.cfg.pool_max {
                state.open += 1;
                drop(state);
                return self
                    .open_conn()
                    .and_then(|conn| {
                        self.prepare(
                            IdleConn {
                                conn,
                                created_at: Instant::now(),
                                idle_since: Instant::now(),
                            },
                            timeout,
                            readonly,
                        )
                    })
                    .map_err(|e| {
                        self.release_slot();
                        e
                    });
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(StoreError::Connection(
                    "connection pool checkout timed out".to_string(),
                ));
            }
            let (guard, _) = self
                .pool
                .available
                .wait_timeout(state, deadline - now)
                .map_err(|_| StoreError::Connection("pool lock poisoned".to_string()))?;
            state = guard;
        }
    }

    /// A checked-out slot failed to produce a usable connection.
    fn release_slot(&self) {
        if let Ok(mut state) = self.pool.state.lock() {
            state.open = state.open.saturating_sub(1);
            self.pool.available.notify_one();
        }
    }

    /// Close idle connections past their idle timeout or lifetime, keeping
    /// the pool at its configured minimum.
    fn evict_stale(&self, state: &mut PoolState) {
        let cfg = &self.pool.cfg;
        while state.open > cfg.pool_min {
            let Some(pos) = state.idle.iter().position(|c| {
                c.idle_since.elapsed() >= cfg.idle_timeout
                    || c.created_at.elapsed() >= cfg.max_lifetime
            }) else {
                break;
            };
            state.idle.remove(pos);
            state.open -= 1;
        }
    }

    fn prepare(
        &self,
        idle: IdleConn,
        timeout: Duration,
        readonly: bool,
    ) -> Result<ConnHandle, StoreError> {
        idle.conn.busy_timeout(timeout)?;
        idle.conn.execute_batch(if readonly {
            "PRAGMA query_only=ON;"
        } else {
            "PRAGMA query_only=OFF;"
        })?;
        Ok(ConnHandle {
            pool: Arc::clone(&self.pool),
            conn: Some(idle.conn),
            created_at: idle.created_at,
        })
    }

    /// Run `f` against a pooled connection outside a transaction. Each
    /// statement auto-commits.
    pub fn with_conn<T>(
        &self,
        timeout: Option<Duration>,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let timeout = timeout.unwrap_or(self.pool.cfg.default_timeout);
        let handle = self.checkout(timeout, false)?;
        f(handle.conn())
    }

    /// Run `f` inside a transaction: commit on `Ok`, roll back on `Err`.
    pub fn transaction<T>(
        &self,
        opts: TxOptions,
        f: impl FnOnce(&Transaction) -> Result<T, CoreError>,
    ) -> Result<T, CoreError> {
        let timeout = opts.timeout.unwrap_or(self.pool.cfg.default_timeout);
        let mut handle = self.checkout(timeout, opts.readonly)?;

        // A readonly transaction never takes a write lock regardless of the
        // requested isolation.
        let behavior = if opts.readonly {
            TransactionBehavior::Deferred
        } else {
            opts.isolation.behavior()
        };

        let tx = handle
            .conn_mut()
            .transaction_with_behavior(behavior)
            .map_err(StoreError::from)?;

        match f(&tx) {
            Ok(value) => {
                tx.commit().map_err(StoreError::from)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback() {
                    tracing::warn!(error = %rollback_err, "transaction rollback failed");
                }
                Err(e)
            }
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.pool.cfg.default_timeout
    }

    pub fn config(&self) -> &StoreConfig {
        &self.pool.cfg
    }

    /// Connectivity probe for health reporting.
    pub fn health_check(&self) -> StoreHealth {
        let start = Instant::now();
        let result = self.with_conn(Some(Duration::from_secs(5)), |conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map_err(StoreError::from)
        });
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        match result {
            Ok(_) => StoreHealth {
                is_healthy: true,
                latency_ms,
                error: None,
            },
            Err(e) => StoreHealth {
                is_healthy: false,
                latency_ms,
                error: Some(e.to_string()),
            },
        }
    }
}

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Re-run `f` on serialization conflicts with exponential backoff.
///
/// Conflicts are expected under strict isolation; they mean the store
/// prevented an anomaly, not that the operation is wrong. Other errors are
/// not retried. Exhaustion yields [`CoreError::MaxRetriesExceeded`].
pub fn with_retry<T>(f: impl FnMut() -> Result<T, CoreError>) -> Result<T, CoreError> {
    with_retry_config(f, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY)
}

pub fn with_retry_config<T>(
    mut f: impl FnMut() -> Result<T, CoreError>,
    max_retries: u32,
    initial_delay: Duration,
) -> Result<T, CoreError> {
    let mut delay = initial_delay;
    for attempt in 0..=max_retries {
        match f() {
            Err(CoreError::Store(StoreError::Serialization)) if attempt < max_retries => {
                tracing::info!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "serialization conflict, retrying"
                );
                std::thread::sleep(delay);
                delay *= 2;
            }
            Err(CoreError::Store(StoreError::Serialization)) => {
                tracing::warn!(
                    attempts = max_retries + 1,
                    "max retries exceeded for serialization conflict"
                );
                return Err(CoreError::MaxRetriesExceeded {
                    attempts: max_retries + 1,
                });
            }
            other => return other,
        }
    }
    Err(CoreError::MaxRetriesExceeded {
        attempts: max_retries + 1,
    })
}

/// Run `f` inside a savepoint for bounded partial rollback within an open
/// transaction. The savepoint is released on `Ok` and rolled back on `Err`
/// without aborting the enclosing transaction.
pub fn with_savepoint<T>(
    tx: &Transaction,
    name: &str,
    f: impl FnOnce() -> Result<T, CoreError>,
) -> Result<T, CoreError> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(CoreError::Validation(format!(
            "invalid savepoint name: {name}"
        )));
    }

    tx.execute_batch(&format!("SAVEPOINT {name}"))
        .map_err(StoreError::from)?;
    match f() {
        Ok(value) => {
            tx.execute_batch(&format!("RELEASE SAVEPOINT {name}"))
                .map_err(StoreError::from)?;
            Ok(value)
        }
        Err(e) => {
            if let Err(sp_err) = tx.execute_batch(&format!(
                "ROLLBACK TO SAVEPOINT {name}; RELEASE SAVEPOINT {name}"
            )) {
                tracing::warn!(error = %sp_err, savepoint = name, "savepoint rollback failed");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::params;

    #[test]
    fn test_open_initializes_schema() {
        let store = Store::in_memory().unwrap();
        let count: i64 = store
            .with_conn(None, |conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'sessions'",
                    [],
                    |row| row.get(0),
                )
                .map_err(StoreError::from)
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_transaction_commits_on_ok() {
        let store = Store::in_memory().unwrap();
        store
            .transaction(TxOptions::read_committed(), |tx| {
                tx.execute(
                    "INSERT INTO teams (id, name, created_at) VALUES (?1, ?2, ?3)",
                    params!["t-1", "alpha", 1000],
                )
                .map_err(StoreError::from)?;
                Ok(())
            })
            .unwrap();

        let count: i64 = store
            .with_conn(None, |conn| {
                conn.query_row("SELECT COUNT(*) FROM teams", [], |row| row.get(0))
                    .map_err(StoreError::from)
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_transaction_rolls_back_on_err() {
        let store = Store::in_memory().unwrap();
        let result: Result<(), CoreError> =
            store.transaction(TxOptions::serializable(), |tx| {
                tx.execute(
                    "INSERT INTO teams (id, name, created_at) VALUES (?1, ?2, ?3)",
                    params!["t-1", "alpha", 1000],
                )
                .map_err(StoreError::from)?;
                Err(CoreError::Validation("abort".to_string()))
            });
        assert!(result.is_err());

        let count: i64 = store
            .with_conn(None, |conn| {
                conn.query_row("SELECT COUNT(*) FROM teams", [], |row| row.get(0))
                    .map_err(StoreError::from)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_readonly_transaction_rejects_writes() {
        let store = Store::in_memory().unwrap();
        let result = store.transaction(TxOptions::read_committed().readonly(), |tx| {
            tx.execute(
                "INSERT INTO teams (id, name, created_at) VALUES ('t', 'n', 0)",
                [],
            )
            .map_err(StoreError::from)?;
            Ok(())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_with_retry_retries_serialization() {
        let mut attempts = 0;
        let result = with_retry_config(
            || {
                attempts += 1;
                if attempts < 3 {
                    Err(CoreError::Store(StoreError::Serialization))
                } else {
                    Ok(attempts)
                }
            },
            3,
            Duration::from_millis(1),
        );
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn test_with_retry_exhaustion() {
        let result: Result<(), CoreError> = with_retry_config(
            || Err(CoreError::Store(StoreError::Serialization)),
            2,
            Duration::from_millis(1),
        );
        assert!(matches!(
            result,
            Err(CoreError::MaxRetriesExceeded { attempts: 3 })
        ));
    }

    #[test]
    fn test_with_retry_does_not_retry_other_errors() {
        let mut attempts = 0;
        let result: Result<(), CoreError> = with_retry_config(
            || {
                attempts += 1;
                Err(CoreError::Validation("bad".to_string()))
            },
            3,
            Duration::from_millis(1),
        );
        assert!(matches!(result, Err(CoreError::Validation(_))));
        assert_eq!(attempts, 1);
    }

    #[test]
    fn test_savepoint_partial_rollback() {
        let store = Store::in_memory().unwrap();
        store
            .transaction(TxOptions::read_committed(), |tx| {
                tx.execute(
                    "INSERT INTO teams (id, name, created_at) VALUES ('t-1', 'kept', 0)",
                    [],
                )
                .map_err(StoreError::from)?;

                let inner: Result<(), CoreError> = with_savepoint(tx, "sp_1", || {
                    tx.execute(
                        "INSERT INTO teams (id, name, created_at) VALUES ('t-2', 'dropped', 0)",
                        [],
                    )
                    .map_err(StoreError::from)?;
                    Err(CoreError::Validation("inner abort".to_string()))
                });
                assert!(inner.is_err());
                Ok(())
            })
            .unwrap();

        let names: Vec<String> = store
            .with_conn(None, |conn| {
                let mut stmt = conn.prepare("SELECT id FROM teams ORDER BY id")?;
                let rows = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                Ok(rows)
            })
            .unwrap();
        assert_eq!(names, vec!["t-1".to_string()]);
    }

    #[test]
    fn test_savepoint_rejects_bad_name() {
        let store = Store::in_memory().unwrap();
        let result = store.transaction(TxOptions::read_committed(), |tx| {
            with_savepoint(tx, "bad name; DROP TABLE teams", || Ok(()))
        });
        assert!(matches!(result, Err(CoreError::Validation(_))));
    }

    #[test]
    fn test_on_disk_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");

        {
            let store = Store::open(StoreConfig::at(path.to_str().unwrap())).unwrap();
            store
                .with_conn(None, |conn| {
                    conn.execute(
                        "INSERT INTO teams (id, name, created_at) VALUES ('t-1', 'alpha', 0)",
                        [],
                    )?;
                    Ok(())
                })
                .unwrap();
        }

        // Reopen with a new pool — the row must still be there.
        let store = Store::open(StoreConfig::at(path.to_str().unwrap())).unwrap();
        let count: i64 = store
            .with_conn(None, |conn| {
                conn.query_row("SELECT COUNT(*) FROM teams", [], |row| row.get(0))
                    .map_err(StoreError::from)
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_pool_reuses_connections() {
        let store = Store::in_memory().unwrap();
        for _ in 0..50 {
            store
                .with_conn(None, |conn| {
                    conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                        .map_err(StoreError::from)
                })
                .unwrap();
        }
        // Never exceeds the configured maximum.
        let state = store.pool.state.lock().unwrap();
        assert!(state.open <= store.pool.cfg.pool_max);
    }

    #[test]
    fn test_health_check() {
        let store = Store::in_memory().unwrap();
        let health = store.health_check();
        assert!(health.is_healthy);
        assert!(health.error.is_none());
    }
}
