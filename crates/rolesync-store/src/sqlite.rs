//! SQLite implementation of the Store trait.
//!
//! This is the primary storage backend. It uses rusqlite with bundled
//! SQLite, wrapped in async via tokio::spawn_blocking.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use rolesync_core::{
    ActionId, Decode, DeliveryState, Encode, FailedAction, InternalAction, PendingAction,
    ServiceKey, Time,
};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::Store;

/// SQLite-based store implementation.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|e| {
                StoreError::Database(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_LOCKED),
                    Some(format!("mutex poisoned: {}", e)),
                ))
            })?;
            f(&mut conn)
        })
        .await
        .map_err(|e| {
            StoreError::Database(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
                Some(format!("spawn_blocking failed: {}", e)),
            ))
        })?
    }
}

fn blob_column(idx: usize, err: rolesync_core::CoreError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Blob, Box::new(err))
}

fn row_to_pending(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingAction> {
    let id: i64 = row.get("action_id")?;
    let state: String = row.get("state")?;
    let blob: Vec<u8> = row.get("action")?;
    let action = InternalAction::from_bytes(&blob).map_err(|e| blob_column(6, e))?;
    let state = DeliveryState::parse(&state).ok_or_else(|| {
        rusqlite::Error::InvalidColumnType(3, "state".into(), rusqlite::types::Type::Text)
    })?;
    Ok(PendingAction {
        id: ActionId(id as u64),
        action,
        enqueued_at: Time(row.get("enqueued_at")?),
        state,
        attempts: row.get("attempts")?,
    })
}

fn row_to_failure(row: &rusqlite::Row<'_>) -> rusqlite::Result<FailedAction> {
    let id: i64 = row.get("action_id")?;
    let blob: Vec<u8> = row.get("action")?;
    let action = InternalAction::from_bytes(&blob).map_err(|e| blob_column(3, e))?;
    Ok(FailedAction {
        id: ActionId(id as u64),
        action,
        failed_at: Time(row.get("failed_at")?),
        reason: row.get("reason")?,
    })
}

const PENDING_COLUMNS: &str =
    "action_id, role_id, service, state, attempts, enqueued_at, action";

#[async_trait]
impl Store for SqliteStore {
    async fn persist_action(&self, pending: &PendingAction) -> Result<()> {
        let pending = pending.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO pending_actions (
                    action_id, role_id, service, state, attempts, enqueued_at, action
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    pending.id.0 as i64,
                    pending.action.role.0 as i64,
                    pending.action.service.as_str(),
                    pending.state.as_str(),
                    pending.attempts,
                    pending.enqueued_at.millis(),
                    pending.action.to_bytes().as_ref(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn set_delivery_state(
        &self,
        id: ActionId,
        state: DeliveryState,
        attempts: u32,
    ) -> Result<()> {
        self.blocking(move |conn| {
            let updated = conn.execute(
                "UPDATE pending_actions SET state = ?1, attempts = ?2 WHERE action_id = ?3",
                params![state.as_str(), attempts, id.0 as i64],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(id.to_string()));
            }
            Ok(())
        })
        .await
    }

    async fn remove_action(&self, id: ActionId) -> Result<()> {
        self.blocking(move |conn| {
            conn.execute(
                "DELETE FROM pending_actions WHERE action_id = ?1",
                params![id.0 as i64],
            )?;
            Ok(())
        })
        .await
    }

    async fn load_pending(&self, key: &ServiceKey) -> Result<Vec<PendingAction>> {
        let key = key.clone();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {PENDING_COLUMNS} FROM pending_actions
                 WHERE role_id = ?1 AND service = ?2 ORDER BY action_id"
            ))?;
            let rows = stmt.query_map(
                params![key.role.0 as i64, key.service.as_str()],
                row_to_pending,
            )?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn load_all_pending(&self) -> Result<Vec<PendingAction>> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {PENDING_COLUMNS} FROM pending_actions ORDER BY action_id"
            ))?;
            let rows = stmt.query_map([], row_to_pending)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn max_action_id(&self) -> Result<Option<ActionId>> {
        self.blocking(|conn| {
            let max: Option<i64> = conn.query_row(
                "SELECT MAX(id) FROM (
                    SELECT MAX(action_id) AS id FROM pending_actions
                    UNION ALL
                    SELECT MAX(action_id) AS id FROM failed_actions
                 )",
                [],
                |row| row.get(0),
            )?;
            Ok(max.map(|id| ActionId(id as u64)))
        })
        .await
    }

    async fn save_audit_cursor(&self, key: &ServiceKey, time: Time) -> Result<()> {
        let key = key.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO audit_cursors (role_id, service, last_time, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (role_id, service)
                 DO UPDATE SET last_time = excluded.last_time, updated_at = excluded.updated_at",
                params![
                    key.role.0 as i64,
                    key.service.as_str(),
                    time.millis(),
                    Time::now().millis(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn load_audit_cursor(&self, key: &ServiceKey) -> Result<Time> {
        let key = key.clone();
        self.blocking(move |conn| {
            let last: Option<i64> = conn
                .query_row(
                    "SELECT last_time FROM audit_cursors WHERE role_id = ?1 AND service = ?2",
                    params![key.role.0 as i64, key.service.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(last.map(Time).unwrap_or(Time::ZERO))
        })
        .await
    }

    async fn record_failure(&self, failed: &FailedAction) -> Result<()> {
        let failed = failed.clone();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM pending_actions WHERE action_id = ?1",
                params![failed.id.0 as i64],
            )?;
            tx.execute(
                "INSERT OR REPLACE INTO failed_actions (
                    action_id, role_id, service, action, reason, failed_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    failed.id.0 as i64,
                    failed.action.role.0 as i64,
                    failed.action.service.as_str(),
                    failed.action.to_bytes().as_ref(),
                    failed.reason,
                    failed.failed_at.millis(),
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn load_failures(&self) -> Result<Vec<FailedAction>> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare(
                "SELECT action_id, role_id, service, action, reason, failed_at
                 FROM failed_actions ORDER BY action_id",
            )?;
            let rows = stmt.query_map([], row_to_failure)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rolesync_core::{ContentBlock, Effect, Identifier, RoleId, TypeIdentifier};

    fn pending(id: u64) -> PendingAction {
        let action = InternalAction::new(
            RoleId(2),
            Identifier::new("bob@host.test").unwrap(),
            TypeIdentifier::from_static("contacts@test"),
            ContentBlock::new(TypeIdentifier::from_static("add@test"), vec![id as u8; 3]),
            Effect::HostAssigned,
        );
        PendingAction::new(ActionId(id), action, Time(1000 + id as i64))
    }

    #[tokio::test]
    async fn test_persist_and_load() {
        let store = SqliteStore::open_memory().unwrap();
        store.persist_action(&pending(2)).await.unwrap();
        store.persist_action(&pending(1)).await.unwrap();

        let loaded = store.load_pending(&pending(1).key()).await.unwrap();
        assert_eq!(loaded, vec![pending(1), pending(2)]);
    }

    #[tokio::test]
    async fn test_state_update_and_remove() {
        let store = SqliteStore::open_memory().unwrap();
        store.persist_action(&pending(1)).await.unwrap();
        store
            .set_delivery_state(ActionId(1), DeliveryState::InFlight, 2)
            .await
            .unwrap();

        let loaded = store.load_all_pending().await.unwrap();
        assert_eq!(loaded[0].state, DeliveryState::InFlight);
        assert_eq!(loaded[0].attempts, 2);

        store.remove_action(ActionId(1)).await.unwrap();
        assert!(store.load_all_pending().await.unwrap().is_empty());
        assert!(matches!(
            store
                .set_delivery_state(ActionId(1), DeliveryState::Queued, 0)
                .await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_audit_cursor_upsert() {
        let store = SqliteStore::open_memory().unwrap();
        let key = pending(1).key();
        assert_eq!(store.load_audit_cursor(&key).await.unwrap(), Time::ZERO);
        store.save_audit_cursor(&key, Time(10)).await.unwrap();
        store.save_audit_cursor(&key, Time(20)).await.unwrap();
        assert_eq!(store.load_audit_cursor(&key).await.unwrap(), Time(20));
    }

    #[tokio::test]
    async fn test_failure_is_atomic_and_keeps_max_id() {
        let store = SqliteStore::open_memory().unwrap();
        let p = pending(5);
        store.persist_action(&p).await.unwrap();
        store
            .record_failure(&FailedAction {
                id: p.id,
                action: p.action.clone(),
                failed_at: Time(9),
                reason: "conflict".into(),
            })
            .await
            .unwrap();

        assert!(store.load_all_pending().await.unwrap().is_empty());
        let failures = store.load_failures().await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].reason, "conflict");
        assert_eq!(store.max_action_id().await.unwrap(), Some(ActionId(5)));
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.persist_action(&pending(1)).await.unwrap();
            store.save_audit_cursor(&pending(1).key(), Time(33)).await.unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.load_all_pending().await.unwrap(), vec![pending(1)]);
        assert_eq!(
            store.load_audit_cursor(&pending(1).key()).await.unwrap(),
            Time(33)
        );
    }
}
