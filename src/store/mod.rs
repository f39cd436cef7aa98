// # Session store
//
// Thin façade over the relational database. Short transactions from a
// bounded connection pool; the unique partial index on `username` and the
// `claim_pool` compare-and-swap are the only concurrency mechanisms.

use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::info;

use crate::config::DatabaseSettings;
use crate::domain::Session;
use crate::error::{BrokerError, Result};

/// Deadline for checking a connection out of the pool. Exhaustion fails
/// fast with a resource-unavailable error instead of blocking the caller.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

const SESSION_COLUMNS: &str = "session_id, username, gateway_connection_id, vnc_password, \
     workload_id, workload_ip, created_at, started_at, last_activity";

#[derive(Clone)]
pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    /// Open the database and bring the schema up to date. Errors here are
    /// fatal at startup.
    pub async fn connect(settings: &DatabaseSettings) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&settings.url)?
            .create_if_missing(true)
            .busy_timeout(ACQUIRE_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .min_connections(settings.pool_min)
            .max_connections(settings.pool_max)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        info!(
            "session store ready (pool min={} max={})",
            settings.pool_min, settings.pool_max
        );
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| BrokerError::Database(format!("migration failed: {e}")))
    }

    /// Upsert a session.
    ///
    /// Identity columns merge with COALESCE so a partial record never wipes
    /// what another writer established; the volatile workload columns take
    /// the incoming value verbatim so destroyed workloads can be cleared.
    /// `created_at` is written once and survives later saves.
    pub async fn save(&self, session: &Session) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (session_id, username, gateway_connection_id, vnc_password,
                                  workload_id, workload_ip, created_at, started_at,
                                  last_activity, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, COALESCE(?7, strftime('%s', 'now')), ?8, ?9,
                    strftime('%s', 'now'))
            ON CONFLICT (session_id) DO UPDATE SET
                username              = COALESCE(excluded.username, username),
                gateway_connection_id = COALESCE(excluded.gateway_connection_id, gateway_connection_id),
                vnc_password          = COALESCE(excluded.vnc_password, vnc_password),
                workload_id           = excluded.workload_id,
                workload_ip           = excluded.workload_ip,
                started_at            = excluded.started_at,
                last_activity         = excluded.last_activity,
                updated_at            = strftime('%s', 'now')
            "#,
        )
        .bind(&session.session_id)
        .bind(&session.username)
        .bind(&session.gateway_connection_id)
        .bind(&session.vnc_password)
        .bind(&session.workload_id)
        .bind(&session.workload_ip)
        .bind(session.created_at)
        .bind(session.started_at)
        .bind(session.last_activity)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, session_id: &str) -> Result<Option<Session>> {
        let row = sqlx::query_as::<_, Session>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id = ?1"
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_by_username(&self, username: &str) -> Result<Option<Session>> {
        let row = sqlx::query_as::<_, Session>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE username = ?1"
        ))
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_by_connection(&self, connection_id: &str) -> Result<Option<Session>> {
        let row = sqlx::query_as::<_, Session>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE gateway_connection_id = ?1"
        ))
        .bind(connection_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn delete(&self, session_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE session_id = ?1")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<Session>> {
        let rows = sqlx::query_as::<_, Session>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Usernames that already have a session.
    pub async fn provisioned_usernames(&self) -> Result<HashSet<String>> {
        let names: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT username FROM sessions WHERE username IS NOT NULL")
                .fetch_all(&self.pool)
                .await?;
        Ok(names.into_iter().collect())
    }

    /// Unclaimed pool entries, oldest first. No liveness probing here: the
    /// caller reconciles against the orchestrator's own pool listing, and
    /// stale rows are cleaned up by the observer sweep.
    pub async fn list_pool(&self) -> Result<Vec<Session>> {
        let rows = sqlx::query_as::<_, Session>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions \
             WHERE username IS NULL AND workload_id IS NOT NULL \
             ORDER BY created_at ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Claim a pool entry for `username`.
    ///
    /// The update is the linearization point: it succeeds iff the row still
    /// has no owner, so concurrent claimants see exactly one winner. A
    /// `false` return is a lost race, not an error; callers move on to the
    /// next candidate.
    pub async fn claim_pool(&self, session_id: &str, username: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE sessions \
             SET username = ?1, updated_at = strftime('%s', 'now') \
             WHERE session_id = ?2 AND username IS NULL",
        )
        .bind(username)
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::new_session_id;

    async fn test_store() -> (SessionStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let settings = DatabaseSettings {
            url: format!("sqlite://{}?mode=rwc", dir.path().join("test.db").display()),
            pool_min: 1,
            pool_max: 4,
        };
        let store = SessionStore::connect(&settings).await.unwrap();
        (store, dir)
    }

    fn sample(username: Option<&str>) -> Session {
        Session {
            session_id: new_session_id(),
            username: username.map(String::from),
            gateway_connection_id: Some("c-17".into()),
            vnc_password: Some("pw".into()),
            workload_id: Some("w-1".into()),
            workload_ip: Some("172.18.0.9".into()),
            created_at: Some(1000),
            started_at: Some(1001),
            last_activity: None,
        }
    }

    #[tokio::test]
    async fn save_then_get_round_trips() {
        let (store, _dir) = test_store().await;
        let session = sample(Some("alice"));
        store.save(&session).await.unwrap();

        let loaded = store.get(&session.session_id).await.unwrap().unwrap();
        assert_eq!(loaded, session);
        assert_eq!(
            store.get_by_username("alice").await.unwrap().unwrap(),
            session
        );
        assert_eq!(
            store.get_by_connection("c-17").await.unwrap().unwrap(),
            session
        );
    }

    #[tokio::test]
    async fn upsert_merges_identity_and_overwrites_workload() {
        let (store, _dir) = test_store().await;
        let mut session = sample(Some("alice"));
        store.save(&session).await.unwrap();

        // A later save clearing the workload must not lose the identity
        // columns, but must clear workload_id/ip.
        session.username = None;
        session.gateway_connection_id = None;
        session.vnc_password = None;
        session.clear_workload();
        session.last_activity = Some(2000);
        store.save(&session).await.unwrap();

        let loaded = store.get(&session.session_id).await.unwrap().unwrap();
        assert_eq!(loaded.username.as_deref(), Some("alice"));
        assert_eq!(loaded.gateway_connection_id.as_deref(), Some("c-17"));
        assert_eq!(loaded.vnc_password.as_deref(), Some("pw"));
        assert_eq!(loaded.workload_id, None);
        assert_eq!(loaded.workload_ip, None);
        assert_eq!(loaded.created_at, Some(1000));
        assert_eq!(loaded.last_activity, Some(2000));
    }

    #[tokio::test]
    async fn second_session_for_same_user_is_a_conflict() {
        let (store, _dir) = test_store().await;
        store.save(&sample(Some("alice"))).await.unwrap();

        let err = store.save(&sample(Some("alice"))).await.unwrap_err();
        assert!(matches!(err, BrokerError::Conflict(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn claim_pool_has_exactly_one_winner() {
        let (store, _dir) = test_store().await;
        let mut pool_entry = sample(None);
        pool_entry.gateway_connection_id = None;
        store.save(&pool_entry).await.unwrap();

        let sid = pool_entry.session_id.clone();
        let (a, b) = tokio::join!(store.claim_pool(&sid, "alice"), store.claim_pool(&sid, "bob"));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(a ^ b, "exactly one claimant must win (got {a}, {b})");

        let loaded = store.get(&sid).await.unwrap().unwrap();
        let winner = loaded.username.unwrap();
        assert!(winner == "alice" || winner == "bob");
    }

    #[tokio::test]
    async fn claim_pool_for_already_provisioned_user_is_a_conflict() {
        let (store, _dir) = test_store().await;
        store.save(&sample(Some("bob"))).await.unwrap();
        let mut pool_entry = sample(None);
        pool_entry.gateway_connection_id = None;
        store.save(&pool_entry).await.unwrap();

        let err = store
            .claim_pool(&pool_entry.session_id, "bob")
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Conflict(_)));
    }

    #[tokio::test]
    async fn list_pool_is_oldest_first_and_filtered() {
        let (store, _dir) = test_store().await;

        let mut young = sample(None);
        young.gateway_connection_id = None;
        young.created_at = Some(2000);
        let mut old = sample(None);
        old.gateway_connection_id = None;
        old.created_at = Some(1000);
        // A pool row whose workload is gone is not claimable.
        let mut dead = sample(None);
        dead.gateway_connection_id = None;
        dead.workload_id = None;
        dead.workload_ip = None;
        // Claimed sessions never show up in the pool.
        let claimed = sample(Some("alice"));

        for s in [&young, &old, &dead, &claimed] {
            store.save(s).await.unwrap();
        }

        let pool = store.list_pool().await.unwrap();
        let ids: Vec<&str> = pool.iter().map(|s| s.session_id.as_str()).collect();
        assert_eq!(ids, vec![&old.session_id, &young.session_id]);
    }

    #[tokio::test]
    async fn provisioned_usernames_skips_pool_entries() {
        let (store, _dir) = test_store().await;
        store.save(&sample(Some("alice"))).await.unwrap();
        let mut pool_entry = sample(None);
        pool_entry.gateway_connection_id = None;
        store.save(&pool_entry).await.unwrap();

        let users = store.provisioned_usernames().await.unwrap();
        assert_eq!(users, HashSet::from(["alice".to_string()]));
    }

    #[tokio::test]
    async fn delete_removes_the_row() {
        let (store, _dir) = test_store().await;
        let session = sample(Some("alice"));
        store.save(&session).await.unwrap();
        store.delete(&session.session_id).await.unwrap();
        assert!(store.get(&session.session_id).await.unwrap().is_none());
        assert!(store.list().await.unwrap().is_empty());
    }
}
