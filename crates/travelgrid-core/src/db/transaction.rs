//! Explicit transaction boundaries on a shared connection

use crate::error::Result;
use libsql::Connection;

/// Start a write transaction, taking the write lock up front
pub async fn begin(conn: &Connection) -> Result<()> {
    conn.execute("BEGIN IMMEDIATE", ()).await?;
    Ok(())
}

/// Commit when `outcome` is `Ok`, roll back otherwise.
///
/// A failed commit is rolled back and reported in place of `outcome`.
pub async fn finish<T>(conn: &Connection, outcome: Result<T>) -> Result<T> {
    match outcome {
        Ok(value) => {
            if let Err(e) = conn.execute("COMMIT", ()).await {
                conn.execute("ROLLBACK", ()).await.ok();
                return Err(e.into());
            }
            Ok(value)
        }
        Err(e) => {
            conn.execute("ROLLBACK", ()).await.ok();
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::error::Error;

    async fn count(conn: &Connection) -> i64 {
        let mut rows = conn
            .query("SELECT COUNT(*) FROM device_sync", ())
            .await
            .unwrap();
        rows.next().await.unwrap().unwrap().get::<i64>(0).unwrap()
    }

    async fn insert_device(conn: &Connection, device_id: &str) -> Result<()> {
        conn.execute(
            "INSERT INTO device_sync (user_id, device_id, data_type, last_sync_at, sync_status, created_at, updated_at)
             VALUES ('u1', ?1, 'trip', 1, 'synced', 1, 1)",
            [device_id],
        )
        .await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_commit_keeps_writes() {
        let db = Database::open_in_memory().await.unwrap();
        let conn = db.connection();

        begin(conn).await.unwrap();
        let outcome = insert_device(conn, "d1").await;
        finish(conn, outcome).await.unwrap();

        assert_eq!(count(conn).await, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_error_rolls_back_writes() {
        let db = Database::open_in_memory().await.unwrap();
        let conn = db.connection();

        begin(conn).await.unwrap();
        let outcome = async {
            insert_device(conn, "d1").await?;
            Err::<(), _>(Error::Concurrency("lost race".into()))
        }
        .await;
        let err = finish(conn, outcome).await.unwrap_err();

        assert!(matches!(err, Error::Concurrency(_)));
        assert_eq!(count(conn).await, 0);
    }
}
