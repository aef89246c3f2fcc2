//! State Tracker
//!
//! Persistent storage for shard configuration, so term, generation and the
//! participant set survive restarts.

use std::path::PathBuf;

use rusqlite::{params, Connection};
use tokio::sync::Mutex;

use super::registry::ShardView;
use crate::error::{Error, Result};

/// Persistent state tracker backed by SQLite
pub struct StateTracker {
    /// Database connection
    conn: Mutex<Connection>,
    /// Node ID
    node_id: String,
}

impl StateTracker {
    /// Create or open the state tracker database
    pub fn new(data_dir: PathBuf, node_id: String) -> Result<Self> {
        std::fs::create_dir_all(&data_dir)?;

        let db_path = data_dir.join("state.db");
        let conn = Connection::open(&db_path)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS node_state (
                key TEXT PRIMARY KEY,
                value_int INTEGER,
                value_text TEXT,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS shard_state (
                shard TEXT PRIMARY KEY,
                term INTEGER NOT NULL,
                generation INTEGER NOT NULL,
                leader TEXT NOT NULL,
                view TEXT NOT NULL,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            node_id,
        })
    }

    /// Store the current view of a shard. Older generations never overwrite newer ones.
    pub async fn save_shard(&self, view: &ShardView) -> Result<()> {
        let encoded = serde_json::to_string(view)?;
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO shard_state (shard, term, generation, leader, view)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(shard) DO UPDATE SET
                term = ?2,
                generation = ?3,
                leader = ?4,
                view = ?5,
                updated_at = CURRENT_TIMESTAMP
            WHERE generation <= ?3
            "#,
            params![
                view.shard,
                view.term as i64,
                view.generation as i64,
                view.leader.id,
                encoded
            ],
        )?;
        Ok(())
    }

    /// Load all persisted shard views
    pub async fn load_shards(&self) -> Result<Vec<ShardView>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT view FROM shard_state ORDER BY shard")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut views = Vec::new();
        for row in rows {
            views.push(serde_json::from_str(&row?)?);
        }
        Ok(views)
    }

    /// Generation persisted for a shard
    pub async fn shard_generation(&self, shard: &str) -> Result<Option<u64>> {
        let conn = self.conn.lock().await;
        let result: std::result::Result<i64, _> = conn.query_row(
            "SELECT generation FROM shard_state WHERE shard = ?1",
            params![shard],
            |row| row.get(0),
        );

        match result {
            Ok(generation) => Ok(Some(generation as u64)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Error::State(format!("Failed to get generation: {}", e))),
        }
    }

    /// Forget a decommissioned shard
    pub async fn delete_shard(&self, shard: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute("DELETE FROM shard_state WHERE shard = ?1", params![shard])?;
        Ok(deleted > 0)
    }

    /// Record when this node last started
    pub async fn mark_started(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO node_state (key, value_text) VALUES ('last_started', ?1)
            ON CONFLICT(key) DO UPDATE SET value_text = ?1, updated_at = CURRENT_TIMESTAMP
            "#,
            params![chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// When this node last started, if ever
    pub async fn last_started(&self) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        let result: std::result::Result<String, _> = conn.query_row(
            "SELECT value_text FROM node_state WHERE key = 'last_started'",
            [],
            |row| row.get(0),
        );

        match result {
            Ok(started) => Ok(Some(started)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Error::State(format!("Failed to get last start: {}", e))),
        }
    }

    /// Get node ID
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Make every later shard write fail
    #[cfg(test)]
    pub(crate) async fn break_shard_table(&self) {
        let conn = self.conn.lock().await;
        conn.execute_batch("DROP TABLE shard_state").unwrap();
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::State(format!("SQLite error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ReplicationMetrics;
    use crate::state::ParticipantRegistry;
    use std::sync::Arc;
    use tempfile::tempdir;

    async fn view(generation: u64) -> ShardView {
        let registry = ParticipantRegistry::new(Arc::new(ReplicationMetrics::new()));
        let mut view = registry
            .provision("s1", "L", &["F1".to_string()])
            .await
            .unwrap();
        view.generation = generation;
        view
    }

    #[tokio::test]
    async fn test_save_and_load_shard() {
        let dir = tempdir().unwrap();
        let tracker = StateTracker::new(dir.path().to_path_buf(), "L".to_string()).unwrap();

        assert!(tracker.shard_generation("s1").await.unwrap().is_none());
        tracker.save_shard(&view(3).await).await.unwrap();
        assert_eq!(tracker.shard_generation("s1").await.unwrap(), Some(3));

        let loaded = tracker.load_shards().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].followers.len(), 1);
    }

    #[tokio::test]
    async fn test_older_generation_does_not_overwrite() {
        let dir = tempdir().unwrap();
        let tracker = StateTracker::new(dir.path().to_path_buf(), "L".to_string()).unwrap();

        tracker.save_shard(&view(5).await).await.unwrap();
        tracker.save_shard(&view(4).await).await.unwrap();
        assert_eq!(tracker.shard_generation("s1").await.unwrap(), Some(5));

        assert!(tracker.delete_shard("s1").await.unwrap());
        assert!(tracker.load_shards().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_last_started() {
        let dir = tempdir().unwrap();
        let tracker = StateTracker::new(dir.path().to_path_buf(), "L".to_string()).unwrap();
        assert!(tracker.last_started().await.unwrap().is_none());
        tracker.mark_started().await.unwrap();
        assert!(tracker.last_started().await.unwrap().is_some());
        assert_eq!(tracker.node_id(), "L");
    }
}
