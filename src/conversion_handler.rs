use chrono::Utc;
use rand::Rng;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use std::sync::Arc;
use tokio_rusqlite::Connection;
use tracing::instrument;

use crate::aggregators::start_of_day;
use crate::anonymize::{anonymize_ip, client_hash};

#[derive(Debug, Serialize)]
pub struct DownloadCount {
    pub total_downloads: i64,
}

#[derive(Debug, PartialEq, Serialize)]
pub struct DownloadStats {
    pub total_downloads: i64,
    pub unique_downloads: i64,
    pub today_downloads: i64,
}

#[derive(Debug, PartialEq, Serialize)]
pub struct FollowStatus {
    pub followers_count: i64,
    pub following: bool,
}

/// Returns the install-wide hashing salt, storing `candidate` on first use.
fn load_salt(conn: &rusqlite::Connection, candidate: String) -> rusqlite::Result<String> {
    conn.execute(
        "INSERT OR IGNORE INTO salt (id, value) VALUES (1, ?1)",
        params![candidate],
    )?;
    conn.query_row("SELECT value FROM salt WHERE id = 1", [], |row| row.get(0))
}

fn salt_candidate() -> String {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Records the CV downloads and follows that feed the conversion funnel.
pub struct ConversionHandler {
    db: Arc<Connection>,
}

impl ConversionHandler {
    pub fn new(db: Arc<Connection>) -> Self {
        Self { db }
    }

    #[instrument(skip_all)]
    pub async fn record_cv_download(
        &self,
        raw_ip: &str,
    ) -> Result<DownloadCount, tokio_rusqlite::Error> {
        let ip = anonymize_ip(raw_ip);
        let now = Utc::now().timestamp();

        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO cv_downloads (ip, created_at) VALUES (?1, ?2)",
                    params![ip, now],
                )?;
                let total_downloads =
                    conn.query_row("SELECT COUNT(*) FROM cv_downloads", [], |row| row.get(0))?;
                Ok(DownloadCount { total_downloads })
            })
            .await
    }

    pub async fn cv_download_stats(&self) -> Result<DownloadStats, tokio_rusqlite::Error> {
        let today_start = start_of_day(Utc::now().date_naive());

        self.db
            .call(move |conn| {
                let (total_downloads, unique_downloads, today_downloads) = conn.query_row(
                    "SELECT COUNT(*),
                            COUNT(DISTINCT ip),
                            COUNT(CASE WHEN created_at >= ?1 THEN 1 END)
                     FROM cv_downloads",
                    params![today_start],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )?;
                Ok(DownloadStats {
                    total_downloads,
                    unique_downloads,
                    today_downloads,
                })
            })
            .await
    }

    pub async fn follow_status(&self, raw_ip: &str) -> Result<FollowStatus, tokio_rusqlite::Error> {
        let raw_ip = raw_ip.to_string();
        let candidate = salt_candidate();

        self.db
            .call(move |conn| {
                let hash = client_hash(&raw_ip, &load_salt(conn, candidate)?);
                let followers_count =
                    conn.query_row("SELECT COUNT(*) FROM followers", [], |row| row.get(0))?;
                let following = conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM followers WHERE client_hash = ?1)",
                    params![hash],
                    |row| row.get(0),
                )?;
                Ok(FollowStatus {
                    followers_count,
                    following,
                })
            })
            .await
    }

    /// Follows when this client is not following yet, unfollows otherwise.
    /// Clients are told apart by a salted hash of the full address; only the
    /// anonymized prefix is stored alongside it.
    #[instrument(skip_all)]
    pub async fn toggle_follow(&self, raw_ip: &str) -> Result<FollowStatus, tokio_rusqlite::Error> {
        let raw_ip = raw_ip.to_string();
        let ip = anonymize_ip(&raw_ip);
        let candidate = salt_candidate();
        let now = Utc::now().timestamp();

        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                let hash = client_hash(&raw_ip, &load_salt(&tx, candidate)?);
                let existing: Option<i64> = tx
                    .query_row(
                        "SELECT id FROM followers WHERE client_hash = ?1",
                        params![hash],
                        |row| row.get(0),
                    )
                    .optional()?;

                let following = match existing {
                    Some(id) => {
                        tx.execute("DELETE FROM followers WHERE id = ?1", params![id])?;
                        false
                    }
                    None => {
                        tx.execute(
                            "INSERT INTO followers (ip, client_hash, created_at) VALUES (?1, ?2, ?3)",
                            params![ip, hash, now],
                        )?;
                        true
                    }
                };
                let followers_count =
                    tx.query_row("SELECT COUNT(*) FROM followers", [], |row| row.get(0))?;
                tx.commit()?;

                Ok(FollowStatus {
                    followers_count,
                    following,
                })
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::run_migrations;

    async fn handler() -> ConversionHandler {
        let db = Connection::open_in_memory().await.unwrap();
        run_migrations(&db).await.unwrap();
        ConversionHandler::new(Arc::new(db))
    }

    #[tokio::test]
    async fn downloads_are_counted() {
        let handler = handler().await;
        handler.record_cv_download("8.8.8.8").await.unwrap();
        handler.record_cv_download("8.8.8.9").await.unwrap();
        let count = handler.record_cv_download("1.1.1.1").await.unwrap();
        assert_eq!(count.total_downloads, 3);

        let stats = handler.cv_download_stats().await.unwrap();
        assert_eq!(
            stats,
            DownloadStats {
                total_downloads: 3,
                unique_downloads: 2,
                today_downloads: 3,
            }
        );
    }

    #[tokio::test]
    async fn follow_toggles() {
        let handler = handler().await;

        let status = handler.follow_status("8.8.8.8").await.unwrap();
        assert_eq!(status, FollowStatus { followers_count: 0, following: false });

        let status = handler.toggle_follow("8.8.8.8").await.unwrap();
        assert_eq!(status, FollowStatus { followers_count: 1, following: true });
        assert!(handler.follow_status("8.8.8.8").await.unwrap().following);

        let status = handler.toggle_follow("8.8.8.8").await.unwrap();
        assert_eq!(status, FollowStatus { followers_count: 0, following: false });
    }

    #[tokio::test]
    async fn hosts_sharing_a_network_follow_independently() {
        let handler = handler().await;

        let status = handler.toggle_follow("83.45.112.10").await.unwrap();
        assert_eq!(status, FollowStatus { followers_count: 1, following: true });

        let status = handler.toggle_follow("83.45.112.99").await.unwrap();
        assert_eq!(status, FollowStatus { followers_count: 2, following: true });

        assert!(handler.follow_status("83.45.112.10").await.unwrap().following);
        assert!(handler.follow_status("83.45.112.99").await.unwrap().following);
        assert!(!handler.follow_status("83.45.112.50").await.unwrap().following);
    }

    #[tokio::test]
    async fn followers_store_only_the_prefix_and_a_hash() {
        let db = Connection::open_in_memory().await.unwrap();
        run_migrations(&db).await.unwrap();
        let db = Arc::new(db);
        ConversionHandler::new(db.clone())
            .toggle_follow("83.45.112.10")
            .await
            .unwrap();

        let (ip, hash): (String, String) = db
            .call(|conn| {
                Ok(conn.query_row("SELECT ip, client_hash FROM followers", [], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?)
            })
            .await
            .unwrap();
        assert_eq!(ip, "83.45.112.0");
        assert!(!hash.contains("83.45.112.10"));
    }

    #[tokio::test]
    async fn raw_addresses_stay_out_of_logs() {
        let capture = crate::log_capture::LogCapture::default();
        let _guard = capture.install();

        let handler = handler().await;
        handler.toggle_follow("83.45.112.10").await.unwrap();
        handler.record_cv_download("83.45.112.10").await.unwrap();

        let logs = capture.contents();
        assert!(logs.contains("toggle_follow"));
        assert!(logs.contains("record_cv_download"));
        assert!(!logs.contains("83.45.112.10"));
    }
}
