use anyhow::Result;
use rusqlite::params;
use tokio_rusqlite::Connection;
use tracing::info;

#[derive(Debug)]
struct Migration {
    name: &'static str,
    version: i32,
    up: fn(&rusqlite::Connection) -> rusqlite::Result<()>,
}

impl Migration {
    fn new(
        name: &'static str,
        version: i32,
        up: fn(&rusqlite::Connection) -> rusqlite::Result<()>,
    ) -> Self {
        Self { name, version, up }
    }
}

/// Opens the database file, switches it to WAL and brings the schema up to date.
pub async fn open_database(path: &str) -> Result<Connection> {
    let db = Connection::open(path).await?;
    db.call(|conn| {
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        Ok(())
    })
    .await?;
    run_migrations(&db).await?;
    Ok(db)
}

fn get_migrations() -> Vec<Migration> {
    vec![
        Migration::new("Create visits table", 1, |conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS visits (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    anonymized_ip TEXT NOT NULL,
                    page TEXT NOT NULL DEFAULT '/',
                    city TEXT NOT NULL DEFAULT '',
                    region TEXT NOT NULL DEFAULT '',
                    country TEXT NOT NULL DEFAULT '',
                    org TEXT NOT NULL DEFAULT '',
                    is_company INTEGER NOT NULL DEFAULT 0,
                    timezone TEXT NOT NULL DEFAULT '',
                    isp TEXT NOT NULL DEFAULT '',
                    as_number TEXT NOT NULL DEFAULT '',
                    device TEXT NOT NULL DEFAULT 'desktop',
                    referrer TEXT NOT NULL DEFAULT 'directo',
                    duration_seconds INTEGER,
                    created_at INTEGER NOT NULL
                )",
                [],
            )?;
            Ok(())
        }),
        Migration::new("Create events table", 2, |conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    type TEXT NOT NULL,
                    ip TEXT NOT NULL,
                    metadata TEXT,
                    created_at INTEGER NOT NULL
                )",
                [],
            )?;
            Ok(())
        }),
        Migration::new("Create conversion tables", 3, |conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS cv_downloads (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    ip TEXT NOT NULL,
                    created_at INTEGER NOT NULL
                )",
                [],
            )?;
            conn.execute(
                "CREATE TABLE IF NOT EXISTS followers (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    ip TEXT NOT NULL,
                    client_hash TEXT NOT NULL UNIQUE,
                    created_at INTEGER NOT NULL
                )",
                [],
            )?;
            Ok(())
        }),
        Migration::new("Add analytics indices", 4, |conn| {
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_visits_created_at ON visits(created_at)",
                [],
            )?;
            // Duration updates look up the latest visit per address.
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_visits_ip_created_at ON visits(anonymized_ip, created_at)",
                [],
            )?;
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_events_type_created_at ON events(type, created_at)",
                [],
            )?;
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_cv_downloads_created_at ON cv_downloads(created_at)",
                [],
            )?;
            Ok(())
        }),
        Migration::new("Add salt table", 5, |conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS salt (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    value TEXT NOT NULL
                )",
                [],
            )?;
            Ok(())
        }),
    ]
}

pub async fn run_migrations(db: &Connection) -> Result<()> {
    info!("Running database migrations...");

    db.call(|conn| {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS migrations (
                id INTEGER PRIMARY KEY,
                version INTEGER NOT NULL UNIQUE,
                name TEXT NOT NULL,
                executed_at INTEGER NOT NULL
            )",
            [],
        )?;

        let executed_versions: Vec<i32> = {
            let mut stmt = conn.prepare("SELECT version FROM migrations ORDER BY version DESC")?;
            let versions = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<i32>, rusqlite::Error>>()?;
            versions
        };

        for migration in get_migrations() {
            if executed_versions.contains(&migration.version) {
                continue;
            }

            info!(
                "Running migration {}: {}",
                migration.version, migration.name
            );

            let tx = conn.transaction()?;
            (migration.up)(&tx)?;
            tx.execute(
                "INSERT INTO migrations (version, name, executed_at) VALUES (?1, ?2, unixepoch())",
                params![migration.version, migration.name],
            )?;
            tx.commit()?;

            info!("Migration {} completed successfully", migration.version);
        }

        Ok(())
    })
    .await?;

    info!("All database migrations completed successfully");
    Ok(())
}
