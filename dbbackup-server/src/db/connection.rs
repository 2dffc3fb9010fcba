use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::time::Duration;

pub type DbPool = Pool<SqliteConnectionManager>;

pub fn create_pool(db_path: &str, busy_timeout: Duration) -> anyhow::Result<DbPool> {
    let manager = SqliteConnectionManager::file(db_path).with_init(move |conn| {
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch(
            "PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )
    });
    let pool = Pool::builder().max_size(8).build(manager)?;

    // journal_mode is persistent, set it once
    let conn = pool.get()?;
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;

    Ok(pool)
}

pub fn close_pool(pool: &DbPool) {
    // r2d2 closes connections when the pool is dropped.
    if let Ok(conn) = pool.get() {
        let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE)");
    }
}
