#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Once;
use std::time::Duration;

use gnode::{ColumnType, Engine, EngineConfig, Row, TableSchema};
use rusqlite::{Connection, OpenFlags};

static TRACING: Once = Once::new();

/// Routes engine logs to the test harness; filter with `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn config_with_debounce(debounce: Duration) -> EngineConfig {
    EngineConfig::default().with_debounce(debounce)
}

/// In-memory engine with a short debounce window.
pub async fn engine() -> Engine {
    engine_with(config_with_debounce(Duration::from_millis(5))).await
}

pub async fn engine_with(config: EngineConfig) -> Engine {
    init_tracing();
    Engine::open(config).await.expect("open engine")
}

pub fn temp_db_path(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    (dir, path)
}

pub fn open_read_only(path: &Path) -> Connection {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .expect("open read-only connection")
}

pub fn count_physical(conn: &Connection, table: &str) -> usize {
    let sql = format!("SELECT COUNT(*) FROM \"{table}\"");
    conn.query_row(&sql, [], |r| r.get::<_, i64>(0))
        .expect("count rows") as usize
}

pub fn sales_schema() -> TableSchema {
    TableSchema::new()
        .column("region", ColumnType::Text)
        .column("product", ColumnType::Text)
        .column("revenue", ColumnType::Integer)
}

pub fn sale(region: &str, product: &str, revenue: i64) -> Row {
    Row::new()
        .with("region", region)
        .with("product", product)
        .with("revenue", revenue)
}

pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}
