use crate::context::SchemaPack;
use crate::db::{DbAdapter, QueryRows};
use crate::error::{Nl2SqlError, Result};
use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, InterruptHandle, OpenFlags};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

const READ_KEYWORDS: &[&str] = &["SELECT", "WITH", "EXPLAIN"];

/// SQLite adapter. Every call opens its own read-only connection on a
/// blocking thread, so concurrent requests share no cursor state.
#[derive(Debug, Clone)]
pub struct SqliteAdapter {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteAdapter {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(Nl2SqlError::Config(format!(
                "SQLite database not found: {}",
                path.display()
            )));
        }
        Ok(Self {
            path,
            busy_timeout: Duration::from_millis(1000),
        })
    }

    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` on a fresh connection on the blocking pool. Dropping the
    /// returned future (timeout, task abort) interrupts the statement in
    /// flight so the worker thread is released.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Connection) -> Result<T> + Send + 'static,
    {
        let path = self.path.clone();
        let busy_timeout = self.busy_timeout;
        let slot = Arc::new(Mutex::new(InterruptSlot::default()));
        let mut guard = InterruptOnDrop {
            slot: Arc::clone(&slot),
            armed: true,
        };

        let result = tokio::task::spawn_blocking(move || {
            let conn = connect(&path, busy_timeout)?;
            {
                let mut slot = slot.lock().unwrap_or_else(|p| p.into_inner());
                if slot.cancelled {
                    return Err(Nl2SqlError::Database("interrupted: caller gave up".to_string()));
                }
                slot.handle = Some(conn.get_interrupt_handle());
            }
            f(conn)
        })
        .await;

        guard.armed = false;
        result.map_err(|e| Nl2SqlError::Database(format!("SQLite worker failed: {}", e)))?
    }
}

#[derive(Default)]
struct InterruptSlot {
    handle: Option<InterruptHandle>,
    cancelled: bool,
}

/// Interrupts the connection of an abandoned blocking call
struct InterruptOnDrop {
    slot: Arc<Mutex<InterruptSlot>>,
    armed: bool,
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut slot = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        slot.cancelled = true;
        if let Some(handle) = slot.handle.take() {
            debug!("Interrupting abandoned SQLite statement");
            handle.interrupt();
        }
    }
}

fn connect(path: &Path, busy_timeout: Duration) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(map_sqlite_error)?;
    conn.busy_timeout(busy_timeout).map_err(map_sqlite_error)?;
    Ok(conn)
}

fn map_sqlite_error(err: rusqlite::Error) -> Nl2SqlError {
    if let rusqlite::Error::SqliteFailure(ref failure, _) = err {
        if matches!(
            failure.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ) {
            return Nl2SqlError::DbLocked(err.to_string());
        }
        if failure.code == rusqlite::ErrorCode::OperationInterrupted {
            return Nl2SqlError::Database(format!("interrupted: {}", err));
        }
    }
    Nl2SqlError::Database(err.to_string())
}

fn to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(f) => serde_json::Value::from(f),
        ValueRef::Text(bytes) => {
            serde_json::Value::from(String::from_utf8_lossy(bytes).into_owned())
        }
        ValueRef::Blob(bytes) => serde_json::Value::from(format!("<blob {} bytes>", bytes.len())),
    }
}

fn ensure_read_keyword(sql: &str) -> Result<()> {
    let first = sql
        .trim_start()
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or("")
        .to_uppercase();
    if READ_KEYWORDS.contains(&first.as_str()) {
        Ok(())
    } else {
        Err(Nl2SqlError::DbRejected(format!("only SELECT statements are allowed, got {}", first)))
    }
}

fn run_query(conn: &Connection, sql: &str) -> Result<QueryRows> {
    ensure_read_keyword(sql)?;
    let mut stmt = conn.prepare(sql).map_err(map_sqlite_error)?;
    if !stmt.readonly() {
        return Err(Nl2SqlError::DbRejected("statement is not read-only".to_string()));
    }

    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let width = columns.len();

    let mut rows = stmt.query([]).map_err(map_sqlite_error)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(map_sqlite_error)? {
        let mut values = Vec::with_capacity(width);
        for idx in 0..width {
            values.push(to_json(row.get_ref(idx).map_err(map_sqlite_error)?));
        }
        out.push(values);
    }

    Ok(QueryRows { columns, rows: out })
}

fn read_schema(conn: &Connection) -> Result<SchemaPack> {
    let mut tables_stmt = conn
        .prepare(
            "SELECT name FROM sqlite_master \
             WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .map_err(map_sqlite_error)?;
    let names: Vec<String> = tables_stmt
        .query_map([], |row| row.get(0))
        .map_err(map_sqlite_error)?
        .collect::<std::result::Result<_, _>>()
        .map_err(map_sqlite_error)?;

    let mut columns_stmt = conn
        .prepare("SELECT name FROM pragma_table_info(?1)")
        .map_err(map_sqlite_error)?;
    let mut fk_stmt = conn
        .prepare("SELECT \"from\", \"table\", \"to\" FROM pragma_foreign_key_list(?1)")
        .map_err(map_sqlite_error)?;

    let mut raw_tables = Vec::with_capacity(names.len());
    let mut raw_fks: BTreeMap<String, Vec<(String, String)>> = BTreeMap::new();

    for name in names {
        let columns: Vec<String> = columns_stmt
            .query_map(params![name], |row| row.get(0))
            .map_err(map_sqlite_error)?
            .collect::<std::result::Result<_, _>>()
            .map_err(map_sqlite_error)?;

        let fks: Vec<(String, String)> = fk_stmt
            .query_map(params![name], |row| {
                let from: String = row.get(0)?;
                let table: String = row.get(1)?;
                let to: Option<String> = row.get(2)?;
                let target = match to {
                    Some(col) => format!("{}.{}", table, col),
                    None => table,
                };
                Ok((from, target))
            })
            .map_err(map_sqlite_error)?
            .collect::<std::result::Result<_, _>>()
            .map_err(map_sqlite_error)?;

        if !fks.is_empty() {
            raw_fks.insert(name.clone(), fks);
        }
        raw_tables.push((name, columns));
    }

    Ok(SchemaPack::build(raw_tables, &raw_fks))
}

#[async_trait]
impl DbAdapter for SqliteAdapter {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn dialect(&self) -> &str {
        "sqlite"
    }

    async fn execute(&self, sql: &str) -> Result<QueryRows> {
        debug!(db = %self.path.display(), "Executing SQL: {}", sql);
        let sql = sql.to_string();
        self.blocking(move |conn| run_query(&conn, &sql)).await
    }

    async fn explain_query_plan(&self, sql: &str) -> Result<Option<Vec<String>>> {
        ensure_read_keyword(sql)?;
        let sql = format!("EXPLAIN QUERY PLAN {}", sql);
        let lines = self
            .blocking(move |conn| {
                let mut stmt = conn.prepare(&sql).map_err(map_sqlite_error)?;
                let lines: Vec<String> = stmt
                    .query_map([], |row| row.get::<_, String>(3))
                    .map_err(map_sqlite_error)?
                    .collect::<std::result::Result<_, _>>()
                    .map_err(map_sqlite_error)?;
                Ok(lines)
            })
            .await?;
        Ok(Some(lines))
    }

    async fn describe_schema(&self) -> Result<SchemaPack> {
        self.blocking(|conn| read_schema(&conn)).await
    }
}
