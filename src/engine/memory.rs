//! In-process engine used by the test suite and `serve --in-memory`.
//!
//! It models the parts of PostgreSQL the scoping layer depends on:
//! - a transaction-local tenant marker that vanishes on commit/rollback
//! - row-level visibility: `SELECT * FROM t` only returns rows whose tenant
//!   matches the current marker, and `INSERT INTO t` without a marker fails
//! - writes buffered per transaction and discarded on rollback
//!
//! Every directive is recorded as an [`EngineEvent`] so tests can assert what
//! marker the engine saw for each query. The event log keeps the most recent
//! [`MemoryEngine::DEFAULT_EVENT_CAPACITY`] events.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{Engine, EngineConnection, EngineError, Row};

/// Directive observed by the memory engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Connect { conn: u64 },
    Begin { conn: u64 },
    Commit { conn: u64 },
    Rollback { conn: u64 },
    SetMarker { conn: u64, value: String },
    ClearMarker { conn: u64 },
    Query { conn: u64, sql: String, marker: Option<String> },
    Close { conn: u64 },
}

#[derive(Default)]
struct Failures {
    connect: bool,
    set_marker: bool,
    clear_marker: bool,
    commit: bool,
}

struct MemoryState {
    next_conn: u64,
    open: usize,
    events: VecDeque<EngineEvent>,
    event_capacity: usize,
    tables: HashMap<String, Vec<(String, Row)>>,
    failures: Failures,
}

impl MemoryState {
    fn push_event(&mut self, event: EngineEvent) {
        while self.events.len() >= self.event_capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }
}

/// Shared in-memory database; clones share the same state
#[derive(Clone)]
pub struct MemoryEngine {
    state: Arc<Mutex<MemoryState>>,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::with_event_capacity(Self::DEFAULT_EVENT_CAPACITY)
    }
}

impl MemoryEngine {
    pub const DEFAULT_EVENT_CAPACITY: usize = 10_000;

    pub fn new() -> Self {
        Self::default()
    }

    /// Engine whose event log keeps at most `capacity` events, dropping the oldest
    pub fn with_event_capacity(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                next_conn: 0,
                open: 0,
                events: VecDeque::new(),
                event_capacity: capacity.max(1),
                tables: HashMap::new(),
                failures: Failures::default(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Seed a row owned by `tenant` into `table`
    pub fn seed(&self, table: &str, tenant: &str, row: Value) {
        let row = match row {
            Value::Object(map) => map,
            other => {
                let mut map = Row::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        self.lock()
            .tables
            .entry(table.to_string())
            .or_default()
            .push((tenant.to_lowercase(), row));
    }

    /// Committed rows of `table` regardless of tenant
    pub fn committed_rows(&self, table: &str) -> Vec<(String, Row)> {
        self.lock().tables.get(table).cloned().unwrap_or_default()
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.lock().events.iter().cloned().collect()
    }

    /// Markers seen by every query, in order
    pub fn query_markers(&self) -> Vec<(String, Option<String>)> {
        self.lock()
            .events
            .iter()
            .filter_map(|e| match e {
                EngineEvent::Query { sql, marker, .. } => Some((sql.clone(), marker.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn open_connections(&self) -> usize {
        self.lock().open
    }

    pub fn fail_connect(&self, fail: bool) {
        self.lock().failures.connect = fail;
    }

    pub fn fail_set_marker(&self, fail: bool) {
        self.lock().failures.set_marker = fail;
    }

    pub fn fail_clear_marker(&self, fail: bool) {
        self.lock().failures.clear_marker = fail;
    }

    pub fn fail_commit(&self, fail: bool) {
        self.lock().failures.commit = fail;
    }
}

#[async_trait]
impl Engine for MemoryEngine {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self) -> Result<Box<dyn EngineConnection>, EngineError> {
        let mut state = self.lock();
        if state.failures.connect {
            return Err(EngineError::Connection("memory engine refused connection".to_string()));
        }
        state.next_conn += 1;
        state.open += 1;
        let id = state.next_conn;
        state.push_event(EngineEvent::Connect { conn: id });
        drop(state);

        Ok(Box::new(MemoryConnection {
            id,
            engine: self.clone(),
            in_transaction: false,
            local_marker: None,
            pending: Vec::new(),
        }))
    }
}

struct MemoryConnection {
    id: u64,
    engine: MemoryEngine,
    in_transaction: bool,
    local_marker: Option<String>,
    pending: Vec<(String, String, Row)>,
}

impl MemoryConnection {
    fn marker(&self) -> Option<String> {
        self.local_marker.clone().filter(|m| !m.is_empty())
    }

    fn end_transaction(&mut self) {
        self.in_transaction = false;
        self.local_marker = None;
        self.pending.clear();
    }

    fn record_query(&self, sql: &str) {
        self.engine.lock().push_event(EngineEvent::Query {
            conn: self.id,
            sql: sql.to_string(),
            marker: self.marker(),
        });
    }
}

/// Table name following `keyword` in `sql`, e.g. `FROM shipments`
fn table_after<'a>(sql: &'a str, keyword: &str) -> Option<&'a str> {
    let upper = sql.to_ascii_uppercase();
    let at = upper.find(keyword)? + keyword.len();
    sql[at..]
        .split_whitespace()
        .next()
        .map(|t| t.trim_matches(|c| c == '"' || c == ';'))
}

#[async_trait]
impl EngineConnection for MemoryConnection {
    async fn begin(&mut self) -> Result<(), EngineError> {
        if self.in_transaction {
            return Err(EngineError::Transaction("transaction already in progress".to_string()));
        }
        self.in_transaction = true;
        self.engine.lock().push_event(EngineEvent::Begin { conn: self.id });
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), EngineError> {
        let mut state = self.engine.lock();
        state.push_event(EngineEvent::Commit { conn: self.id });
        if state.failures.commit {
            drop(state);
            self.end_transaction();
            return Err(EngineError::Transaction("injected commit failure".to_string()));
        }
        for (table, tenant, row) in self.pending.drain(..) {
            state.tables.entry(table).or_default().push((tenant, row));
        }
        drop(state);
        self.end_transaction();
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), EngineError> {
        self.engine.lock().push_event(EngineEvent::Rollback { conn: self.id });
        self.end_transaction();
        Ok(())
    }

    async fn set_tenant_marker(&mut self, _marker: &str, value: &str) -> Result<(), EngineError> {
        let mut state = self.engine.lock();
        state.push_event(EngineEvent::SetMarker {
            conn: self.id,
            value: value.to_string(),
        });
        if state.failures.set_marker {
            return Err(EngineError::Query("injected set_config failure".to_string()));
        }
        drop(state);
        if !self.in_transaction {
            return Err(EngineError::Transaction(
                "transaction-local marker set outside a transaction".to_string(),
            ));
        }
        self.local_marker = Some(value.to_string());
        Ok(())
    }

    async fn clear_tenant_marker(&mut self, _marker: &str) -> Result<(), EngineError> {
        let mut state = self.engine.lock();
        state.push_event(EngineEvent::ClearMarker { conn: self.id });
        if state.failures.clear_marker {
            return Err(EngineError::Query("injected clear failure".to_string()));
        }
        drop(state);
        self.local_marker = None;
        Ok(())
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, EngineError> {
        self.record_query(sql);
        let Some(table) = table_after(sql, "INSERT INTO ") else {
            return Ok(0);
        };
        let Some(tenant) = self.marker() else {
            return Err(EngineError::Query(format!(
                "new row violates row-level security policy for table \"{}\"",
                table
            )));
        };
        let row = match params.first() {
            Some(Value::Object(map)) => map.clone(),
            Some(other) => {
                let mut map = Row::new();
                map.insert("value".to_string(), other.clone());
                map
            }
            None => Row::new(),
        };
        let table = table.to_string();
        if self.in_transaction {
            self.pending.push((table, tenant, row));
        } else {
            self.engine.lock().tables.entry(table).or_default().push((tenant, row));
        }
        Ok(1)
    }

    async fn fetch_all(&mut self, sql: &str, _params: &[Value]) -> Result<Vec<Row>, EngineError> {
        self.record_query(sql);
        let marker = self.marker();

        if sql.contains("current_setting") {
            let mut row = Row::new();
            row.insert("tenant".to_string(), json!(marker));
            return Ok(vec![row]);
        }

        if let Some(table) = table_after(sql, "FROM ") {
            let Some(tenant) = marker else {
                return Ok(Vec::new());
            };
            let state = self.engine.lock();
            let mut rows: Vec<Row> = state
                .tables
                .get(table)
                .map(|rows| {
                    rows.iter()
                        .filter(|(owner, _)| *owner == tenant)
                        .map(|(_, row)| row.clone())
                        .collect()
                })
                .unwrap_or_default();
            drop(state);
            rows.extend(
                self.pending
                    .iter()
                    .filter(|(t, owner, _)| t == table && *owner == tenant)
                    .map(|(_, _, row)| row.clone()),
            );
            return Ok(rows);
        }

        // SELECT 1 and friends
        let mut row = Row::new();
        row.insert("?column?".to_string(), json!(1));
        Ok(vec![row])
    }

    async fn close(self: Box<Self>) {
        let mut state = self.engine.lock();
        state.open = state.open.saturating_sub(1);
        state.push_event(EngineEvent::Close { conn: self.id });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TENANT: &str = "123e4567-e89b-12d3-a456-426614174000";

    #[tokio::test]
    async fn local_marker_ends_with_transaction() {
        let engine = MemoryEngine::new();
        let mut conn = engine.connect().await.unwrap();

        conn.begin().await.unwrap();
        conn.set_tenant_marker("app.tenant_id", TENANT).await.unwrap();
        conn.fetch_all("SELECT current_setting('app.tenant_id', true)", &[]).await.unwrap();
        conn.commit().await.unwrap();
        let rows = conn
            .fetch_all("SELECT current_setting('app.tenant_id', true)", &[])
            .await
            .unwrap();

        assert_eq!(rows[0]["tenant"], Value::Null);
        let markers = engine.query_markers();
        assert_eq!(markers[0].1.as_deref(), Some(TENANT));
        assert_eq!(markers[1].1, None);
    }

    #[tokio::test]
    async fn event_log_keeps_only_the_newest_events() {
        let engine = MemoryEngine::with_event_capacity(3);
        let mut conn = engine.connect().await.unwrap();
        for _ in 0..5 {
            conn.fetch_all("SELECT 1", &[]).await.unwrap();
        }

        let events = engine.events();
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| matches!(e, EngineEvent::Query { .. })));
        assert!(!events.contains(&EngineEvent::Connect { conn: 1 }));
    }

    #[tokio::test]
    async fn marker_outside_transaction_is_rejected() {
        let engine = MemoryEngine::new();
        let mut conn = engine.connect().await.unwrap();
        assert!(conn.set_tenant_marker("app.tenant_id", TENANT).await.is_err());
    }

    #[tokio::test]
    async fn rows_are_filtered_by_marker_and_rollback_discards_writes() {
        let engine = MemoryEngine::new();
        engine.seed("shipments", TENANT, json!({"id": 1}));
        engine.seed("shipments", "00000000-0000-0000-0000-000000000001", json!({"id": 2}));
        let mut conn = engine.connect().await.unwrap();

        // no marker: nothing visible
        assert!(conn.fetch_all("SELECT * FROM shipments", &[]).await.unwrap().is_empty());

        conn.begin().await.unwrap();
        conn.set_tenant_marker("app.tenant_id", TENANT).await.unwrap();
        conn.execute("INSERT INTO shipments VALUES ($1)", &[json!({"id": 3})]).await.unwrap();
        let rows = conn.fetch_all("SELECT * FROM shipments", &[]).await.unwrap();
        assert_eq!(rows.len(), 2);
        conn.rollback().await.unwrap();

        assert_eq!(engine.committed_rows("shipments").len(), 2);
    }

    #[tokio::test]
    async fn insert_without_marker_violates_policy() {
        let engine = MemoryEngine::new();
        let mut conn = engine.connect().await.unwrap();
        let err = conn.execute("INSERT INTO shipments VALUES ($1)", &[json!({})]).await;
        assert!(matches!(err, Err(EngineError::Query(_))));
    }
}
