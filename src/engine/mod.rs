//! Storage engine seam.
//!
//! A session talks to the database only through [`EngineConnection`], which
//! exposes the transaction lifecycle, the two tenant-marker directives and
//! parameterized queries. Everything above this module is engine-agnostic.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;

pub use memory::{EngineEvent, MemoryEngine};
pub use postgres::PgEngine;

/// A result row as a JSON object keyed by column name
pub type Row = Map<String, Value>;

/// Errors from the underlying storage engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

/// One physical connection to the storage engine
#[async_trait]
pub trait EngineConnection: Send {
    async fn begin(&mut self) -> Result<(), EngineError>;

    async fn commit(&mut self) -> Result<(), EngineError>;

    async fn rollback(&mut self) -> Result<(), EngineError>;

    /// Set the tenant marker for the current transaction only
    async fn set_tenant_marker(&mut self, marker: &str, value: &str) -> Result<(), EngineError>;

    /// Clear the tenant marker at every level
    async fn clear_tenant_marker(&mut self, marker: &str) -> Result<(), EngineError>;

    /// Run a statement and return the number of affected rows
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, EngineError>;

    async fn fetch_all(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, EngineError>;

    /// Close the connection; errors are ignored since the connection is gone either way
    async fn close(self: Box<Self>) {}
}

/// Connection factory used by the session pool
#[async_trait]
pub trait Engine: Send + Sync {
    /// Engine name for logging
    fn name(&self) -> &'static str;

    async fn connect(&self) -> Result<Box<dyn EngineConnection>, EngineError>;
}

pub type EngineRef = Arc<dyn Engine>;
