use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::token::ContextToken;

/// What an audit record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Bind,
    Unbind,
    Query,
    Violation,
    PoolExhausted,
}

/// Immutable audit log entry
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub kind: AuditKind,
    pub tenant: Option<String>,
    pub session_id: Option<u64>,
    pub detail: Option<String>,
}

impl AuditRecord {
    pub fn new(kind: AuditKind, tenant: Option<&ContextToken>, session_id: Option<u64>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            tenant: tenant.map(ContextToken::canonical),
            session_id,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Append-only trip-wire log of binds, unbinds, violations and pool exhaustion.
///
/// Recording never fails: a poisoned lock is recovered and the record is kept.
/// Once `retention` records are held the oldest are dropped.
#[derive(Debug)]
pub struct AccessAuditor {
    records: Mutex<VecDeque<AuditRecord>>,
    retention: usize,
    audit_queries: bool,
}

pub type AuditorRef = Arc<AccessAuditor>;

impl AccessAuditor {
    pub const DEFAULT_RETENTION: usize = 10_000;

    pub fn new(retention: usize, audit_queries: bool) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            retention: retention.max(1),
            audit_queries,
        }
    }

    pub fn record(&self, record: AuditRecord) {
        match record.kind {
            AuditKind::Bind | AuditKind::Unbind => tracing::info!(
                kind = ?record.kind,
                tenant = record.tenant.as_deref().unwrap_or("-"),
                session = record.session_id.unwrap_or_default(),
                "tenant context {:?}",
                record.kind
            ),
            AuditKind::Query => tracing::debug!(
                tenant = record.tenant.as_deref().unwrap_or("-"),
                session = record.session_id.unwrap_or_default(),
                "scoped query: {}",
                record.detail.as_deref().unwrap_or("")
            ),
            AuditKind::Violation | AuditKind::PoolExhausted => tracing::warn!(
                kind = ?record.kind,
                tenant = record.tenant.as_deref().unwrap_or("-"),
                session = record.session_id.unwrap_or_default(),
                "access audit: {}",
                record.detail.as_deref().unwrap_or("")
            ),
        }

        let mut records = self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        while records.len() >= self.retention {
            records.pop_front();
        }
        records.push_back(record);
    }

    pub fn bind(&self, token: &ContextToken, session_id: u64) {
        self.record(AuditRecord::new(AuditKind::Bind, Some(token), Some(session_id)));
    }

    pub fn unbind(&self, token: &ContextToken, session_id: u64) {
        self.record(AuditRecord::new(AuditKind::Unbind, Some(token), Some(session_id)));
    }

    /// Query run under a bound tenant; kept only when query auditing is enabled
    pub fn query(&self, token: Option<&ContextToken>, session_id: u64, sql: &str) {
        if self.audit_queries {
            self.record(AuditRecord::new(AuditKind::Query, token, Some(session_id)).with_detail(sql));
        }
    }

    /// Query run with no tenant bound; always kept
    pub fn unscoped_query(&self, session_id: u64, sql: &str) {
        self.record(AuditRecord::new(AuditKind::Query, None, Some(session_id)).with_detail(sql));
    }

    pub fn violation(&self, session_id: u64, sql: &str) {
        self.record(
            AuditRecord::new(AuditKind::Violation, None, Some(session_id))
                .with_detail(format!("unscoped access to tenant resource: {}", sql)),
        );
    }

    pub fn pool_exhausted(&self, detail: impl Into<String>) {
        self.record(AuditRecord::new(AuditKind::PoolExhausted, None, None).with_detail(detail));
    }

    /// Snapshot of all retained records, oldest first
    pub fn records(&self) -> Vec<AuditRecord> {
        let records = self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        records.iter().cloned().collect()
    }

    pub fn records_since(&self, since: DateTime<Utc>) -> Vec<AuditRecord> {
        let records = self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        records.iter().filter(|r| r.timestamp >= since).cloned().collect()
    }

    pub fn violations_since(&self, since: DateTime<Utc>) -> Vec<AuditRecord> {
        self.records_since(since)
            .into_iter()
            .filter(|r| r.kind == AuditKind::Violation)
            .collect()
    }
}

impl Default for AccessAuditor {
    fn default() -> Self {
        Self::new(Self::DEFAULT_RETENTION, false)
    }
}
