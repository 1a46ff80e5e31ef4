//! Moderation reports
//!
//! Reports are not causally merged: they are append-only, deduplicated by
//! id, and their status changes locally.

use crate::error::{Error, Result};
use crate::hash::{decode_row, encode_row, joined_hex};
use crate::op::{ActorId, EntityId};
use concord_storage::{Predicate, Row, Storage, Table};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Kind of entity a report points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Post,
    Comment,
}

/// Moderation status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    #[default]
    Open,
    Resolved,
    Dismissed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub id: String,
    pub target_id: EntityId,
    pub target_kind: TargetKind,
    pub reason: String,
    pub reporter: ActorId,
    pub timestamp: i64,
    #[serde(default)]
    pub status: ReportStatus,
}

impl Report {
    /// New open report with a deterministic id
    pub fn new(
        target_id: EntityId,
        target_kind: TargetKind,
        reason: impl Into<String>,
        reporter: ActorId,
        timestamp: i64,
    ) -> Self {
        let id = joined_hex(&[
            reporter.as_str(),
            target_id.as_str(),
            &timestamp.to_string(),
        ]);
        Self {
            id,
            target_id,
            target_kind,
            reason: reason.into(),
            reporter,
            timestamp,
            status: ReportStatus::Open,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::validation("report is missing id"));
        }
        if self.target_id.is_empty() {
            return Err(Error::validation("report is missing target"));
        }
        if self.reporter.is_empty() {
            return Err(Error::validation("report is missing reporter"));
        }
        Ok(())
    }
}

/// Append-only report store
pub struct ReportStore {
    storage: Arc<dyn Storage>,
    reports: DashMap<String, Report>,
    /// Serializes check-persist-insert so an id is only ever new once
    writes: Mutex<()>,
}

impl ReportStore {
    pub async fn open(storage: Arc<dyn Storage>) -> Result<Self> {
        let reports = DashMap::new();
        for row in storage.query(Table::Reports, &Predicate::All, None).await? {
            let report: Report = decode_row(&row.value)?;
            reports.insert(report.id.clone(), report);
        }
        Ok(Self {
            storage,
            reports,
            writes: Mutex::new(()),
        })
    }

    /// Add a report. Returns `false` when a report with that id already exists.
    pub async fn add(&self, report: Report) -> Result<bool> {
        report.validate()?;
        let _guard = self.writes.lock().await;
        if self.reports.contains_key(&report.id) {
            return Ok(false);
        }

        self.persist(&report).await?;
        debug!(report = %report.id, target = %report.target_id, "Stored report");
        self.reports.insert(report.id.clone(), report);
        Ok(true)
    }

    /// Change a report's status
    pub async fn set_status(&self, id: &str, status: ReportStatus) -> Result<Report> {
        let _guard = self.writes.lock().await;
        let mut report = self
            .get(id)
            .ok_or_else(|| Error::not_found(format!("report {}", id)))?;
        report.status = status;

        self.persist(&report).await?;
        self.reports.insert(report.id.clone(), report.clone());
        Ok(report)
    }

    pub fn get(&self, id: &str) -> Option<Report> {
        self.reports.get(id).map(|r| r.value().clone())
    }

    /// All reports, oldest first
    pub fn list(&self) -> Vec<Report> {
        let mut all: Vec<_> = self.reports.iter().map(|r| r.value().clone()).collect();
        all.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        all
    }

    pub fn for_target(&self, target: &EntityId) -> Vec<Report> {
        self.list()
            .into_iter()
            .filter(|r| &r.target_id == target)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }

    async fn persist(&self, report: &Report) -> Result<()> {
        self.storage
            .put(
                Table::Reports,
                Row::new(report.id.as_str(), report.timestamp, encode_row(report)?),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_storage::MemoryStorage;

    fn report(ts: i64) -> Report {
        Report::new(
            EntityId::from("p1"),
            TargetKind::Post,
            "spam",
            ActorId::from("carol"),
            ts,
        )
    }

    #[tokio::test]
    async fn test_add_deduplicates_by_id() {
        let store = ReportStore::open(Arc::new(MemoryStorage::new())).await.unwrap();

        assert!(store.add(report(1)).await.unwrap());
        assert!(!store.add(report(1)).await.unwrap());
        assert!(store.add(report(2)).await.unwrap());
        assert_eq!(store.len(), 2);
        assert_eq!(store.for_target(&EntityId::from("p1")).len(), 2);
    }

    #[tokio::test]
    async fn test_status_change_persists() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let id = {
            let store = ReportStore::open(storage.clone()).await.unwrap();
            let r = report(1);
            store.add(r.clone()).await.unwrap();
            store.set_status(&r.id, ReportStatus::Resolved).await.unwrap();
            r.id
        };

        let store = ReportStore::open(storage).await.unwrap();
        assert_eq!(store.get(&id).unwrap().status, ReportStatus::Resolved);
        assert!(store.set_status("missing", ReportStatus::Dismissed).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_adds_report_new_once() {
        let store = Arc::new(ReportStore::open(Arc::new(MemoryStorage::new())).await.unwrap());

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.add(report(1)).await.unwrap() }));
        }

        let mut fresh = 0;
        for handle in handles {
            if handle.await.unwrap() {
                fresh += 1;
            }
        }
        assert_eq!(fresh, 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_report_is_refused() {
        let store = ReportStore::open(Arc::new(MemoryStorage::new())).await.unwrap();
        let mut r = report(1);
        r.reporter = ActorId::from("");
        assert!(store.add(r).await.is_err());
        assert!(store.is_empty());
    }
}
