//! Search History Store
//! Mission: Remember the last 50 successful sweeps, one per address
//!
//! The whole list is persisted as a single JSON document in one SQLite row,
//! so every mutation is an atomic replace-on-write of the full list.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::consolidate;
use crate::models::{HistoryEntry, PropertyData, SourceStatus, ValuationEstimate};
use crate::sources::SourceRegistry;

pub const HISTORY_CAPACITY: usize = 50;

const HISTORY_KEY: &str = "search_history";

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS history_state (
    key TEXT PRIMARY KEY,
    entries_json TEXT NOT NULL,
    updated_at INTEGER NOT NULL
) WITHOUT ROWID;
"#;

struct Inner {
    conn: Connection,
    entries: Vec<HistoryEntry>,
}

pub struct HistoryStore {
    inner: Mutex<Inner>,
}

/// Per-source row rebuilt from a stored entry
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SourceView {
    pub source: String,
    pub display_name: String,
    pub status: SourceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub low: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub high: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl HistoryStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open history database at {}", db_path))?;
        let store = Self::with_connection(conn)?;
        info!("🗂️  History store opened at {} ({} entries)", db_path, store.len());
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize history schema")?;

        let raw: Option<String> = conn
            .query_row(
                "SELECT entries_json FROM history_state WHERE key = ?1",
                params![HISTORY_KEY],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read stored history")?;

        let entries = match raw {
            Some(json) => serde_json::from_str::<Vec<HistoryEntry>>(&json).unwrap_or_else(|e| {
                warn!("Stored history is unreadable, starting empty: {}", e);
                Vec::new()
            }),
            None => Vec::new(),
        };

        Ok(Self {
            inner: Mutex::new(Inner { conn, entries }),
        })
    }

    /// Records a finished sweep. Empty `estimates` is a no-op so failed sweeps
    /// never reach history. An older entry for the same address (any casing)
    /// is replaced and the new one goes first.
    pub fn add_entry(
        &self,
        address: &str,
        estimates: Vec<ValuationEstimate>,
        property_data: Option<PropertyData>,
    ) -> Result<Option<HistoryEntry>> {
        let values: Vec<f64> = estimates.iter().map(|e| e.estimate).collect();
        let Some(summary) = consolidate::consolidate(&values) else {
            debug!(address, "Sweep produced no estimates, history unchanged");
            return Ok(None);
        };

        let address = address.trim();
        let entry = HistoryEntry {
            id: Uuid::new_v4().to_string(),
            address: address.to_string(),
            timestamp: Utc::now(),
            estimates,
            property_data: property_data.filter(|p| !p.is_empty()),
            median_estimate: summary.median,
        };

        let key = address.to_lowercase();
        let mut inner = self.inner.lock();
        let mut next: Vec<HistoryEntry> = Vec::with_capacity(HISTORY_CAPACITY);
        next.push(entry.clone());
        next.extend(
            inner
                .entries
                .iter()
                .filter(|e| e.address.trim().to_lowercase() != key)
                .cloned(),
        );
        next.truncate(HISTORY_CAPACITY);

        persist(&inner.conn, &next)?;
        inner.entries = next;

        info!(address, median = summary.median, "🗂️  History entry recorded");
        Ok(Some(entry))
    }

    /// Most recent first.
    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.inner.lock().entries.clone()
    }

    pub fn get(&self, id: &str) -> Option<HistoryEntry> {
        self.inner.lock().entries.iter().find(|e| e.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn remove(&self, id: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        let next: Vec<HistoryEntry> = inner.entries.iter().filter(|e| e.id != id).cloned().collect();
        if next.len() == inner.entries.len() {
            return Ok(false);
        }
        persist(&inner.conn, &next)?;
        inner.entries = next;
        Ok(true)
    }

    pub fn clear(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        persist(&inner.conn, &[])?;
        inner.entries.clear();
        Ok(())
    }
}

fn persist(conn: &Connection, entries: &[HistoryEntry]) -> Result<()> {
    let json = serde_json::to_string(entries)?;
    conn.execute(
        "INSERT OR REPLACE INTO history_state (key, entries_json, updated_at) VALUES (?1, ?2, ?3)",
        params![HISTORY_KEY, json, Utc::now().timestamp()],
    )
    .context("Failed to persist history")?;
    Ok(())
}

/// Rebuilds the per-source status board for a stored entry. Every registered
/// source appears; those with a matching estimate are `found`, the rest
/// `not_found`. Labels the registry cannot resolve are skipped.
pub fn load_entry(entry: &HistoryEntry, registry: &SourceRegistry) -> Vec<SourceView> {
    let mut views: Vec<SourceView> = registry
        .iter()
        .map(|s| SourceView {
            source: s.id.clone(),
            display_name: s.display_name.clone(),
            status: SourceStatus::NotFound,
            estimate: None,
            low: None,
            high: None,
            url: None,
        })
        .collect();

    for estimate in &entry.estimates {
        let Some(source) = registry.match_label(&estimate.source) else {
            debug!(label = %estimate.source, "History label matches no registered source");
            continue;
        };
        if let Some(view) = views.iter_mut().find(|v| v.source == source.id) {
            view.status = SourceStatus::Found;
            view.estimate = Some(estimate.estimate);
            view.low = Some(estimate.low);
            view.high = Some(estimate.high);
            view.url = estimate.url.clone();
        }
    }

    views
}

/// Relative age label for history listings.
pub fn time_ago(timestamp: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let elapsed = now.signed_duration_since(timestamp);
    let minutes = elapsed.num_minutes();
    let hours = elapsed.num_hours();
    let days = elapsed.num_days();

    if minutes < 1 {
        "just now".to_string()
    } else if minutes < 60 {
        format!("{}m ago", minutes)
    } else if hours < 24 {
        format!("{}h ago", hours)
    } else if days == 1 {
        "yesterday".to_string()
    } else if days < 7 {
        format!("{}d ago", days)
    } else {
        timestamp.format("%-m/%-d/%Y").to_string()
    }
}
