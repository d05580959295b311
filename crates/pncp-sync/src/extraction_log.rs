use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::{DateTime, NaiveDate, Utc};
use pncp_storage::StorageAdapter;
use serde::{Deserialize, Serialize};

use crate::filter::FilterReport;

/// What one committed day produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionLogEntry {
    pub date: NaiveDate,
    pub records_fetched: u64,
    pub invalid_records: u64,
    pub records_written: u64,
    pub path: Option<String>,
    pub sha256: Option<String>,
    pub bytes: u64,
    pub filter: FilterReport,
    pub extracted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionLog {
    pub schema_version: u32,
    #[serde(default)]
    pub entries: Vec<ExtractionLogEntry>,
}

impl ExtractionLog {
    pub async fn load(storage: &dyn StorageAdapter, path: &str) -> Result<Self> {
        match storage.read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).with_context(|| format!("parsing {path}")),
            Err(err) if err.is_not_found() => Ok(Self {
                schema_version: 1,
                entries: Vec::new(),
            }),
            Err(err) => Err(err).with_context(|| format!("reading {path}")),
        }
    }

    /// Replaces the entry for the same date, keeping entries sorted by date.
    pub fn upsert(&mut self, entry: ExtractionLogEntry) {
        match self.entries.binary_search_by_key(&entry.date, |e| e.date) {
            Ok(i) => self.entries[i] = entry,
            Err(i) => self.entries.insert(i, entry),
        }
    }

    pub async fn save(&self, storage: &dyn StorageAdapter, path: &str) -> Result<()> {
        let body = serde_json::to_vec_pretty(self).context("serializing extraction log")?;
        storage
            .write(path, Bytes::from(body))
            .await
            .with_context(|| format!("writing {path}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterStats;
    use pncp_storage::LocalStorage;

    fn entry(day: u32, written: u64) -> ExtractionLogEntry {
        ExtractionLogEntry {
            date: NaiveDate::from_ymd_opt(2025, 8, day).unwrap(),
            records_fetched: written,
            invalid_records: 0,
            records_written: written,
            path: None,
            sha256: None,
            bytes: 0,
            filter: FilterStats::default().report(10),
            extracted_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn upsert_replaces_same_date_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        let mut log = ExtractionLog::load(&storage, "metadata/extraction_log.json")
            .await
            .unwrap();
        log.upsert(entry(3, 1));
        log.upsert(entry(1, 1));
        log.upsert(entry(3, 9));
        log.save(&storage, "metadata/extraction_log.json").await.unwrap();

        let reloaded = ExtractionLog::load(&storage, "metadata/extraction_log.json")
            .await
            .unwrap();
        assert_eq!(reloaded.entries.len(), 2);
        assert_eq!(reloaded.entries[0].date.format("%d").to_string(), "01");
        assert_eq!(reloaded.entries[1].records_written, 9);
    }
}
