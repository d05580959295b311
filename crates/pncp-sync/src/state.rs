//! Durable record of which calendar days have been extracted.

use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use pncp_core::date_from_partition_path;
use pncp_storage::{StorageAdapter, StorageError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionState {
    pub last_extraction_date: Option<NaiveDate>,
    #[serde(default)]
    pub processed_dates: BTreeSet<NaiveDate>,
    /// Oldest scheduled date of the current run not yet committed.
    #[serde(default)]
    pub in_progress_date: Option<NaiveDate>,
    #[serde(default)]
    pub total_records_extracted: u64,
    #[serde(default)]
    pub last_extraction_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state file {path} is corrupt: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("state file {path} could not be read: {source}")]
    Unreadable {
        path: String,
        #[source]
        source: StorageError,
    },
    #[error(
        "state file {path} is missing but {partitions} partition file(s) exist; \
         rerun with --rebuild-state to derive state from them"
    )]
    PartitionsWithoutState { path: String, partitions: usize },
    #[error("state file {path} could not be written: {source}")]
    Persist {
        path: String,
        #[source]
        source: StorageError,
    },
}

#[derive(Debug, Clone)]
pub struct StateOptions {
    pub path: String,
    pub start_date: NaiveDate,
    /// Prefix holding daily partition files, consulted when the state file is absent.
    pub partition_prefix: String,
    pub rebuild_from_partitions: bool,
}

/// Single owner and writer of [`ExtractionState`].
#[derive(Debug)]
pub struct StateTracker {
    storage: Arc<dyn StorageAdapter>,
    path: String,
    start_date: NaiveDate,
    state: ExtractionState,
}

impl StateTracker {
    pub async fn load(
        storage: Arc<dyn StorageAdapter>,
        options: StateOptions,
    ) -> Result<Self, StateError> {
        let loaded = match storage.read(&options.path).await {
            Ok(bytes) => Some(serde_json::from_slice::<ExtractionState>(&bytes).map_err(
                |source| StateError::Corrupt {
                    path: options.path.clone(),
                    source,
                },
            )?),
            Err(err) if err.is_not_found() => None,
            Err(source) => {
                return Err(StateError::Unreadable {
                    path: options.path,
                    source,
                })
            }
        };

        let found = loaded.is_some();
        let mut tracker = Self {
            storage,
            path: options.path,
            start_date: options.start_date,
            state: loaded.unwrap_or_default(),
        };
        if !found {
            tracker
                .recover_missing_state(&options.partition_prefix, options.rebuild_from_partitions)
                .await?;
        }
        tracker.normalize();
        Ok(tracker)
    }

    async fn recover_missing_state(&mut self, prefix: &str, rebuild: bool) -> Result<(), StateError> {
        let partitions = self
            .storage
            .list(prefix)
            .await
            .map_err(|source| StateError::Unreadable {
                path: prefix.to_string(),
                source,
            })?
            .iter()
            .filter_map(|p| date_from_partition_path(p))
            .collect::<BTreeSet<_>>();

        if partitions.is_empty() {
            info!(path = %self.path, "no state file and no partitions; starting fresh");
            return Ok(());
        }
        if !rebuild {
            return Err(StateError::PartitionsWithoutState {
                path: self.path.clone(),
                partitions: partitions.len(),
            });
        }

        warn!(
            path = %self.path,
            dates = partitions.len(),
            "rebuilding extraction state from partition files"
        );
        self.state.processed_dates = partitions;
        self.normalize();
        self.persist().await
    }

    fn normalize(&mut self) {
        self.state.last_extraction_date = self.state.processed_dates.iter().next_back().copied();
    }

    pub fn state(&self) -> &ExtractionState {
        &self.state
    }

    pub fn start_date(&self) -> NaiveDate {
        self.start_date
    }

    pub fn is_processed(&self, date: NaiveDate) -> bool {
        self.state.processed_dates.contains(&date)
    }

    /// Dates after the newest processed one (or from the start date) up to yesterday.
    pub fn pending_dates(&self, today: NaiveDate) -> Vec<NaiveDate> {
        let from = match self.state.processed_dates.iter().next_back() {
            Some(last) => *last + Duration::days(1),
            None => self.start_date,
        };
        from.iter_days().take_while(|d| *d < today).collect()
    }

    /// Every date from the start date up to yesterday that was never processed.
    pub fn missing_dates(&self, today: NaiveDate) -> Vec<NaiveDate> {
        self.start_date
            .iter_days()
            .take_while(|d| *d < today)
            .filter(|d| !self.state.processed_dates.contains(d))
            .collect()
    }

    pub async fn begin(&mut self, date: NaiveDate) -> Result<(), StateError> {
        if self.state.in_progress_date == Some(date) {
            return Ok(());
        }
        self.state.in_progress_date = Some(date);
        self.persist().await
    }

    /// Records `date` as durably extracted. Returns `false` when nothing changed.
    pub async fn mark_processed(&mut self, date: NaiveDate, records: u64) -> Result<bool, StateError> {
        let inserted = self.state.processed_dates.insert(date);
        let cleared = self.state.in_progress_date == Some(date);
        if !inserted && !cleared {
            return Ok(false);
        }
        if cleared {
            self.state.in_progress_date = None;
        }
        if inserted {
            self.state.total_records_extracted += records;
        }
        self.state.last_extraction_timestamp = Some(Utc::now());
        self.normalize();
        self.persist().await?;
        Ok(true)
    }

    async fn persist(&self) -> Result<(), StateError> {
        let body = serde_json::to_vec_pretty(&self.state).map_err(|source| StateError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        self.storage
            .write(&self.path, Bytes::from(body))
            .await
            .map_err(|source| StateError::Persist {
                path: self.path.clone(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pncp_storage::LocalStorage;
    use tempfile::tempdir;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn options(rebuild: bool) -> StateOptions {
        StateOptions {
            path: "state.json".to_string(),
            start_date: day(2025, 8, 1),
            partition_prefix: "raw-data".to_string(),
            rebuild_from_partitions: rebuild,
        }
    }

    async fn fresh(storage: Arc<dyn StorageAdapter>) -> StateTracker {
        StateTracker::load(storage, options(false)).await.expect("load")
    }

    #[tokio::test]
    async fn pending_dates_continue_after_newest_processed_day() {
        let dir = tempdir().unwrap();
        let storage: Arc<dyn StorageAdapter> = Arc::new(LocalStorage::new(dir.path()));
        let mut tracker = fresh(storage).await;
        for d in day(2025, 8, 1).iter_days().take(15) {
            tracker.mark_processed(d, 1).await.unwrap();
        }

        assert_eq!(
            tracker.pending_dates(day(2025, 8, 18)),
            vec![day(2025, 8, 16), day(2025, 8, 17)]
        );
        assert!(tracker.pending_dates(day(2025, 8, 16)).is_empty());
        assert_eq!(tracker.state().last_extraction_date, Some(day(2025, 8, 15)));
    }

    #[tokio::test]
    async fn empty_state_starts_at_configured_date() {
        let dir = tempdir().unwrap();
        let storage: Arc<dyn StorageAdapter> = Arc::new(LocalStorage::new(dir.path()));
        let tracker = fresh(storage).await;
        assert_eq!(
            tracker.pending_dates(day(2025, 8, 4)),
            vec![day(2025, 8, 1), day(2025, 8, 2), day(2025, 8, 3)]
        );
        assert!(tracker.pending_dates(day(2025, 8, 1)).is_empty());
    }

    #[tokio::test]
    async fn marking_twice_is_idempotent_and_survives_reload() {
        let dir = tempdir().unwrap();
        let storage: Arc<dyn StorageAdapter> = Arc::new(LocalStorage::new(dir.path()));
        let mut tracker = fresh(storage.clone()).await;

        assert!(tracker.mark_processed(day(2025, 8, 3), 7).await.unwrap());
        let after_first = tracker.state().clone();
        assert!(!tracker.mark_processed(day(2025, 8, 3), 7).await.unwrap());
        assert_eq!(tracker.state(), &after_first);

        let reloaded = fresh(storage).await;
        assert_eq!(reloaded.state(), &after_first);
        assert_eq!(reloaded.state().total_records_extracted, 7);
    }

    #[tokio::test]
    async fn processed_dates_are_never_reoffered() {
        let dir = tempdir().unwrap();
        let storage: Arc<dyn StorageAdapter> = Arc::new(LocalStorage::new(dir.path()));
        let mut tracker = fresh(storage).await;
        tracker.mark_processed(day(2025, 8, 2), 0).await.unwrap();
        tracker.mark_processed(day(2025, 8, 5), 0).await.unwrap();

        let today = day(2025, 8, 9);
        for pending in [tracker.pending_dates(today), tracker.missing_dates(today)] {
            assert!(!pending.contains(&day(2025, 8, 2)));
            assert!(!pending.contains(&day(2025, 8, 5)));
        }
        assert_eq!(
            tracker.missing_dates(today),
            vec![
                day(2025, 8, 1),
                day(2025, 8, 3),
                day(2025, 8, 4),
                day(2025, 8, 6),
                day(2025, 8, 7),
                day(2025, 8, 8)
            ]
        );
    }

    #[tokio::test]
    async fn in_progress_marker_is_cleared_by_commit() {
        let dir = tempdir().unwrap();
        let storage: Arc<dyn StorageAdapter> = Arc::new(LocalStorage::new(dir.path()));
        let mut tracker = fresh(storage.clone()).await;
        tracker.begin(day(2025, 8, 1)).await.unwrap();
        assert_eq!(
            fresh(storage.clone()).await.state().in_progress_date,
            Some(day(2025, 8, 1))
        );
        tracker.mark_processed(day(2025, 8, 1), 0).await.unwrap();
        assert_eq!(tracker.state().in_progress_date, None);
    }

    #[tokio::test]
    async fn corrupt_state_is_fatal() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("state.json"), "{ not json").unwrap();
        let storage: Arc<dyn StorageAdapter> = Arc::new(LocalStorage::new(dir.path()));
        let err = StateTracker::load(storage, options(true)).await.unwrap_err();
        assert!(matches!(err, StateError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn missing_state_with_partitions_requires_explicit_rebuild() {
        let dir = tempdir().unwrap();
        let storage: Arc<dyn StorageAdapter> = Arc::new(LocalStorage::new(dir.path()));
        for stamp in ["20250801", "20250802"] {
            storage
                .write(
                    &format!("raw-data/year=2025/month=08/contracts_{stamp}.parquet"),
                    Bytes::from_static(b"x"),
                )
                .await
                .unwrap();
        }

        let err = StateTracker::load(storage.clone(), options(false))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StateError::PartitionsWithoutState { partitions: 2, .. }
        ));

        let tracker = StateTracker::load(storage.clone(), options(true)).await.unwrap();
        assert_eq!(tracker.state().last_extraction_date, Some(day(2025, 8, 2)));
        assert!(storage.exists("state.json").await.unwrap());
    }
}
