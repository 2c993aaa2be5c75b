use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::alarm::model::{Alarm, SchedulerSettings, UserId, Wakeup, WakeyConfig, load_config, save_config};

const WAKEUP_FILE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("store data is not valid JSON: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("unsupported wakeup file version {0}; expected version {WAKEUP_FILE_VERSION}")]
    UnsupportedVersion(u32),
    #[error("config store failed: {0:#}")]
    Config(#[from] anyhow::Error),
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("store is unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait AlarmConfigStore: Send + Sync {
    async fn get(&self, user_id: &UserId) -> Result<Option<Alarm>, StoreError>;

    /// Replaces the user's alarm. No history is kept.
    async fn save(&self, user_id: &UserId, alarm: Alarm) -> Result<(), StoreError>;
}

#[async_trait]
pub trait WakeupStore: Send + Sync {
    /// The user's wakeup with the latest alarm instant.
    async fn latest(&self, user_id: &UserId) -> Result<Option<Wakeup>, StoreError>;

    /// Idempotent on `(user_id, alarm_instant)`. An acknowledgment already
    /// stored is never replaced. Returns the record as stored.
    async fn upsert(&self, user_id: &UserId, wakeup: Wakeup) -> Result<Wakeup, StoreError>;
}

type WakeupKey = (UserId, DateTime<Utc>);

fn merge_record(
    records: &mut BTreeMap<WakeupKey, Wakeup>,
    user_id: &UserId,
    wakeup: Wakeup,
) -> (Wakeup, Option<Wakeup>) {
    let key = (user_id.clone(), wakeup.alarm_instant);
    let previous = records.get(&key).cloned();
    let merged = match previous.clone() {
        Some(existing) => existing.merge(wakeup),
        None => wakeup,
    };
    records.insert(key, merged.clone());
    (merged, previous)
}

fn latest_record(records: &BTreeMap<WakeupKey, Wakeup>, user_id: &UserId) -> Option<Wakeup> {
    records
        .iter()
        .filter(|((owner, _), _)| owner == user_id)
        .map(|(_, wakeup)| wakeup.clone())
        .next_back()
}

/// Alarm configuration backed by the JSON config file.
#[derive(Debug)]
pub struct FileAlarmConfigStore {
    path: PathBuf,
    config: tokio::sync::Mutex<WakeyConfig>,
}

impl FileAlarmConfigStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let config = load_config(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            config: tokio::sync::Mutex::new(config),
        })
    }

    pub async fn settings(&self) -> SchedulerSettings {
        self.config.lock().await.settings.clone()
    }
}

#[async_trait]
impl AlarmConfigStore for FileAlarmConfigStore {
    async fn get(&self, user_id: &UserId) -> Result<Option<Alarm>, StoreError> {
        Ok(self.config.lock().await.alarm_for(user_id))
    }

    async fn save(&self, user_id: &UserId, alarm: Alarm) -> Result<(), StoreError> {
        let mut config = self.config.lock().await;
        let mut updated = config.clone();
        updated.set_alarm(user_id.clone(), alarm);

        let path = self.path.clone();
        let snapshot = updated.clone();
        tokio::task::spawn_blocking(move || save_config(&path, &snapshot))
            .await
            .map_err(|err| StoreError::Unavailable(format!("config writer failed: {err}")))??;

        *config = updated;
        debug!(user_id = %user_id, alarm = %alarm, "alarm saved");
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WakeupFile {
    version: u32,
    #[serde(default)]
    wakeups: Vec<WakeupRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WakeupRecord {
    user_id: UserId,
    #[serde(flatten)]
    wakeup: Wakeup,
}

/// Wakeups persisted as one JSON document, rewritten on every upsert.
#[derive(Debug)]
pub struct FileWakeupStore {
    path: PathBuf,
    records: tokio::sync::Mutex<BTreeMap<WakeupKey, Wakeup>>,
}

impl FileWakeupStore {
    /// Opens the file at `path`, starting empty when it does not exist yet.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let records = match fs::read_to_string(path) {
            Ok(content) => parse_wakeup_file(&content)?,
            Err(err) if err.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        Ok(Self {
            path: path.to_path_buf(),
            records: tokio::sync::Mutex::new(records),
        })
    }

    async fn write(&self, records: &BTreeMap<WakeupKey, Wakeup>) -> Result<(), StoreError> {
        let payload = WakeupFile {
            version: WAKEUP_FILE_VERSION,
            wakeups: records
                .iter()
                .map(|((user_id, _), wakeup)| WakeupRecord {
                    user_id: user_id.clone(),
                    wakeup: wakeup.clone(),
                })
                .collect(),
        };
        let text = serde_json::to_string_pretty(&payload)?;
        tokio::fs::write(&self.path, format!("{text}\n"))
            .await
            .map_err(|source| StoreError::Io {
                path: self.path.clone(),
                source,
            })
    }
}

fn parse_wakeup_file(content: &str) -> Result<BTreeMap<WakeupKey, Wakeup>, StoreError> {
    let file = serde_json::from_str::<WakeupFile>(content)?;
    if file.version != WAKEUP_FILE_VERSION {
        return Err(StoreError::UnsupportedVersion(file.version));
    }
    let mut records = BTreeMap::new();
    for record in file.wakeups {
        merge_record(&mut records, &record.user_id, record.wakeup);
    }
    Ok(records)
}

#[async_trait]
impl WakeupStore for FileWakeupStore {
    async fn latest(&self, user_id: &UserId) -> Result<Option<Wakeup>, StoreError> {
        let records = self.records.lock().await;
        Ok(latest_record(&records, user_id))
    }

    async fn upsert(&self, user_id: &UserId, wakeup: Wakeup) -> Result<Wakeup, StoreError> {
        let mut records = self.records.lock().await;
        let (stored, previous) = merge_record(&mut records, user_id, wakeup);
        if let Err(err) = self.write(&records).await {
            let key = (user_id.clone(), stored.alarm_instant);
            match previous {
                Some(previous) => records.insert(key, previous),
                None => records.remove(&key),
            };
            return Err(err);
        }
        Ok(stored)
    }
}
