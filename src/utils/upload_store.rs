use crate::data_structures::{OhlcSeries, UploadBundle};
use chrono::{DateTime, Utc};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{debug, warn};

const KEY_PREFIX: &str = "upload_";

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("invalid upload key '{0}'")]
    InvalidKey(String),
    #[error("upload '{0}' not found")]
    NotFound(String),
    #[error("upload storage error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt upload file: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Uploaded CSV bundles persisted as JSON files under the temp directory.
#[derive(Debug, Clone)]
pub struct UploadStore {
    dir: PathBuf,
}

impl UploadStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Initialize the storage directory
    pub fn init(&self) -> io::Result<()> {
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir)?;
            debug!(dir = ?self.dir, "Created upload directory");
        }
        Ok(())
    }

    fn file_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    /// Persist a new bundle under `upload_{YYYYmmdd_HHMMSS}`. Same-second
    /// uploads get a numeric suffix instead of overwriting each other.
    pub fn save(&self, series: Vec<OhlcSeries>, now: DateTime<Utc>) -> Result<UploadBundle, UploadError> {
        self.init()?;

        let base = format!("{}{}", KEY_PREFIX, now.format("%Y%m%d_%H%M%S"));
        let mut key = base.clone();
        let mut attempt = 1;
        while self.file_path(&key).exists() {
            key = format!("{}_{}", base, attempt);
            attempt += 1;
        }

        let bundle = UploadBundle {
            key,
            created_at: now,
            series,
        };

        let content = serde_json::to_vec(&bundle)?;
        let path = self.file_path(&bundle.key);
        debug!(key = %bundle.key, ?path, content_size = content.len(), "Writing upload bundle");
        fs::write(&path, content)?;

        Ok(bundle)
    }

    pub fn load(&self, key: &str) -> Result<UploadBundle, UploadError> {
        validate_key(key)?;

        let path = self.file_path(key);
        if !path.exists() {
            return Err(UploadError::NotFound(key.to_string()));
        }

        debug!(key, ?path, "Reading upload bundle");
        let content = fs::read(&path)?;
        Ok(serde_json::from_slice(&content)?)
    }

    /// Remove upload files older than `ttl`. Returns how many were removed.
    pub fn cleanup_expired(&self, ttl: Duration) -> io::Result<usize> {
        if !self.dir.exists() {
            return Ok(0);
        }

        let now = SystemTime::now();
        let mut removed_count = 0;

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();

            let is_upload = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(KEY_PREFIX) && n.ends_with(".json"));
            if !is_upload {
                continue;
            }

            let age = fs::metadata(&path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok());

            match age {
                Some(age) if age > ttl => match fs::remove_file(&path) {
                    Ok(()) => removed_count += 1,
                    Err(e) => warn!(?path, ?e, "Failed to remove expired upload"),
                },
                Some(_) => {}
                None => warn!(?path, "Failed to determine upload age"),
            }
        }

        if removed_count > 0 {
            debug!(removed_count, "Cleaned up expired uploads");
        }

        Ok(removed_count)
    }
}

fn validate_key(key: &str) -> Result<(), UploadError> {
    let well_formed = key.starts_with(KEY_PREFIX)
        && key.len() <= 64
        && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if well_formed {
        Ok(())
    } else {
        Err(UploadError::InvalidKey(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_structures::Candle;
    use chrono::{FixedOffset, TimeZone};

    fn sample_series(symbol: &str) -> OhlcSeries {
        let tz = FixedOffset::east_opt(0).unwrap();
        let candle = Candle {
            time: tz.with_ymd_and_hms(2025, 1, 2, 9, 0, 0).unwrap(),
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 10.0,
        };
        OhlcSeries::new(symbol, 15, vec![candle])
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = UploadStore::new(dir.path().join("temp"));
        let now = Utc.with_ymd_and_hms(2025, 3, 4, 5, 6, 7).unwrap();

        let bundle = store.save(vec![sample_series("XAUUSD")], now).unwrap();
        assert_eq!(bundle.key, "upload_20250304_050607");

        let loaded = store.load(&bundle.key).unwrap();
        assert_eq!(loaded.symbols(), vec!["XAUUSD"]);
        assert_eq!(loaded.series[0], sample_series("XAUUSD"));
    }

    #[test]
    fn test_same_second_uploads_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let store = UploadStore::new(dir.path());
        let now = Utc.with_ymd_and_hms(2025, 3, 4, 5, 6, 7).unwrap();

        let first = store.save(vec![sample_series("A")], now).unwrap();
        let second = store.save(vec![sample_series("B")], now).unwrap();
        assert_ne!(first.key, second.key);
        assert_eq!(second.key, "upload_20250304_050607_1");
        assert_eq!(store.load(&first.key).unwrap().symbols(), vec!["A"]);
    }

    #[test]
    fn test_load_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = UploadStore::new(dir.path());
        assert!(matches!(store.load("../etc/passwd"), Err(UploadError::InvalidKey(_))));
        assert!(matches!(store.load("upload_missing"), Err(UploadError::NotFound(_))));
    }

    #[test]
    fn test_cleanup_keeps_fresh_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = UploadStore::new(dir.path());
        store.save(vec![sample_series("A")], Utc::now()).unwrap();
        fs::write(dir.path().join("unrelated.txt"), b"keep").unwrap();

        assert_eq!(store.cleanup_expired(Duration::from_secs(3600)).unwrap(), 0);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(store.cleanup_expired(Duration::ZERO).unwrap(), 1);
        assert!(dir.path().join("unrelated.txt").exists());
    }
}
