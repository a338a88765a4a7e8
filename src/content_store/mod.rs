//! Content-addressed deduplication store.
//!
//! Raw scraped content and its eventual HSDS alignment result are stored on
//! disk, keyed by the SHA-256 hash of the trimmed content. A small `fjall`
//! partition indexes the hashes so enumeration and statistics don't require
//! walking the content directory.

mod error;

pub use error::{Result, StorageError};

use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

pub type TagBag = BTreeMap<String, String>;

/// Computes the content hash: SHA-256 hex digest of the trimmed content.
pub fn hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.trim().as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    job_id: Option<String>,
    has_result: bool,
    created_at: String,
}

/// A content-store entry as returned to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentEntry {
    pub hash: String,
    pub content: String,
    pub tags: TagBag,
    pub job_id: Option<String>,
    pub result: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Statistics {
    pub total_content: u64,
    pub processed_content: u64,
}

/// Layered key-value content store: raw content, aligned results, and an index.
#[derive(Clone)]
pub struct ContentStore {
    content_dir: PathBuf,
    results_dir: PathBuf,
    keyspace: Keyspace,
    index: PartitionHandle,
}

impl ContentStore {
    /// Open (creating if necessary) a content store rooted at `root`.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref();
        let content_dir = root.join("content");
        let results_dir = root.join("results");
        std::fs::create_dir_all(&content_dir)?;
        std::fs::create_dir_all(&results_dir)?;

        info!(path = %root.display(), "opening content store");
        let keyspace = Config::new(root.join("index.fjall")).open()?;
        let index = keyspace.open_partition("index", PartitionCreateOptions::default())?;

        Ok(Self {
            content_dir,
            results_dir,
            keyspace,
            index,
        })
    }

    fn content_path(&self, hash: &str) -> PathBuf {
        self.content_dir.join(&hash[..2]).join(&hash[2..])
    }

    fn tags_path(&self, hash: &str) -> PathBuf {
        self.content_dir.join(&hash[..2]).join(format!("{}.tags.json", &hash[2..]))
    }

    fn result_path(&self, hash: &str) -> PathBuf {
        self.results_dir.join(&hash[..2]).join(format!("{}.json", &hash[2..]))
    }

    /// Idempotent on hash: if an entry already exists, it is returned
    /// unchanged (tags and result are never overwritten by this call).
    pub fn store_content(&self, content: &str, tags: TagBag) -> Result<ContentEntry> {
        let h = hash(content);

        if let Some(existing) = self.read_index(&h)? {
            debug!(hash = %h, "content already present, returning existing entry");
            let tags = read_tags(&self.tags_path(&h))?.unwrap_or_default();
            let result = self.get_result(&h)?;
            return Ok(ContentEntry {
                hash: h,
                content: content.trim().to_string(),
                tags,
                job_id: existing.job_id,
                result,
                created_at: existing.created_at,
            });
        }

        write_atomic(&self.content_path(&h), content.trim().as_bytes())?;
        write_atomic(&self.tags_path(&h), serde_json::to_vec(&tags)?.as_slice())?;

        let created_at = OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_default();

        let entry = IndexEntry {
            job_id: None,
            has_result: false,
            created_at: created_at.clone(),
        };
        self.index.insert(h.as_bytes(), serde_json::to_vec(&entry)?)?;

        Ok(ContentEntry {
            hash: h,
            content: content.trim().to_string(),
            tags,
            job_id: None,
            result: None,
            created_at,
        })
    }

    /// Set the entry's most recent job id. Non-fatal if the entry is missing.
    pub fn link_job(&self, hash: &str, job_id: &str) -> Result<()> {
        match self.read_index(hash)? {
            Some(mut entry) => {
                entry.job_id = Some(job_id.to_string());
                self.index.insert(hash.as_bytes(), serde_json::to_vec(&entry)?)?;
            }
            None => {
                warn!(hash, job_id, "link_job called for unknown content hash");
            }
        }
        Ok(())
    }

    /// Returns the stored aligned-payload text, if present.
    pub fn get_result(&self, hash: &str) -> Result<Option<String>> {
        let path = self.result_path(hash);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write-once per hash in spirit; a second call silently replaces the
    /// previous result (last-writer-wins).
    pub fn store_result(&self, hash: &str, result_text: &str) -> Result<()> {
        write_atomic(&self.result_path(hash), result_text.as_bytes())?;

        let mut entry = self.read_index(hash)?.unwrap_or(IndexEntry {
            job_id: None,
            has_result: false,
            created_at: OffsetDateTime::now_utc()
                .format(&time::format_description::well_known::Rfc3339)
                .unwrap_or_default(),
        });
        entry.has_result = true;
        self.index.insert(hash.as_bytes(), serde_json::to_vec(&entry)?)?;
        Ok(())
    }

    /// O(N) scan over the index only.
    pub fn statistics(&self) -> Result<Statistics> {
        let mut stats = Statistics::default();
        for item in self.index.iter() {
            let (_, value) = item?;
            let entry: IndexEntry = serde_json::from_slice(&value)?;
            stats.total_content += 1;
            if entry.has_result {
                stats.processed_content += 1;
            }
        }
        Ok(stats)
    }

    pub fn persist(&self) -> Result<()> {
        self.keyspace.persist(fjall::PersistMode::SyncAll)?;
        Ok(())
    }

    fn read_index(&self, hash: &str) -> Result<Option<IndexEntry>> {
        match self.index.get(hash.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

fn read_tags(path: &Path) -> Result<Option<TagBag>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write-temp-then-rename: readers never observe a partial file.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("tmp");
    {
        let mut f = std::fs::File::create(&tmp_path)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (ContentStore, TempDir) {
        let dir = TempDir::new().unwrap();
        (ContentStore::open(dir.path()).unwrap(), dir)
    }

    #[test]
    fn hash_is_deterministic_and_trim_insensitive() {
        assert_eq!(hash("hello"), hash("hello"));
        assert_eq!(hash("  hello  \n"), hash("hello"));
        assert_eq!(hash("hello").len(), 64);
    }

    #[test]
    fn store_content_is_idempotent_on_hash() {
        let (store, _tmp) = store();
        let mut tags = TagBag::new();
        tags.insert("scraper_id".to_string(), "s1".to_string());

        let first = store.store_content("hello world", tags.clone()).unwrap();

        let mut other_tags = TagBag::new();
        other_tags.insert("scraper_id".to_string(), "s2".to_string());
        let second = store.store_content("hello world", other_tags).unwrap();

        assert_eq!(first.hash, second.hash);
        assert_eq!(second.tags.get("scraper_id"), Some(&"s1".to_string()));
    }

    #[test]
    fn link_job_on_missing_entry_is_non_fatal() {
        let (store, _tmp) = store();
        assert!(store.link_job("deadbeef", "job-1").is_ok());
    }

    #[test]
    fn store_result_then_get_result_round_trips() {
        let (store, _tmp) = store();
        let entry = store.store_content("food bank on main st", TagBag::new()).unwrap();

        assert_eq!(store.get_result(&entry.hash).unwrap(), None);

        store.store_result(&entry.hash, r#"{"organization":[]}"#).unwrap();
        assert_eq!(
            store.get_result(&entry.hash).unwrap(),
            Some(r#"{"organization":[]}"#.to_string())
        );

        // last-writer-wins
        store.store_result(&entry.hash, r#"{"organization":[1]}"#).unwrap();
        assert_eq!(
            store.get_result(&entry.hash).unwrap(),
            Some(r#"{"organization":[1]}"#.to_string())
        );
    }

    #[test]
    fn statistics_counts_processed_and_total() {
        let (store, _tmp) = store();
        let a = store.store_content("aaa", TagBag::new()).unwrap();
        let _b = store.store_content("bbb", TagBag::new()).unwrap();
        store.store_result(&a.hash, "result").unwrap();

        let stats = store.statistics().unwrap();
        assert_eq!(stats.total_content, 2);
        assert_eq!(stats.processed_content, 1);
    }
}
