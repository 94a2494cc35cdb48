//! Configuration store implementations
//!
//! [`InMemoryConfigStore`] keeps drop-lists in process memory and is used by
//! tests and dry runs. [`RelabelFileStore`] persists them as Prometheus
//! relabel snippets that the scraper re-reads.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tcm_core::labels::{JOB_LABEL, METRIC_NAME_LABEL};
use tcm_core::{ConfigStore, ErrorContext, RemoteWriteRestriction};
use tracing::debug;

/// In-memory configuration store
#[derive(Debug, Clone, Default)]
pub struct InMemoryConfigStore {
    drop_lists: Arc<DashMap<String, BTreeSet<String>>>,
    restrictions: Arc<DashMap<String, RemoteWriteRestriction>>,
    fail_writes: Arc<AtomicBool>,
    writes: Arc<AtomicU64>,
}

impl InMemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail until toggled back
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful writes
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Snapshot of a job's drop-list
    pub fn drop_list(&self, job: &str) -> BTreeSet<String> {
        self.drop_lists
            .get(job)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    fn check_writable(&self) -> tcm_core::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(tcm_core::Error::apply("configuration store rejected the write"));
        }
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for InMemoryConfigStore {
    async fn read_drop_list(&self, job: &str) -> tcm_core::Result<BTreeSet<String>> {
        Ok(self.drop_list(job))
    }

    async fn write_drop_list(&self, job: &str, drop_list: &BTreeSet<String>) -> tcm_core::Result<()> {
        self.check_writable()?;
        self.drop_lists.insert(job.to_string(), drop_list.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read_remote_write_restriction(
        &self,
        destination: &str,
    ) -> tcm_core::Result<RemoteWriteRestriction> {
        Ok(self
            .restrictions
            .get(destination)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| RemoteWriteRestriction::new(destination)))
    }

    async fn write_remote_write_restriction(
        &self,
        restriction: &RemoteWriteRestriction,
    ) -> tcm_core::Result<()> {
        self.check_writable()?;
        self.restrictions
            .insert(restriction.destination.clone(), restriction.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// One Prometheus relabel rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelabelRule {
    pub source_labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub separator: Option<String>,
    pub regex: String,
    pub action: String,
}

/// Persisted drop-list of one scrape job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeDropFile {
    pub job_name: String,
    pub dropped_metrics: BTreeSet<String>,
    pub metric_relabel_configs: Vec<RelabelRule>,
}

impl ScrapeDropFile {
    pub fn new(job: &str, drop_list: &BTreeSet<String>) -> Self {
        let metric_relabel_configs = if drop_list.is_empty() {
            Vec::new()
        } else {
            vec![RelabelRule {
                source_labels: vec![METRIC_NAME_LABEL.to_string()],
                separator: None,
                regex: alternation(drop_list.iter().map(|m| regex::escape(m))),
                action: "drop".to_string(),
            }]
        };

        Self {
            job_name: job.to_string(),
            dropped_metrics: drop_list.clone(),
            metric_relabel_configs,
        }
    }
}

/// Persisted remote-write restriction of one destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteWriteFile {
    pub destination: String,
    pub excluded: BTreeMap<String, BTreeSet<String>>,
    pub write_relabel_configs: Vec<RelabelRule>,
}

impl RemoteWriteFile {
    pub fn new(restriction: &RemoteWriteRestriction) -> Self {
        let pairs: Vec<String> = restriction
            .excluded
            .iter()
            .flat_map(|(job, metrics)| {
                metrics
                    .iter()
                    .map(move |metric| format!("{};{}", regex::escape(job), regex::escape(metric)))
            })
            .collect();

        let write_relabel_configs = if pairs.is_empty() {
            Vec::new()
        } else {
            vec![RelabelRule {
                source_labels: vec![JOB_LABEL.to_string(), METRIC_NAME_LABEL.to_string()],
                separator: Some(";".to_string()),
                regex: alternation(pairs.into_iter()),
                action: "drop".to_string(),
            }]
        };

        Self {
            destination: restriction.destination.clone(),
            excluded: restriction.excluded.clone(),
            write_relabel_configs,
        }
    }

    fn into_restriction(self) -> RemoteWriteRestriction {
        RemoteWriteRestriction {
            destination: self.destination,
            excluded: self.excluded,
        }
    }
}

fn alternation(parts: impl Iterator<Item = String>) -> String {
    let parts: Vec<String> = parts.collect();
    format!("^(?:{})$", parts.join("|"))
}

/// File-backed store writing relabel snippets the scraper includes
///
/// Layout: `<dir>/scrape/<job>.yaml` and `<dir>/remote_write/<destination>.yaml`.
/// Every write goes to a temporary file that is renamed into place.
#[derive(Debug, Clone)]
pub struct RelabelFileStore {
    dir: PathBuf,
}

impl RelabelFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn scrape_path(&self, job: &str) -> PathBuf {
        self.dir.join("scrape").join(format!("{}.yaml", file_stem(job)))
    }

    fn remote_write_path(&self, destination: &str) -> PathBuf {
        self.dir
            .join("remote_write")
            .join(format!("{}.yaml", file_stem(destination)))
    }

    async fn read_yaml<T: for<'de> Deserialize<'de>>(path: &Path) -> tcm_core::Result<Option<T>> {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => serde_yaml::from_str(&contents)
                .map(Some)
                .with_context_fn(|| format!("parsing {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(tcm_core::Error::store(format!(
                "failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn write_yaml<T: Serialize>(path: &Path, value: &T) -> tcm_core::Result<()> {
        let contents = serde_yaml::to_string(value)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context_fn(|| format!("creating {}", parent.display()))?;
        }

        let tmp = path.with_extension("yaml.tmp");
        tokio::fs::write(&tmp, contents)
            .await
            .map_err(|e| tcm_core::Error::apply(format!("failed to write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| tcm_core::Error::apply(format!("failed to replace {}: {}", path.display(), e)))?;

        debug!(path = %path.display(), "Wrote relabel file");
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for RelabelFileStore {
    async fn read_drop_list(&self, job: &str) -> tcm_core::Result<BTreeSet<String>> {
        let path = self.scrape_path(job);
        let Some(file) = Self::read_yaml::<ScrapeDropFile>(&path).await? else {
            return Ok(BTreeSet::new());
        };
        check_owner(&path, "job", &file.job_name, job)?;
        Ok(file.dropped_metrics)
    }

    async fn write_drop_list(&self, job: &str, drop_list: &BTreeSet<String>) -> tcm_core::Result<()> {
        Self::write_yaml(&self.scrape_path(job), &ScrapeDropFile::new(job, drop_list)).await
    }

    async fn read_remote_write_restriction(
        &self,
        destination: &str,
    ) -> tcm_core::Result<RemoteWriteRestriction> {
        let path = self.remote_write_path(destination);
        let Some(file) = Self::read_yaml::<RemoteWriteFile>(&path).await? else {
            return Ok(RemoteWriteRestriction::new(destination));
        };
        check_owner(&path, "destination", &file.destination, destination)?;
        Ok(file.into_restriction())
    }

    async fn write_remote_write_restriction(
        &self,
        restriction: &RemoteWriteRestriction,
    ) -> tcm_core::Result<()> {
        Self::write_yaml(
            &self.remote_write_path(&restriction.destination),
            &RemoteWriteFile::new(restriction),
        )
        .await
    }
}

/// Map a job or destination name to a file stem
///
/// Bytes outside `[A-Za-z0-9._-]` are percent-encoded, so distinct names
/// never share a file. A leading dot is encoded as well.
fn file_stem(name: &str) -> String {
    let mut stem = String::with_capacity(name.len());
    for (i, byte) in name.bytes().enumerate() {
        let plain = match byte {
            b'.' => i > 0,
            b'-' | b'_' => true,
            _ => byte.is_ascii_alphanumeric(),
        };
        if plain {
            stem.push(char::from(byte));
        } else {
            stem.push_str(&format!("%{:02X}", byte));
        }
    }
    stem
}

fn check_owner(path: &Path, kind: &str, recorded: &str, expected: &str) -> tcm_core::Result<()> {
    if recorded == expected {
        return Ok(());
    }
    Err(tcm_core::Error::store(format!(
        "{} belongs to {} {:?}, not {:?}",
        path.display(),
        kind,
        recorded,
        expected
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryConfigStore::new();
        assert!(store.read_drop_list("api").await.unwrap().is_empty());

        store.write_drop_list("api", &set(&["m1", "m2"])).await.unwrap();
        assert_eq!(store.read_drop_list("api").await.unwrap(), set(&["m1", "m2"]));
        assert_eq!(store.write_count(), 1);

        store.set_fail_writes(true);
        let err = store.write_drop_list("api", &set(&["m3"])).await.unwrap_err();
        assert!(matches!(err, tcm_core::Error::ApplyFailure(_)));
        assert_eq!(store.drop_list("api"), set(&["m1", "m2"]));
    }

    #[test]
    fn test_scrape_relabel_rendering() {
        let file = ScrapeDropFile::new("api", &set(&["m1", "job:rate:5m"]));
        let rule = &file.metric_relabel_configs[0];

        assert_eq!(rule.source_labels, vec!["__name__".to_string()]);
        assert_eq!(rule.action, "drop");

        let pattern = Regex::new(&rule.regex).unwrap();
        assert!(pattern.is_match("m1"));
        assert!(pattern.is_match("job:rate:5m"));
        assert!(!pattern.is_match("m10"));

        assert!(ScrapeDropFile::new("api", &BTreeSet::new()).metric_relabel_configs.is_empty());
    }

    #[test]
    fn test_remote_write_relabel_rendering() {
        let mut restriction = RemoteWriteRestriction::new("long-term");
        restriction.exclude("api", "m1");
        restriction.exclude("node.exporter", "m2");

        let file = RemoteWriteFile::new(&restriction);
        let rule = &file.write_relabel_configs[0];
        let pattern = Regex::new(&rule.regex).unwrap();

        assert!(pattern.is_match("api;m1"));
        assert!(pattern.is_match("node.exporter;m2"));
        assert!(!pattern.is_match("nodeXexporter;m2"));
        assert!(!pattern.is_match("beta;m1"));
    }

    #[tokio::test]
    async fn test_relabel_file_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = RelabelFileStore::new(dir.path());

        assert!(store.read_drop_list("api").await.unwrap().is_empty());
        store.write_drop_list("api", &set(&["m1"])).await.unwrap();

        let reopened = RelabelFileStore::new(dir.path());
        assert_eq!(reopened.read_drop_list("api").await.unwrap(), set(&["m1"]));

        let contents = std::fs::read_to_string(dir.path().join("scrape/api.yaml")).unwrap();
        assert!(contents.contains("metric_relabel_configs"));
        assert!(!dir.path().join("scrape/api.yaml.tmp").exists());

        let mut restriction = RemoteWriteRestriction::new("long-term");
        restriction.exclude("api", "m2");
        store.write_remote_write_restriction(&restriction).await.unwrap();
        assert_eq!(
            reopened.read_remote_write_restriction("long-term").await.unwrap(),
            restriction
        );
    }

    #[tokio::test]
    async fn test_corrupt_relabel_file_names_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("scrape")).unwrap();
        std::fs::write(dir.path().join("scrape/api.yaml"), "dropped_metrics: [unterminated").unwrap();

        let store = RelabelFileStore::new(dir.path());
        let err = store.read_drop_list("api").await.unwrap_err();

        assert!(err.to_string().starts_with("parsing "));
        assert!(err.to_string().contains("api.yaml"));
    }

    #[test]
    fn test_file_stem() {
        assert_eq!(file_stem("kubernetes-pods"), "kubernetes-pods");
        assert_eq!(file_stem("node_exporter.v2"), "node_exporter.v2");
        assert_eq!(file_stem("a/b c"), "a%2Fb%20c");
        assert_eq!(file_stem(".."), "%2E.");
        assert_ne!(file_stem("a/b"), file_stem("a_b"));
        assert_ne!(file_stem("a%2Fb"), file_stem("a/b"));
    }

    #[tokio::test]
    async fn test_similar_job_names_keep_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = RelabelFileStore::new(dir.path());

        store.write_drop_list("a/b", &set(&["x"])).await.unwrap();
        assert!(store.read_drop_list("a_b").await.unwrap().is_empty());

        store.write_drop_list("a_b", &set(&["y"])).await.unwrap();
        assert_eq!(store.read_drop_list("a/b").await.unwrap(), set(&["x"]));
        assert_eq!(store.read_drop_list("a_b").await.unwrap(), set(&["y"]));
    }

    #[tokio::test]
    async fn test_file_of_another_job_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = RelabelFileStore::new(dir.path());
        store.write_drop_list("beta", &set(&["x"])).await.unwrap();
        std::fs::copy(dir.path().join("scrape/beta.yaml"), dir.path().join("scrape/api.yaml")).unwrap();

        let err = store.read_drop_list("api").await.unwrap_err();
        assert!(matches!(err, tcm_core::Error::Store(_)));
        assert!(err.to_string().contains("\"beta\""));

        let mut restriction = RemoteWriteRestriction::new("long-term");
        restriction.exclude("api", "m1");
        store.write_remote_write_restriction(&restriction).await.unwrap();
        std::fs::copy(
            dir.path().join("remote_write/long-term.yaml"),
            dir.path().join("remote_write/archive.yaml"),
        )
        .unwrap();
        assert!(store.read_remote_write_restriction("archive").await.is_err());
    }
}
