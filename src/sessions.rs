use crate::jobs::JobStore;
use crate::paths::AppPaths;
use crate::scrape::{self, ImageRecord};
use crate::{config::Settings, optimizer, EngineError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use url::Url;

/// One end-to-end pass over a target page: the originating URL plus the
/// downloaded images, in discovery order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSession {
    pub id: String,
    pub url: String,
    pub created_at_ms: i64,
    pub images: Vec<ImageRecord>,
}

/// Session storage seam. The in-memory implementation is all this needs for
/// now; a persistent one can slot in without touching the scan pipeline.
pub trait ScanStore: Send + Sync {
    fn put(&self, session: ScanSession) -> Result<()>;
    fn get(&self, scan_id: &str) -> Result<Option<ScanSession>>;
    fn list(&self) -> Result<Vec<ScanSession>>;
    fn clear(&self) -> Result<usize>;
}

#[derive(Default)]
pub struct MemoryScanStore {
    inner: Mutex<HashMap<String, ScanSession>>,
}

impl MemoryScanStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ScanStore for MemoryScanStore {
    fn put(&self, session: ScanSession) -> Result<()> {
        let mut inner = self.inner.lock().expect("scan store lock poisoned");
        inner.insert(session.id.clone(), session);
        Ok(())
    }

    fn get(&self, scan_id: &str) -> Result<Option<ScanSession>> {
        let inner = self.inner.lock().expect("scan store lock poisoned");
        Ok(inner.get(scan_id).cloned())
    }

    fn list(&self) -> Result<Vec<ScanSession>> {
        let inner = self.inner.lock().expect("scan store lock poisoned");
        let mut sessions: Vec<ScanSession> = inner.values().cloned().collect();
        sessions.sort_by(|a, b| a.created_at_ms.cmp(&b.created_at_ms));
        Ok(sessions)
    }

    fn clear(&self) -> Result<usize> {
        let mut inner = self.inner.lock().expect("scan store lock poisoned");
        let removed = inner.len();
        inner.clear();
        Ok(removed)
    }
}

/// Deterministic per target URL: re-scanning a page replaces its session.
/// 48 bits of SHA-256 rather than the handful of decimal digits a narrow
/// numeric hash would give.
pub fn scan_session_id(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    let digest = hasher.finalize();
    format!("scan_{}", &hex::encode(digest)[..12])
}

pub fn normalize_target_url(value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(EngineError::InvalidReference("empty URL provided".to_string()));
    }
    let parsed = Url::parse(trimmed)
        .map_err(|_| EngineError::InvalidReference(format!("invalid URL: {trimmed}")))?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => {
            return Err(EngineError::InvalidReference(format!(
                "unsupported URL scheme: {other}"
            )));
        }
    }
    if parsed.host_str().is_none() {
        return Err(EngineError::InvalidReference(format!(
            "URL is missing host: {trimmed}"
        )));
    }
    Ok(trimmed.to_string())
}

/// Runs extraction and download against a freshly validated target URL and
/// stores the resulting session. Page-fetch failure aborts the scan;
/// per-image failures are logged to the scan's JSONL log and the affected
/// images are simply omitted.
pub fn start_scan(
    paths: &AppPaths,
    store: &dyn ScanStore,
    settings: &Settings,
    url: &str,
) -> Result<ScanSession> {
    paths.ensure_dirs()?;
    let url = normalize_target_url(url)?;
    let scan_id = scan_session_id(&url);

    let agent = scrape::build_http_agent(settings.request_timeout_secs);
    let html = scrape::fetch_page(&agent, &url)?;
    let discovered = scrape::extract_images(&html, &url)?;

    let log_path = paths.scan_logs_dir().join(format!("{scan_id}.jsonl"));
    let images = scrape::download_all(
        &agent,
        &paths.temp_dir(),
        discovered,
        |level, event, data| append_log_line(&log_path, &scan_id, level, event, data),
    )?;

    let session = ScanSession {
        id: scan_id,
        url,
        created_at_ms: now_ms(),
        images,
    };
    store.put(session.clone())?;
    Ok(session)
}

/// Pure lookup; an unknown id is `None`, never a failure.
pub fn get_scan(store: &dyn ScanStore, scan_id: &str) -> Result<Option<ScanSession>> {
    store.get(scan_id)
}

/// Locates a downloaded image by id across all stored sessions.
pub fn find_image(store: &dyn ScanStore, image_id: &str) -> Result<Option<ImageRecord>> {
    for session in store.list()? {
        if let Some(record) = session.images.iter().find(|img| img.id == image_id) {
            return Ok(Some(record.clone()));
        }
    }
    Ok(None)
}

/// Original URL -> enhanced output path, for every image of the scan that has
/// an enhanced output on disk. This map is the screenshot collaborator's
/// image-replacement contract.
pub fn image_replacements(
    paths: &AppPaths,
    store: &dyn ScanStore,
    scan_id: &str,
) -> Result<HashMap<String, PathBuf>> {
    let session = store
        .get(scan_id)?
        .ok_or_else(|| EngineError::NotFound(format!("scan {scan_id}")))?;

    let mut replacements = HashMap::new();
    for image in &session.images {
        if let Some(enhanced) = optimizer::find_enhanced_output(paths, &image.id) {
            replacements.insert(image.original_url.clone(), enhanced);
        }
    }
    Ok(replacements)
}

#[derive(Debug, Clone, Serialize)]
pub struct ClearSummary {
    pub removed_temp_files: usize,
    pub removed_output_files: usize,
    pub removed_scans: usize,
    pub removed_jobs: usize,
}

/// Bulk reset: scratch originals, optimized outputs, and both stores.
pub fn clear_all(
    paths: &AppPaths,
    scan_store: &dyn ScanStore,
    job_store: &dyn JobStore,
) -> Result<ClearSummary> {
    let removed_temp_files = clear_dir_files(&paths.temp_dir())?;
    let removed_output_files = clear_dir_files(&paths.output_dir())?;
    let removed_scans = scan_store.clear()?;
    let removed_jobs = job_store.clear()?;
    Ok(ClearSummary {
        removed_temp_files,
        removed_output_files,
        removed_scans,
        removed_jobs,
    })
}

fn clear_dir_files(dir: &Path) -> Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }
    let mut removed = 0_usize;
    for entry in std::fs::read_dir(dir)? {
        let entry = match entry {
            Ok(v) => v,
            Err(_) => continue,
        };
        let path = entry.path();
        if path.is_file() && std::fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

fn append_log_line(
    path: &Path,
    scan_id: &str,
    level: &str,
    event: &str,
    data: serde_json::Value,
) -> Result<()> {
    let line = serde_json::json!({
        "ts_ms": now_ms(),
        "scan_id": scan_id,
        "level": level,
        "event": event,
        "data": data
    })
    .to_string();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?
        .write_all(format!("{line}\n").as_bytes())?;
    Ok(())
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scrape::SourceKind;

    fn record(id: &str, url: &str, local_path: Option<PathBuf>) -> ImageRecord {
        ImageRecord {
            id: id.to_string(),
            original_url: url.to_string(),
            local_path,
            width: None,
            height: None,
            file_size: None,
            alt_text: String::new(),
            source_element: SourceKind::Img,
        }
    }

    fn session(id: &str, url: &str, images: Vec<ImageRecord>) -> ScanSession {
        ScanSession {
            id: id.to_string(),
            url: url.to_string(),
            created_at_ms: now_ms(),
            images,
        }
    }

    #[test]
    fn scan_session_id_is_deterministic_and_prefixed() {
        let a = scan_session_id("https://x.test/page");
        let b = scan_session_id("https://x.test/page");
        let c = scan_session_id("https://x.test/other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("scan_"));
        assert_eq!(a.len(), "scan_".len() + 12);
    }

    #[test]
    fn normalize_target_url_allows_http_https_only() {
        assert!(normalize_target_url("https://example.com").is_ok());
        assert!(normalize_target_url("http://example.com").is_ok());
        assert!(normalize_target_url("ftp://example.com").is_err());
        assert!(normalize_target_url("").is_err());
        assert!(normalize_target_url("not a url").is_err());
    }

    #[test]
    fn unknown_scan_lookup_is_none_not_a_failure() {
        let store = MemoryScanStore::new();
        let found = get_scan(&store, "scan_000000000000").expect("lookup");
        assert!(found.is_none());
    }

    #[test]
    fn store_put_get_and_replace_by_id() {
        let store = MemoryScanStore::new();
        store
            .put(session("scan_1", "https://x.test/a", vec![record("img1", "https://x.test/1.png", None)]))
            .expect("put");
        store
            .put(session("scan_1", "https://x.test/a", vec![]))
            .expect("replace");

        let loaded = store.get("scan_1").expect("get").expect("present");
        assert!(loaded.images.is_empty(), "later put replaces the session");
    }

    #[test]
    fn find_image_searches_across_sessions() {
        let store = MemoryScanStore::new();
        store
            .put(session(
                "scan_a",
                "https://a.test/",
                vec![record("aaa111", "https://a.test/1.png", Some(PathBuf::from("/tmp/aaa111.png")))],
            ))
            .expect("put a");
        store
            .put(session(
                "scan_b",
                "https://b.test/",
                vec![record("bbb222", "https://b.test/2.jpg", None)],
            ))
            .expect("put b");

        let found = find_image(&store, "bbb222").expect("find").expect("present");
        assert_eq!(found.original_url, "https://b.test/2.jpg");
        assert!(find_image(&store, "zzz999").expect("find").is_none());
    }

    #[test]
    fn clear_all_removes_files_and_store_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        paths.ensure_dirs().expect("ensure dirs");

        std::fs::write(paths.temp_dir().join("abc123.png"), b"x").expect("temp file");
        std::fs::write(paths.output_dir().join("enhanced_abc123.webp"), b"y").expect("output file");

        let scan_store = MemoryScanStore::new();
        scan_store
            .put(session("scan_1", "https://x.test/", vec![]))
            .expect("put");
        let job_store = crate::jobs::MemoryJobStore::new();

        let summary = clear_all(&paths, &scan_store, &job_store).expect("clear");
        assert_eq!(summary.removed_temp_files, 1);
        assert_eq!(summary.removed_output_files, 1);
        assert_eq!(summary.removed_scans, 1);
        assert_eq!(summary.removed_jobs, 0);
        assert!(scan_store.list().expect("list").is_empty());
        // The screenshots subdirectory survives a clear.
        assert!(paths.screenshots_dir().exists());
    }

    #[test]
    fn image_replacements_maps_only_enhanced_images() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        paths.ensure_dirs().expect("ensure dirs");

        let store = MemoryScanStore::new();
        store
            .put(session(
                "scan_1",
                "https://x.test/",
                vec![
                    record("hasout", "https://x.test/1.png", Some(PathBuf::from("/tmp/hasout.png"))),
                    record("noout", "https://x.test/2.png", Some(PathBuf::from("/tmp/noout.png"))),
                ],
            ))
            .expect("put");

        let enhanced = paths.output_dir().join("enhanced_hasout.webp");
        std::fs::write(&enhanced, b"img").expect("enhanced file");

        let map = image_replacements(&paths, &store, "scan_1").expect("replacements");
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("https://x.test/1.png"), Some(&enhanced));

        assert!(matches!(
            image_replacements(&paths, &store, "scan_missing"),
            Err(EngineError::NotFound(_))
        ));
    }
}
