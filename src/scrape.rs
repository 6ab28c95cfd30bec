use crate::{EngineError, Result};
use regex::Regex;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (compatible; ImageLiftBot/1.0)";

/// Accepted image extensions, matched case-insensitively against the resolved
/// URL path. Extension-less or content-type-only references are dropped on
/// purpose: precision over recall.
const SUPPORTED_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".webp", ".gif", ".bmp"];

/// Primary source attribute first, then lazy-load aliases.
const IMG_SRC_ATTRS: &[&str] = &["src", "data-src", "data-lazy-src"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    Img,
    ResponsiveSource,
    BackgroundImage,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Img => "img",
            SourceKind::ResponsiveSource => "responsive-source",
            SourceKind::BackgroundImage => "background-image",
        }
    }
}

/// A raw reference as it appeared in markup/CSS. Not retained after
/// resolution.
#[derive(Debug, Clone)]
pub struct ImageReference {
    pub raw: String,
    pub kind: SourceKind,
    pub alt_text: String,
}

/// The durable image entity. This exact field shape is the contract consumed
/// by the enhancement and screenshot collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: String,
    pub original_url: String,
    pub local_path: Option<PathBuf>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub file_size: Option<u64>,
    pub alt_text: String,
    pub source_element: SourceKind,
}

pub fn build_http_agent(timeout_secs: u64) -> ureq::Agent {
    let mut config = ureq::Agent::config_builder();
    config = config
        .http_status_as_error(false)
        .timeout_global(Some(Duration::from_secs(timeout_secs)))
        .user_agent(DEFAULT_USER_AGENT);
    config.build().into()
}

/// Resolves a raw reference against the page base URL (RFC 3986 join).
/// Fragments are stripped; the canonical form is scheme+host+path+query.
pub fn resolve_reference(base_url: &Url, raw: &str) -> Result<Url> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(EngineError::InvalidReference("empty reference".to_string()));
    }
    let lower = raw.to_ascii_lowercase();
    if lower.starts_with("data:") || lower.starts_with("javascript:") || lower.starts_with('#') {
        return Err(EngineError::InvalidReference(raw.to_string()));
    }

    let mut joined = base_url
        .join(raw)
        .map_err(|_| EngineError::InvalidReference(raw.to_string()))?;
    if !matches!(joined.scheme(), "http" | "https") {
        return Err(EngineError::InvalidReference(raw.to_string()));
    }
    joined.set_fragment(None);
    Ok(joined)
}

/// Stable content-addressed id for a canonical URL: SHA-256, first 12 hex
/// characters. Pure function; the same canonical URL always maps to the same
/// id within and across scans.
pub fn image_id(canonical_url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_url.as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)[..12].to_string()
}

fn has_supported_extension(url: &Url) -> bool {
    let path = url.path().to_ascii_lowercase();
    SUPPORTED_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

/// Extension for the local copy, from the canonical URL path. Records built
/// outside the extractor may lack one; those fall back to `.jpg`.
fn file_extension_of(canonical_url: &str) -> &'static str {
    if let Ok(parsed) = Url::parse(canonical_url) {
        let path = parsed.path().to_ascii_lowercase();
        for ext in SUPPORTED_EXTENSIONS {
            if path.ends_with(ext) {
                return ext;
            }
        }
    }
    ".jpg"
}

fn background_url_pattern() -> Regex {
    Regex::new(r#"(?i)background(?:-image)?\s*:\s*url\(\s*["']?([^"')\s]+)["']?\s*\)"#)
        .expect("background url regex")
}

/// Walks the document for raw image references in discovery order: `img`
/// tags, then responsive source sets, then CSS backgrounds (inline `style`
/// attributes and `<style>` blocks).
pub fn collect_references(document: &Html) -> Vec<ImageReference> {
    let selector_img = Selector::parse("img").expect("img selector");
    let selector_source = Selector::parse("source[srcset]").expect("source selector");
    let selector_styled = Selector::parse("[style]").expect("style attribute selector");
    let selector_style_block = Selector::parse("style").expect("style selector");

    let mut out: Vec<ImageReference> = Vec::new();

    for img in document.select(&selector_img) {
        let raw = IMG_SRC_ATTRS.iter().find_map(|attr| {
            img.value()
                .attr(attr)
                .map(str::trim)
                .filter(|v| !v.is_empty())
        });
        let Some(raw) = raw else {
            continue;
        };
        out.push(ImageReference {
            raw: raw.to_string(),
            kind: SourceKind::Img,
            alt_text: img.value().attr("alt").unwrap_or("").trim().to_string(),
        });
    }

    for source in document.select(&selector_source) {
        let Some(srcset) = source.value().attr("srcset") else {
            continue;
        };
        // Each entry is `url [descriptor]`; only the URL token matters.
        for entry in srcset.split(',') {
            let Some(url_token) = entry.split_whitespace().next() else {
                continue;
            };
            out.push(ImageReference {
                raw: url_token.to_string(),
                kind: SourceKind::ResponsiveSource,
                alt_text: String::new(),
            });
        }
    }

    let pattern = background_url_pattern();
    for element in document.select(&selector_styled) {
        let style = element.value().attr("style").unwrap_or("");
        for capture in pattern.captures_iter(style) {
            out.push(ImageReference {
                raw: capture[1].to_string(),
                kind: SourceKind::BackgroundImage,
                alt_text: String::new(),
            });
        }
    }
    for style_block in document.select(&selector_style_block) {
        let css = style_block.text().collect::<String>();
        for capture in pattern.captures_iter(&css) {
            out.push(ImageReference {
                raw: capture[1].to_string(),
                kind: SourceKind::BackgroundImage,
                alt_text: String::new(),
            });
        }
    }

    out
}

/// Resolves, filters and dedupes the document's references into records.
/// Unresolvable references are skipped, never fatal. The first occurrence of
/// a canonical URL wins and keeps its provenance.
pub fn extract_images(html: &str, page_url: &str) -> Result<Vec<ImageRecord>> {
    let base_url = Url::parse(page_url)
        .map_err(|_| EngineError::InvalidReference(page_url.to_string()))?;
    let document = Html::parse_document(html);

    let mut seen: HashSet<String> = HashSet::new();
    let mut records: Vec<ImageRecord> = Vec::new();

    for reference in collect_references(&document) {
        let Ok(resolved) = resolve_reference(&base_url, &reference.raw) else {
            continue;
        };
        if !has_supported_extension(&resolved) {
            continue;
        }
        let canonical = resolved.to_string();
        if !seen.insert(canonical.clone()) {
            continue;
        }
        records.push(ImageRecord {
            id: image_id(&canonical),
            original_url: canonical,
            local_path: None,
            width: None,
            height: None,
            file_size: None,
            alt_text: reference.alt_text,
            source_element: reference.kind,
        });
    }

    Ok(records)
}

/// Fetches the target page. Failure here is fatal to the whole scan.
pub fn fetch_page(agent: &ureq::Agent, url: &str) -> Result<String> {
    let mut response = agent.get(url).call().map_err(|e| EngineError::FetchFailure {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    let status = response.status().as_u16();
    if status >= 400 {
        return Err(EngineError::FetchFailure {
            url: url.to_string(),
            reason: format!("http {status}"),
        });
    }

    let mut buf = Vec::new();
    response
        .body_mut()
        .as_reader()
        .read_to_end(&mut buf)
        .map_err(|e| EngineError::FetchFailure {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn fetch_image_bytes(agent: &ureq::Agent, url: &str) -> Result<Vec<u8>> {
    let mut response = agent.get(url).call().map_err(|e| EngineError::FetchFailure {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    let status = response.status().as_u16();
    if status >= 400 {
        return Err(EngineError::FetchFailure {
            url: url.to_string(),
            reason: format!("http {status}"),
        });
    }

    let mut data = Vec::new();
    response
        .body_mut()
        .as_reader()
        .read_to_end(&mut data)
        .map_err(|e| EngineError::FetchFailure {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
    Ok(data)
}

/// Downloads every record to `temp_dir/<id><ext>` and enriches it with size
/// and pixel dimensions. One image's failure never aborts the batch: failed
/// downloads are logged and excluded from the returned set, and a decode
/// failure only leaves the dimensions absent. A record is pushed into the
/// result only once fully populated.
pub fn download_all<FLog>(
    agent: &ureq::Agent,
    temp_dir: &Path,
    images: Vec<ImageRecord>,
    mut log_line: FLog,
) -> Result<Vec<ImageRecord>>
where
    FLog: FnMut(&str, &str, serde_json::Value) -> Result<()>,
{
    std::fs::create_dir_all(temp_dir)?;

    let mut downloaded: Vec<ImageRecord> = Vec::with_capacity(images.len());
    for mut image in images {
        let data = match fetch_image_bytes(agent, &image.original_url) {
            Ok(v) => v,
            Err(err) => {
                log_line(
                    "warn",
                    "image_download_failed",
                    serde_json::json!({
                        "id": image.id,
                        "url": redact_url_for_log(&image.original_url),
                        "error": err.to_string(),
                    }),
                )?;
                continue;
            }
        };

        let ext = file_extension_of(&image.original_url);
        let local_path = temp_dir.join(format!("{}{}", image.id, ext));
        if let Err(err) = std::fs::write(&local_path, &data) {
            log_line(
                "warn",
                "image_persist_failed",
                serde_json::json!({
                    "id": image.id,
                    "path": local_path.to_string_lossy().to_string(),
                    "error": err.to_string(),
                }),
            )?;
            continue;
        }

        match image::image_dimensions(&local_path) {
            Ok((width, height)) => {
                image.width = Some(width);
                image.height = Some(height);
            }
            Err(err) => {
                log_line(
                    "warn",
                    "image_decode_failed",
                    serde_json::json!({
                        "id": image.id,
                        "error": err.to_string(),
                    }),
                )?;
            }
        }

        image.file_size = Some(data.len() as u64);
        image.local_path = Some(local_path);
        downloaded.push(image);
    }

    Ok(downloaded)
}

pub(crate) fn redact_url_for_log(value: &str) -> String {
    match Url::parse(value) {
        Ok(parsed) => {
            let scheme = parsed.scheme();
            let authority = parsed.host_str().unwrap_or("unknown-host");
            format!("{scheme}://{authority}/...")
        }
        Err(_) => "[invalid-url]".to_string(),
    }
}
