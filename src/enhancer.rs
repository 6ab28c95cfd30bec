use crate::config::{self, Settings};
use crate::paths::AppPaths;
use crate::scrape;
use crate::{EngineError, Result};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::Path;
use std::time::Duration;

const REPLICATE_PREDICTIONS_URL: &str = "https://api.replicate.com/v1/predictions";
const POLL_INTERVAL_MS: u64 = 1_000;
const MAX_POLL_ATTEMPTS: usize = 120;
const OUTPUT_DOWNLOAD_TIMEOUT_SECS: u64 = 60;

/// A black-box function from a local image file to enhanced image bytes.
/// Provider-side rate limiting and retries are the provider's concern; the
/// pipeline does not retry on its behalf.
pub trait Enhancer: Send + Sync {
    fn enhance(&self, image_path: &Path, scale: u32) -> Result<Vec<u8>>;
}

/// Selects the enhancement backend from configuration.
pub fn from_settings(paths: &AppPaths, settings: &Settings) -> Result<Box<dyn Enhancer>> {
    match settings.provider.as_str() {
        "replicate" => {
            let token = config::replicate_api_token(paths)?.ok_or_else(|| {
                EngineError::Config(format!(
                    "{} is not set; configure a Replicate API token",
                    config::REPLICATE_TOKEN_ENV_VAR
                ))
            })?;
            Ok(Box::new(ReplicateEnhancer::new(
                token,
                settings.model_version.clone(),
                settings.request_timeout_secs,
            )))
        }
        "passthrough" => Ok(Box::new(PassthroughEnhancer)),
        other => Err(EngineError::Config(format!(
            "unknown enhancement provider: {other}"
        ))),
    }
}

/// Returns the input unchanged. Lets the rest of the pipeline run locally
/// without a provider token.
pub struct PassthroughEnhancer;

impl Enhancer for PassthroughEnhancer {
    fn enhance(&self, image_path: &Path, _scale: u32) -> Result<Vec<u8>> {
        Ok(std::fs::read(image_path)?)
    }
}

/// Real-ESRGAN super-resolution via Replicate's predictions API: submit the
/// image as a base64 data URI, poll the prediction to a terminal state, then
/// download the output.
pub struct ReplicateEnhancer {
    agent: ureq::Agent,
    token: String,
    model_version: String,
}

#[derive(Debug, Serialize)]
struct PredictionRequest<'a> {
    version: &'a str,
    input: PredictionInput<'a>,
}

#[derive(Debug, Serialize)]
struct PredictionInput<'a> {
    image: &'a str,
    scale: u32,
    face_enhance: bool,
}

#[derive(Debug, Deserialize)]
struct Prediction {
    id: String,
    status: String,
    #[serde(default)]
    output: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

impl ReplicateEnhancer {
    pub fn new(token: String, model_version: String, timeout_secs: u64) -> Self {
        Self {
            agent: scrape::build_http_agent(timeout_secs.max(OUTPUT_DOWNLOAD_TIMEOUT_SECS)),
            token,
            model_version,
        }
    }

    fn auth_header(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn create_prediction(&self, body: &str) -> Result<Prediction> {
        let auth = self.auth_header();
        let mut response = self
            .agent
            .post(REPLICATE_PREDICTIONS_URL)
            .header("Authorization", auth.as_str())
            .header("Content-Type", "application/json")
            .send(body)
            .map_err(|e| EngineError::Enhance(format!("prediction request failed: {e}")))?;

        let status = response.status().as_u16();
        let mut buf = Vec::new();
        response
            .body_mut()
            .as_reader()
            .read_to_end(&mut buf)
            .map_err(|e| EngineError::Enhance(format!("prediction response unreadable: {e}")))?;
        if status >= 400 {
            return Err(EngineError::Enhance(format!(
                "prediction request returned http {status}: {}",
                String::from_utf8_lossy(&buf)
            )));
        }
        Ok(serde_json::from_slice(&buf)?)
    }

    fn get_prediction(&self, prediction_id: &str) -> Result<Prediction> {
        let url = format!("{REPLICATE_PREDICTIONS_URL}/{prediction_id}");
        let auth = self.auth_header();
        let mut response = self
            .agent
            .get(url.as_str())
            .header("Authorization", auth.as_str())
            .call()
            .map_err(|e| EngineError::Enhance(format!("prediction poll failed: {e}")))?;

        let status = response.status().as_u16();
        let mut buf = Vec::new();
        response
            .body_mut()
            .as_reader()
            .read_to_end(&mut buf)
            .map_err(|e| EngineError::Enhance(format!("prediction response unreadable: {e}")))?;
        if status >= 400 {
            return Err(EngineError::Enhance(format!(
                "prediction poll returned http {status}"
            )));
        }
        Ok(serde_json::from_slice(&buf)?)
    }

    fn fetch_output(&self, url: &str) -> Result<Vec<u8>> {
        let mut response = self
            .agent
            .get(url)
            .call()
            .map_err(|e| EngineError::Enhance(format!("output download failed: {e}")))?;

        let status = response.status().as_u16();
        if status >= 400 {
            return Err(EngineError::Enhance(format!(
                "output download returned http {status}"
            )));
        }
        let mut data = Vec::new();
        response
            .body_mut()
            .as_reader()
            .read_to_end(&mut data)
            .map_err(|e| EngineError::Enhance(format!("output download unreadable: {e}")))?;
        Ok(data)
    }
}

impl Enhancer for ReplicateEnhancer {
    fn enhance(&self, image_path: &Path, scale: u32) -> Result<Vec<u8>> {
        if !image_path.exists() {
            return Err(EngineError::NotFound(format!(
                "image not found: {}",
                image_path.to_string_lossy()
            )));
        }

        let data = std::fs::read(image_path)?;
        let data_uri = format!(
            "data:{};base64,{}",
            mime_for_path(image_path),
            base64::engine::general_purpose::STANDARD.encode(&data)
        );
        let body = serde_json::to_string(&PredictionRequest {
            version: &self.model_version,
            input: PredictionInput {
                image: &data_uri,
                scale,
                face_enhance: false,
            },
        })?;

        let mut prediction = self.create_prediction(&body)?;
        let mut attempts = 0_usize;
        while !is_terminal_status(&prediction.status) {
            attempts += 1;
            if attempts > MAX_POLL_ATTEMPTS {
                return Err(EngineError::Enhance(format!(
                    "prediction {} did not finish in time",
                    prediction.id
                )));
            }
            std::thread::sleep(Duration::from_millis(POLL_INTERVAL_MS));
            prediction = self.get_prediction(&prediction.id)?;
        }

        if prediction.status != "succeeded" {
            let reason = prediction
                .error
                .map(|v| v.to_string())
                .unwrap_or_else(|| "no error detail".to_string());
            return Err(EngineError::Enhance(format!(
                "prediction {} ended as {}: {reason}",
                prediction.id, prediction.status
            )));
        }

        let output_url = output_url(prediction.output)?;
        self.fetch_output(&output_url)
    }
}

fn is_terminal_status(status: &str) -> bool {
    matches!(status, "succeeded" | "failed" | "canceled")
}

/// The output is either a plain URL string or a list of URLs; take the first.
fn output_url(output: Option<serde_json::Value>) -> Result<String> {
    match output {
        Some(serde_json::Value::String(url)) => Ok(url),
        Some(serde_json::Value::Array(values)) => values
            .into_iter()
            .find_map(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| EngineError::Enhance("prediction output list held no URL".to_string())),
        _ => Err(EngineError::Enhance(
            "prediction returned no output".to_string(),
        )),
    }
}

fn mime_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|v| v.to_str())
        .map(|v| v.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        _ => "image/jpeg",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_returns_input_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("sample.png");
        std::fs::write(&input, b"raw image bytes").expect("write");

        let out = PassthroughEnhancer.enhance(&input, 2).expect("enhance");
        assert_eq!(out, b"raw image bytes");
    }

    #[test]
    fn provider_selection_follows_settings() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());

        let mut settings = Settings::default();
        settings.provider = "passthrough".to_string();
        assert!(from_settings(&paths, &settings).is_ok());

        settings.provider = "does-not-exist".to_string();
        assert!(matches!(
            from_settings(&paths, &settings),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn replicate_without_token_is_a_config_error() {
        std::env::remove_var(config::REPLICATE_TOKEN_ENV_VAR);
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());

        let settings = Settings::default();
        assert!(matches!(
            from_settings(&paths, &settings),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn output_url_accepts_string_and_list_forms() {
        let direct = output_url(Some(serde_json::json!("https://cdn.test/out.png")));
        assert_eq!(direct.expect("direct"), "https://cdn.test/out.png");

        let listed = output_url(Some(serde_json::json!([
            "https://cdn.test/first.png",
            "https://cdn.test/second.png"
        ])));
        assert_eq!(listed.expect("listed"), "https://cdn.test/first.png");

        assert!(output_url(None).is_err());
        assert!(output_url(Some(serde_json::json!(42))).is_err());
    }

    #[test]
    fn mime_follows_extension_with_jpeg_fallback() {
        assert_eq!(mime_for_path(Path::new("a.png")), "image/png");
        assert_eq!(mime_for_path(Path::new("a.WEBP")), "image/webp");
        assert_eq!(mime_for_path(Path::new("a.jpg")), "image/jpeg");
        assert_eq!(mime_for_path(Path::new("noext")), "image/jpeg");
    }
}
