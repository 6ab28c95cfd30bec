use crate::config::Settings;
use crate::paths::AppPaths;
use crate::{EngineError, Result};
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use serde::Serialize;
use std::io::Cursor;
use std::path::{Path, PathBuf};

pub const ENHANCED_PREFIX: &str = "enhanced_";

const ENHANCED_LOOKUP_EXTS: &[&str] = &[".png", ".webp", ".jpg", ".jpeg"];

#[derive(Debug, Clone, Serialize)]
pub struct OptimizationResult {
    pub output_path: PathBuf,
    pub original_size: u64,
    pub optimized_size: u64,
    pub original_dimensions: (u32, u32),
    pub optimized_dimensions: (u32, u32),
}

impl OptimizationResult {
    pub fn size_reduction_percent(&self) -> f64 {
        if self.original_size == 0 {
            return 0.0;
        }
        (1.0 - self.optimized_size as f64 / self.original_size as f64) * 100.0
    }
}

/// Re-encodes images for web delivery. Quality applies to JPEG output; the
/// WebP encoder is lossless.
#[derive(Debug, Clone)]
pub struct Optimizer {
    output_format: String,
    quality: u8,
    max_dimension: Option<u32>,
}

impl Optimizer {
    pub fn new(output_format: &str, quality: u8, max_dimension: Option<u32>) -> Self {
        Self {
            output_format: output_format.to_ascii_lowercase(),
            quality,
            max_dimension,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            &settings.output_format,
            settings.output_quality,
            settings.max_dimension,
        )
    }

    pub fn optimize_bytes(
        &self,
        paths: &AppPaths,
        data: &[u8],
        output_name: &str,
    ) -> Result<OptimizationResult> {
        let original_size = data.len() as u64;
        let img = image::load_from_memory(data)?;
        self.encode(paths, img, original_size, output_name)
    }

    pub fn optimize_file(
        &self,
        paths: &AppPaths,
        input: &Path,
        output_name: Option<&str>,
    ) -> Result<OptimizationResult> {
        let data = std::fs::read(input)?;
        let name = match output_name {
            Some(v) => v.to_string(),
            None => input
                .file_stem()
                .and_then(|v| v.to_str())
                .unwrap_or("image")
                .to_string(),
        };
        self.optimize_bytes(paths, &data, &name)
    }

    fn encode(
        &self,
        paths: &AppPaths,
        img: DynamicImage,
        original_size: u64,
        output_name: &str,
    ) -> Result<OptimizationResult> {
        let original_dimensions = (img.width(), img.height());

        let img = match self.max_dimension {
            Some(max) if img.width() > max || img.height() > max => {
                img.resize(max, max, FilterType::Lanczos3)
            }
            _ => img,
        };
        let optimized_dimensions = (img.width(), img.height());

        let mut encoded: Vec<u8> = Vec::new();
        match self.output_format.as_str() {
            "jpg" | "jpeg" => {
                // JPEG has no alpha channel.
                let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
                let encoder =
                    image::codecs::jpeg::JpegEncoder::new_with_quality(&mut encoded, self.quality);
                rgb.write_with_encoder(encoder)?;
            }
            "webp" => {
                let rgba = DynamicImage::ImageRgba8(img.to_rgba8());
                let encoder = image::codecs::webp::WebPEncoder::new_lossless(&mut encoded);
                rgba.write_with_encoder(encoder)?;
            }
            "png" => {
                img.write_to(&mut Cursor::new(&mut encoded), ImageFormat::Png)?;
            }
            other => {
                return Err(EngineError::Config(format!(
                    "unsupported output format: {other}"
                )));
            }
        }

        std::fs::create_dir_all(paths.output_dir())?;
        let ext = output_extension(&self.output_format);
        let output_path = paths.output_dir().join(format!("{output_name}.{ext}"));
        std::fs::write(&output_path, &encoded)?;

        Ok(OptimizationResult {
            output_path,
            original_size,
            optimized_size: encoded.len() as u64,
            original_dimensions,
            optimized_dimensions,
        })
    }
}

fn output_extension(format: &str) -> &'static str {
    match format {
        "jpg" | "jpeg" => "jpg",
        "png" => "png",
        _ => "webp",
    }
}

pub fn enhanced_output_name(image_id: &str) -> String {
    format!("{ENHANCED_PREFIX}{image_id}")
}

#[derive(Debug, Clone, Serialize)]
pub struct EnhancedOutput {
    pub filename: String,
    pub path: PathBuf,
    pub size: u64,
}

/// Lists every enhanced output currently on disk.
pub fn list_enhanced_outputs(paths: &AppPaths) -> Result<Vec<EnhancedOutput>> {
    let dir = paths.output_dir();
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut out: Vec<EnhancedOutput> = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = match entry {
            Ok(v) => v,
            Err(_) => continue,
        };
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|v| v.to_str()) else {
            continue;
        };
        if !name.starts_with(ENHANCED_PREFIX) {
            continue;
        }
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        out.push(EnhancedOutput {
            filename: name.to_string(),
            path,
            size,
        });
    }
    out.sort_by(|a, b| a.filename.cmp(&b.filename));
    Ok(out)
}

/// Locates an enhanced output by image id across the known extensions.
pub fn find_enhanced_output(paths: &AppPaths, image_id: &str) -> Option<PathBuf> {
    for ext in ENHANCED_LOOKUP_EXTS {
        let candidate = paths
            .output_dir()
            .join(format!("{ENHANCED_PREFIX}{image_id}{ext}"));
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}
