use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub base_dir: PathBuf,
}

impl AppPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn config_dir(&self) -> PathBuf {
        self.base_dir.join("config")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.config_dir().join("settings.json")
    }

    pub fn replicate_token_path(&self) -> PathBuf {
        self.config_dir().join("replicate_token.txt")
    }

    /// Downloaded originals, named `<image_id><ext>`.
    pub fn temp_dir(&self) -> PathBuf {
        self.base_dir.join("temp")
    }

    /// Enhanced/optimized outputs, named `enhanced_<image_id>.<ext>`.
    pub fn output_dir(&self) -> PathBuf {
        self.base_dir.join("output")
    }

    /// Reserved for the screenshot collaborator's before/after captures.
    pub fn screenshots_dir(&self) -> PathBuf {
        self.output_dir().join("screenshots")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    pub fn scan_logs_dir(&self) -> PathBuf {
        self.logs_dir().join("scans")
    }

    pub fn job_logs_dir(&self) -> PathBuf {
        self.logs_dir().join("jobs")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.config_dir())?;
        std::fs::create_dir_all(self.temp_dir())?;
        std::fs::create_dir_all(self.output_dir())?;
        std::fs::create_dir_all(self.screenshots_dir())?;
        std::fs::create_dir_all(self.logs_dir())?;
        std::fs::create_dir_all(self.scan_logs_dir())?;
        std::fs::create_dir_all(self.job_logs_dir())?;
        Ok(())
    }
}
