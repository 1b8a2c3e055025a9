//! 出力先

use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::ScraperError;
use crate::record::PlanRecord;

/// レコード列の出力先（1回の実行で1度だけ呼ばれる）
pub trait RecordSink: Send + Sync {
    fn write(&self, records: &[PlanRecord]) -> Result<(), ScraperError>;
}

/// JSON配列としてファイルに書き出す
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    path: PathBuf,
}

impl JsonFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RecordSink for JsonFileSink {
    fn write(&self, records: &[PlanRecord]) -> Result<(), ScraperError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(records)?;

        // 一時ファイルに書いてから置き換える
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| ScraperError::Sink(format!("{}: {}", self.path.display(), e)))?;

        info!("Wrote {} records to {}", records.len(), self.path.display());
        Ok(())
    }
}
