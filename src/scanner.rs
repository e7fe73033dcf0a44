//! Selects the auth and fail2ban logs (plain or rotated/gzipped) that can
//! contain lines from the report month, and decodes them to text.

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDateTime};
use flate2::read::GzDecoder;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};

use crate::matcher::LogKind;

/// A selected log file, already decompressed and split into lines
#[derive(Debug, Clone)]
pub struct LogSource {
    pub path: PathBuf,
    pub kind: LogKind,
    pub lines: Vec<String>,
}

/// Scanner over a single log directory
pub struct LogCorpusScanner {
    log_dir: PathBuf,
    cutoff: NaiveDateTime,
}

impl LogCorpusScanner {
    /// Files modified at or before `cutoff` (local time) are ignored
    pub fn new<P: AsRef<Path>>(log_dir: P, cutoff: NaiveDateTime) -> Self {
        Self {
            log_dir: log_dir.as_ref().to_path_buf(),
            cutoff,
        }
    }

    /// Eligible files in name order, without reading them
    pub fn eligible_files(&self) -> Result<Vec<(PathBuf, LogKind)>> {
        let entries = fs::read_dir(&self.log_dir).with_context(|| {
            format!("Failed to read log directory: {}", self.log_dir.display())
        })?;

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();

            let Some(kind) = LogKind::from_file_name(&name) else {
                continue;
            };

            let modified = match entry.metadata().and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(e) => {
                    warn!("Cannot stat {}: {}", entry.path().display(), e);
                    continue;
                }
            };

            if !is_recent(modified, self.cutoff) {
                debug!("Skipping {}: last modified before {}", name, self.cutoff);
                continue;
            }

            files.push((entry.path(), kind));
        }

        files.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(files)
    }

    /// Read every eligible file. Unreadable individual files are skipped.
    pub fn scan(&self) -> Result<Vec<LogSource>> {
        let files = self.eligible_files()?;
        let mut sources = Vec::with_capacity(files.len());

        for (path, kind) in files {
            match read_lines(&path) {
                Ok(lines) => {
                    info!("Read {} lines from {} ({})", lines.len(), path.display(), kind);
                    sources.push(LogSource { path, kind, lines });
                }
                Err(e) => warn!("Skipping {}: {:#}", path.display(), e),
            }
        }

        Ok(sources)
    }
}

fn is_recent(modified: SystemTime, cutoff: NaiveDateTime) -> bool {
    DateTime::<Local>::from(modified).naive_local() > cutoff
}

/// Read a log file as text lines, gunzipping `.gz` files
pub fn read_lines(path: &Path) -> Result<Vec<String>> {
    let raw = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;

    let bytes = if path.extension().is_some_and(|ext| ext == "gz") {
        let mut decoded = Vec::new();
        GzDecoder::new(raw.as_slice())
            .read_to_end(&mut decoded)
            .with_context(|| format!("Failed to decompress {}", path.display()))?;
        decoded
    } else {
        raw
    };

    Ok(String::from_utf8_lossy(&bytes)
        .lines()
        .map(str::to_string)
        .collect())
}
