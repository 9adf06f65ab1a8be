//! Coverage collection behind a swappable trait.
//!
//! The shipped implementation shells out to `gcovr` in JSON mode over the
//! build directory of the instrumented compiler and joins its relative paths
//! with the configured source root.

use std::{
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use anyhow::Context;
use derive_new::new as New;
use serde::Deserialize;
use tracing::debug;

use super::{BasisPoints, LineId};

/// The lines one execution covered, plus the collector's total figure when the
/// tool reports one.
#[derive(Debug, Clone, Default)]
pub struct CoverageSnapshot {
    pub lines: Vec<LineId>,
    pub total: Option<BasisPoints>,
}

pub trait CoverageCollector {
    /// Collects coverage accumulated in `build_dir` since the last reset.
    fn collect(&self, build_dir: &Path) -> anyhow::Result<CoverageSnapshot>;
}

/// Runs `gcovr --json -` and reads per-line execution counts.
#[derive(Debug, New)]
pub struct GcovCollector {
    gcovr: String,
    source_root: PathBuf,
}

impl CoverageCollector for GcovCollector {
    fn collect(&self, build_dir: &Path) -> anyhow::Result<CoverageSnapshot> {
        let output = Command::new(&self.gcovr)
            .args(["--json", "-"])
            .current_dir(build_dir)
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .context("Spawning gcovr")?;
        anyhow::ensure!(
            output.status.success(),
            "gcovr failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );

        let report: GcovrReport =
            serde_json::from_slice(&output.stdout).context("Parsing gcovr JSON report")?;
        Ok(self.snapshot_from(report))
    }
}

impl GcovCollector {
    fn snapshot_from(&self, report: GcovrReport) -> CoverageSnapshot {
        let mut lines = Vec::new();
        let mut covered = 0u64;
        let mut total = 0u64;
        for file in report.files {
            let path = PathBuf::from(&file.file);
            let path = if path.is_absolute() {
                path
            } else {
                self.source_root.join(path)
            };
            for line in file.lines {
                total += 1;
                if line.count > 0 {
                    covered += 1;
                    lines.push(LineId::new(path.clone(), line.line_number));
                }
            }
        }
        debug!(covered, total, "Coverage snapshot collected");
        CoverageSnapshot {
            lines,
            total: (total > 0).then(|| BasisPoints::from_counts(covered, total)),
        }
    }
}

// Only the fields we use; the gcovr report carries plenty more.
#[derive(Debug, Deserialize)]
struct GcovrReport {
    #[serde(default)]
    files: Vec<GcovrFile>,
}

#[derive(Debug, Deserialize)]
struct GcovrFile {
    file: String,
    #[serde(default)]
    lines: Vec<GcovrLine>,
}

#[derive(Debug, Deserialize)]
struct GcovrLine {
    line_number: u32,
    count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_joins_relative_paths_and_counts() {
        let report: GcovrReport = serde_json::from_str(
            r#"{
  "gcovr/format_version": "0.6",
  "files": [
    {
      "file": "t.c",
      "lines": [
        {"line_number": 10, "count": 2, "branches": []},
        {"line_number": 11, "count": 0, "branches": []}
      ]
    },
    {
      "file": "/abs/u.c",
      "lines": [
        {"line_number": 3, "count": 1, "branches": []}
      ]
    }
  ]
}"#,
        )
        .unwrap();

        let collector = GcovCollector::new("gcovr".to_owned(), PathBuf::from("/src"));
        let snapshot = collector.snapshot_from(report);
        assert_eq!(
            snapshot.lines,
            vec![LineId::new("/src/t.c", 10), LineId::new("/abs/u.c", 3)]
        );
        assert_eq!(snapshot.total, Some(BasisPoints::from_counts(2, 3)));
    }
}
