//! First-covering-seed line map and the nearest-covered-line query.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt, fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::debug;

pub mod collect;

/// One source line, identified by canonical (absolute) path and 1-based line
/// number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LineId {
    pub file: PathBuf,
    pub line: u32,
}

impl LineId {
    pub fn new(file: impl Into<PathBuf>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }
}

impl fmt::Display for LineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file.display(), self.line)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoverageMapError {
    #[error("coverage map I/O failure: {0}")]
    Io(#[from] io::Error),
    #[error("coverage map is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("coverage map key {key:?} is not of the form `path:line`")]
    BadKey { key: String },
}

/// Maps every covered line to the first seed observed to cover it.
///
/// First-covering assignments are monotonic: once a line has a seed, later
/// recordings never overwrite it. A per-file sorted index serves the
/// closest-line query; it is kept in one-to-one correspondence with the map.
#[derive(Debug, Default)]
pub struct CoverageMap {
    first_cover: HashMap<LineId, u64>,
    by_file: BTreeMap<PathBuf, BTreeSet<u32>>,
}

impl CoverageMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records lines covered by `seed_id`, returning how many were new.
    pub fn record_lines<I>(&mut self, lines: I, seed_id: u64) -> usize
    where
        I: IntoIterator<Item = LineId>,
    {
        let mut inserted = 0;
        for line in lines {
            if self.first_cover.contains_key(&line) {
                continue;
            }
            self.by_file
                .entry(line.file.clone())
                .or_default()
                .insert(line.line);
            self.first_cover.insert(line, seed_id);
            inserted += 1;
        }
        if inserted > 0 {
            debug!(seed_id, new_lines = inserted, "Coverage map grew");
        }
        inserted
    }

    pub fn seed_for_line(&self, line: &LineId) -> Option<u64> {
        self.first_cover.get(line).copied()
    }

    pub fn is_covered(&self, file: &Path, line: u32) -> bool {
        self.by_file
            .get(file)
            .is_some_and(|lines| lines.contains(&line))
    }

    /// Number of unique covered lines.
    pub fn len(&self) -> usize {
        self.first_cover.len()
    }

    pub fn is_empty(&self) -> bool {
        self.first_cover.is_empty()
    }

    pub fn covered_lines(&self) -> impl Iterator<Item = &LineId> {
        self.first_cover.keys()
    }

    /// Returns the covered line in `file` closest to `target`, with its seed.
    ///
    /// Distance ties prefer the line strictly below `target` (earlier in
    /// source). `None` when no line of `file` is covered at or below
    /// `target`: a line that only exists further down cannot serve as a base,
    /// since reaching it says nothing about the code leading up to the
    /// target.
    pub fn find_closest_covered_line(
        &self,
        file: &Path,
        target: u32,
    ) -> Option<(LineId, u64)> {
        let lines = self.by_file.get(file)?;
        use std::ops::Bound;
        let below = lines.range(..=target).next_back().copied()?;
        let above = lines
            .range((Bound::Excluded(target), Bound::Unbounded))
            .next()
            .copied();

        let chosen = match above {
            Some(above) if above - target < target - below => above,
            _ => below,
        };
        let line = LineId::new(file, chosen);
        let seed = self.seed_for_line(&line)?;
        Some((line, seed))
    }

    /// Serializes the map as a JSON object keyed by `path:line`.
    pub fn save(&self, path: &Path) -> Result<(), CoverageMapError> {
        let entries: BTreeMap<String, u64> = self
            .first_cover
            .iter()
            .map(|(line, &seed)| (line.to_string(), seed))
            .collect();
        fs::write(path, serde_json::to_string_pretty(&entries)?)?;
        Ok(())
    }

    /// Merges a previously saved map into this one. First-covering entries
    /// already present win, so loading the same file twice is idempotent.
    pub fn load(&mut self, path: &Path) -> Result<(), CoverageMapError> {
        let text = fs::read_to_string(path)?;
        let entries: BTreeMap<String, u64> = serde_json::from_str(&text)?;
        for (key, seed) in entries {
            let (file, line) = key
                .rsplit_once(':')
                .ok_or_else(|| CoverageMapError::BadKey { key: key.clone() })?;
            let line: u32 = line
                .parse()
                .map_err(|_| CoverageMapError::BadKey { key: key.clone() })?;
            self.record_lines([LineId::new(file, line)], seed);
        }
        Ok(())
    }
}

/// Total coverage of one collection run, in basis points (1 = 0.01%).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasisPoints(pub u32);

impl BasisPoints {
    pub fn from_counts(covered: u64, total: u64) -> Self {
        if total == 0 {
            return Self(0);
        }
        Self(((covered * 10_000) / total) as u32)
    }
}

impl fmt::Display for BasisPoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}%", self.0 / 100, self.0 % 100)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn map_with(file: &str, lines: &[(u32, u64)]) -> CoverageMap {
        let mut map = CoverageMap::new();
        for &(line, seed) in lines {
            map.record_lines([LineId::new(file, line)], seed);
        }
        map
    }

    #[test]
    fn first_covering_seed_is_stable() {
        let mut map = CoverageMap::new();
        let line = LineId::new("/src/t.c", 10);
        map.record_lines([line.clone()], 1);
        map.record_lines([line.clone()], 2);
        assert_eq!(map.seed_for_line(&line), Some(1));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn closest_line_prefers_earlier_on_tie() {
        let map = map_with("/src/t.c", &[(10, 1), (20, 2), (30, 3)]);

        // 25 is equidistant from 20 and 30; the earlier line wins.
        let (line, seed) = map
            .find_closest_covered_line(Path::new("/src/t.c"), 25)
            .unwrap();
        assert_eq!(line.line, 20);
        assert_eq!(seed, 2);

        // Exact hit.
        let (line, _) = map
            .find_closest_covered_line(Path::new("/src/t.c"), 30)
            .unwrap();
        assert_eq!(line.line, 30);

        // Nothing covered at or below the target: no usable base.
        assert!(
            map.find_closest_covered_line(Path::new("/src/t.c"), 5)
                .is_none()
        );

        // Unknown file.
        assert!(
            map.find_closest_covered_line(Path::new("/src/other.c"), 25)
                .is_none()
        );
    }

    #[test]
    fn closest_line_distance_is_minimal() {
        let map = map_with("/src/t.c", &[(10, 1), (20, 2), (30, 3)]);
        for target in 10..40 {
            let (line, _) = map
                .find_closest_covered_line(Path::new("/src/t.c"), target)
                .unwrap();
            let distance = line.line.abs_diff(target);
            for &covered in &[10u32, 20, 30] {
                assert!(distance <= covered.abs_diff(target));
            }
        }

        // The line above wins only when it is strictly closer.
        let (line, _) = map
            .find_closest_covered_line(Path::new("/src/t.c"), 26)
            .unwrap();
        assert_eq!(line.line, 30);
    }

    #[test]
    fn save_load_round_trip_merges() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mapping.json");

        let map = map_with("/src/t.c", &[(10, 1), (20, 2)]);
        map.save(&path).unwrap();

        let mut loaded = CoverageMap::new();
        loaded.load(&path).unwrap();
        loaded.load(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.seed_for_line(&LineId::new("/src/t.c", 10)), Some(1));
        assert_eq!(loaded.seed_for_line(&LineId::new("/src/t.c", 20)), Some(2));
    }

    #[test]
    fn basis_points_from_counts() {
        assert_eq!(BasisPoints::from_counts(1234, 10_000).0, 1234);
        assert_eq!(BasisPoints::from_counts(0, 0).0, 0);
        assert_eq!(BasisPoints::from_counts(1, 3).0, 3333);
        assert_eq!(BasisPoints(1234).to_string(), "12.34%");
    }
}
