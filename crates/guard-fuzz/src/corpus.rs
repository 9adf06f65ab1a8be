use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
};

use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::{
    oracle::Bug,
    seed::{self, Seed, SeedState, TestCase},
};

const SOURCE_FILE: &str = "source.c";
const INPUTS_FILE: &str = "inputs.json";
const MAPPING_FILE: &str = "mapping.json";
const UNDERSTANDING_FILE: &str = "understanding.md";
const FINDINGS_DIR: &str = "findings";

#[derive(Debug, thiserror::Error)]
pub enum CorpusError {
    #[error("corpus I/O failure: {0}")]
    Io(#[from] io::Error),
    #[error("serializing corpus entry: {0}")]
    Json(#[from] serde_json::Error),
    #[error("seed {0} is not in the corpus")]
    UnknownSeed(u64),
    #[error(transparent)]
    InvalidSeed(#[from] seed::ValidationError),
}

/// Result of adding a seed whose content may already be known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    /// A seed with an identical content hash already exists; the new seed was
    /// not stored. The caller decides how to treat the duplicate.
    Duplicate { existing: u64 },
}

/// Append-only on-disk seed store.
///
/// Each seed occupies one directory under the corpus root; the directory name
/// encodes the seed metadata so that a scan of the root reconstructs the corpus
/// without opening any file.
#[derive(Debug)]
pub struct Corpus {
    root: PathBuf,
    seeds: IndexMap<u64, Seed>,
    by_hash: HashMap<String, u64>,
    next_id: u64,
}

impl Corpus {
    /// Opens (and scans) a corpus root, creating the directory tree if absent.
    ///
    /// Malformed entries are skipped with a warning; they never abort loading.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CorpusError> {
        let root = root.into();
        fs::create_dir_all(root.join(FINDINGS_DIR))?;

        let mut corpus = Self {
            root,
            seeds: IndexMap::new(),
            by_hash: HashMap::new(),
            next_id: 1,
        };
        corpus.scan()?;
        Ok(corpus)
    }

    fn scan(&mut self) -> Result<(), CorpusError> {
        let mut loaded: Vec<Seed> = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                warn!(path = %entry.path().display(), "Skipping non-UTF-8 corpus entry");
                continue;
            };
            if name == FINDINGS_DIR {
                continue;
            }
            match load_seed_dir(&entry.path(), name) {
                Ok(seed) => loaded.push(seed),
                Err(error) => {
                    warn!(entry = name, %error, "Skipping malformed corpus entry");
                }
            }
        }

        loaded.sort_by_key(|seed| seed.id);
        for seed in loaded {
            self.next_id = self.next_id.max(seed.id + 1);
            self.by_hash.insert(seed.meta.content_hash.clone(), seed.id);
            self.seeds.insert(seed.id, seed);
        }
        debug!(seeds = self.seeds.len(), next_id = self.next_id, "Corpus scanned");
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The id the next created seed should take.
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    pub fn len(&self) -> usize {
        self.seeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seeds.is_empty()
    }

    pub fn get(&self, id: u64) -> Option<&Seed> {
        self.seeds.get(&id)
    }

    pub fn seeds(&self) -> impl Iterator<Item = &Seed> {
        self.seeds.values()
    }

    /// Validates, persists and registers a seed.
    ///
    /// A seed whose content hash matches an existing entry is reported as a
    /// [`AddOutcome::Duplicate`] and not written to disk.
    pub fn add(&mut self, seed: Seed) -> Result<AddOutcome, CorpusError> {
        seed.validate()?;
        if let Some(&existing) = self.by_hash.get(&seed.meta.content_hash) {
            debug!(seed = seed.id, existing, "Duplicate seed content");
            return Ok(AddOutcome::Duplicate { existing });
        }

        self.persist(&seed)?;
        self.next_id = self.next_id.max(seed.id + 1);
        self.by_hash.insert(seed.meta.content_hash.clone(), seed.id);
        self.seeds.insert(seed.id, seed);
        Ok(AddOutcome::Added)
    }

    fn persist(&self, seed: &Seed) -> Result<(), CorpusError> {
        let dir = self.root.join(seed.directory_name());
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(SOURCE_FILE), &seed.content)?;
        let inputs = serde_json::to_string_pretty(&seed.test_cases)?;
        fs::write(dir.join(INPUTS_FILE), inputs)?;
        Ok(())
    }

    /// Advances the state of a persisted seed. The state is the only field a
    /// seed may change after persistence.
    pub fn update_state(&mut self, id: u64, state: SeedState) -> Result<(), CorpusError> {
        let seed = self
            .seeds
            .get_mut(&id)
            .ok_or(CorpusError::UnknownSeed(id))?;
        seed.meta.state = state;
        Ok(())
    }

    /// Writes a bug report into the findings directory.
    pub fn save_finding(&self, bug: &Bug) -> Result<PathBuf, CorpusError> {
        let name = format!("seed-{:06}-{}.json", bug.seed_id, bug.oracle);
        let path = self.root.join(FINDINGS_DIR).join(name);
        fs::write(&path, serde_json::to_string_pretty(bug)?)?;
        Ok(path)
    }

    pub fn mapping_path(&self) -> PathBuf {
        self.root.join(MAPPING_FILE)
    }

    /// Reads the persisted LLM system-prompt context, if any. The content is
    /// opaque to the corpus.
    pub fn read_understanding(&self) -> Result<Option<String>, CorpusError> {
        match fs::read_to_string(self.root.join(UNDERSTANDING_FILE)) {
            Ok(text) => Ok(Some(text)),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    pub fn write_understanding(&self, text: &str) -> Result<(), CorpusError> {
        fs::write(self.root.join(UNDERSTANDING_FILE), text)?;
        Ok(())
    }
}

fn load_seed_dir(dir: &Path, name: &str) -> anyhow::Result<Seed> {
    use anyhow::Context;

    let parsed = seed::parse_directory_name(name)?;
    let content = fs::read_to_string(dir.join(SOURCE_FILE)).context("Reading seed source")?;
    let inputs = fs::read_to_string(dir.join(INPUTS_FILE)).context("Reading seed inputs")?;
    let test_cases: Vec<TestCase> =
        serde_json::from_str(&inputs).context("Parsing seed inputs")?;

    let mut seed = Seed::new(parsed.id, content, test_cases, Vec::new());
    seed.meta.parent_id = parsed.parent_id;
    seed.meta.cov_incr = parsed.cov_incr;
    anyhow::ensure!(
        seed.meta.content_hash == parsed.content_hash,
        "content hash mismatch: directory says {}, content hashes to {}",
        parsed.content_hash,
        seed.meta.content_hash,
    );
    seed.meta.state = SeedState::Processed;
    Ok(seed)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::seed::TestCase;

    fn make_seed(id: u64, source: &str) -> Seed {
        Seed::new(
            id,
            source.to_owned(),
            vec![TestCase::new("./prog 64 10", "0")],
            vec![],
        )
    }

    #[test]
    fn save_and_reload_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut corpus = Corpus::open(dir.path()).unwrap();

        let mut seed = make_seed(1, "int main(void) { return 0; }\n");
        seed.meta.parent_id = 0;
        seed.meta.cov_incr = 250;
        assert_eq!(corpus.add(seed.clone()).unwrap(), AddOutcome::Added);

        let reloaded = Corpus::open(dir.path()).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.next_id(), 2);
        let loaded = reloaded.get(1).unwrap();
        assert_eq!(loaded.content, seed.content);
        assert_eq!(loaded.test_cases, seed.test_cases);
        assert_eq!(loaded.meta.parent_id, 0);
        assert_eq!(loaded.meta.cov_incr, 250);
        assert_eq!(loaded.meta.content_hash, seed.meta.content_hash);
    }

    #[test]
    fn duplicate_content_is_reported() {
        let dir = TempDir::new().unwrap();
        let mut corpus = Corpus::open(dir.path()).unwrap();

        corpus.add(make_seed(1, "int x;\n")).unwrap();
        let outcome = corpus.add(make_seed(2, "int x;\n")).unwrap();
        assert_eq!(outcome, AddOutcome::Duplicate { existing: 1 });
        assert_eq!(corpus.len(), 1);
    }

    #[test]
    fn malformed_entries_are_skipped() {
        let dir = TempDir::new().unwrap();
        {
            let mut corpus = Corpus::open(dir.path()).unwrap();
            corpus.add(make_seed(1, "int y;\n")).unwrap();
        }
        // A directory that does not parse as a seed name.
        fs::create_dir(dir.path().join("not-a-seed")).unwrap();
        // A well-named directory with no files inside.
        fs::create_dir(dir.path().join("id-000009-src-000000-cov-00000-00000000.seed"))
            .unwrap();

        let corpus = Corpus::open(dir.path()).unwrap();
        assert_eq!(corpus.len(), 1);
        assert_eq!(corpus.next_id(), 2);
    }

    #[test]
    fn invalid_seed_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut corpus = Corpus::open(dir.path()).unwrap();
        let seed = Seed::new(1, String::new(), vec![], vec![]);
        assert!(matches!(
            corpus.add(seed),
            Err(CorpusError::InvalidSeed(_))
        ));
    }
}
