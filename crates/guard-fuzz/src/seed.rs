use std::{
    hash::{Hash, Hasher},
    time::SystemTime,
};

use serde::{Deserialize, Serialize};

/// Seed id `0` marks a seed without a parent (a generated root).
pub const NO_PARENT: u64 = 0;

const ID_WIDTH: usize = 6;
const SRC_WIDTH: usize = 6;
const COV_WIDTH: usize = 5;
const HASH_WIDTH: usize = 8;
const DIR_EXTENSION: &str = ".seed";

/// One argument-driven invocation of a compiled seed binary.
///
/// The JSON keys are part of the wire contract with the LLM and must not change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestCase {
    #[serde(rename = "running command")]
    pub running_command: String,
    #[serde(rename = "expected result")]
    pub expected_result: String,
}

impl TestCase {
    pub fn new(running_command: impl Into<String>, expected_result: impl Into<String>) -> Self {
        Self {
            running_command: running_command.into(),
            expected_result: expected_result.into(),
        }
    }
}

/// Terminal classification of a seed after its iteration finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, derive_more::Display)]
pub enum SeedState {
    #[display("pending")]
    Pending,
    #[display("processed")]
    Processed,
    #[display("crash")]
    Crash,
    #[display("timeout")]
    Timeout,
}

/// Lineage and coverage bookkeeping attached to a seed.
///
/// Coverage figures are in basis points (1 = 0.01%).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedMeta {
    pub parent_id: u64,
    pub depth: u32,
    pub state: SeedState,
    pub created_at: SystemTime,
    pub old_cov: u32,
    pub new_cov: u32,
    pub cov_incr: u32,
    pub content_hash: String,
}

impl SeedMeta {
    pub fn root() -> Self {
        Self {
            parent_id: NO_PARENT,
            depth: 0,
            state: SeedState::Pending,
            created_at: SystemTime::now(),
            old_cov: 0,
            new_cov: 0,
            cov_incr: 0,
            content_hash: String::new(),
        }
    }
}

/// One candidate C program together with its inputs and compile flags.
#[derive(Debug, Clone, PartialEq)]
pub struct Seed {
    pub id: u64,
    pub content: String,
    pub test_cases: Vec<TestCase>,
    pub cflags: Vec<String>,
    pub meta: SeedMeta,
}

impl Seed {
    pub fn new(
        id: u64,
        content: String,
        test_cases: Vec<TestCase>,
        cflags: Vec<String>,
    ) -> Self {
        let content_hash = content_hash(&content);
        let meta = SeedMeta {
            content_hash,
            ..SeedMeta::root()
        };
        Self {
            id,
            content,
            test_cases,
            cflags,
            meta,
        }
    }

    /// The on-disk directory name encoding id, parent, coverage increase and hash.
    pub fn directory_name(&self) -> String {
        format!(
            "id-{:0id_w$}-src-{:0src_w$}-cov-{:0cov_w$}-{}{}",
            self.id,
            self.meta.parent_id,
            self.meta.cov_incr,
            self.meta.content_hash,
            DIR_EXTENSION,
            id_w = ID_WIDTH,
            src_w = SRC_WIDTH,
            cov_w = COV_WIDTH,
        )
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.content.trim().is_empty() {
            return Err(ValidationError {
                field: "content",
                message: "seed content is empty".into(),
            });
        }
        for (index, case) in self.test_cases.iter().enumerate() {
            if case.running_command.trim().is_empty() {
                return Err(ValidationError {
                    field: "test_cases",
                    message: format!("test case {index} has an empty running command"),
                });
            }
        }
        Ok(())
    }
}

/// A seed field that failed validation.
#[derive(Debug, thiserror::Error)]
#[error("invalid seed field `{field}`: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

/// Short stable digest of the seed source, used for naming and deduplication.
pub fn content_hash(content: &str) -> String {
    let mut hasher = std::hash::DefaultHasher::new();
    content.hash(&mut hasher);
    format!("{:08x}", hasher.finish() as u32)
}

/// The metadata fields recoverable from a seed directory name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSeedName {
    pub id: u64,
    pub parent_id: u64,
    pub cov_incr: u32,
    pub content_hash: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SeedNameError {
    #[error("seed directory name does not end in `.seed`")]
    MissingExtension,
    #[error("seed directory name has the wrong shape")]
    MalformedName,
    #[error("seed directory field `{field}` has the wrong width")]
    FieldWidth { field: &'static str },
    #[error("seed directory field `{field}` is not a number")]
    FieldValue { field: &'static str },
}

/// Parses a directory name produced by [`Seed::directory_name`].
///
/// Strict inverse of generation: field widths, the extension, and the hash
/// length must match exactly.
pub fn parse_directory_name(name: &str) -> Result<ParsedSeedName, SeedNameError> {
    let stem = name
        .strip_suffix(DIR_EXTENSION)
        .ok_or(SeedNameError::MissingExtension)?;

    let rest = stem.strip_prefix("id-").ok_or(SeedNameError::MalformedName)?;
    let (id_field, rest) = rest.split_once("-src-").ok_or(SeedNameError::MalformedName)?;
    let (src_field, rest) = rest.split_once("-cov-").ok_or(SeedNameError::MalformedName)?;
    let (cov_field, hash_field) = rest.split_once('-').ok_or(SeedNameError::MalformedName)?;

    let id = parse_fixed_width(id_field, ID_WIDTH, "id")?;
    let parent_id = parse_fixed_width(src_field, SRC_WIDTH, "src")?;
    let cov_incr = parse_fixed_width(cov_field, COV_WIDTH, "cov")? as u32;

    if hash_field.len() != HASH_WIDTH {
        return Err(SeedNameError::FieldWidth { field: "hash" });
    }
    if !hash_field.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()) {
        return Err(SeedNameError::FieldValue { field: "hash" });
    }

    Ok(ParsedSeedName {
        id,
        parent_id,
        cov_incr,
        content_hash: hash_field.to_owned(),
    })
}

fn parse_fixed_width(
    field: &str,
    width: usize,
    name: &'static str,
) -> Result<u64, SeedNameError> {
    if field.len() != width {
        return Err(SeedNameError::FieldWidth { field: name });
    }
    if !field.bytes().all(|b| b.is_ascii_digit()) {
        return Err(SeedNameError::FieldValue { field: name });
    }
    field
        .parse()
        .map_err(|_| SeedNameError::FieldValue { field: name })
}
