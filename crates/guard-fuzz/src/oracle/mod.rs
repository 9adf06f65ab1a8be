//! Active bug detectors that re-run produced binaries and decide whether a
//! compiler-emitted mitigation was bypassed.

use std::{fmt, path::Path};

use indexmap::IndexMap;
use serde::Serialize;
use tracing::warn;

use crate::{
    execution::{ExecutionResult, Executor},
    seed::Seed,
};

pub mod canary;
pub mod crash;
pub mod fortify;
mod test;

/// Printed by the test harness right after the fuzzed function returns.
/// Its presence at crash time discriminates "returned then crashed" (a true
/// return-address corruption) from "crashed inside the function". Wire
/// constant.
pub const RETURN_SENTINEL: &str = "SEED_RETURNED";

/// POSIX `128 + signal` crash exits.
pub const SIGILL_EXIT: i32 = 128 + libc::SIGILL;
pub const SIGABRT_EXIT: i32 = 128 + libc::SIGABRT;
pub const SIGBUS_EXIT: i32 = 128 + libc::SIGBUS;
pub const SIGFPE_EXIT: i32 = 128 + libc::SIGFPE;
pub const SIGSEGV_EXIT: i32 = 128 + libc::SIGSEGV;

pub fn is_crash_exit(exit_code: i32) -> bool {
    matches!(
        exit_code,
        SIGILL_EXIT | SIGABRT_EXIT | SIGBUS_EXIT | SIGFPE_EXIT | SIGSEGV_EXIT
    )
}

/// A confirmed (or strongly suspected) mitigation bypass.
#[derive(Debug, Clone, Serialize)]
pub struct Bug {
    pub seed_id: u64,
    pub oracle: String,
    pub description: String,
    pub execution_results: Vec<ExecutionResult>,
}

/// What an oracle gets to work with beyond the seed itself.
///
/// Passive oracles ignore the context; active oracles need both the binary and
/// the executor and treat their absence as a contract violation.
pub struct OracleContext<'a> {
    pub binary: Option<&'a Path>,
    pub executor: &'a dyn Executor,
}

impl fmt::Debug for OracleContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OracleContext")
            .field("binary", &self.binary)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("oracle `{oracle}` requires a compiled binary")]
    MissingBinary { oracle: &'static str },
    #[error("unknown oracle `{0}`")]
    UnknownOracle(String),
    #[error("oracle option `{name}`: {message}")]
    BadOption { name: String, message: String },
}

pub trait Oracle {
    fn name(&self) -> &'static str;

    /// Inspects one executed seed. `Ok(None)` means "no bug"; errors are
    /// reserved for contract violations, never for "the probe crashed".
    fn analyze(
        &self,
        seed: &Seed,
        ctx: &OracleContext<'_>,
        results: &[ExecutionResult],
    ) -> Result<Option<Bug>, OracleError>;
}

/// Free-form oracle parameters from configuration.
#[derive(Debug, Clone, Default)]
pub struct OracleOptions(serde_json::Map<String, serde_json::Value>);

impl OracleOptions {
    pub fn new(map: serde_json::Map<String, serde_json::Value>) -> Self {
        Self(map)
    }

    pub fn get_u64(&self, name: &str) -> Result<Option<u64>, OracleError> {
        match self.0.get(name) {
            None => Ok(None),
            Some(value) => value.as_u64().map(Some).ok_or_else(|| OracleError::BadOption {
                name: name.to_owned(),
                message: format!("expected an unsigned integer, got {value}"),
            }),
        }
    }

    pub fn get_strings(&self, name: &str) -> Result<Vec<String>, OracleError> {
        let Some(value) = self.0.get(name) else {
            return Ok(Vec::new());
        };
        let invalid = || OracleError::BadOption {
            name: name.to_owned(),
            message: format!("expected an array of strings, got {value}"),
        };
        value
            .as_array()
            .ok_or_else(invalid)?
            .iter()
            .map(|entry| entry.as_str().map(str::to_owned).ok_or_else(invalid))
            .collect()
    }
}

type OracleFactory = Box<dyn Fn(&OracleOptions) -> Result<Box<dyn Oracle>, OracleError>>;

/// Name → factory table, built at construction time and injected into the
/// loop. Nothing here is process-global, which keeps tests hermetic.
pub struct OracleRegistry {
    factories: IndexMap<String, OracleFactory>,
}

impl fmt::Debug for OracleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OracleRegistry")
            .field("oracles", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl OracleRegistry {
    pub fn empty() -> Self {
        Self {
            factories: IndexMap::new(),
        }
    }

    /// A registry with the shipped oracles: `crash`, `canary`, `fortify`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("crash", |_| Ok(Box::new(crash::CrashOracle)));
        registry.register("canary", |options| {
            Ok(Box::new(canary::CanaryOracle::from_options(options)?))
        });
        registry.register("fortify", |options| {
            Ok(Box::new(fortify::FortifyOracle::from_options(options)?))
        });
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&OracleOptions) -> Result<Box<dyn Oracle>, OracleError> + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    pub fn build(
        &self,
        name: &str,
        options: &OracleOptions,
    ) -> Result<Box<dyn Oracle>, OracleError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| OracleError::UnknownOracle(name.to_owned()))?;
        factory(options)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

/// Binary-searches the half-open fill-size domain `[0, max]` for the minimum
/// probe value whose execution exits non-zero.
///
/// A probe returning `None` (executor-level error) counts as "no crash" and
/// the search continues upward. Deterministic executors make the search
/// deterministic; at most `⌈log₂(max + 2)⌉` probes run.
pub(crate) fn min_crashing_input<P>(mut probe: P, max: u64) -> Option<(u64, ExecutionResult)>
where
    P: FnMut(u64) -> Option<ExecutionResult>,
{
    let mut lo: i64 = 0;
    let mut hi: i64 = max as i64;
    let mut answer = None;
    while lo <= hi {
        let mid = (lo + hi) / 2;
        match probe(mid as u64) {
            Some(result) if result.exit_code != 0 => {
                answer = Some((mid as u64, result));
                hi = mid - 1;
            }
            _ => lo = mid + 1,
        }
    }
    answer
}

/// Runs a single probe, demoting executor failures to "no result".
pub(crate) fn run_probe(
    executor: &dyn Executor,
    binary: &Path,
    args: &[String],
) -> Option<ExecutionResult> {
    match executor.execute_with_args(binary, args) {
        Ok(result) => Some(result),
        Err(error) => {
            warn!(%error, binary = %binary.display(), "Probe execution failed, treating as no crash");
            None
        }
    }
}
