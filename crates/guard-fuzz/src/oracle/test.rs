#![cfg(test)]

use std::{cell::Cell, path::Path};

use super::{
    Bug, OracleContext, OracleError, OracleOptions, OracleRegistry, RETURN_SENTINEL, SIGABRT_EXIT,
    SIGSEGV_EXIT, min_crashing_input,
};
use crate::{
    execution::{ExecError, ExecutionResult, Executor},
    oracle::{Oracle, canary::CanaryOracle, crash::CrashOracle, fortify::FortifyOracle},
    seed::{Seed, TestCase},
};

/// Scripted harness double: crashes with a fixed exit code whenever the fill
/// argument reaches the threshold. A threshold of zero never crashes.
struct MockExecutor {
    crash_threshold: u64,
    exit_code: i32,
    sentinel: bool,
    calls: Cell<usize>,
}

impl MockExecutor {
    fn new(crash_threshold: u64, exit_code: i32, sentinel: bool) -> Self {
        Self {
            crash_threshold,
            exit_code,
            sentinel,
            calls: Cell::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.get()
    }
}

impl Executor for MockExecutor {
    fn execute_with_args(
        &self,
        _binary: &Path,
        args: &[String],
    ) -> Result<ExecutionResult, ExecError> {
        self.calls.set(self.calls.get() + 1);
        let fill: u64 = args
            .last()
            .expect("probes always pass a fill argument")
            .parse()
            .expect("fill argument is numeric");
        let crashes = self.crash_threshold > 0 && fill >= self.crash_threshold;
        let stdout = if self.sentinel || !crashes {
            format!("{RETURN_SENTINEL}\n")
        } else {
            String::new()
        };
        Ok(ExecutionResult {
            exit_code: if crashes { self.exit_code } else { 0 },
            stdout,
            stderr: String::new(),
        })
    }
}

/// Executor that always fails to spawn, for the error-handling path.
struct BrokenExecutor;

impl Executor for BrokenExecutor {
    fn execute_with_args(
        &self,
        binary: &Path,
        _args: &[String],
    ) -> Result<ExecutionResult, ExecError> {
        Err(ExecError::Spawn {
            binary: binary.display().to_string(),
            source: std::io::Error::other("broken"),
        })
    }
}

fn seed_with_cflags(cflags: &[&str]) -> Seed {
    Seed::new(
        1,
        "int main(int argc, char **argv) { return 0; }\n".to_owned(),
        vec![TestCase::new("./seed.bin 64 10", "0")],
        cflags.iter().map(|s| (*s).to_owned()).collect(),
    )
}

fn ctx<'a>(executor: &'a dyn Executor) -> OracleContext<'a> {
    OracleContext {
        binary: Some(Path::new("/tmp/seed.bin")),
        executor,
    }
}

fn analyze_canary(oracle: &CanaryOracle, executor: &dyn Executor) -> Option<Bug> {
    oracle
        .analyze(&seed_with_cflags(&[]), &ctx(executor), &[])
        .unwrap()
}

#[test]
fn canary_bypass_is_reported() {
    let executor = MockExecutor::new(100, SIGSEGV_EXIT, true);
    let oracle = CanaryOracle::new(200, 64, vec![]);
    let bug = analyze_canary(&oracle, &executor).expect("a bypass must be reported");
    assert!(bug.description.contains("bypass"));
    assert!(bug.description.contains("139"));
    assert_eq!(bug.oracle, "canary");
}

#[test]
fn canary_abort_is_safe() {
    let executor = MockExecutor::new(100, SIGABRT_EXIT, true);
    let oracle = CanaryOracle::new(200, 64, vec![]);
    assert!(analyze_canary(&oracle, &executor).is_none());
}

#[test]
fn segfault_without_sentinel_is_filtered() {
    let executor = MockExecutor::new(74, SIGSEGV_EXIT, false);
    let oracle = CanaryOracle::new(200, 64, vec![]);
    assert!(analyze_canary(&oracle, &executor).is_none());
}

#[test]
fn negative_cflags_suppress_the_oracle() {
    let executor = MockExecutor::new(100, SIGSEGV_EXIT, true);
    let oracle = CanaryOracle::new(200, 64, vec!["-fno-stack-protector".to_owned()]);
    let seed = seed_with_cflags(&["-fno-stack-protector"]);
    let bug = oracle.analyze(&seed, &ctx(&executor), &[]).unwrap();
    assert!(bug.is_none());
    // Short-circuited before any probe.
    assert_eq!(executor.calls(), 0);
}

#[test]
fn no_crash_below_max_means_no_bug() {
    let executor = MockExecutor::new(0, SIGSEGV_EXIT, true);
    let oracle = CanaryOracle::new(200, 64, vec![]);
    assert!(analyze_canary(&oracle, &executor).is_none());
}

#[test]
fn binary_search_finds_the_exact_threshold() {
    let executor = MockExecutor::new(337, SIGSEGV_EXIT, true);
    let (min_fill, result) = min_crashing_input(
        |fill| {
            executor
                .execute_with_args(Path::new("/tmp/seed.bin"), &[fill.to_string()])
                .ok()
        },
        1000,
    )
    .expect("a crash must be found");
    assert_eq!(min_fill, 337);
    assert_eq!(result.exit_code, SIGSEGV_EXIT);
    // ⌈log₂(1002)⌉ probes at most.
    assert!(executor.calls() <= 11, "used {} probes", executor.calls());
}

#[test]
fn binary_search_boundaries() {
    let at_zero = MockExecutor::new(1, SIGSEGV_EXIT, true);
    let probe = |fill: u64| {
        at_zero
            .execute_with_args(Path::new("/tmp/x"), &[fill.to_string()])
            .ok()
    };
    assert_eq!(min_crashing_input(probe, 1000).unwrap().0, 1);

    let at_max = MockExecutor::new(1000, SIGSEGV_EXIT, true);
    let probe = |fill: u64| {
        at_max
            .execute_with_args(Path::new("/tmp/x"), &[fill.to_string()])
            .ok()
    };
    assert_eq!(min_crashing_input(probe, 1000).unwrap().0, 1000);

    let never = MockExecutor::new(0, SIGSEGV_EXIT, true);
    let probe = |fill: u64| {
        never
            .execute_with_args(Path::new("/tmp/x"), &[fill.to_string()])
            .ok()
    };
    assert!(min_crashing_input(probe, 1000).is_none());
}

#[test]
fn executor_errors_count_as_no_crash() {
    let executor = BrokenExecutor;
    let oracle = CanaryOracle::new(200, 64, vec![]);
    assert!(analyze_canary(&oracle, &executor).is_none());
}

#[test]
fn canary_requires_a_binary() {
    let executor = MockExecutor::new(100, SIGSEGV_EXIT, true);
    let oracle = CanaryOracle::new(200, 64, vec![]);
    let no_binary = OracleContext {
        binary: None,
        executor: &executor,
    };
    let error = oracle
        .analyze(&seed_with_cflags(&[]), &no_binary, &[])
        .unwrap_err();
    assert!(matches!(error, OracleError::MissingBinary { oracle: "canary" }));
}

#[test]
fn fortify_abort_is_safe_and_fault_is_a_bypass() {
    let aborts = MockExecutor::new(50, SIGABRT_EXIT, true);
    let oracle = FortifyOracle::new(200, vec![]);
    let seed = seed_with_cflags(&[]);
    assert!(oracle.analyze(&seed, &ctx(&aborts), &[]).unwrap().is_none());

    let faults = MockExecutor::new(50, SIGSEGV_EXIT, true);
    let bug = oracle
        .analyze(&seed, &ctx(&faults), &[])
        .unwrap()
        .expect("a fortify bypass must be reported");
    assert!(bug.description.contains("bypass"));
    assert_eq!(bug.oracle, "fortify");
}

#[test]
fn crash_oracle_is_passive() {
    let oracle = CrashOracle;
    let executor = MockExecutor::new(0, 0, false);
    let seed = seed_with_cflags(&[]);

    let results = vec![
        ExecutionResult {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        },
        ExecutionResult {
            exit_code: SIGSEGV_EXIT,
            stdout: String::new(),
            stderr: String::new(),
        },
    ];
    let bug = oracle
        .analyze(&seed, &ctx(&executor), &results)
        .unwrap()
        .expect("the crashing result must be flagged");
    assert_eq!(bug.execution_results.len(), 1);
    assert_eq!(executor.calls(), 0);
}

#[test]
fn registry_builds_configured_oracles() {
    let registry = OracleRegistry::with_builtins();
    let options = OracleOptions::new(
        serde_json::from_str(
            r#"{"max_buffer_size": 200, "default_buf_size": 64, "negative_cflags": ["-fno-stack-protector"]}"#,
        )
        .unwrap(),
    );
    let oracle = registry.build("canary", &options).unwrap();
    assert_eq!(oracle.name(), "canary");

    assert!(matches!(
        registry.build("nonexistent", &OracleOptions::default()),
        Err(OracleError::UnknownOracle(name)) if name == "nonexistent"
    ));

    let bad = OracleOptions::new(serde_json::from_str(r#"{"max_buffer_size": "big"}"#).unwrap());
    assert!(matches!(
        registry.build("canary", &bad),
        Err(OracleError::BadOption { .. })
    ));
}
