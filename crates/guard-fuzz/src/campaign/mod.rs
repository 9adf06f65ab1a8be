//! The fuzzing loop: generate → compile → execute → measure → record.
//!
//! The loop is the central recovery point. Lower components return typed
//! errors; the loop decides retry versus skip versus abort. It runs
//! single-threaded; the LLM call, the compiler, the child executions and the
//! coverage collection are its only suspension points.

use std::{
    fmt, fs,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::{
    compile::{CompileOutcome, Compiler},
    corpus::{AddOutcome, Corpus},
    coverage::{BasisPoints, CoverageMap, LineId, collect::CoverageCollector},
    execution::{ExecError, ExecutionResult, Executor},
    llm::LlmClient,
    oracle::{Oracle, OracleContext},
    prompt::PromptBuilder,
    response::ResponseParser,
    seed::{NO_PARENT, Seed, SeedState},
    selector::{TargetInfo, TargetSelector},
};


/// Per-iteration retry budgets. Each counter resets at iteration boundaries.
#[derive(Debug, Clone, Copy)]
pub struct RetryBudgets {
    pub max_compile_retries: u32,
    pub max_divergence_retries: u32,
    pub max_parse_retries: u32,
}

impl Default for RetryBudgets {
    fn default() -> Self {
        Self {
            max_compile_retries: 3,
            max_divergence_retries: 2,
            max_parse_retries: 2,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CampaignConfig {
    pub budgets: RetryBudgets,
    pub wall_clock_limit: Option<Duration>,
    pub bug_quota: Option<usize>,
}

/// Why the campaign stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum CampaignOutcome {
    #[display("all targeted blocks covered")]
    TargetsExhausted,
    #[display("wall-clock limit reached")]
    WallClockReached,
    #[display("bug quota met")]
    BugQuotaMet,
    #[display("cancelled")]
    Cancelled,
}

/// The external capabilities the loop drives.
pub struct Toolchain {
    pub llm: Box<dyn LlmClient>,
    pub compiler: Box<dyn Compiler>,
    pub executor: Box<dyn Executor>,
    pub collector: Box<dyn CoverageCollector>,
    pub oracles: Vec<Box<dyn Oracle>>,
}

impl fmt::Debug for Toolchain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Toolchain")
            .field(
                "oracles",
                &self.oracles.iter().map(|o| o.name()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
enum IterationOutcome {
    /// The target block was covered; the seed is recorded.
    Progress { seed_id: u64 },
    /// The iteration ended without reaching the target. When a seed was still
    /// worth keeping it has been recorded.
    Abandoned { reason: &'static str },
}

#[derive(Debug)]
pub struct Campaign {
    selector: TargetSelector,
    corpus: Corpus,
    coverage: CoverageMap,
    prompts: PromptBuilder,
    parser: ResponseParser,
    toolchain: Toolchain,
    config: CampaignConfig,
    stop: Arc<AtomicBool>,
    bugs_found: usize,
    current_cov: u32,
}

impl Campaign {
    pub fn new(
        selector: TargetSelector,
        corpus: Corpus,
        coverage: CoverageMap,
        prompts: PromptBuilder,
        toolchain: Toolchain,
        config: CampaignConfig,
    ) -> Self {
        let parser = ResponseParser::new(prompts.function_template().map(str::to_owned));
        Self {
            selector,
            corpus,
            coverage,
            prompts,
            parser,
            toolchain,
            config,
            stop: Arc::new(AtomicBool::new(false)),
            bugs_found: 0,
            current_cov: 0,
        }
    }

    /// Installs a cancellation flag. The loop polls it at iteration
    /// boundaries, so a raised flag lets the in-flight iteration finish its
    /// recording before the campaign exits.
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    pub fn bugs_found(&self) -> usize {
        self.bugs_found
    }

    pub fn coverage(&self) -> &CoverageMap {
        &self.coverage
    }

    pub fn corpus(&self) -> &Corpus {
        &self.corpus
    }

    pub fn run(&mut self) -> anyhow::Result<CampaignOutcome> {
        let started = Instant::now();
        loop {
            if self.stop.load(Ordering::Relaxed) {
                info!("Cancellation requested, stopping the campaign");
                return Ok(CampaignOutcome::Cancelled);
            }
            if let Some(limit) = self.config.wall_clock_limit
                && started.elapsed() >= limit
            {
                return Ok(CampaignOutcome::WallClockReached);
            }
            if let Some(quota) = self.config.bug_quota
                && self.bugs_found >= quota
            {
                return Ok(CampaignOutcome::BugQuotaMet);
            }

            let Some(target) = self.selector.select(&self.coverage) else {
                return Ok(CampaignOutcome::TargetsExhausted);
            };
            self.selector.record_attempt(&target);

            match self.run_iteration(&target)? {
                IterationOutcome::Progress { seed_id } => {
                    info!(
                        seed = seed_id,
                        function = target.function,
                        bb = target.bb_id,
                        "Target covered"
                    );
                }
                IterationOutcome::Abandoned { reason } => {
                    debug!(
                        function = target.function,
                        bb = target.bb_id,
                        reason,
                        "Iteration abandoned"
                    );
                }
            }
        }
    }

    fn run_iteration(&mut self, target: &TargetInfo) -> anyhow::Result<IterationOutcome> {
        // Scratch space for compile and execute; removed on every exit path
        // when the guard drops.
        let scratch = TempDir::new().context("Creating iteration scratch directory")?;

        let base = target
            .base_seed_id
            .and_then(|id| self.corpus.get(id))
            .cloned();
        let mut prompt = self.prompts.constraint_solving(target, base.as_ref());

        let mut parse_retries = 0;
        let mut compile_retries = 0;
        let mut divergence_retries = 0;

        loop {
            let completion = self
                .toolchain
                .llm
                .get_completion(self.prompts.system_prompt(), &prompt)
                .context("Requesting a completion")?;

            let parsed = match self.parser.parse(&completion) {
                Ok(parsed) => parsed,
                Err(error) => {
                    if parse_retries >= self.config.budgets.max_parse_retries {
                        return Ok(IterationOutcome::Abandoned {
                            reason: "parse retries exhausted",
                        });
                    }
                    parse_retries += 1;
                    warn!(%error, parse_retries, "Response did not parse, re-prompting");
                    prompt = self.prompts.compile_error(target, &error.to_string(), &completion);
                    continue;
                }
            };

            let mut seed = Seed::new(
                self.corpus.next_id(),
                parsed.code,
                parsed.test_cases,
                parsed.cflags,
            );
            if let Some(base) = &base {
                seed.meta.parent_id = base.id;
                seed.meta.depth = base.meta.depth + 1;
            } else {
                seed.meta.parent_id = NO_PARENT;
            }

            let source = scratch.path().join("seed.c");
            fs::write(&source, &seed.content).context("Writing seed source")?;
            let binary = match self
                .toolchain
                .compiler
                .compile(&source, &seed.cflags, scratch.path())?
            {
                CompileOutcome::Success { binary } => binary,
                CompileOutcome::Failed { exit_code, stderr } => {
                    if compile_retries >= self.config.budgets.max_compile_retries {
                        return Ok(IterationOutcome::Abandoned {
                            reason: "compile retries exhausted",
                        });
                    }
                    compile_retries += 1;
                    debug!(exit_code, compile_retries, "Compile failed, re-prompting");
                    prompt = self.prompts.compile_error(target, &stderr, &seed.content);
                    continue;
                }
            };

            let (results, timed_out) = self.run_test_cases(&binary, &seed);
            let snapshot = self
                .toolchain
                .collector
                .collect(scratch.path())
                .context("Collecting coverage")?;

            let new_lines: Vec<LineId> = snapshot
                .lines
                .iter()
                .filter(|line| !self.coverage.is_covered(&line.file, line.line))
                .cloned()
                .collect();
            let target_hit = target.file.as_deref().is_some_and(|file| {
                snapshot
                    .lines
                    .iter()
                    .any(|line| line.file == file && target.lines.contains(&line.line))
            });

            if new_lines.is_empty() || !target_hit {
                if divergence_retries < self.config.budgets.max_divergence_retries {
                    divergence_retries += 1;
                    let hint = self
                        .selector
                        .first_uncovered_function(&self.coverage)
                        .unwrap_or(&target.function)
                        .to_owned();
                    debug!(divergence_retries, hint, "Divergence, re-prompting");
                    prompt = self.prompts.refined(target, &hint, base.as_ref());
                    continue;
                }
                // Budget exhausted: keep the seed anyway, it executed fine and
                // may serve as a future base.
                self.record(seed, results, timed_out, &new_lines, snapshot.total, &binary)?;
                return Ok(IterationOutcome::Abandoned {
                    reason: "divergence retries exhausted",
                });
            }

            let seed_id = seed.id;
            self.record(seed, results, timed_out, &new_lines, snapshot.total, &binary)?;
            self.selector.record_success(target);
            return Ok(IterationOutcome::Progress { seed_id });
        }
    }

    /// Runs every test case of the seed. Executor errors are logged and the
    /// campaign continues; a timeout additionally taints the seed state.
    fn run_test_cases(&self, binary: &Path, seed: &Seed) -> (Vec<ExecutionResult>, bool) {
        let mut results = Vec::with_capacity(seed.test_cases.len());
        let mut timed_out = false;
        for case in &seed.test_cases {
            let args = command_args(&case.running_command, binary);
            match self.toolchain.executor.execute_with_args(binary, &args) {
                Ok(result) => {
                    if !case.expected_result.is_empty()
                        && result.stdout.trim() != case.expected_result.trim()
                    {
                        debug!(
                            expected = case.expected_result,
                            actual = result.stdout.trim(),
                            "Test case output differs from expectation"
                        );
                    }
                    results.push(result);
                }
                Err(ExecError::Timeout { timeout }) => {
                    warn!(?timeout, seed = seed.id, "Test case timed out");
                    timed_out = true;
                }
                Err(error) => {
                    warn!(%error, seed = seed.id, "Test case execution failed");
                }
            }
        }
        (results, timed_out)
    }

    fn record(
        &mut self,
        mut seed: Seed,
        results: Vec<ExecutionResult>,
        timed_out: bool,
        new_lines: &[LineId],
        total: Option<BasisPoints>,
        binary: &Path,
    ) -> anyhow::Result<()> {
        seed.meta.state = if results
            .iter()
            .any(|result| crate::oracle::is_crash_exit(result.exit_code))
        {
            SeedState::Crash
        } else if timed_out {
            SeedState::Timeout
        } else {
            SeedState::Processed
        };

        seed.meta.old_cov = self.current_cov;
        match total {
            Some(total) => {
                seed.meta.new_cov = total.0;
                seed.meta.cov_incr = total.0.saturating_sub(self.current_cov);
                self.current_cov = total.0;
            }
            // Collectors without a total figure (stubs, partial reports):
            // the new-line count stands in for the increase.
            None => {
                seed.meta.cov_incr = new_lines.len().min(99_999) as u32;
                seed.meta.new_cov = self.current_cov + seed.meta.cov_incr;
                self.current_cov = seed.meta.new_cov;
            }
        }

        match self.corpus.add(seed.clone()).context("Recording seed")? {
            AddOutcome::Added => {}
            AddOutcome::Duplicate { existing } => {
                warn!(existing, "LLM reproduced an existing seed, dropping");
                return Ok(());
            }
        }
        self.coverage.record_lines(new_lines.iter().cloned(), seed.id);
        self.coverage
            .save(&self.corpus.mapping_path())
            .context("Persisting coverage map")?;

        let ctx = OracleContext {
            binary: Some(binary),
            executor: &*self.toolchain.executor,
        };
        for oracle in &self.toolchain.oracles {
            // Contract violations are programming errors and abort the
            // campaign; everything else has already been demoted to "no bug"
            // inside the oracle.
            let verdict = oracle
                .analyze(&seed, &ctx, &results)
                .with_context(|| format!("Oracle `{}` misconfigured", oracle.name()))?;
            if let Some(bug) = verdict {
                let path = self.corpus.save_finding(&bug).context("Saving finding")?;
                self.bugs_found += 1;
                info!(
                    oracle = oracle.name(),
                    seed = bug.seed_id,
                    finding = %path.display(),
                    "{}",
                    bug.description
                );
            }
        }
        Ok(())
    }
}

/// Turns a test case's `running_command` into argv for the compiled binary.
/// A leading program token (`./whatever` or the binary's file name) is
/// dropped; the binary path is supplied by the loop.
fn command_args(running_command: &str, binary: &Path) -> Vec<String> {
    let mut tokens = running_command.split_whitespace().peekable();
    if let Some(first) = tokens.peek() {
        let is_program = first.starts_with("./")
            || binary
                .file_name()
                .is_some_and(|name| name.to_string_lossy() == **first);
        if is_program {
            tokens.next();
        }
    }
    tokens.map(str::to_owned).collect()
}
