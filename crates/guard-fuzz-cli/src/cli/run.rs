use std::{
    fs,
    path::PathBuf,
    process::ExitCode,
    sync::{Arc, atomic::AtomicBool},
    time::Duration,
};

use anyhow::Context;
use guard_fuzz::{
    campaign::{Campaign, CampaignConfig, CampaignOutcome, RetryBudgets, Toolchain},
    cfg::Cfg,
    compile::GccCompiler,
    corpus::Corpus,
    coverage::{CoverageMap, collect::GcovCollector},
    execution::ProcessExecutor,
    llm::{CommandLlm, Retrying},
    oracle::{OracleOptions, OracleRegistry},
    prompt::PromptBuilder,
    selector::TargetSelector,
};
use tracing::{error, info};

#[derive(Debug, clap::Parser)]
pub(super) struct RunCommand {
    /// Corpus root; created when absent.
    #[clap(long, default_value = "corpus")]
    corpus_dir: PathBuf,

    /// CFG dump of the target compiler build.
    #[clap(long)]
    cfg_dump: PathBuf,

    /// Prefix joined with relative source paths from the dump and the
    /// coverage tool.
    #[clap(long)]
    source_root: PathBuf,

    /// Compiler functions to fuzz exhaustively; repeatable.
    #[clap(long = "focus", required = true)]
    focus: Vec<String>,

    /// Directory holding `system.md` and an optional `function_template.c`.
    #[clap(long)]
    templates: PathBuf,

    /// Compiler driver under test.
    #[clap(long, default_value = "gcc")]
    compiler: String,

    /// Coverage tool invoked over the build directory.
    #[clap(long, default_value = "gcovr")]
    gcovr: String,

    /// Command producing LLM completions (user prompt on stdin, completion on
    /// stdout, system prompt in GUARD_FUZZ_SYSTEM_PROMPT).
    #[clap(long)]
    llm_command: String,

    #[clap(long)]
    llm_args: Vec<String>,

    #[clap(long, default_value_t = 3)]
    max_llm_retries: u32,

    #[clap(long, default_value_t = 3)]
    max_compile_retries: u32,

    #[clap(long, default_value_t = 2)]
    max_divergence_retries: u32,

    #[clap(long, default_value_t = 2)]
    max_parse_retries: u32,

    /// Oracles to run over every recorded seed; repeatable.
    #[clap(long = "oracle", default_values_t = [String::from("crash"), String::from("canary")])]
    oracles: Vec<String>,

    /// JSON object with oracle parameters (max_buffer_size, negative_cflags, ...).
    #[clap(long, default_value = "{}")]
    oracle_options: String,

    /// Per-execution timeout in milliseconds.
    #[clap(long, default_value_t = 1200)]
    timeout: u64,

    /// Stop after this many seconds.
    #[clap(long)]
    wall_clock_limit: Option<u64>,

    /// Stop after this many findings.
    #[clap(long)]
    bug_quota: Option<usize>,
}

impl RunCommand {
    pub(super) fn run(self) -> anyhow::Result<ExitCode> {
        let dump = fs::read_to_string(&self.cfg_dump)
            .with_context(|| format!("Reading CFG dump {}", self.cfg_dump.display()))?;
        let cfg = Cfg::parse(&dump, &self.source_root).context("Parsing CFG dump")?;
        let selector = TargetSelector::new(cfg, self.focus.clone())
            .context("Configuring target selector")?;

        let corpus = Corpus::open(&self.corpus_dir).context("Opening corpus")?;
        let mut coverage = CoverageMap::new();
        let mapping = corpus.mapping_path();
        if mapping.exists() {
            coverage.load(&mapping).context("Loading coverage map")?;
            info!(lines = coverage.len(), "Coverage map restored");
        }

        let understanding = corpus.read_understanding().context("Reading understanding")?;
        let prompts = PromptBuilder::load(&self.templates, understanding.as_deref())
            .context("Loading prompt templates")?;

        let options = OracleOptions::new(
            serde_json::from_str(&self.oracle_options).context("Parsing oracle options")?,
        );
        let registry = OracleRegistry::with_builtins();
        let oracles = self
            .oracles
            .iter()
            .map(|name| registry.build(name, &options))
            .collect::<Result<Vec<_>, _>>()
            .context("Configuring oracles")?;

        let toolchain = Toolchain {
            llm: Box::new(Retrying::new(
                CommandLlm::new(&self.llm_command, self.llm_args.clone()),
                self.max_llm_retries,
                Duration::from_secs(1),
            )),
            compiler: Box::new(GccCompiler::new(&self.compiler)),
            executor: Box::new(ProcessExecutor::new(Duration::from_millis(self.timeout))),
            collector: Box::new(GcovCollector::new(
                self.gcovr.clone(),
                self.source_root.clone(),
            )),
            oracles,
        };

        let config = CampaignConfig {
            budgets: RetryBudgets {
                max_compile_retries: self.max_compile_retries,
                max_divergence_retries: self.max_divergence_retries,
                max_parse_retries: self.max_parse_retries,
            },
            wall_clock_limit: self.wall_clock_limit.map(Duration::from_secs),
            bug_quota: self.bug_quota,
        };

        let stop = Arc::new(AtomicBool::new(false));
        {
            let stop = Arc::clone(&stop);
            ctrlc::set_handler(move || {
                stop.store(true, std::sync::atomic::Ordering::Relaxed);
            })
            .context("Installing interrupt handler")?;
        }

        let mut campaign = Campaign::new(selector, corpus, coverage, prompts, toolchain, config)
            .with_stop_flag(stop);

        // From here on failures are campaign aborts, not configuration errors.
        match campaign.run() {
            Ok(outcome) => {
                info!(%outcome, bugs = campaign.bugs_found(), "Campaign finished");
                Ok(match outcome {
                    CampaignOutcome::BugQuotaMet => ExitCode::from(64),
                    _ => ExitCode::SUCCESS,
                })
            }
            Err(campaign_error) => {
                error!(?campaign_error, "Campaign aborted");
                eprintln!("guard-fuzz: campaign aborted: {campaign_error:#}");
                Ok(ExitCode::from(2))
            }
        }
    }
}
