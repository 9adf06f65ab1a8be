use std::{path::PathBuf, process::ExitCode};

use anyhow::Context;
use guard_fuzz::corpus::Corpus;
use walkdir::WalkDir;

#[derive(Debug, clap::Subcommand)]
pub(super) enum CorpusCommand {
    /// List all seeds in the corpus.
    List {
        #[clap(long, default_value = "corpus")]
        corpus_dir: PathBuf,
    },
    /// Print one seed's source and test cases.
    Inspect {
        #[clap(long, default_value = "corpus")]
        corpus_dir: PathBuf,
        /// Seed id to inspect.
        id: u64,
    },
}

impl CorpusCommand {
    pub(super) fn run(self) -> anyhow::Result<ExitCode> {
        match self {
            CorpusCommand::List { corpus_dir } => list(&corpus_dir),
            CorpusCommand::Inspect { corpus_dir, id } => inspect(&corpus_dir, id),
        }
    }
}

fn list(corpus_dir: &PathBuf) -> anyhow::Result<ExitCode> {
    let corpus = Corpus::open(corpus_dir).context("Opening corpus")?;

    println!("{:>6}  {:>6}  {:>8}  {:>9}  {:8}  cases", "id", "parent", "cov-incr", "state", "hash");
    for seed in corpus.seeds() {
        println!(
            "{:>6}  {:>6}  {:>8}  {:>9}  {}  {}",
            seed.id,
            seed.meta.parent_id,
            seed.meta.cov_incr,
            seed.meta.state,
            seed.meta.content_hash,
            seed.test_cases.len(),
        );
    }

    let findings = WalkDir::new(corpus_dir.join("findings"))
        .min_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .count();
    println!("\n{} seeds, {} findings", corpus.len(), findings);
    Ok(ExitCode::SUCCESS)
}

fn inspect(corpus_dir: &PathBuf, id: u64) -> anyhow::Result<ExitCode> {
    let corpus = Corpus::open(corpus_dir).context("Opening corpus")?;
    let seed = corpus
        .get(id)
        .with_context(|| format!("Seed {id} is not in the corpus"))?;

    println!("seed {id} (parent {}, hash {})", seed.meta.parent_id, seed.meta.content_hash);
    println!("---- source.c ----");
    println!("{}", seed.content);
    println!("---- inputs.json ----");
    println!(
        "{}",
        serde_json::to_string_pretty(&seed.test_cases).context("Serializing test cases")?
    );
    Ok(ExitCode::SUCCESS)
}
