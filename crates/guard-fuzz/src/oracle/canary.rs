//! Stack-canary bypass detection.
//!
//! The harness binary takes two arguments, a buffer size and a fill size, and
//! prints [`RETURN_SENTINEL`](super::RETURN_SENTINEL) right after the fuzzed
//! function returns. A fill that corrupts the saved return address *before*
//! the canary check executes segfaults on return with the sentinel already on
//! stdout; the canary catching the overflow aborts instead.

use tracing::{debug, info};

use super::{
    Bug, Oracle, OracleContext, OracleError, OracleOptions, RETURN_SENTINEL, SIGABRT_EXIT,
    SIGBUS_EXIT, SIGSEGV_EXIT, min_crashing_input, run_probe,
};
use crate::{execution::ExecutionResult, seed::Seed};

pub const DEFAULT_MAX_BUFFER_SIZE: u64 = 4096;
pub const DEFAULT_BUF_SIZE: u64 = 64;

#[derive(Debug, Clone)]
pub struct CanaryOracle {
    max_buffer_size: u64,
    default_buf_size: u64,
    /// Flags that disable the mitigation outright (e.g. `-fno-stack-protector`).
    /// A seed carrying one of these cannot demonstrate a bypass.
    negative_cflags: Vec<String>,
}

impl Default for CanaryOracle {
    fn default() -> Self {
        Self {
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            default_buf_size: DEFAULT_BUF_SIZE,
            negative_cflags: Vec::new(),
        }
    }
}

impl CanaryOracle {
    pub fn new(max_buffer_size: u64, default_buf_size: u64, negative_cflags: Vec<String>) -> Self {
        Self {
            max_buffer_size,
            default_buf_size,
            negative_cflags,
        }
    }

    pub fn from_options(options: &OracleOptions) -> Result<Self, OracleError> {
        let defaults = Self::default();
        Ok(Self {
            max_buffer_size: options
                .get_u64("max_buffer_size")?
                .unwrap_or(defaults.max_buffer_size),
            default_buf_size: options
                .get_u64("default_buf_size")?
                .unwrap_or(defaults.default_buf_size),
            negative_cflags: options.get_strings("negative_cflags")?,
        })
    }

    fn probe_args(&self, fill_size: u64) -> Vec<String> {
        vec![self.default_buf_size.to_string(), fill_size.to_string()]
    }
}

impl Oracle for CanaryOracle {
    fn name(&self) -> &'static str {
        "canary"
    }

    fn analyze(
        &self,
        seed: &Seed,
        ctx: &OracleContext<'_>,
        _results: &[ExecutionResult],
    ) -> Result<Option<Bug>, OracleError> {
        if let Some(flag) = self
            .negative_cflags
            .iter()
            .find(|flag| seed.cflags.contains(flag))
        {
            debug!(seed = seed.id, flag, "Seed disables the stack protector, skipping");
            return Ok(None);
        }
        let binary = ctx.binary.ok_or(OracleError::MissingBinary {
            oracle: self.name(),
        })?;

        let found = min_crashing_input(
            |fill| run_probe(ctx.executor, binary, &self.probe_args(fill)),
            self.max_buffer_size,
        );
        let Some((min_fill, searched)) = found else {
            return Ok(None);
        };

        // The search may have approached the boundary from below; re-probe to
        // re-read the exit code and the sentinel at exactly the minimum.
        let confirmed =
            run_probe(ctx.executor, binary, &self.probe_args(min_fill)).unwrap_or(searched);

        let verdict = classify(&confirmed);
        debug!(
            seed = seed.id,
            min_fill,
            exit_code = confirmed.exit_code,
            ?verdict,
            "Canary probe classified"
        );
        match verdict {
            Verdict::CanaryTriggered | Verdict::IndirectCrash => Ok(None),
            Verdict::ReturnAddressCorrupted => {
                info!(seed = seed.id, min_fill, "Stack canary bypass detected");
                Ok(Some(Bug {
                    seed_id: seed.id,
                    oracle: self.name().to_owned(),
                    description: format!(
                        "stack canary bypass: writing {min_fill} bytes into a \
                         {buf}-byte buffer corrupted the return address before the \
                         canary check ran (exit code {code}, sentinel on stdout)",
                        buf = self.default_buf_size,
                        code = confirmed.exit_code,
                    ),
                    execution_results: vec![confirmed],
                }))
            }
            Verdict::SuspiciousExit => Ok(Some(Bug {
                seed_id: seed.id,
                oracle: self.name().to_owned(),
                description: format!(
                    "potential stack canary bypass: fill {min_fill} exits with \
                     unexpected code {code} after the harness returned",
                    code = confirmed.exit_code,
                ),
                execution_results: vec![confirmed],
            })),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    /// SIGABRT: the canary caught the overflow. The mitigation works.
    CanaryTriggered,
    /// Memory fault after the harness returned: corruption preceded the check.
    ReturnAddressCorrupted,
    /// Memory fault without the sentinel: the crash happened inside the
    /// harness, not on return.
    IndirectCrash,
    /// Any other non-zero exit with the sentinel present.
    SuspiciousExit,
}

fn classify(result: &ExecutionResult) -> Verdict {
    let returned = result.stdout.contains(RETURN_SENTINEL);
    match result.exit_code {
        SIGABRT_EXIT => Verdict::CanaryTriggered,
        SIGSEGV_EXIT | SIGBUS_EXIT if returned => Verdict::ReturnAddressCorrupted,
        SIGSEGV_EXIT | SIGBUS_EXIT => Verdict::IndirectCrash,
        _ if returned => Verdict::SuspiciousExit,
        _ => Verdict::IndirectCrash,
    }
}
