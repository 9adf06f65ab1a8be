//! `_FORTIFY_SOURCE` bypass detection.
//!
//! Fortify is proactive: a fortified build that detects the overflow aborts
//! from `__chk_fail` before any memory is corrupted. A memory fault with the
//! return sentinel on stdout therefore means the checked call was bypassed
//! entirely.

use tracing::{debug, info};

use super::{
    Bug, Oracle, OracleContext, OracleError, OracleOptions, RETURN_SENTINEL, SIGABRT_EXIT,
    SIGBUS_EXIT, SIGSEGV_EXIT, min_crashing_input, run_probe,
};
use crate::{execution::ExecutionResult, seed::Seed};

pub const DEFAULT_MAX_FILL_SIZE: u64 = 4096;

#[derive(Debug, Clone)]
pub struct FortifyOracle {
    max_fill_size: u64,
    negative_cflags: Vec<String>,
}

impl Default for FortifyOracle {
    fn default() -> Self {
        Self {
            max_fill_size: DEFAULT_MAX_FILL_SIZE,
            negative_cflags: Vec::new(),
        }
    }
}

impl FortifyOracle {
    pub fn new(max_fill_size: u64, negative_cflags: Vec<String>) -> Self {
        Self {
            max_fill_size,
            negative_cflags,
        }
    }

    pub fn from_options(options: &OracleOptions) -> Result<Self, OracleError> {
        let defaults = Self::default();
        Ok(Self {
            max_fill_size: options
                .get_u64("max_fill_size")?
                .unwrap_or(defaults.max_fill_size),
            negative_cflags: options.get_strings("negative_cflags")?,
        })
    }
}

impl Oracle for FortifyOracle {
    fn name(&self) -> &'static str {
        "fortify"
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
            debug!(seed = seed.id, flag, "Seed disables fortification, skipping");
            return Ok(None);
        }
        let binary = ctx.binary.ok_or(OracleError::MissingBinary {
            oracle: self.name(),
        })?;

        let found = min_crashing_input(
            |fill| run_probe(ctx.executor, binary, &[fill.to_string()]),
            self.max_fill_size,
        );
        let Some((min_fill, searched)) = found else {
            return Ok(None);
        };
        let confirmed =
            run_probe(ctx.executor, binary, &[min_fill.to_string()]).unwrap_or(searched);

        let returned = confirmed.stdout.contains(RETURN_SENTINEL);
        match confirmed.exit_code {
            // __chk_fail aborts before corruption: the mitigation held.
            SIGABRT_EXIT => Ok(None),
            SIGSEGV_EXIT | SIGBUS_EXIT if returned => {
                info!(seed = seed.id, min_fill, "Fortify bypass detected");
                Ok(Some(Bug {
                    seed_id: seed.id,
                    oracle: self.name().to_owned(),
                    description: format!(
                        "fortify bypass: a {min_fill}-byte fill faulted after the \
                         checked call returned instead of aborting in __chk_fail \
                         (exit code {code})",
                        code = confirmed.exit_code,
                    ),
                    execution_results: vec![confirmed],
                }))
            }
            _ if returned => Ok(Some(Bug {
                seed_id: seed.id,
                oracle: self.name().to_owned(),
                description: format!(
                    "potential fortify bypass: fill {min_fill} exits with code \
                     {code} after the checked call returned",
                    code = confirmed.exit_code,
                ),
                execution_results: vec![confirmed],
            })),
            _ => Ok(None),
        }
    }
}
