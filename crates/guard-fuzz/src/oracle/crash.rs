//! Passive crash detection over the recorded test-case executions.

use super::{Bug, Oracle, OracleContext, OracleError, is_crash_exit};
use crate::{execution::ExecutionResult, seed::Seed};

/// Flags any test-case execution that died to a crash signal. Needs no
/// executor and no binary.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrashOracle;

impl Oracle for CrashOracle {
    fn name(&self) -> &'static str {
        "crash"
    }

    fn analyze(
        &self,
        seed: &Seed,
        _ctx: &OracleContext<'_>,
        results: &[ExecutionResult],
    ) -> Result<Option<Bug>, OracleError> {
        let crashed: Vec<ExecutionResult> = results
            .iter()
            .filter(|result| is_crash_exit(result.exit_code))
            .cloned()
            .collect();
        if crashed.is_empty() {
            return Ok(None);
        }
        let codes: Vec<i32> = crashed.iter().map(|result| result.exit_code).collect();
        Ok(Some(Bug {
            seed_id: seed.id,
            oracle: self.name().to_owned(),
            description: format!(
                "{} of {} test cases crashed (exit codes {codes:?})",
                crashed.len(),
                results.len(),
            ),
            execution_results: crashed,
        }))
    }
}
