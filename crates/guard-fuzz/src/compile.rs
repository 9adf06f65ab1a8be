//! Invoking the target compiler over a candidate seed.

use std::{
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use anyhow::Context;
use tracing::debug;

/// Result of one compiler invocation. A failed compile is an outcome, not an
/// error; the loop turns it into a retry prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileOutcome {
    Success { binary: PathBuf },
    Failed { exit_code: i32, stderr: String },
}

pub trait Compiler {
    /// Compiles `source` with the seed's flags into `out_dir`, which also
    /// receives the instrumentation side products (coverage notes, CFG dumps).
    fn compile(
        &self,
        source: &Path,
        cflags: &[String],
        out_dir: &Path,
    ) -> anyhow::Result<CompileOutcome>;
}

const BINARY_NAME: &str = "seed.bin";

/// Shells out to a GCC-compatible driver with coverage instrumentation.
#[derive(Debug, Clone)]
pub struct GccCompiler {
    cc: String,
    instrument_flags: Vec<String>,
}

impl GccCompiler {
    pub fn new(cc: impl Into<String>) -> Self {
        Self {
            cc: cc.into(),
            instrument_flags: vec!["--coverage".to_owned()],
        }
    }

    pub fn with_instrument_flags(mut self, flags: Vec<String>) -> Self {
        self.instrument_flags = flags;
        self
    }
}

impl Compiler for GccCompiler {
    fn compile(
        &self,
        source: &Path,
        cflags: &[String],
        out_dir: &Path,
    ) -> anyhow::Result<CompileOutcome> {
        let binary = out_dir.join(BINARY_NAME);
        let output = Command::new(&self.cc)
            .args(&self.instrument_flags)
            .args(cflags)
            .arg("-o")
            .arg(&binary)
            .arg(source)
            .current_dir(out_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("Spawning compiler {}", self.cc))?;

        let exit_code = output.status.code().unwrap_or(-1);
        if output.status.success() {
            debug!(binary = %binary.display(), "Compile succeeded");
            Ok(CompileOutcome::Success { binary })
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            debug!(exit_code, "Compile failed");
            Ok(CompileOutcome::Failed { exit_code, stderr })
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn cc_available() -> bool {
        Command::new("cc")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|status| status.success())
    }

    #[test]
    fn compiles_a_trivial_program() {
        if !cc_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("t.c");
        std::fs::write(&source, "int main(void) { return 0; }\n").unwrap();

        let compiler = GccCompiler::new("cc").with_instrument_flags(vec![]);
        let outcome = compiler.compile(&source, &[], dir.path()).unwrap();
        match outcome {
            CompileOutcome::Success { binary } => assert!(binary.exists()),
            CompileOutcome::Failed { stderr, .. } => panic!("unexpected failure: {stderr}"),
        }
    }

    #[test]
    fn reports_diagnostics_on_failure() {
        if !cc_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("t.c");
        std::fs::write(&source, "int main(void) { return broken; }\n").unwrap();

        let compiler = GccCompiler::new("cc").with_instrument_flags(vec![]);
        let outcome = compiler.compile(&source, &[], dir.path()).unwrap();
        match outcome {
            CompileOutcome::Failed { exit_code, stderr } => {
                assert_ne!(exit_code, 0);
                assert!(stderr.contains("broken"));
            }
            CompileOutcome::Success { .. } => panic!("expected a failure"),
        }
    }
}
