//! Prompt construction for the LLM.
//!
//! Templates are loaded once; every builder method is a pure function of its
//! inputs, so identical targets produce identical prompts.

use std::{fmt::Write as _, fs, io, path::Path};

use anyhow::Context;

use crate::{
    response::{CFLAGS_END, CFLAGS_START, TESTCASES_SEPARATOR},
    seed::Seed,
    selector::TargetInfo,
};

const SYSTEM_PROMPT_FILE: &str = "system.md";
const FUNCTION_TEMPLATE_FILE: &str = "function_template.c";

/// Holds the loaded template set and the opaque "understanding" document.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    system_prompt: String,
    function_template: Option<String>,
}

impl PromptBuilder {
    /// Reads `system.md` (required) and `function_template.c` (optional) from
    /// `template_dir`. The understanding text, when present, is appended to
    /// the system prompt verbatim.
    pub fn load(template_dir: &Path, understanding: Option<&str>) -> anyhow::Result<Self> {
        let base = fs::read_to_string(template_dir.join(SYSTEM_PROMPT_FILE))
            .with_context(|| format!("Reading {SYSTEM_PROMPT_FILE} from {}", template_dir.display()))?;
        let function_template = read_optional(&template_dir.join(FUNCTION_TEMPLATE_FILE))
            .context("Reading function template")?;

        let mut system_prompt = base;
        if let Some(understanding) = understanding {
            system_prompt.push_str("\n\n");
            system_prompt.push_str(understanding);
        }
        Ok(Self {
            system_prompt,
            function_template,
        })
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// The template the response parser merges function bodies into, if one
    /// is configured.
    pub fn function_template(&self) -> Option<&str> {
        self.function_template.as_deref()
    }

    /// The initial prompt for a target: describes the uncovered block as a
    /// constraint-solving problem seeded with a nearby covered program.
    pub fn constraint_solving(&self, target: &TargetInfo, base: Option<&Seed>) -> String {
        let mut prompt = String::new();
        self.write_target(&mut prompt, target);
        match base {
            Some(seed) => {
                writeln!(
                    prompt,
                    "The following C program already drives the compiler close to that \
                     block{}. Modify it so the compiler's control flow reaches the \
                     target lines.",
                    target
                        .base_seed_line
                        .map(|line| format!(" (it covers line {line})"))
                        .unwrap_or_default(),
                )
                .expect("writing to String cannot fail");
                write_code_block(&mut prompt, &seed.content);
            }
            None => {
                prompt.push_str(
                    "No existing program reaches nearby code. Write a fresh C program \
                     that forces the compiler down the target path.\n",
                );
            }
        }
        self.write_format_contract(&mut prompt);
        prompt
    }

    /// Retry prompt after a divergence: the previous attempt missed the
    /// target block.
    pub fn refined(
        &self,
        target: &TargetInfo,
        divergent_function: &str,
        base: Option<&Seed>,
    ) -> String {
        let mut prompt = String::new();
        self.write_target(&mut prompt, target);
        writeln!(
            prompt,
            "Your previous program diverged: compiler execution left the intended \
             path inside `{divergent_function}` and the target block stayed \
             uncovered. Adjust the program so the branch conditions in \
             `{divergent_function}` take the other direction.",
        )
        .expect("writing to String cannot fail");
        if let Some(seed) = base {
            prompt.push_str("Start again from the known-good base program:\n");
            write_code_block(&mut prompt, &seed.content);
        }
        self.write_format_contract(&mut prompt);
        prompt
    }

    /// Retry prompt after the candidate failed to compile (or to parse).
    pub fn compile_error(&self, target: &TargetInfo, stderr: &str, failed_code: &str) -> String {
        let mut prompt = String::new();
        self.write_target(&mut prompt, target);
        prompt.push_str("Your previous program was rejected:\n");
        write_code_block(&mut prompt, failed_code);
        prompt.push_str("The compiler reported:\n");
        write_code_block(&mut prompt, stderr);
        prompt.push_str("Fix the program without abandoning the target.\n");
        self.write_format_contract(&mut prompt);
        prompt
    }

    /// Free mutation of an existing seed, optionally steered by a note.
    pub fn mutate(&self, seed: &Seed, note: Option<&str>) -> String {
        let mut prompt = String::new();
        prompt.push_str("Mutate the following C program into a new variant that exercises \
                         different compiler behavior.\n");
        if let Some(note) = note {
            writeln!(prompt, "Guidance: {note}").expect("writing to String cannot fail");
        }
        write_code_block(&mut prompt, &seed.content);
        self.write_format_contract(&mut prompt);
        prompt
    }

    fn write_target(&self, prompt: &mut String, target: &TargetInfo) {
        writeln!(
            prompt,
            "Coverage target: basic block {bb} of compiler function `{function}` \
             ({succs} outgoing edges).",
            bb = target.bb_id,
            function = target.function,
            succs = target.successor_count,
        )
        .expect("writing to String cannot fail");
        if let (Some(file), false) = (&target.file, target.lines.is_empty()) {
            writeln!(
                prompt,
                "The block spans source lines {lines:?} of {file}.",
                lines = target.lines,
                file = file.display(),
            )
            .expect("writing to String cannot fail");
        }
        if let Some(distance) = target.distance_from_base {
            writeln!(prompt, "The base program covers code {distance} line(s) away.")
                .expect("writing to String cannot fail");
        }
        prompt.push('\n');
    }

    fn write_format_contract(&self, prompt: &mut String) {
        prompt.push('\n');
        if self.function_template.is_some() {
            prompt.push_str(
                "Reply with the body of a single function only; it will be spliced \
                 into a fixed harness.\n",
            );
        } else {
            prompt.push_str("Reply with a complete, self-contained C program.\n");
        }
        writeln!(
            prompt,
            "After the code, emit the line `{TESTCASES_SEPARATOR}` followed by a JSON \
             array of objects with keys \"running command\" and \"expected result\". \
             Extra compile flags, one per line, may be wrapped between \
             `{CFLAGS_START}` and `{CFLAGS_END}`.",
        )
        .expect("writing to String cannot fail");
    }
}

fn read_optional(path: &Path) -> io::Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(text) if text.trim().is_empty() => Ok(None),
        Ok(text) => Ok(Some(text)),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(error) => Err(error),
    }
}

fn write_code_block(prompt: &mut String, code: &str) {
    prompt.push_str("```c\n");
    prompt.push_str(code.trim_end());
    prompt.push_str("\n```\n");
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::seed::TestCase;

    fn builder_with(understanding: Option<&str>) -> PromptBuilder {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(SYSTEM_PROMPT_FILE), "You fuzz compilers.\n").unwrap();
        PromptBuilder::load(dir.path(), understanding).unwrap()
    }

    fn target() -> TargetInfo {
        TargetInfo {
            function: "stack_protect_prologue".to_owned(),
            bb_id: 4,
            successor_count: 3,
            lines: vec![30, 31],
            file: Some("/src/g.c".into()),
            base_seed_id: Some(3),
            base_seed_line: Some(10),
            distance_from_base: Some(1),
        }
    }

    #[test]
    fn missing_system_template_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(PromptBuilder::load(dir.path(), None).is_err());
    }

    #[test]
    fn understanding_is_appended_to_the_system_prompt() {
        let builder = builder_with(Some("The pass guards large arrays."));
        assert!(builder.system_prompt().starts_with("You fuzz compilers."));
        assert!(builder.system_prompt().ends_with("The pass guards large arrays."));
    }

    #[test]
    fn prompts_are_deterministic_and_carry_the_contract() {
        let builder = builder_with(None);
        let seed = Seed::new(
            3,
            "int main(void) { return 0; }\n".to_owned(),
            vec![TestCase::new("./seed.bin", "0")],
            vec![],
        );
        let a = builder.constraint_solving(&target(), Some(&seed));
        let b = builder.constraint_solving(&target(), Some(&seed));
        assert_eq!(a, b);
        assert!(a.contains("stack_protect_prologue"));
        assert!(a.contains(TESTCASES_SEPARATOR));
        assert!(a.contains("int main(void)"));
    }

    #[test]
    fn refined_prompt_names_the_divergent_function() {
        let builder = builder_with(None);
        let prompt = builder.refined(&target(), "expand_stack_guard", None);
        assert!(prompt.contains("expand_stack_guard"));
        assert!(prompt.contains("diverged"));
    }

    #[test]
    fn compile_error_prompt_quotes_the_diagnostics() {
        let builder = builder_with(None);
        let prompt = builder.compile_error(&target(), "t.c:3: error: expected ';'", "int main(");
        assert!(prompt.contains("expected ';'"));
        assert!(prompt.contains("int main("));
    }
}
