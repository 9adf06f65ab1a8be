//! Parsing of LLM free text into code, test cases, and compile flags.
//!
//! The LLM is treated as an adversarial structured-text producer: every way the
//! response can deviate from the wire contract is a distinct error variant, so
//! the fuzzing loop can feed a precise complaint back into the next prompt.

use serde::Deserialize;

use crate::seed::TestCase;

/// Separates the code region from the JSON test-case array. Wire constant.
pub const TESTCASES_SEPARATOR: &str = "// ||||| JSON_TESTCASES_START |||||";
/// Brackets an optional per-line compile-flag block. Wire constants.
pub const CFLAGS_START: &str = "// ||||| CFLAGS_START |||||";
pub const CFLAGS_END: &str = "// ||||| CFLAGS_END |||||";
/// Prefix of the placeholder line replaced in function-template mode.
pub const FUNCTION_PLACEHOLDER_PREFIX: &str = "// FUNCTION_PLACEHOLDER:";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ResponseError {
    #[error("response has no `{TESTCASES_SEPARATOR}` separator")]
    MissingSeparator,
    #[error("code region is empty")]
    EmptyCode,
    #[error("malformed test-case JSON: {message}")]
    TestCaseJson { message: String },
    #[error("test-case array is empty")]
    NoTestCases,
    #[error("test case {index} has an empty running command")]
    EmptyRunningCommand { index: usize },
    #[error("compile flag line {line:?} does not start with `-`")]
    MalformedCflag { line: String },
    #[error("cflags block is not terminated by `{CFLAGS_END}`")]
    UnterminatedCflags,
    #[error("function template has no `{FUNCTION_PLACEHOLDER_PREFIX}` marker")]
    MissingPlaceholder,
}

/// A successfully decomposed LLM response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedResponse {
    pub code: String,
    pub test_cases: Vec<TestCase>,
    pub cflags: Vec<String>,
}

/// Splits raw LLM output at the marker contract.
///
/// In function-template mode (a non-empty template is configured) the code
/// region is treated as the text of a single function and substituted into the
/// template at the placeholder marker.
#[derive(Debug, Clone)]
pub struct ResponseParser {
    function_template: Option<String>,
}

impl ResponseParser {
    pub fn new(function_template: Option<String>) -> Self {
        Self {
            function_template: function_template.filter(|t| !t.trim().is_empty()),
        }
    }

    pub fn parse(&self, raw: &str) -> Result<ParsedResponse, ResponseError> {
        let (remainder, cflags) = extract_cflags(raw)?;

        let (code_region, json_region) = remainder
            .split_once(TESTCASES_SEPARATOR)
            .ok_or(ResponseError::MissingSeparator)?;

        let code = strip_fences(code_region);
        if code.trim().is_empty() {
            return Err(ResponseError::EmptyCode);
        }
        let code = match &self.function_template {
            Some(template) => merge_into_template(template, &code)?,
            None => code,
        };

        let test_cases = parse_test_cases(&strip_fences(json_region))?;

        Ok(ParsedResponse {
            code,
            test_cases,
            cflags,
        })
    }
}

/// Removes the cflags block from the text and returns the retained flags.
///
/// Inside the block, blank lines and lines starting with `#` or `//` are
/// ignored; every other line must start with `-`.
fn extract_cflags(raw: &str) -> Result<(String, Vec<String>), ResponseError> {
    let Some(start) = raw.find(CFLAGS_START) else {
        return Ok((raw.to_owned(), Vec::new()));
    };
    let after_start = start + CFLAGS_START.len();
    let Some(end_offset) = raw[after_start..].find(CFLAGS_END) else {
        return Err(ResponseError::UnterminatedCflags);
    };
    let block = &raw[after_start..after_start + end_offset];

    let mut cflags = Vec::new();
    for line in block.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
            continue;
        }
        if !line.starts_with('-') {
            return Err(ResponseError::MalformedCflag {
                line: line.to_owned(),
            });
        }
        cflags.push(line.to_owned());
    }

    let mut remainder = String::with_capacity(raw.len());
    remainder.push_str(&raw[..start]);
    remainder.push_str(&raw[after_start + end_offset + CFLAGS_END.len()..]);
    Ok((remainder, cflags))
}

/// Drops fence delimiter lines (``` with an optional `c`/`cpp`/`json` tag).
/// The fenced content itself is kept verbatim.
fn strip_fences(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn parse_test_cases(json: &str) -> Result<Vec<TestCase>, ResponseError> {
    #[derive(Deserialize)]
    #[serde(transparent)]
    struct Cases(Vec<TestCase>);

    let Cases(cases) =
        serde_json::from_str(json.trim()).map_err(|error| ResponseError::TestCaseJson {
            message: error.to_string(),
        })?;
    if cases.is_empty() {
        return Err(ResponseError::NoTestCases);
    }
    for (index, case) in cases.iter().enumerate() {
        if case.running_command.trim().is_empty() {
            return Err(ResponseError::EmptyRunningCommand { index });
        }
    }
    Ok(cases)
}

/// Substitutes the function text into the template at the placeholder.
///
/// The replaced span is either the placeholder line itself or, when the marker
/// sits inside a `/* ... */` block comment, that whole comment. The function
/// text is re-indented to the placeholder's indentation.
fn merge_into_template(template: &str, function: &str) -> Result<String, ResponseError> {
    let marker_pos = template
        .find(FUNCTION_PLACEHOLDER_PREFIX)
        .ok_or(ResponseError::MissingPlaceholder)?;

    let (raw_start, span_end) = match enclosing_block_comment(template, marker_pos) {
        Some(span) => span,
        None => {
            let line_start = template[..marker_pos].rfind('\n').map_or(0, |p| p + 1);
            let line_end = template[marker_pos..]
                .find('\n')
                .map_or(template.len(), |p| marker_pos + p);
            (line_start, line_end)
        }
    };

    // Widen the span to the start of its line when only indentation precedes
    // it, then take that indentation for the substituted function text.
    let line_start = template[..raw_start].rfind('\n').map_or(0, |p| p + 1);
    let span_start = if template[line_start..raw_start]
        .chars()
        .all(|c| c == ' ' || c == '\t')
    {
        line_start
    } else {
        raw_start
    };
    let indent: String = template[span_start..span_end]
        .chars()
        .take_while(|&c| c == ' ' || c == '\t')
        .collect();

    let indented = function
        .trim()
        .lines()
        .map(|line| {
            if line.trim().is_empty() {
                String::new()
            } else {
                format!("{indent}{line}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n");

    let mut merged = String::with_capacity(template.len() + indented.len());
    merged.push_str(&template[..span_start]);
    merged.push_str(&indented);
    merged.push_str(&template[span_end..]);
    Ok(merged)
}

/// Returns the byte span of the `/* ... */` comment containing `pos`, if any.
fn enclosing_block_comment(text: &str, pos: usize) -> Option<(usize, usize)> {
    let open = text[..pos].rfind("/*")?;
    // Only an enclosing comment counts: the comment must still be open at `pos`.
    if let Some(close_before) = text[open..pos].find("*/") {
        debug_assert!(open + close_before < pos);
        return None;
    }
    let close = text[pos..].find("*/")?;
    Some((open, pos + close + 2))
}
