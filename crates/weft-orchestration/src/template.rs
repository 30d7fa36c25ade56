//! Prompt templates for pipeline stages.
//!
//! Placeholders:
//!
//! - `{{input}}`: the pipeline's initial input
//! - `{{previous}}`: the previous stage's full output (the initial input
//!   for the first stage)
//! - `{{history}}`: every earlier stage output, as `Stage N output:` blocks
//! - `{{previous.<path>}}`: a field of the previous output parsed as JSON,
//!   with dotted paths for nested objects and numeric segments for arrays

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

use crate::result::StageOutput;

static FIELD_PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*previous\.([A-Za-z0-9_.\-]+)\s*\}\}").expect("static pattern")
});

/// What a pipeline stage receives as input.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum InputMapping {
    /// The previous stage's full output
    #[default]
    Previous,
    /// A single field of the previous output parsed as JSON
    Field(String),
    /// A prompt template
    Template(String),
}

/// Values available to a stage's template.
pub(crate) struct StageContext<'a> {
    pub input: &'a str,
    pub previous: &'a str,
    pub history: &'a [StageOutput],
    pub pass_full_history: bool,
}

impl InputMapping {
    pub(crate) fn render(&self, ctx: &StageContext<'_>) -> String {
        match self {
            InputMapping::Previous => ctx.previous.to_string(),
            InputMapping::Field(path) => extract_field(ctx.previous, path).unwrap_or_default(),
            InputMapping::Template(template) => render_template(template, ctx),
        }
    }
}

fn render_template(template: &str, ctx: &StageContext<'_>) -> String {
    let history = format_history(ctx.history);
    let mut out = FIELD_PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures<'_>| {
            extract_field(ctx.previous, &caps[1]).unwrap_or_else(|| {
                tracing::debug!(field = %&caps[1], "Template field missing from previous output");
                String::new()
            })
        })
        .into_owned();

    let mentions_history = out.contains("{{history}}");
    out = out
        .replace("{{input}}", ctx.input)
        .replace("{{previous}}", ctx.previous)
        .replace("{{history}}", &history);

    if ctx.pass_full_history && !mentions_history && !history.is_empty() {
        out.push_str("\n\nPrevious stages:\n");
        out.push_str(&history);
    }
    out
}

/// `Stage N output:` blocks separated by blank lines.
pub(crate) fn format_history(history: &[StageOutput]) -> String {
    history
        .iter()
        .map(|stage| format!("Stage {} output:\n{}\n\n", stage.stage, stage.output.output))
        .collect()
}

/// Extract a dotted path from text parsed as JSON. Strings come back
/// unquoted, everything else as compact JSON.
pub fn extract_field(text: &str, path: &str) -> Option<String> {
    let root: Value = serde_json::from_str(text.trim()).ok()?;
    let value = path.split('.').try_fold(&root, |value, segment| match value {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })?;
    Some(match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

/// The question asked of a stage about its own output. `{{output}}` marks
/// where the output goes; without it the output is appended.
pub(crate) fn validation_prompt(check: &str, output: &str) -> String {
    if check.contains("{{output}}") {
        check.replace("{{output}}", output)
    } else {
        format!("{check}\n\nOutput to validate:\n{output}")
    }
}

/// Re-run prompt for a stage whose output was rejected.
pub(crate) fn retry_prompt(input: &str, rejected: &str, feedback: &str, attempt: u32) -> String {
    format!(
        "VALIDATION FAILED (retry {attempt})\n\n\
         Your previous output was rejected.\n\n\
         Feedback:\n{}\n\n\
         Rejected output:\n{rejected}\n\n\
         Address the feedback and complete the task again:\n\n{input}",
        feedback.trim()
    )
}

/// Whether a validation reply accepts the stage output.
///
/// The first verdict word in the reply decides, so "Yes, no issues found"
/// passes and "This is not valid" fails. A reply without one fails.
pub(crate) fn validation_passed(reply: &str) -> bool {
    const YES: &[&str] = &["valid", "yes", "true", "pass", "passed", "approved", "ok", "lgtm"];
    const NO: &[&str] = &["invalid", "no", "not", "false", "fail", "failed", "rejected"];
    reply
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .find_map(|w| {
            if YES.contains(&w.as_str()) {
                Some(true)
            } else if NO.contains(&w.as_str()) {
                Some(false)
            } else {
                None
            }
        })
        .unwrap_or(false)
}
