//! Normalization of free-form code submissions.
//!
//! Upstream text generators tend to wrap code in Markdown fences, collapse it
//! onto one line, or paste it with an enclosing indent. `normalize` repairs
//! those artifacts with a fixed set of narrow rules, applied in order.

use serde::Serialize;

/// Opening fence accepted at the start of a submission
pub const FENCE_OPEN: &str = "```python";
/// Closing fence accepted at the end of a submission
pub const FENCE_CLOSE: &str = "```";
/// File the show-to-save rewrite saves into, relative to the working directory
pub const FALLBACK_IMAGE_NAME: &str = "output.png";

const SHOW_CALL: &str = "plt.show()";
const IMPORT_KEYWORD: &str = "import ";

/// A normalization rule that changed the submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
    StripFence,
    SplitSemicolons,
    SplitImports,
    Dedent,
    ShowToSave,
}

/// Result of normalizing a submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized {
    /// Source text ready for evaluation
    pub source: String,
    /// Rules that changed the text, in application order
    pub applied: Vec<Rule>,
}

impl Normalized {
    pub fn is_empty(&self) -> bool {
        self.source.trim().is_empty()
    }
}

/// Normalize a raw submission into directly evaluable source text
pub fn normalize(code: &str) -> Normalized {
    let mut applied = Vec::new();
    let mut text = code.to_string();

    if let Some(stripped) = strip_fence(&text) {
        text = stripped;
        applied.push(Rule::StripFence);
    }

    if let Some(split) = split_semicolons(&text) {
        text = split;
        applied.push(Rule::SplitSemicolons);
    }

    if let Some(split) = split_imports(&text) {
        text = split;
        applied.push(Rule::SplitImports);
    }

    let dedented = dedent(&text);
    if dedented != text {
        text = dedented;
        applied.push(Rule::Dedent);
    }

    if text.contains(SHOW_CALL) {
        text = text.replace(SHOW_CALL, &format!("plt.savefig('{}')", FALLBACK_IMAGE_NAME));
        applied.push(Rule::ShowToSave);
    }

    Normalized {
        source: text,
        applied,
    }
}

fn strip_fence(text: &str) -> Option<String> {
    let mut out = text;
    let mut changed = false;
    if let Some(rest) = out.strip_prefix(FENCE_OPEN) {
        out = rest;
        changed = true;
    }
    if let Some(rest) = out.strip_suffix(FENCE_CLOSE) {
        out = rest;
        changed = true;
    }
    changed.then(|| out.to_string())
}

fn split_semicolons(text: &str) -> Option<String> {
    if !text.contains(';') || text.contains('\n') {
        return None;
    }
    Some(text.replace("; ", "\n").replace(';', "\n"))
}

fn split_imports(text: &str) -> Option<String> {
    if text.matches(IMPORT_KEYWORD).count() <= 1 || text.contains('\n') {
        return None;
    }
    let mut parts: Vec<&str> = text.split(IMPORT_KEYWORD).collect();
    if parts.first() == Some(&"") {
        parts.remove(0);
    }
    Some(
        parts
            .into_iter()
            .filter(|part| !part.trim().is_empty())
            .map(|part| format!("{}{}", IMPORT_KEYWORD, part))
            .collect::<Vec<_>>()
            .join("\n"),
    )
}

/// Drop blank lines and remove the indentation shared by every remaining line
fn dedent(text: &str) -> String {
    let lines: Vec<&str> = text.split('\n').filter(|l| !l.trim().is_empty()).collect();

    let min_indent = lines
        .iter()
        .map(|l| l.chars().take_while(|c| c.is_whitespace()).count())
        .min()
        .unwrap_or(0);

    if min_indent == 0 {
        return lines.join("\n");
    }

    lines
        .iter()
        .map(|l| match l.char_indices().nth(min_indent) {
            Some((idx, _)) => &l[idx..],
            None => "",
        })
        .collect::<Vec<_>>()
        .join("\n")
}
