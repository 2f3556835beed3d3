//! Document Formatter.
//!
//! Pure functions from structured artefacts to canonical text. Rendering
//! builds a raw section stream and then runs it through the same
//! normaliser applied to free text, so `format_document` is idempotent on
//! anything the renderers produce.
//!
//! Canonical shape:
//! - `# TITLE` header, one blank line, body, one blank line before the next header
//! - blank runs collapse to a single blank line
//! - exactly one trailing newline
//! - 7-bit ASCII only

use crate::core::config::DEFAULT_PLACEHOLDER;
use crate::core::contract::ContractRule;
use crate::core::error::GovernanceError;
use crate::core::knowledge::{KnowledgeObject, SectionValue};
use crate::core::ledger::ExecuteLedger;
use crate::core::route::RoutePlan;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::LazyLock;
use unicode_normalization::UnicodeNormalization;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EncodingStrictness {
    /// Reject any non-ASCII input.
    Strict,
    /// Approximate non-ASCII input, `?` when nothing fits.
    #[default]
    Transliterate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatOptions {
    pub strictness: EncodingStrictness,
    pub placeholder: String,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            strictness: EncodingStrictness::default(),
            placeholder: DEFAULT_PLACEHOLDER.to_string(),
        }
    }
}

static FENCED_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?ms)^```[ \t]*([A-Za-z0-9_+-]*)[ \t]*\n(.*?)^```[ \t]*$").unwrap());

fn is_header(line: &str) -> bool {
    line.starts_with("# ")
}

/// Whitespace and heading normalisation.
///
/// Line endings become LF, trailing whitespace is trimmed, leading blank
/// lines are dropped, every header gets exactly one blank line on each
/// side, blank runs collapse to one, and the result ends in one newline.
pub fn normalise_sections(text: &str) -> String {
    let text = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut lines: Vec<&str> = Vec::new();
    let mut pending_blank = false;
    let mut after_header = false;

    for raw in text.split('\n') {
        let line = raw.trim_end();
        if line.is_empty() {
            pending_blank = true;
            continue;
        }
        let header = is_header(line);
        if !lines.is_empty() && (pending_blank || header || after_header) {
            lines.push("");
        }
        lines.push(line);
        pending_blank = false;
        after_header = header;
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

fn transliterate_char(c: char) -> Option<&'static str> {
    let s = match c {
        '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}' | '\u{2032}' => "'",
        '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{201F}' | '\u{2033}' => "\"",
        '\u{00AB}' => "<<",
        '\u{00BB}' => ">>",
        '\u{2010}' | '\u{2011}' | '\u{2012}' | '\u{2013}' | '\u{2212}' => "-",
        '\u{2014}' | '\u{2015}' => "--",
        '\u{2022}' | '\u{2023}' | '\u{2043}' | '\u{00B7}' => "*",
        '\u{2190}' => "<-",
        '\u{2192}' => "->",
        '\u{2194}' => "<->",
        '\u{21D2}' => "=>",
        '\u{00D7}' => "x",
        '\u{00F7}' => "/",
        '\u{00DF}' => "ss",
        '\u{00C6}' => "AE",
        '\u{00E6}' => "ae",
        '\u{0152}' => "OE",
        '\u{0153}' => "oe",
        '\u{00D8}' => "O",
        '\u{00F8}' => "o",
        '\u{0110}' => "D",
        '\u{0111}' => "d",
        '\u{0141}' => "L",
        '\u{0142}' => "l",
        '\u{20AC}' => "EUR",
        '\u{00A3}' => "GBP",
        '\u{00A9}' => "(c)",
        '\u{00AE}' => "(r)",
        '\u{2713}' | '\u{2714}' => "[x]",
        _ => return None,
    };
    Some(s)
}

/// Compatibility folding that keeps the value readable: `1/2` for a
/// vulgar fraction, `^2` and `_2` for super- and subscripts.
fn fold_compatible(c: char) -> Option<String> {
    let marker = match c {
        '\u{00B2}' | '\u{00B3}' | '\u{00B9}' | '\u{2070}'..='\u{207F}' => "^",
        '\u{2080}'..='\u{209C}' => "_",
        _ => "",
    };
    let folded: String = c
        .to_string()
        .nfkd()
        .map(|d| if d == '\u{2044}' { '/' } else { d })
        .filter(char::is_ascii)
        .collect();
    if folded.is_empty() {
        None
    } else {
        Some(format!("{}{}", marker, folded))
    }
}

/// Restrict `text` to 7-bit ASCII according to `strictness`.
pub fn enforce_ascii(text: &str, strictness: EncodingStrictness) -> Result<String, GovernanceError> {
    if text.is_ascii() {
        return Ok(text.to_string());
    }
    if strictness == EncodingStrictness::Strict {
        for (idx, line) in text.lines().enumerate() {
            if let Some(c) = line.chars().find(|c| !c.is_ascii()) {
                return Err(GovernanceError::EncodingViolation(format!(
                    "non-ASCII character '{}' (U+{:04X}) on line {}",
                    c,
                    c as u32,
                    idx + 1
                )));
            }
        }
    }

    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if c.is_ascii() {
            out.push(c);
        } else if let Some(mapped) = transliterate_char(c) {
            out.push_str(mapped);
        } else {
            match fold_compatible(c) {
                Some(folded) => {
                    if folded.contains('/') && out.ends_with(|p: char| p.is_ascii_digit()) {
                        out.push(' ');
                    }
                    out.push_str(&folded);
                }
                None => out.push('?'),
            }
        }
    }
    Ok(out)
}

/// Canonicalise free text: ASCII first, then whitespace and headings.
pub fn format_document(text: &str, opts: &FormatOptions) -> Result<String, GovernanceError> {
    Ok(normalise_sections(&enforce_ascii(text, opts.strictness)?))
}

fn ascii_json(value: &mut JsonValue, strictness: EncodingStrictness) -> Result<(), GovernanceError> {
    match value {
        JsonValue::String(s) => {
            if !s.is_ascii() {
                *s = enforce_ascii(s, strictness)?;
            }
        }
        JsonValue::Array(items) => {
            for item in items {
                ascii_json(item, strictness)?;
            }
        }
        JsonValue::Object(map) => {
            for item in map.values_mut() {
                ascii_json(item, strictness)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Copy of `value` with every string made ASCII.
pub fn ascii_clean<T>(value: &T, strictness: EncodingStrictness) -> Result<T, GovernanceError>
where
    T: Serialize + DeserializeOwned,
{
    let mut json = serde_json::to_value(value)?;
    ascii_json(&mut json, strictness)?;
    Ok(serde_json::from_value(json)?)
}

/// Bullets by default; numbering only for ordered values.
pub fn render_value(value: &SectionValue) -> String {
    match value {
        SectionValue::Text(text) => text.trim().to_string(),
        SectionValue::Bullets(items) => items
            .iter()
            .map(|item| format!("- {}", item.trim()))
            .collect::<Vec<_>>()
            .join("\n"),
        SectionValue::Steps { steps } => steps
            .iter()
            .enumerate()
            .map(|(idx, step)| format!("{}. {}", idx + 1, step.trim()))
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

fn push_section(out: &mut String, title: &str, body: &str) {
    out.push_str("# ");
    out.push_str(title);
    out.push_str("\n\n");
    out.push_str(body);
    out.push_str("\n\n");
}

fn raw_knowledge(obj: &KnowledgeObject, placeholder: &str) -> String {
    let schema = obj.kind.schema();
    let body_of = |key: &str| {
        obj.get(key)
            .map(render_value)
            .unwrap_or_else(|| placeholder.to_string())
    };

    let mut out = String::new();
    push_section(&mut out, &obj.identifier(), &body_of(schema.summary_key));
    for section in schema.sections {
        let body = section
            .fields
            .iter()
            .map(|field| match field.label {
                Some(label) => format!("{}:\n{}", label, body_of(field.key)),
                None => body_of(field.key),
            })
            .collect::<Vec<_>>()
            .join("\n\n");
        push_section(&mut out, section.title, &body);
    }
    out
}

/// Canonical text for a knowledge object. Every schema section is
/// emitted; absent ones carry the placeholder.
pub fn render_knowledge(obj: &KnowledgeObject, opts: &FormatOptions) -> Result<String, GovernanceError> {
    format_document(&raw_knowledge(obj, &opts.placeholder), opts)
}

/// WKO sections followed by the numbered stage list.
pub fn render_route_plan(plan: &RoutePlan, opts: &FormatOptions) -> Result<String, GovernanceError> {
    let mut out = raw_knowledge(&plan.workflow, &opts.placeholder);
    let stages = if plan.stages.is_empty() {
        opts.placeholder.clone()
    } else {
        plan.stages
            .iter()
            .map(|stage| {
                let mut entry = format!("{}. {} [{}]", stage.stage_number, stage.title, stage.stage_id);
                if !stage.purpose.is_empty() {
                    entry.push_str(&format!("\n   Purpose: {}", stage.purpose));
                }
                if !stage.outputs.is_empty() {
                    let outputs: Vec<&str> = stage
                        .outputs
                        .lines()
                        .map(str::trim)
                        .filter(|l| !l.is_empty())
                        .collect();
                    entry.push_str(&format!("\n   Outputs: {}", outputs.join("; ")));
                }
                if !stage.work_items.is_empty() {
                    let items: Vec<String> = stage
                        .work_items
                        .iter()
                        .map(|w| format!("{} [{}]", w.title, w.wi_id))
                        .collect();
                    entry.push_str(&format!("\n   Work items: {}", items.join("; ")));
                }
                entry
            })
            .collect::<Vec<_>>()
            .join("\n")
    };
    push_section(&mut out, "STAGES", &stages);
    format_document(&out, opts)
}

/// The complete ledger as exactly one fenced `json` block.
pub fn render_ledger_block(ledger: &ExecuteLedger, opts: &FormatOptions) -> Result<String, GovernanceError> {
    let mut json = serde_json::to_value(ledger)?;
    ascii_json(&mut json, opts.strictness)?;
    let pretty = serde_json::to_string_pretty(&json)?;
    Ok(format!("```json\n{}\n```\n", pretty))
}

/// Body of the only fenced block in `text`, which must be labelled `json`.
pub fn extract_single_json_block(text: &str) -> Result<String, GovernanceError> {
    let text = text.replace("\r\n", "\n");
    let blocks: Vec<(String, String)> = FENCED_BLOCK
        .captures_iter(&text)
        .map(|cap| (cap[1].to_ascii_lowercase(), cap[2].to_string()))
        .collect();
    match blocks.as_slice() {
        [] => Err(GovernanceError::contract(
            ContractRule::SingleJsonBlock,
            "no fenced code block found",
        )),
        [(label, body)] if label == "json" => Ok(body.trim_end().to_string()),
        [(label, _)] => Err(GovernanceError::contract(
            ContractRule::SingleJsonBlock,
            format!("fenced block is labelled '{}', expected 'json'", label),
        )),
        many => Err(GovernanceError::contract(
            ContractRule::SingleJsonBlock,
            format!("expected exactly one fenced block, found {}", many.len()),
        )),
    }
}

/// Extract the single `json` block and deserialize it.
pub fn parse_json_block<T: DeserializeOwned>(text: &str) -> Result<T, GovernanceError> {
    let body = extract_single_json_block(text)?;
    serde_json::from_str(&body).map_err(|e| {
        GovernanceError::SchemaViolation(format!("json block does not match the expected shape: {}", e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_get_single_blank_lines() {
        let raw = "# Title\nLine1\n\n\nLine2\n# Next\nBody";
        assert_eq!(
            normalise_sections(raw),
            "# Title\n\nLine1\n\nLine2\n\n# Next\n\nBody\n"
        );
    }

    #[test]
    fn four_blank_lines_collapse_to_one() {
        assert_eq!(normalise_sections("a\n\n\n\n\nb"), "a\n\nb\n");
    }

    #[test]
    fn crlf_and_trailing_space_are_cleaned() {
        assert_eq!(normalise_sections("\r\n\r\na  \r\nb\t\r\n\r\n\r\n"), "a\nb\n");
    }

    #[test]
    fn normalise_is_idempotent_on_headers() {
        let once = normalise_sections("# A\n# B\ntext\n\n\n# C");
        assert_eq!(normalise_sections(&once), once);
    }

    #[test]
    fn transliterates_common_punctuation() {
        let out = enforce_ascii("caf\u{e9} \u{2014} \u{201c}ok\u{201d} \u{2192} na\u{ef}ve", EncodingStrictness::Transliterate)
            .unwrap();
        assert_eq!(out, "cafe -- \"ok\" -> naive");
    }

    #[test]
    fn unknown_characters_become_question_marks() {
        let out = enforce_ascii("\u{4e2d}x", EncodingStrictness::Transliterate).unwrap();
        assert_eq!(out, "?x");
    }

    #[test]
    fn fractions_and_exponents_keep_their_value() {
        let out = enforce_ascii("\u{bd} cup, 2\u{bd} m\u{b2}, H\u{2082}O, x\u{207f}", EncodingStrictness::Transliterate)
            .unwrap();
        assert_eq!(out, "1/2 cup, 2 1/2 m^2, H_2O, x^n");
    }

    #[test]
    fn strict_mode_names_line() {
        let err = enforce_ascii("fine\nna\u{ef}ve", EncodingStrictness::Strict).unwrap_err();
        assert_eq!(err.code(), "ENCODING_VIOLATION");
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn lists_render_bullets_unless_ordered() {
        assert_eq!(render_value(&SectionValue::bullets(["a", "b"])), "- a\n- b");
        assert_eq!(render_value(&SectionValue::steps(["a", "b"])), "1. a\n2. b");
    }

    #[test]
    fn json_block_extraction() {
        let body = extract_single_json_block("Here:\n```json\n{\"a\": 1}\n```\n").unwrap();
        assert_eq!(body, "{\"a\": 1}");

        let none = extract_single_json_block("{\"a\": 1}").unwrap_err();
        assert_eq!(none.rule(), Some(ContractRule::SingleJsonBlock));

        let two = extract_single_json_block("```json\n{}\n```\n```json\n{}\n```\n").unwrap_err();
        assert!(two.to_string().contains("found 2"));

        let unlabelled = extract_single_json_block("```\n{}\n```\n").unwrap_err();
        assert_eq!(unlabelled.rule(), Some(ContractRule::SingleJsonBlock));
    }
}
