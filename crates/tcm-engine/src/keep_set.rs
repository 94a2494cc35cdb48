//! Keep-set extraction from rule expressions
//!
//! Metric names are pulled out of PromQL syntactically: vector selectors,
//! `__name__` equality matchers and purely literal `__name__` alternations.
//! Function names, aggregation operators, keywords, grouping label lists,
//! string literals, durations and numbers are skipped. Nothing is evaluated.

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::OnceLock;
use tcm_core::{KeepSet, RulesConfig};
use tracing::{debug, info};

const KEYWORDS: &[&str] = &[
    "and", "or", "unless", "by", "without", "on", "ignoring", "group_left", "group_right",
    "offset", "bool", "atan2", "inf", "nan",
];

/// Keywords followed by a parenthesised label list
const GROUPING: &[&str] = &["by", "without", "on", "ignoring", "group_left", "group_right"];

const AGGREGATORS: &[&str] = &[
    "sum", "min", "max", "avg", "group", "stddev", "stdvar", "count", "count_values",
    "bottomk", "topk", "quantile", "limitk", "limit_ratio",
];

/// Build the keep set from scratch
///
/// The result replaces any previous set; nothing is merged.
pub fn build_keep_set(rules: &RulesConfig) -> KeepSet {
    let mut names = BTreeSet::new();

    for expr in rules.expressions() {
        let extracted = extract_metric_names(expr);
        debug!(expr = %expr, metrics = ?extracted, "Extracted protected metrics");
        names.extend(extracted);
    }

    names.extend(rules.extra_keep.iter().cloned());

    info!(
        protected = names.len(),
        alerting_rules = rules.alerting.len(),
        recording_rules = rules.recording.len(),
        "Built keep set"
    );

    names.into_iter().collect()
}

/// Metric names referenced by one PromQL expression
pub fn extract_metric_names(expr: &str) -> BTreeSet<String> {
    let chars: Vec<char> = expr.chars().collect();
    let mut names = BTreeSet::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '"' | '\'' | '`' => i = skip_string(&chars, i),
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '{' => i = scan_matchers(&chars, i, &mut names),
            '[' => i = skip_balanced(&chars, i, '[', ']'),
            c if is_ident_start(c) => {
                let start = i;
                while i < chars.len() && is_ident_char(chars[i]) {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().collect();
                let lower = ident.to_ascii_lowercase();
                let next = skip_whitespace(&chars, i);

                if GROUPING.contains(&lower.as_str()) {
                    if chars.get(next) == Some(&'(') {
                        i = skip_balanced(&chars, next, '(', ')');
                    }
                    continue;
                }

                if KEYWORDS.contains(&lower.as_str()) {
                    continue;
                }

                // Function call or aggregation
                if chars.get(next) == Some(&'(') {
                    continue;
                }

                // Aggregation with a leading modifier: `sum by (job) (...)`
                if AGGREGATORS.contains(&lower.as_str()) && starts_grouping(&chars, next) {
                    continue;
                }

                names.insert(ident);
            }
            c if c.is_ascii_digit() || c == '.' => {
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '.' || chars[i] == '_') {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }

    names
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == ':'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == ':'
}

fn skip_whitespace(chars: &[char], mut i: usize) -> usize {
    while i < chars.len() && chars[i].is_whitespace() {
        i += 1;
    }
    i
}

fn starts_grouping(chars: &[char], i: usize) -> bool {
    let mut end = i;
    while end < chars.len() && is_ident_char(chars[end]) {
        end += 1;
    }
    let word: String = chars[i..end].iter().collect();
    matches!(word.to_ascii_lowercase().as_str(), "by" | "without")
}

/// Index just past the string literal opening at `start`
fn skip_string(chars: &[char], start: usize) -> usize {
    let quote = chars[start];
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' if quote != '`' => i += 2,
            c if c == quote => return i + 1,
            _ => i += 1,
        }
    }
    chars.len()
}

/// Contents of the string literal opening at `start`, with escapes resolved
fn read_string(chars: &[char], start: usize) -> (String, usize) {
    let quote = chars[start];
    let mut value = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' if quote != '`' && i + 1 < chars.len() => {
                value.push(chars[i + 1]);
                i += 2;
            }
            c if c == quote => return (value, i + 1),
            c => {
                value.push(c);
                i += 1;
            }
        }
    }
    (value, chars.len())
}

fn skip_balanced(chars: &[char], start: usize, open: char, close: char) -> usize {
    let mut depth = 0usize;
    let mut i = start;
    while i < chars.len() {
        match chars[i] {
            '"' | '\'' | '`' => {
                i = skip_string(chars, i);
                continue;
            }
            c if c == open => depth += 1,
            c if c == close => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return i + 1;
                }
            }
            _ => {}
        }
        i += 1;
    }
    chars.len()
}

/// Scan a `{...}` matcher list, collecting metric names it pins down
fn scan_matchers(chars: &[char], start: usize, names: &mut BTreeSet<String>) -> usize {
    let mut i = start + 1;

    loop {
        i = skip_whitespace(chars, i);
        match chars.get(i) {
            None => return chars.len(),
            Some('}') => return i + 1,
            Some(',') => {
                i += 1;
                continue;
            }
            Some('"') | Some('\'') | Some('`') => {
                // Quoted metric name, or a quoted label name followed by an operator
                let (value, end) = read_string(chars, i);
                let next = skip_whitespace(chars, end);
                if matches!(chars.get(next), Some(',') | Some('}') | None) {
                    names.insert(value);
                    i = end;
                    continue;
                }
                i = scan_matcher_tail(chars, next, &value, names);
            }
            Some(&c) if is_ident_start(c) => {
                let name_start = i;
                while i < chars.len() && is_ident_char(chars[i]) {
                    i += 1;
                }
                let label: String = chars[name_start..i].iter().collect();
                let next = skip_whitespace(chars, i);
                i = scan_matcher_tail(chars, next, &label, names);
            }
            Some(_) => i += 1,
        }
    }
}

/// Parse `op "value"` after a label name, returning the index past the value
fn scan_matcher_tail(
    chars: &[char],
    start: usize,
    label: &str,
    names: &mut BTreeSet<String>,
) -> usize {
    let mut i = start;
    let mut op = String::new();
    while i < chars.len() && matches!(chars[i], '=' | '!' | '~') {
        op.push(chars[i]);
        i += 1;
    }
    i = skip_whitespace(chars, i);

    if !matches!(chars.get(i), Some('"') | Some('\'') | Some('`')) {
        return i;
    }
    let (value, end) = read_string(chars, i);

    if label == tcm_core::labels::METRIC_NAME_LABEL {
        match op.as_str() {
            "=" => {
                names.insert(value);
            }
            "=~" if literal_alternation().is_match(&value) => {
                names.extend(value.split('|').map(str::to_string));
            }
            _ => debug!(matcher = %value, op = %op, "Skipping non-literal metric name matcher"),
        }
    }

    end
}

fn literal_alternation() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-zA-Z_:][a-zA-Z0-9_:]*(\|[a-zA-Z_:][a-zA-Z0-9_:]*)*$")
            .unwrap_or_else(|e| panic!("invalid metric alternation pattern: {}", e))
    })
}
