//! `${name}` substitution over strings, nested JSON values and script
//! source text.
//!
//! Resolution is best-effort: a name the lookup does not know is left in
//! place verbatim and reported back to the caller, which decides whether
//! that is worth a log line or a hard failure.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([^}]+)\}").expect("failed to compile placeholder regex")
});

/// Text form of a value when spliced into a larger string.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// The variable name when `text` is exactly one `${name}` token.
pub fn bare_reference(text: &str) -> Option<&str> {
    let caps = PLACEHOLDER_RE.captures(text)?;
    let whole = caps.get(0)?;
    (whole.start() == 0 && whole.end() == text.len())
        .then(|| caps.get(1).map(|m| m.as_str()))
        .flatten()
}

/// `true` when `text` contains at least one `${...}` token.
pub fn has_placeholder(text: &str) -> bool {
    PLACEHOLDER_RE.is_match(text)
}

/// Replace every known `${name}` in `text` with the value's text form.
///
/// Unknown names are pushed onto `missing` and kept as written.
pub fn resolve_str<F>(text: &str, lookup: &F, missing: &mut Vec<String>) -> String
where
    F: Fn(&str) -> Option<Value>,
{
    if !text.contains("${") {
        return text.to_string();
    }
    PLACEHOLDER_RE
        .replace_all(text, |caps: &regex::Captures| {
            let name = caps[1].trim();
            match lookup(name) {
                Some(value) => display_value(&value),
                None => {
                    missing.push(name.to_string());
                    caps[0].to_string()
                }
            }
        })
        .into_owned()
}

/// Recursively resolve placeholders inside a JSON value.
///
/// A string that is a single `${name}` token takes the variable's value
/// with its type intact; any other string gets text substitution. Object
/// keys are left untouched.
pub fn resolve_value<F>(value: &Value, lookup: &F, missing: &mut Vec<String>) -> Value
where
    F: Fn(&str) -> Option<Value>,
{
    match value {
        Value::String(s) => {
            if let Some(name) = bare_reference(s) {
                if let Some(found) = lookup(name.trim()) {
                    return found;
                }
            }
            Value::String(resolve_str(s, lookup, missing))
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve_value(item, lookup, missing))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, lookup, missing)))
                .collect(),
        ),
        other => other.clone(),
    }
}

// ── Script source substitution ──────────────────────────

/// Render a value as a script source literal.
pub fn script_literal(value: &Value) -> String {
    match value {
        Value::Null => "()".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => {
            // Integral floats keep a decimal point so the script sees a float.
            match (n.as_i64(), n.as_f64()) {
                (Some(i), _) => i.to_string(),
                (None, Some(f)) if f.fract() == 0.0 && f.is_finite() => format!("{f:.1}"),
                _ => n.to_string(),
            }
        }
        Value::String(s) => quote_string(s),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(script_literal).collect();
            format!("[{}]", parts.join(", "))
        }
        Value::Object(map) => {
            let parts: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{}: {}", quote_string(k), script_literal(v)))
                .collect();
            format!("#{{{}}}", parts.join(", "))
        }
    }
}

fn quote_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for ch in s.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Substitute placeholders into script source before it is compiled.
///
/// - a literal that is exactly `'${name}'` (either quote) loses its
///   quotes: a string value is spliced in as raw text, anything else as
///   its source literal;
/// - a literal with text around the token stays a string literal with
///   the value's text form spliced in;
/// - a token outside any literal becomes the value's source literal.
///
/// Unknown names are left verbatim and pushed onto `missing`.
pub fn substitute_script<F>(code: &str, lookup: &F, missing: &mut Vec<String>) -> String
where
    F: Fn(&str) -> Option<Value>,
{
    if !code.contains("${") {
        return code.to_string();
    }

    let mut out = String::with_capacity(code.len());
    let mut rest = code;

    while let Some(pos) = rest.find(['"', '\'']) {
        let (before, from_quote) = rest.split_at(pos);
        out.push_str(&substitute_bare(before, lookup, missing));

        let quote = from_quote.chars().next().unwrap_or('"');
        let body_start = quote.len_utf8();
        match literal_end(&from_quote[body_start..], quote) {
            Some(len) => {
                let body = &from_quote[body_start..body_start + len];
                out.push_str(&substitute_literal(body, quote, lookup, missing));
                rest = &from_quote[body_start + len + quote.len_utf8()..];
            }
            None => {
                // Unterminated literal: leave the tail for the compiler to reject.
                out.push_str(from_quote);
                rest = "";
            }
        }
    }
    out.push_str(&substitute_bare(rest, lookup, missing));
    out
}

/// Byte length of a literal body up to (not including) its closing quote.
fn literal_end(body: &str, quote: char) -> Option<usize> {
    let mut escaped = false;
    for (i, ch) in body.char_indices() {
        if escaped {
            escaped = false;
        } else if ch == '\\' {
            escaped = true;
        } else if ch == quote {
            return Some(i);
        }
    }
    None
}

fn substitute_literal<F>(
    body: &str,
    quote: char,
    lookup: &F,
    missing: &mut Vec<String>,
) -> String
where
    F: Fn(&str) -> Option<Value>,
{
    if let Some(name) = bare_reference(body) {
        match lookup(name.trim()) {
            Some(Value::String(text)) => return text,
            Some(value) => return script_literal(&value),
            None => {
                missing.push(name.trim().to_string());
                return format!("{quote}{body}{quote}");
            }
        }
    }

    let mut changed = false;
    let spliced = PLACEHOLDER_RE.replace_all(body, |caps: &regex::Captures| {
        let name = caps[1].trim();
        match lookup(name) {
            Some(value) => {
                changed = true;
                escape_inner(&display_value(&value))
            }
            None => {
                missing.push(name.to_string());
                caps[0].to_string()
            }
        }
    });

    // Single quotes delimit a character, so a spliced literal is re-emitted
    // as a double-quoted string.
    if changed && quote == '\'' {
        format!("\"{}\"", requote_single(&spliced))
    } else {
        format!("{quote}{spliced}{quote}")
    }
}

fn escape_inner(s: &str) -> String {
    let quoted = quote_string(s);
    quoted[1..quoted.len() - 1].to_string()
}

/// Convert the body of a `'...'` literal to a `"..."` body.
fn requote_single(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => match chars.next() {
                Some('\'') => out.push('\''),
                Some(next) => {
                    out.push('\\');
                    out.push(next);
                }
                None => out.push('\\'),
            },
            '"' => out.push_str("\\\""),
            c => out.push(c),
        }
    }
    out
}

fn substitute_bare<F>(segment: &str, lookup: &F, missing: &mut Vec<String>) -> String
where
    F: Fn(&str) -> Option<Value>,
{
    if !segment.contains("${") {
        return segment.to_string();
    }
    PLACEHOLDER_RE
        .replace_all(segment, |caps: &regex::Captures| {
            let name = caps[1].trim();
            match lookup(name) {
                Some(value) => script_literal(&value),
                None => {
                    missing.push(name.to_string());
                    caps[0].to_string()
                }
            }
        })
        .into_owned()
}
