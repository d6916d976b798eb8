//! Guard-condition expression language: parser and evaluator.
//!
//! Grammar:
//! ```text
//! Condition ::= Clause ( '&&' Clause )*
//! Clause    ::= Key Op Literal
//! Key       ::= identifier ( '.' identifier )*
//! Op        ::= '=' | '!='
//! Literal   ::= QuotedString | BareWord | Integer | Boolean
//! ```
//!
//! All comparisons are string comparisons against values supplied by a
//! resolver function; missing keys resolve to the empty string.

use trellis_types::TrellisError;

/// A parsed condition: one or more clauses joined by `&&`.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub clauses: Vec<Clause>,
}

/// A single comparison clause: `key op value`.
#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    pub key: String,
    pub op: Op,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    NotEq,
}

/// Parse a condition string.
///
/// An empty or whitespace-only input produces zero clauses, which
/// [`evaluate_condition`] treats as always true. (The edge selector treats an
/// absent condition as *not eligible* for the condition-match step; the
/// always-true semantics only matter for direct evaluation.)
pub fn parse_condition(input: &str) -> Result<Condition, TrellisError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(Condition { clauses: Vec::new() });
    }

    let clauses = trimmed
        .split("&&")
        .map(|part| parse_clause(part.trim()))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Condition { clauses })
}

fn parse_clause(input: &str) -> Result<Clause, TrellisError> {
    if input.is_empty() {
        return Err(syntax_error("empty clause"));
    }

    let (key_end, op, op_len) = find_operator(input)?;

    let key = input[..key_end].trim().to_string();
    if key.is_empty() {
        return Err(syntax_error("missing key before operator"));
    }
    for seg in key.split('.') {
        if seg.is_empty() || !seg.chars().all(|c| c.is_alphanumeric() || c == '_') {
            return Err(syntax_error(&format!("invalid key segment: '{seg}'")));
        }
    }

    let raw_value = input[key_end + op_len..].trim();
    if raw_value.is_empty() {
        return Err(syntax_error(&format!(
            "missing value after operator in '{input}'"
        )));
    }

    Ok(Clause {
        key,
        op,
        value: strip_quotes(raw_value),
    })
}

/// Locate `!=` or `=`, skipping quoted regions.
fn find_operator(input: &str) -> Result<(usize, Op, usize), TrellisError> {
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' | b'\'' => {
                let quote = bytes[i];
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    i += 1;
                }
                i += 1;
            }
            b'!' if i + 1 < bytes.len() && bytes[i + 1] == b'=' => {
                return Ok((i, Op::NotEq, 2));
            }
            b'=' => return Ok((i, Op::Eq, 1)),
            _ => i += 1,
        }
    }
    Err(syntax_error(&format!("no operator found in '{input}'")))
}

fn strip_quotes(s: &str) -> String {
    let bytes = s.as_bytes();
    if s.len() >= 2
        && ((bytes[0] == b'"' && bytes[s.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[s.len() - 1] == b'\''))
    {
        return s[1..s.len() - 1].to_string();
    }
    s.to_string()
}

fn syntax_error(msg: &str) -> TrellisError {
    TrellisError::ValidationError(format!("condition parse error: {msg}"))
}

/// Evaluate a condition against values supplied by `resolve`.
///
/// `resolve` maps a key (e.g. `"outcome"`, `"context.env"`) to its string
/// value; unknown keys should resolve to the empty string. Zero clauses
/// evaluate to `true`.
pub fn evaluate_condition(cond: &Condition, resolve: &dyn Fn(&str) -> String) -> bool {
    cond.clauses.iter().all(|clause| {
        let actual = resolve(&clause.key);
        match clause.op {
            Op::Eq => actual == clause.value,
            Op::NotEq => actual != clause.value,
        }
    })
}
