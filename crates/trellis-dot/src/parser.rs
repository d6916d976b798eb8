use std::collections::HashMap;
use std::time::Duration;

use winnow::ascii::{digit1, multispace0};
use winnow::combinator::{alt, opt, preceded, repeat};
use winnow::error::{ContextError, ErrMode, StrContext, StrContextValue};
use winnow::token::{literal, take_while};
use winnow::{ModalResult, Parser};

use crate::ast::*;

fn make_cut_error(desc: &'static str) -> ErrMode<ContextError<StrContext>> {
    let mut e = ContextError::new();
    e.push(StrContext::Expected(StrContextValue::Description(desc)));
    ErrMode::Cut(e)
}

/// Strip `//` line comments and `/* */` block comments. Newlines inside block
/// comments are preserved so error line numbers stay correct, and comment
/// markers inside string literals are left alone.
pub(crate) fn strip_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let bytes = input.as_bytes();
    let len = bytes.len();
    let mut i = 0;

    while i < len {
        if i + 1 < len && bytes[i] == b'/' && bytes[i + 1] == b'/' {
            i += 2;
            while i < len && bytes[i] != b'\n' {
                i += 1;
            }
        } else if i + 1 < len && bytes[i] == b'/' && bytes[i + 1] == b'*' {
            i += 2;
            while i + 1 < len && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                if bytes[i] == b'\n' {
                    out.push('\n');
                }
                i += 1;
            }
            if i + 1 < len {
                i += 2;
            }
        } else if bytes[i] == b'"' {
            out.push('"');
            i += 1;
            while i < len {
                if bytes[i] == b'\\' && i + 1 < len {
                    out.push(bytes[i] as char);
                    out.push(bytes[i + 1] as char);
                    i += 2;
                } else if bytes[i] == b'"' {
                    out.push('"');
                    i += 1;
                    break;
                } else {
                    out.push(bytes[i] as char);
                    i += 1;
                }
            }
        } else {
            out.push(bytes[i] as char);
            i += 1;
        }
    }
    out
}

fn ws<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    multispace0.parse_next(input)
}

/// Identifier: `[A-Za-z_][A-Za-z0-9_]*`.
fn identifier<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    (
        take_while(1, |c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(0.., |c: char| c.is_ascii_alphanumeric() || c == '_'),
    )
        .take()
        .parse_next(input)
}

/// Attribute key: identifier segments joined by dots (`retry.max` is one key).
fn attr_key(input: &mut &str) -> ModalResult<String> {
    let first = identifier.parse_next(input)?;
    let rest: Vec<&str> = repeat(0.., preceded('.', identifier)).parse_next(input)?;
    let mut key = first.to_string();
    for seg in rest {
        key.push('.');
        key.push_str(seg);
    }
    Ok(key)
}

/// Double-quoted string with `\n`, `\t`, `\\`, `\"` escapes.
fn quoted_string(input: &mut &str) -> ModalResult<String> {
    let _ = '"'.parse_next(input)?;
    let mut s = String::new();
    loop {
        let c = winnow::token::any.parse_next(input)?;
        match c {
            '"' => break,
            '\\' => {
                let esc = winnow::token::any.parse_next(input)?;
                match esc {
                    'n' => s.push('\n'),
                    't' => s.push('\t'),
                    '\\' => s.push('\\'),
                    '"' => s.push('"'),
                    other => {
                        s.push('\\');
                        s.push(other);
                    }
                }
            }
            other => s.push(other),
        }
    }
    Ok(s)
}

/// Duration: digits followed by a unit suffix.
fn duration_value(input: &mut &str) -> ModalResult<Duration> {
    let digits: &str = digit1.parse_next(input)?;
    let val: u64 = digits
        .parse()
        .map_err(|_| ErrMode::Backtrack(ContextError::new()))?;
    let suffix = alt(("ms", "s", "m", "h", "d")).parse_next(input)?;
    Ok(match suffix {
        "ms" => Duration::from_millis(val),
        "s" => Duration::from_secs(val),
        "m" => Duration::from_secs(val * 60),
        "h" => Duration::from_secs(val * 3600),
        "d" => Duration::from_secs(val * 86400),
        _ => unreachable!(),
    })
}

fn boolean_value(input: &mut &str) -> ModalResult<bool> {
    alt((literal("true").value(true), literal("false").value(false))).parse_next(input)
}

fn float_value(input: &mut &str) -> ModalResult<f64> {
    let s: &str = (opt(alt(('-', '+'))), digit1, '.', digit1)
        .take()
        .parse_next(input)?;
    s.parse()
        .map_err(|_| ErrMode::Backtrack(ContextError::new()))
}

fn integer_value(input: &mut &str) -> ModalResult<i64> {
    let s: &str = (opt(alt(('-', '+'))), digit1).take().parse_next(input)?;
    s.parse()
        .map_err(|_| ErrMode::Backtrack(ContextError::new()))
}

/// Attribute value; alternatives are ordered so `250ms` parses as a duration
/// rather than an integer with trailing junk.
fn attr_value(input: &mut &str) -> ModalResult<AttributeValue> {
    alt((
        quoted_string.map(AttributeValue::String),
        boolean_value.map(AttributeValue::Boolean),
        duration_value.map(AttributeValue::Duration),
        float_value.map(AttributeValue::Float),
        integer_value.map(AttributeValue::Integer),
    ))
    .parse_next(input)
}

fn attr(input: &mut &str) -> ModalResult<(String, AttributeValue)> {
    let key = attr_key.parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let _ = '='.parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let value = attr_value
        .context(StrContext::Expected(StrContextValue::Description(
            "attribute value",
        )))
        .parse_next(input)?;
    Ok((key, value))
}

/// `[ key=value (, key=value)* ]` — comma/semicolon separators optional.
fn attr_block(input: &mut &str) -> ModalResult<HashMap<String, AttributeValue>> {
    let _ = '['.parse_next(input)?;
    let _ = ws.parse_next(input)?;

    let mut attrs = HashMap::new();
    if let Some((k, v)) = opt(attr).parse_next(input)? {
        attrs.insert(k, v);
        loop {
            let _ = ws.parse_next(input)?;
            let _ = opt(alt((',', ';'))).parse_next(input)?;
            let _ = ws.parse_next(input)?;
            match opt(attr).parse_next(input)? {
                Some((k, v)) => {
                    attrs.insert(k, v);
                }
                None => break,
            }
        }
    }

    let _ = ws.parse_next(input)?;
    let _ = ']'.parse_next(input)?;
    Ok(attrs)
}

/// A parsed statement, before merging into a [`DotGraph`].
enum Stmt {
    GraphAttrs(HashMap<String, AttributeValue>),
    NodeDefaults(HashMap<String, AttributeValue>),
    EdgeDefaults(HashMap<String, AttributeValue>),
    Node(String, HashMap<String, AttributeValue>),
    Edge(Vec<String>, HashMap<String, AttributeValue>),
    Subgraph(Option<String>, Vec<Stmt>),
    GraphAttrDecl(String, AttributeValue),
}

fn keyword_defaults_stmt(
    keyword: &'static str,
    wrap: fn(HashMap<String, AttributeValue>) -> Stmt,
) -> impl FnMut(&mut &str) -> ModalResult<Stmt> {
    move |input: &mut &str| {
        let _ = literal(keyword).parse_next(input)?;
        let _ = ws.parse_next(input)?;
        let attrs = attr_block.parse_next(input)?;
        let _ = ws.parse_next(input)?;
        let _ = opt(';').parse_next(input)?;
        Ok(wrap(attrs))
    }
}

/// `subgraph name? { ... }`
fn subgraph_stmt(input: &mut &str) -> ModalResult<Stmt> {
    let _ = literal("subgraph").parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let name = opt(identifier).parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let _ = '{'.parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let stmts = statements.parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let _ = '}'.parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let _ = opt(';').parse_next(input)?;
    Ok(Stmt::Subgraph(name.map(|s| s.to_string()), stmts))
}

/// A statement beginning with an identifier: node, edge chain, or bare
/// `key = value` graph attribute.
fn node_or_edge_stmt(input: &mut &str) -> ModalResult<Stmt> {
    let first = identifier.parse_next(input)?;
    let _ = ws.parse_next(input)?;

    if opt(literal("->")).parse_next(input)?.is_some() {
        let mut chain = vec![first.to_string()];
        loop {
            let _ = ws.parse_next(input)?;
            let next = identifier
                .context(StrContext::Expected(StrContextValue::Description(
                    "edge target identifier",
                )))
                .parse_next(input)?;
            chain.push(next.to_string());
            let _ = ws.parse_next(input)?;
            if opt(literal("->")).parse_next(input)?.is_none() {
                break;
            }
        }

        let _ = ws.parse_next(input)?;
        let attrs = opt(attr_block).parse_next(input)?.unwrap_or_default();
        let _ = ws.parse_next(input)?;
        let _ = opt(';').parse_next(input)?;
        return Ok(Stmt::Edge(chain, attrs));
    }

    if opt(literal("--")).parse_next(input)?.is_some() {
        return Err(make_cut_error(
            "only directed edges (->); undirected edges (--) are not supported",
        ));
    }

    let attrs = opt(attr_block).parse_next(input)?.unwrap_or_default();
    let _ = ws.parse_next(input)?;

    if !attrs.is_empty() {
        let _ = opt(';').parse_next(input)?;
        return Ok(Stmt::Node(first.to_string(), attrs));
    }

    // `key = value` graph attribute declaration.
    if opt('=').parse_next(input)?.is_some() {
        let _ = ws.parse_next(input)?;
        let val = attr_value.parse_next(input)?;
        let _ = ws.parse_next(input)?;
        let _ = opt(';').parse_next(input)?;
        return Ok(Stmt::GraphAttrDecl(first.to_string(), val));
    }

    let _ = opt(';').parse_next(input)?;
    Ok(Stmt::Node(first.to_string(), attrs))
}

fn statement(input: &mut &str) -> ModalResult<Stmt> {
    let _ = ws.parse_next(input)?;
    alt((
        keyword_defaults_stmt("graph", Stmt::GraphAttrs),
        keyword_defaults_stmt("node", Stmt::NodeDefaults),
        keyword_defaults_stmt("edge", Stmt::EdgeDefaults),
        subgraph_stmt,
        node_or_edge_stmt,
    ))
    .parse_next(input)
}

fn statements(input: &mut &str) -> ModalResult<Vec<Stmt>> {
    let mut stmts = Vec::new();
    loop {
        let _ = ws.parse_next(input)?;
        if input.is_empty() || input.starts_with('}') {
            break;
        }
        stmts.push(statement.parse_next(input)?);
    }
    Ok(stmts)
}

type Merged = (
    HashMap<String, AttributeValue>, // graph attrs
    HashMap<String, NodeDef>,        // nodes
    Vec<EdgeDef>,                    // edges
    Vec<SubgraphDef>,                // subgraphs
    HashMap<String, AttributeValue>, // node defaults
    HashMap<String, AttributeValue>, // edge defaults
);

/// Merge statements. Defaults accumulate top-down; explicit attributes win.
/// Nodes referenced only by edges are materialized with the current defaults.
#[allow(clippy::type_complexity)]
fn merge_statements(
    stmts: Vec<Stmt>,
    parent_node_defaults: &HashMap<String, AttributeValue>,
    parent_edge_defaults: &HashMap<String, AttributeValue>,
) -> Merged {
    let mut graph_attrs = HashMap::new();
    let mut nodes = HashMap::new();
    let mut edges = Vec::new();
    let mut subgraphs = Vec::new();
    let mut node_defaults = parent_node_defaults.clone();
    let mut edge_defaults = parent_edge_defaults.clone();

    for stmt in stmts {
        match stmt {
            Stmt::GraphAttrs(attrs) => graph_attrs.extend(attrs),
            Stmt::NodeDefaults(attrs) => node_defaults.extend(attrs),
            Stmt::EdgeDefaults(attrs) => edge_defaults.extend(attrs),
            Stmt::Node(id, mut attrs) => {
                for (k, v) in &node_defaults {
                    attrs.entry(k.clone()).or_insert_with(|| v.clone());
                }
                nodes.insert(id.clone(), NodeDef { id, attrs });
            }
            Stmt::Edge(chain, attrs) => {
                for pair in chain.windows(2) {
                    let mut merged = edge_defaults.clone();
                    merged.extend(attrs.clone());
                    edges.push(EdgeDef {
                        from: pair[0].clone(),
                        to: pair[1].clone(),
                        attrs: merged,
                    });
                }
                for node_id in &chain {
                    nodes.entry(node_id.clone()).or_insert_with(|| NodeDef {
                        id: node_id.clone(),
                        attrs: node_defaults.clone(),
                    });
                }
            }
            Stmt::Subgraph(name, inner) => {
                let (sg_attrs, sg_nodes, sg_edges, nested, sg_nd, sg_ed) =
                    merge_statements(inner, &node_defaults, &edge_defaults);
                subgraphs.push(SubgraphDef {
                    name,
                    attrs: sg_attrs,
                    nodes: sg_nodes,
                    edges: sg_edges,
                    node_defaults: sg_nd,
                    edge_defaults: sg_ed,
                });
                subgraphs.extend(nested);
            }
            Stmt::GraphAttrDecl(key, val) => {
                graph_attrs.insert(key, val);
            }
        }
    }

    (
        graph_attrs,
        nodes,
        edges,
        subgraphs,
        node_defaults,
        edge_defaults,
    )
}

/// `digraph Name { statements }`
fn parse_digraph(input: &mut &str) -> ModalResult<DotGraph> {
    let _ = ws.parse_next(input)?;

    if input.starts_with("strict") {
        return Err(make_cut_error(
            "'digraph' keyword (strict graphs are not supported)",
        ));
    }
    if input.starts_with("graph") {
        let trimmed = input[5..].trim_start();
        if trimmed.starts_with('{') || trimmed.starts_with(|c: char| c.is_ascii_alphabetic()) {
            return Err(make_cut_error(
                "'digraph' keyword (undirected graphs are not supported)",
            ));
        }
    }

    let _ = literal("digraph")
        .context(StrContext::Expected(StrContextValue::StringLiteral(
            "digraph",
        )))
        .parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let name = identifier
        .context(StrContext::Expected(StrContextValue::Description(
            "graph name identifier",
        )))
        .parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let _ = '{'.parse_next(input)?;
    let stmts = statements.parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let _ = '}'.parse_next(input)?;
    let _ = ws.parse_next(input)?;

    let empty = HashMap::new();
    let (attrs, nodes, edges, subgraphs, node_defaults, edge_defaults) =
        merge_statements(stmts, &empty, &empty);

    Ok(DotGraph {
        name: name.to_string(),
        attrs,
        nodes,
        edges,
        subgraphs,
        node_defaults,
        edge_defaults,
    })
}

/// Map a remaining-input length back to (line, col) in the stripped text.
/// Comment stripping preserves newlines, so line numbers match the source.
fn offset_to_line_col(stripped: &str, remaining_len: usize) -> (usize, usize) {
    let consumed = stripped.len() - remaining_len;
    let prefix = &stripped[..consumed.min(stripped.len())];
    let line = prefix.matches('\n').count() + 1;
    let col = match prefix.rfind('\n') {
        Some(pos) => consumed - pos,
        None => consumed + 1,
    };
    (line, col)
}

/// Parse DOT source into a [`DotGraph`].
pub fn parse(input: &str) -> std::result::Result<DotGraph, trellis_types::TrellisError> {
    let stripped = strip_comments(input);
    let mut remaining = stripped.as_str();

    parse_digraph.parse_next(&mut remaining).map_err(|e| {
        let (line, col) = offset_to_line_col(&stripped, remaining.len());
        let snippet: String = remaining.chars().take(40).collect();
        trellis_types::TrellisError::ParseError {
            line,
            col,
            message: format!("{e}"),
            source_snippet: if snippet.is_empty() {
                None
            } else {
                Some(snippet)
            },
        }
    })
}
