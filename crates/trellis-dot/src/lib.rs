//! DOT parser for the strict Graphviz subset used by Trellis pipelines.
//!
//! Parses `digraph Name { ... }` with nodes, chained edges, subgraphs, and
//! typed attributes into a typed AST: [`DotGraph`], [`NodeDef`], [`EdgeDef`],
//! [`SubgraphDef`], [`AttributeValue`]. The execution engine never touches
//! raw DOT syntax; it consumes this AST through `PipelineGraph`.
//!
//! # Example
//! ```
//! let dot = r#"digraph Pipeline { start -> work -> done }"#;
//! let graph = trellis_dot::parse(dot).unwrap();
//! assert_eq!(graph.name, "Pipeline");
//! assert_eq!(graph.edges.len(), 2);
//! ```

pub mod ast;
mod duration_serde;
mod parser;

pub use ast::*;
pub use parser::parse;
