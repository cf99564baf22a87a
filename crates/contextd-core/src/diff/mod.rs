//! Diff pipeline
//!
//! Parses unified diffs and attributes their hunks to enclosing functions.
//!
//! # Components
//! - `parser`: unified diff text → [`ParsedDiff`](crate::types::ParsedDiff)
//! - `chunker`: hunks → [`FunctionChunk`](crate::types::FunctionChunk) per function/class
//! - `imports`: dependency names from added lines

mod chunker;
mod imports;
mod parser;

pub use chunker::{chunk_by_function, detect_boundary, MODULE_LEVEL};
pub use imports::scan_imports;
pub use parser::{parse_diff, render_diff};
