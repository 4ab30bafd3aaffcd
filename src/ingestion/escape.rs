//! Query Escaper - Character-set validation for statement text
//!
//! Identifiers and literals that end up inside statement text are checked
//! against a deny-list instead of being bound. Any failure aborts building
//! the statement.

use crate::error::{IngestError, Result};
use std::fmt::Write;

/// Characters that may never appear in an interpolated argument.
pub const FORBIDDEN_SYMBOLS: &str = ";.,\"\\$&*(){}[]\n+?`'<>";

const COMMENT_MARKER: &str = "--";

pub const PLACEHOLDER: &str = "{}";

/// Returns false if `text` contains a forbidden symbol, a control character
/// or a comment marker.
pub fn validate(text: &str) -> bool {
    if text.contains(COMMENT_MARKER) {
        return false;
    }
    !text
        .chars()
        .any(|c| c.is_control() || FORBIDDEN_SYMBOLS.contains(c))
}

/// Validates `text`, naming it `what` in the error.
pub fn ensure_valid(what: &str, text: &str) -> Result<()> {
    if validate(text) {
        Ok(())
    } else {
        Err(IngestError::ForbiddenSymbol(what.to_string()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryArg<'a> {
    Str(&'a str),
    Uint(u64),
}

impl<'a> From<&'a str> for QueryArg<'a> {
    fn from(value: &'a str) -> Self {
        QueryArg::Str(value)
    }
}

impl<'a> From<&'a String> for QueryArg<'a> {
    fn from(value: &'a String) -> Self {
        QueryArg::Str(value.as_str())
    }
}

impl From<u64> for QueryArg<'_> {
    fn from(value: u64) -> Self {
        QueryArg::Uint(value)
    }
}

/// Fills the `{}` placeholders of `template` with `args`, in order.
///
/// Every string argument is validated before anything is assembled, so a
/// rejected argument never yields a partial statement.
pub fn escape_query(template: &str, args: &[QueryArg<'_>]) -> Result<String> {
    for (idx, arg) in args.iter().enumerate() {
        if let QueryArg::Str(text) = arg {
            ensure_valid(&format!("query argument {}", idx + 1), text)?;
        }
    }

    let pieces: Vec<&str> = template.split(PLACEHOLDER).collect();
    let placeholders = pieces.len() - 1;
    if placeholders != args.len() {
        return Err(IngestError::Template(format!(
            "template has {} placeholders but {} arguments were given",
            placeholders,
            args.len()
        )));
    }

    let mut query = String::with_capacity(template.len() + args.len() * 16);
    for (piece, arg) in pieces.iter().zip(args) {
        query.push_str(piece);
        match arg {
            QueryArg::Str(text) => query.push_str(text),
            QueryArg::Uint(n) => {
                let _ = write!(query, "{}", n);
            }
        }
    }
    query.push_str(pieces[placeholders]);

    Ok(query)
}
