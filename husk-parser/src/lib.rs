//! A recursive-descent parser for POSIX/bash shell syntax with a canonical
//! S-expression rendering of the resulting tree.
//!
//! The parser mirrors bash's own behavior closely, including quoting and
//! escaping rules, nested expansions, process substitution, extended glob
//! patterns, heredocs, case patterns, `[[ ]]` conditional expressions, and
//! arithmetic expression precedence. The canonical text produced by
//! [`Node::to_sexp`] is whitespace- and quoting-normalized and serves as the
//! oracle for golden tests.
//!
//! ```
//! let nodes = husk_parser::parse("echo hi | wc -l", true).unwrap();
//! assert_eq!(
//!     nodes[0].to_sexp(),
//!     "(pipe (command (word \"echo\") (word \"hi\")) (command (word \"wc\") (word \"-l\")))"
//! );
//! ```

pub mod ast;

mod arith;
mod canon;
mod error;
mod lexer;
mod parser;

pub use ast::{Node, Word};
pub use error::ParseError;
pub use parser::{Parser, ParserOptions};

/// Parses shell source into a sequence of top-level nodes.
///
/// Empty or whitespace-only input yields a single [`Node::Empty`], never an
/// error. Parsing either returns a full tree or the first fatal error; there
/// is no partial-result recovery.
///
/// # Arguments
///
/// * `source` - The shell source to parse.
/// * `extglob` - Whether extended globbing patterns are recognized.
pub fn parse(source: &str, extglob: bool) -> Result<Vec<Node>, ParseError> {
    let options = ParserOptions::builder()
        .enable_extended_globbing(extglob)
        .build();
    Parser::new(source, &options).parse()
}

/// Parses shell source and renders the result as canonical S-expression
/// text, with top-level nodes joined by single spaces. Results are memoized.
///
/// # Arguments
///
/// * `source` - The shell source to parse.
/// * `extglob` - Whether extended globbing patterns are recognized.
pub fn parse_to_sexp(source: &str, extglob: bool) -> Result<String, ParseError> {
    cached_parse_to_sexp(source.to_owned(), extglob)
}

#[cached::proc_macro::cached(name = "SEXP_CACHE", size = 64, result = true)]
fn cached_parse_to_sexp(source: String, extglob: bool) -> Result<String, ParseError> {
    uncached_parse_to_sexp(&source, extglob)
}

/// Parses and renders canonical text without consulting the memo cache.
///
/// # Arguments
///
/// * `source` - The shell source to parse.
/// * `extglob` - Whether extended globbing patterns are recognized.
pub fn uncached_parse_to_sexp(source: &str, extglob: bool) -> Result<String, ParseError> {
    let nodes = parse(source, extglob)?;
    Ok(nodes
        .iter()
        .map(Node::to_sexp)
        .collect::<Vec<_>>()
        .join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_returns_nodes() {
        let nodes = parse("echo hi", true).expect("parse");
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].kind(), "command");
    }

    #[test]
    fn sexp_entry_point_joins_nodes() {
        assert_eq!(
            parse_to_sexp("echo a\necho b", true).expect("parse"),
            "(command (word \"echo\") (word \"a\")) (command (word \"echo\") (word \"b\"))"
        );
    }

    #[test]
    fn cached_and_uncached_agree() {
        let input = "a && b | c";
        assert_eq!(
            parse_to_sexp(input, true).expect("parse"),
            uncached_parse_to_sexp(input, true).expect("parse")
        );
    }

    #[test]
    fn errors_propagate() {
        assert!(parse_to_sexp("\"unterminated", true).is_err());
    }
}
