//! Error types reported by the parser.

/// Represents an error that occurred while parsing shell source.
///
/// The rendered message varies with how much location information was
/// available at the point of failure.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// A parse error with both a line number and a character position.
    #[error("Parse error at line {line}, position {position}: {message}")]
    AtLine {
        /// Description of the failure.
        message: String,
        /// 1-based line number of the failure.
        line: usize,
        /// 0-based character offset of the failure.
        position: usize,
    },

    /// A parse error with a character position only.
    #[error("Parse error at position {position}: {message}")]
    AtPosition {
        /// Description of the failure.
        message: String,
        /// 0-based character offset of the failure.
        position: usize,
    },

    /// A parse error with no usable location.
    #[error("Parse error: {message}")]
    Message {
        /// Description of the failure.
        message: String,
    },
}

impl ParseError {
    pub(crate) fn at(message: impl Into<String>, position: usize) -> Self {
        Self::AtPosition {
            message: message.into(),
            position,
        }
    }

    /// An "unexpected EOF while looking for matching `X`" error, positioned at
    /// the opening delimiter of the unterminated construct.
    pub(crate) fn unclosed(close: &str, position: usize) -> Self {
        Self::AtPosition {
            message: format!("unexpected EOF while looking for matching `{close}'"),
            position,
        }
    }

    /// Returns the character position associated with the error, if known.
    pub fn position(&self) -> Option<usize> {
        match self {
            Self::AtLine { position, .. } | Self::AtPosition { position, .. } => Some(*position),
            Self::Message { .. } => None,
        }
    }

    /// Returns the line number associated with the error, if known.
    pub fn line(&self) -> Option<usize> {
        match self {
            Self::AtLine { line, .. } => Some(*line),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn message_formats() {
        assert_eq!(
            ParseError::AtLine {
                message: "bad".into(),
                line: 3,
                position: 17
            }
            .to_string(),
            "Parse error at line 3, position 17: bad"
        );
        assert_eq!(
            ParseError::at("bad", 17).to_string(),
            "Parse error at position 17: bad"
        );
        assert_eq!(
            ParseError::Message {
                message: "bad".into()
            }
            .to_string(),
            "Parse error: bad"
        );
    }

    #[test]
    fn unclosed_names_the_delimiter() {
        let err = ParseError::unclosed(")", 4);
        assert_eq!(
            err.to_string(),
            "Parse error at position 4: unexpected EOF while looking for matching `)'"
        );
        assert_eq!(err.position(), Some(4));
        assert_eq!(err.line(), None);
    }
}
