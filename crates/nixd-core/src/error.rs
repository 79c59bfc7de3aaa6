use std::fmt;

use crate::table::Pos;

/// Render an optional position as `line:col` or `<unknown>`.
fn fmt_pos(pos: &Option<Pos>, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match pos {
        Some(p) => write!(f, "{p}"),
        None => write!(f, "<unknown>"),
    }
}

/// Wrapper so `thiserror` can interpolate an `Option<Pos>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPos(pub Option<Pos>);

impl fmt::Display for ErrorPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_pos(&self.0, f)
    }
}

impl From<Option<Pos>> for ErrorPos {
    fn from(pos: Option<Pos>) -> Self {
        ErrorPos(pos)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum NixdError {
    #[error("parse error at {pos}: {message}")]
    Parse { message: String, pos: ErrorPos },

    #[error("evaluation error at {pos}: {message}")]
    Eval { message: String, pos: ErrorPos },

    #[error("type error at {pos}: expected {expected}, got {got}")]
    Type {
        expected: &'static str,
        got: &'static str,
        pos: ErrorPos,
    },

    #[error("undefined variable `{name}` at {pos}")]
    Undefined { name: String, pos: ErrorPos },

    #[error("io error: {0}")]
    Io(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl NixdError {
    pub fn parse(message: impl Into<String>, pos: Option<Pos>) -> Self {
        NixdError::Parse {
            message: message.into(),
            pos: pos.into(),
        }
    }

    pub fn eval(message: impl Into<String>, pos: Option<Pos>) -> Self {
        NixdError::Eval {
            message: message.into(),
            pos: pos.into(),
        }
    }

    /// The source position attached to this error, if any.
    pub fn pos(&self) -> Option<Pos> {
        match self {
            NixdError::Parse { pos, .. }
            | NixdError::Eval { pos, .. }
            | NixdError::Type { pos, .. }
            | NixdError::Undefined { pos, .. } => pos.0,
            NixdError::Io(_) | NixdError::Protocol(_) => None,
        }
    }
}

impl From<std::io::Error> for NixdError {
    fn from(err: std::io::Error) -> Self {
        NixdError::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_displays_position() {
        let err = NixdError::parse("unexpected `;`", Some(Pos { line: 2, col: 7 }));
        assert_eq!(err.to_string(), "parse error at 2:7: unexpected `;`");
    }

    #[test]
    fn missing_position_displays_unknown() {
        let err = NixdError::eval("division by zero", None);
        assert!(err.to_string().contains("<unknown>"));
        assert!(err.pos().is_none());
    }
}
