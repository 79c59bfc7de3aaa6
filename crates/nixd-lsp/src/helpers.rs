//! Conversions between the parser's 1-indexed positions and 0-indexed
//! LSP coordinates, plus small text utilities shared by the controller
//! and the worker loops.

use nixd_core::{NixdError, Pos};
use tower_lsp::lsp_types::*;

/// Convert a 1-indexed `Pos` to a 0-indexed LSP `Position`.
pub fn pos_to_position(pos: Pos) -> Position {
    Position {
        line: pos.line.saturating_sub(1),
        character: pos.col.saturating_sub(1),
    }
}

/// Convert a 0-indexed LSP `Position` to a 1-indexed `Pos`.
pub fn position_to_pos(position: Position) -> Pos {
    Pos {
        line: position.line + 1,
        col: position.character + 1,
    }
}

/// The range of a name starting at `pos`, `len` characters wide.
pub fn name_range(pos: Pos, len: usize) -> Range {
    let start = pos_to_position(pos);
    Range {
        start,
        end: Position {
            line: start.line,
            character: start.character + len as u32,
        },
    }
}

/// Convert a 0-indexed LSP UTF-16 character offset to a byte offset in a
/// UTF-8 line. Errors when the offset points past the end of the line.
pub fn utf16_to_byte_offset(line: &str, utf16_offset: u32) -> Result<usize, NixdError> {
    let mut count = 0u32;
    if count == utf16_offset {
        return Ok(0);
    }
    for (byte_idx, ch) in line.char_indices() {
        count += ch.len_utf16() as u32;
        if count == utf16_offset {
            return Ok(byte_idx + ch.len_utf8());
        }
        if count > utf16_offset {
            return Err(NixdError::Protocol(format!(
                "position {utf16_offset} splits a surrogate pair"
            )));
        }
    }
    Err(NixdError::Protocol(format!(
        "character {utf16_offset} is out of bounds (line has {count} UTF-16 units)"
    )))
}

/// Convert an LSP `Position` to a byte offset into `text`. Out-of-range
/// positions are hard errors (the draft is deemed out of sync).
pub fn position_to_offset(text: &str, position: Position) -> Result<usize, NixdError> {
    let mut line_start = 0usize;
    let mut line = 0u32;
    while line < position.line {
        match text[line_start..].find('\n') {
            Some(nl) => {
                line_start += nl + 1;
                line += 1;
            }
            None => {
                return Err(NixdError::Protocol(format!(
                    "line {} is out of bounds",
                    position.line
                )))
            }
        }
    }
    let line_end = text[line_start..]
        .find('\n')
        .map(|nl| line_start + nl)
        .unwrap_or(text.len());
    let within = utf16_to_byte_offset(&text[line_start..line_end], position.character)?;
    Ok(line_start + within)
}

/// Expand an attribute path around `offset`: the run of identifier and
/// `.` characters covering the cursor, trimmed of surrounding
/// punctuation. Used by option declaration lookup.
pub fn attr_path_at(text: &str, offset: usize) -> String {
    let is_path_char =
        |c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '\'' | '-' | '.');
    let start = text[..offset.min(text.len())]
        .char_indices()
        .rev()
        .take_while(|&(_, c)| is_path_char(c))
        .last()
        .map(|(i, _)| i)
        .unwrap_or(offset.min(text.len()));
    let end = text[offset.min(text.len())..]
        .char_indices()
        .take_while(|&(_, c)| is_path_char(c))
        .last()
        .map(|(i, c)| offset + i + c.len_utf8())
        .unwrap_or(offset.min(text.len()));
    text[start..end].trim_matches('.').to_string()
}

/// The attribute path ending just before `offset`, with any trailing
/// `.` removed: `"pkgs."` at the cursor yields `"pkgs"`. Used by option
/// completion.
pub fn attr_path_before(text: &str, offset: usize) -> String {
    let is_path_char =
        |c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '\'' | '-' | '.');
    let end = offset.min(text.len());
    let start = text[..end]
        .char_indices()
        .rev()
        .take_while(|&(_, c)| is_path_char(c))
        .last()
        .map(|(i, _)| i)
        .unwrap_or(end);
    text[start..end].trim_matches('.').to_string()
}

/// Render an error as an LSP diagnostic anchored at its position.
pub fn error_diagnostic(err: &NixdError) -> Diagnostic {
    let range = err
        .pos()
        .map(|p| {
            let start = pos_to_position(p);
            Range {
                start,
                end: Position {
                    line: start.line,
                    character: start.character + 1,
                },
            }
        })
        .unwrap_or_default();
    Diagnostic {
        range,
        severity: Some(DiagnosticSeverity::ERROR),
        source: Some("nixd".to_string()),
        message: err.to_string(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pos_round_trip() {
        let pos = Pos { line: 3, col: 7 };
        assert_eq!(position_to_pos(pos_to_position(pos)), pos);
    }

    #[test]
    fn offsets_handle_multibyte_lines() {
        let text = "aé b\nxyz";
        // `é` is 2 bytes in UTF-8 but 1 UTF-16 unit.
        let off = position_to_offset(text, Position::new(0, 3)).unwrap();
        assert_eq!(&text[off..off + 1], "b");
        let off = position_to_offset(text, Position::new(1, 1)).unwrap();
        assert_eq!(&text[off..off + 2], "yz");
    }

    #[test]
    fn out_of_bounds_positions_error() {
        assert!(position_to_offset("ab", Position::new(1, 0)).is_err());
        assert!(position_to_offset("ab", Position::new(0, 3)).is_err());
        // End-of-line is fine.
        assert!(position_to_offset("ab", Position::new(0, 2)).is_ok());
    }

    #[test]
    fn attr_path_expansion() {
        let text = "{ services.nginx.enable = true; }";
        let offset = text.find("nginx").unwrap() + 2;
        assert_eq!(attr_path_at(text, offset), "services.nginx.enable");
    }

    #[test]
    fn attr_path_before_trims_trailing_dot() {
        let text = "pkgs.";
        assert_eq!(attr_path_before(text, 5), "pkgs");
        assert_eq!(attr_path_before("x = pkgs.li", 11), "pkgs.li");
    }

    #[test]
    fn name_range_spans_the_identifier() {
        let range = name_range(Pos { line: 1, col: 5 }, 3);
        assert_eq!(range.start, Position::new(0, 4));
        assert_eq!(range.end, Position::new(0, 7));
    }
}
