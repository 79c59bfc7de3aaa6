use nixd_core::{NixdError, Pos};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    Path(String),

    // Keywords
    Let,
    In,
    Rec,
    With,
    If,
    Then,
    Else,
    Assert,
    Inherit,
    Or,

    // Punctuation
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Semi,
    Colon,
    Comma,
    Dot,
    Ellipsis,
    Question,
    At,
    Assign,

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Impl,
    Update,
    Concat,
    Not,
}

impl Token {
    /// Display form used in "expected X, got Y" diagnostics.
    pub fn display(&self) -> String {
        match self {
            Token::Ident(s) => s.clone(),
            Token::Int(n) => n.to_string(),
            Token::Float(x) => x.to_string(),
            Token::Str(_) => "string".to_string(),
            Token::Path(p) => p.clone(),
            Token::Let => "let".into(),
            Token::In => "in".into(),
            Token::Rec => "rec".into(),
            Token::With => "with".into(),
            Token::If => "if".into(),
            Token::Then => "then".into(),
            Token::Else => "else".into(),
            Token::Assert => "assert".into(),
            Token::Inherit => "inherit".into(),
            Token::Or => "or".into(),
            Token::LBrace => "{".into(),
            Token::RBrace => "}".into(),
            Token::LBracket => "[".into(),
            Token::RBracket => "]".into(),
            Token::LParen => "(".into(),
            Token::RParen => ")".into(),
            Token::Semi => ";".into(),
            Token::Colon => ":".into(),
            Token::Comma => ",".into(),
            Token::Dot => ".".into(),
            Token::Ellipsis => "...".into(),
            Token::Question => "?".into(),
            Token::At => "@".into(),
            Token::Assign => "=".into(),
            Token::Plus => "+".into(),
            Token::Minus => "-".into(),
            Token::Star => "*".into(),
            Token::Slash => "/".into(),
            Token::Eq => "==".into(),
            Token::Ne => "!=".into(),
            Token::Lt => "<".into(),
            Token::Le => "<=".into(),
            Token::Gt => ">".into(),
            Token::Ge => ">=".into(),
            Token::AndAnd => "&&".into(),
            Token::OrOr => "||".into(),
            Token::Impl => "->".into(),
            Token::Update => "//".into(),
            Token::Concat => "++".into(),
            Token::Not => "!".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SpannedToken {
    pub token: Token,
    pub line: u32,
    pub col: u32,
}

fn keyword(word: &str) -> Option<Token> {
    Some(match word {
        "let" => Token::Let,
        "in" => Token::In,
        "rec" => Token::Rec,
        "with" => Token::With,
        "if" => Token::If,
        "then" => Token::Then,
        "else" => Token::Else,
        "assert" => Token::Assert,
        "inherit" => Token::Inherit,
        "or" => Token::Or,
        _ => return None,
    })
}

fn is_ident_start(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ch == '_'
}

fn is_ident_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '_' | '\'' | '-')
}

fn is_path_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | '-' | '+' | '~' | '/')
}

/// A path segment character: anything path-valid except `/` itself.
/// Used for lookahead so `a//b` stays `a` `//` `b`.
fn is_path_seg_char(ch: char) -> bool {
    is_path_char(ch) && ch != '/'
}

/// Tokenize a document. Invalid input never aborts the scan: each bad
/// character or unterminated construct is recorded as an error and the
/// lexer resumes, so the parser can still recover.
pub fn tokenize(input: &str) -> (Vec<SpannedToken>, Vec<NixdError>) {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut errors = Vec::new();
    let mut i = 0;
    let mut line: u32 = 1;
    let mut col: u32 = 1;

    macro_rules! push {
        ($tok:expr, $line:expr, $col:expr) => {
            tokens.push(SpannedToken {
                token: $tok,
                line: $line,
                col: $col,
            })
        };
    }

    while i < chars.len() {
        let ch = chars[i];
        let tok_line = line;
        let tok_col = col;

        match ch {
            ' ' | '\t' | '\r' => {
                col += 1;
                i += 1;
            }
            '\n' => {
                line += 1;
                col = 1;
                i += 1;
            }

            // Line comment
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                    col += 1;
                }
            }

            '"' => {
                i += 1;
                col += 1;
                let mut s = String::new();
                let mut closed = false;
                while i < chars.len() {
                    let c = chars[i];
                    match c {
                        '"' => {
                            i += 1;
                            col += 1;
                            closed = true;
                            break;
                        }
                        '\\' => {
                            if i + 1 < chars.len() {
                                let esc = chars[i + 1];
                                s.push(match esc {
                                    'n' => '\n',
                                    't' => '\t',
                                    'r' => '\r',
                                    other => other,
                                });
                                i += 2;
                                col += 2;
                            } else {
                                i += 1;
                                col += 1;
                            }
                        }
                        '\n' => {
                            s.push('\n');
                            i += 1;
                            line += 1;
                            col = 1;
                        }
                        other => {
                            s.push(other);
                            i += 1;
                            col += 1;
                        }
                    }
                }
                if !closed {
                    errors.push(NixdError::parse(
                        "unterminated string",
                        Some(Pos {
                            line: tok_line,
                            col: tok_col,
                        }),
                    ));
                }
                push!(Token::Str(s), tok_line, tok_col);
            }

            '{' => {
                i += 1;
                col += 1;
                push!(Token::LBrace, tok_line, tok_col);
            }
            '}' => {
                i += 1;
                col += 1;
                push!(Token::RBrace, tok_line, tok_col);
            }
            '[' => {
                i += 1;
                col += 1;
                push!(Token::LBracket, tok_line, tok_col);
            }
            ']' => {
                i += 1;
                col += 1;
                push!(Token::RBracket, tok_line, tok_col);
            }
            '(' => {
                i += 1;
                col += 1;
                push!(Token::LParen, tok_line, tok_col);
            }
            ')' => {
                i += 1;
                col += 1;
                push!(Token::RParen, tok_line, tok_col);
            }
            ';' => {
                i += 1;
                col += 1;
                push!(Token::Semi, tok_line, tok_col);
            }
            ':' => {
                i += 1;
                col += 1;
                push!(Token::Colon, tok_line, tok_col);
            }
            ',' => {
                i += 1;
                col += 1;
                push!(Token::Comma, tok_line, tok_col);
            }
            '@' => {
                i += 1;
                col += 1;
                push!(Token::At, tok_line, tok_col);
            }

            '+' => {
                if chars.get(i + 1) == Some(&'+') {
                    i += 2;
                    col += 2;
                    push!(Token::Concat, tok_line, tok_col);
                } else {
                    i += 1;
                    col += 1;
                    push!(Token::Plus, tok_line, tok_col);
                }
            }
            '-' => {
                if chars.get(i + 1) == Some(&'>') {
                    i += 2;
                    col += 2;
                    push!(Token::Impl, tok_line, tok_col);
                } else {
                    i += 1;
                    col += 1;
                    push!(Token::Minus, tok_line, tok_col);
                }
            }
            '*' => {
                i += 1;
                col += 1;
                push!(Token::Star, tok_line, tok_col);
            }
            '/' => {
                if chars.get(i + 1) == Some(&'*') {
                    // Block comment
                    i += 2;
                    col += 2;
                    let mut terminated = false;
                    while i < chars.len() {
                        if chars[i] == '*' && chars.get(i + 1) == Some(&'/') {
                            i += 2;
                            col += 2;
                            terminated = true;
                            break;
                        }
                        if chars[i] == '\n' {
                            line += 1;
                            col = 1;
                        } else {
                            col += 1;
                        }
                        i += 1;
                    }
                    if !terminated {
                        errors.push(NixdError::parse(
                            "unterminated block comment",
                            Some(Pos {
                                line: tok_line,
                                col: tok_col,
                            }),
                        ));
                    }
                } else if chars.get(i + 1) == Some(&'/') {
                    i += 2;
                    col += 2;
                    push!(Token::Update, tok_line, tok_col);
                } else if chars.get(i + 1).is_some_and(|&c| is_path_seg_char(c)) {
                    // Absolute path: `/` directly followed by a path character.
                    let (word, len) = scan_while(&chars[i..], is_path_char);
                    i += len;
                    col += len as u32;
                    push!(Token::Path(word), tok_line, tok_col);
                } else {
                    i += 1;
                    col += 1;
                    push!(Token::Slash, tok_line, tok_col);
                }
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    i += 2;
                    col += 2;
                    push!(Token::Eq, tok_line, tok_col);
                } else {
                    i += 1;
                    col += 1;
                    push!(Token::Assign, tok_line, tok_col);
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    i += 2;
                    col += 2;
                    push!(Token::Ne, tok_line, tok_col);
                } else {
                    i += 1;
                    col += 1;
                    push!(Token::Not, tok_line, tok_col);
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    i += 2;
                    col += 2;
                    push!(Token::Le, tok_line, tok_col);
                } else {
                    i += 1;
                    col += 1;
                    push!(Token::Lt, tok_line, tok_col);
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    i += 2;
                    col += 2;
                    push!(Token::Ge, tok_line, tok_col);
                } else {
                    i += 1;
                    col += 1;
                    push!(Token::Gt, tok_line, tok_col);
                }
            }
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    i += 2;
                    col += 2;
                    push!(Token::AndAnd, tok_line, tok_col);
                } else {
                    errors.push(NixdError::parse(
                        "unexpected character `&`",
                        Some(Pos {
                            line: tok_line,
                            col: tok_col,
                        }),
                    ));
                    i += 1;
                    col += 1;
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    i += 2;
                    col += 2;
                    push!(Token::OrOr, tok_line, tok_col);
                } else {
                    errors.push(NixdError::parse(
                        "unexpected character `|`",
                        Some(Pos {
                            line: tok_line,
                            col: tok_col,
                        }),
                    ));
                    i += 1;
                    col += 1;
                }
            }
            '?' => {
                i += 1;
                col += 1;
                push!(Token::Question, tok_line, tok_col);
            }

            '.' => {
                if chars.get(i + 1) == Some(&'.') && chars.get(i + 2) == Some(&'.') {
                    i += 3;
                    col += 3;
                    push!(Token::Ellipsis, tok_line, tok_col);
                } else if chars.get(i + 1) == Some(&'/')
                    || (chars.get(i + 1) == Some(&'.') && chars.get(i + 2) == Some(&'/'))
                {
                    // `./…` or `../…` relative path
                    let (word, len) = scan_while(&chars[i..], is_path_char);
                    i += len;
                    col += len as u32;
                    push!(Token::Path(word), tok_line, tok_col);
                } else {
                    i += 1;
                    col += 1;
                    push!(Token::Dot, tok_line, tok_col);
                }
            }

            '~' => {
                if chars.get(i + 1) == Some(&'/') {
                    let (word, len) = scan_while(&chars[i..], is_path_char);
                    i += len;
                    col += len as u32;
                    push!(Token::Path(word), tok_line, tok_col);
                } else {
                    errors.push(NixdError::parse(
                        "unexpected character `~`",
                        Some(Pos {
                            line: tok_line,
                            col: tok_col,
                        }),
                    ));
                    i += 1;
                    col += 1;
                }
            }

            c if c.is_ascii_digit() => {
                let (word, len) = scan_number(&chars[i..]);
                i += len;
                col += len as u32;
                // A digit run directly followed by `/` + path char is a path
                // (e.g. `2021/config.nix`).
                if chars.get(i) == Some(&'/')
                    && chars.get(i + 1).is_some_and(|&c| is_path_seg_char(c))
                {
                    let (rest, len) = scan_while(&chars[i..], is_path_char);
                    i += len;
                    col += len as u32;
                    push!(Token::Path(format!("{word}{rest}")), tok_line, tok_col);
                } else if word.contains('.') {
                    match word.parse::<f64>() {
                        Ok(x) => push!(Token::Float(x), tok_line, tok_col),
                        Err(_) => errors.push(NixdError::parse(
                            format!("invalid number `{word}`"),
                            Some(Pos {
                                line: tok_line,
                                col: tok_col,
                            }),
                        )),
                    }
                } else {
                    match word.parse::<i64>() {
                        Ok(n) => push!(Token::Int(n), tok_line, tok_col),
                        Err(_) => errors.push(NixdError::parse(
                            format!("invalid number `{word}`"),
                            Some(Pos {
                                line: tok_line,
                                col: tok_col,
                            }),
                        )),
                    }
                }
            }

            c if is_ident_start(c) => {
                let (word, len) = scan_while(&chars[i..], is_ident_char);
                // An identifier run directly followed by `/` + path char is
                // a relative path (e.g. `lib/default.nix`).
                if chars.get(i + len) == Some(&'/')
                    && chars.get(i + len + 1).is_some_and(|&c| is_path_seg_char(c))
                {
                    let (word, len) = scan_while(&chars[i..], is_path_char);
                    i += len;
                    col += len as u32;
                    push!(Token::Path(word), tok_line, tok_col);
                } else {
                    i += len;
                    col += len as u32;
                    match keyword(&word) {
                        Some(tok) => push!(tok, tok_line, tok_col),
                        None => push!(Token::Ident(word), tok_line, tok_col),
                    }
                }
            }

            other => {
                errors.push(NixdError::parse(
                    format!("unexpected character `{other}`"),
                    Some(Pos {
                        line: tok_line,
                        col: tok_col,
                    }),
                ));
                i += 1;
                col += 1;
            }
        }
    }

    (tokens, errors)
}

fn scan_while(chars: &[char], pred: fn(char) -> bool) -> (String, usize) {
    let mut len = 0;
    while len < chars.len() && pred(chars[len]) {
        len += 1;
    }
    (chars[..len].iter().collect(), len)
}

/// Scan `digits` or `digits.digits`. The dot is consumed only when a
/// digit follows, so `1.x` lexes as `1` `.` `x`.
fn scan_number(chars: &[char]) -> (String, usize) {
    let mut len = 0;
    while len < chars.len() && chars[len].is_ascii_digit() {
        len += 1;
    }
    if len < chars.len()
        && chars[len] == '.'
        && chars.get(len + 1).is_some_and(|c| c.is_ascii_digit())
    {
        len += 1;
        while len < chars.len() && chars[len].is_ascii_digit() {
            len += 1;
        }
    }
    (chars[..len].iter().collect(), len)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(src: &str) -> Vec<Token> {
        let (spanned, errors) = tokenize(src);
        assert!(errors.is_empty(), "unexpected lex errors: {errors:?}");
        spanned.into_iter().map(|t| t.token).collect()
    }

    #[test]
    fn keywords_and_idents() {
        assert_eq!(
            toks("let x = rec-ish; in x"),
            vec![
                Token::Let,
                Token::Ident("x".into()),
                Token::Assign,
                Token::Ident("rec-ish".into()),
                Token::Semi,
                Token::In,
                Token::Ident("x".into()),
            ]
        );
    }

    #[test]
    fn select_chain_splits_on_dots() {
        assert_eq!(
            toks("a.b.c"),
            vec![
                Token::Ident("a".into()),
                Token::Dot,
                Token::Ident("b".into()),
                Token::Dot,
                Token::Ident("c".into()),
            ]
        );
    }

    #[test]
    fn numbers() {
        assert_eq!(toks("1 2.5"), vec![Token::Int(1), Token::Float(2.5)]);
    }

    #[test]
    fn paths() {
        assert_eq!(
            toks("./foo.nix /etc/hosts lib/default.nix"),
            vec![
                Token::Path("./foo.nix".into()),
                Token::Path("/etc/hosts".into()),
                Token::Path("lib/default.nix".into()),
            ]
        );
    }

    #[test]
    fn update_vs_division_vs_path() {
        assert_eq!(
            toks("a // b"),
            vec![
                Token::Ident("a".into()),
                Token::Update,
                Token::Ident("b".into()),
            ]
        );
        assert_eq!(
            toks("a / b"),
            vec![
                Token::Ident("a".into()),
                Token::Slash,
                Token::Ident("b".into()),
            ]
        );
    }

    #[test]
    fn strings_with_escapes() {
        assert_eq!(toks(r#""a\"b\nc""#), vec![Token::Str("a\"b\nc".into())]);
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(
            toks("1 # comment\n/* block\ncomment */ 2"),
            vec![Token::Int(1), Token::Int(2)]
        );
    }

    #[test]
    fn unterminated_string_is_recovered() {
        let (tokens, errors) = tokenize("\"abc");
        assert_eq!(tokens.len(), 1);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("unterminated string"));
    }

    #[test]
    fn spans_are_one_indexed() {
        let (tokens, _) = tokenize("let\n  x = 1;");
        assert_eq!((tokens[0].line, tokens[0].col), (1, 1));
        assert_eq!((tokens[1].line, tokens[1].col), (2, 3));
    }

    #[test]
    fn ellipsis_and_question() {
        assert_eq!(
            toks("{ a ? 1, ... }"),
            vec![
                Token::LBrace,
                Token::Ident("a".into()),
                Token::Question,
                Token::Int(1),
                Token::Comma,
                Token::Ellipsis,
                Token::RBrace,
            ]
        );
    }
}
