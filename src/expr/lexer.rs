//! Expression tokenizer

use super::ExprError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Number(f64),
    Str(String),
    Ident(String),

    // Punctuation and operators
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Dot,
    OptionalDot, // ?.
    Question,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Not,
    EqEq,     // ==
    NotEq,    // !=
    StrictEq, // ===
    StrictNe, // !==
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Nullish, // ??
}

/// A token with its byte offset in the source, for error reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub offset: usize,
}

pub fn tokenize(source: &str) -> Result<Vec<Spanned>, ExprError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];

        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }

        let offset = i;
        let token = match c {
            b'(' => {
                i += 1;
                Token::LParen
            }
            b')' => {
                i += 1;
                Token::RParen
            }
            b'[' => {
                i += 1;
                Token::LBracket
            }
            b']' => {
                i += 1;
                Token::RBracket
            }
            b'{' => {
                i += 1;
                Token::LBrace
            }
            b'}' => {
                i += 1;
                Token::RBrace
            }
            b',' => {
                i += 1;
                Token::Comma
            }
            b':' => {
                i += 1;
                Token::Colon
            }
            b'.' => {
                i += 1;
                Token::Dot
            }
            b'+' => {
                i += 1;
                Token::Plus
            }
            b'-' => {
                i += 1;
                Token::Minus
            }
            b'*' => {
                i += 1;
                Token::Star
            }
            b'/' => {
                i += 1;
                Token::Slash
            }
            b'%' => {
                i += 1;
                Token::Percent
            }
            b'?' => {
                if bytes.get(i + 1) == Some(&b'?') {
                    i += 2;
                    Token::Nullish
                } else if bytes.get(i + 1) == Some(&b'.') {
                    i += 2;
                    Token::OptionalDot
                } else {
                    i += 1;
                    Token::Question
                }
            }
            b'!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    if bytes.get(i + 2) == Some(&b'=') {
                        i += 3;
                        Token::StrictNe
                    } else {
                        i += 2;
                        Token::NotEq
                    }
                } else {
                    i += 1;
                    Token::Not
                }
            }
            b'=' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    if bytes.get(i + 2) == Some(&b'=') {
                        i += 3;
                        Token::StrictEq
                    } else {
                        i += 2;
                        Token::EqEq
                    }
                } else {
                    return Err(err(offset, "unexpected '='"));
                }
            }
            b'<' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    i += 2;
                    Token::Le
                } else {
                    i += 1;
                    Token::Lt
                }
            }
            b'>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    i += 2;
                    Token::Ge
                } else {
                    i += 1;
                    Token::Gt
                }
            }
            b'&' => {
                if bytes.get(i + 1) == Some(&b'&') {
                    i += 2;
                    Token::AndAnd
                } else {
                    return Err(err(offset, "unexpected '&'"));
                }
            }
            b'|' => {
                if bytes.get(i + 1) == Some(&b'|') {
                    i += 2;
                    Token::OrOr
                } else {
                    return Err(err(offset, "unexpected '|'"));
                }
            }
            b'\'' | b'"' => {
                let (s, next) = lex_string(source, i)?;
                i = next;
                Token::Str(s)
            }
            b'0'..=b'9' => {
                let (n, next) = lex_number(source, i)?;
                i = next;
                Token::Number(n)
            }
            c if c == b'_' || c == b'$' || c.is_ascii_alphabetic() => {
                let start = i;
                while i < bytes.len()
                    && (bytes[i] == b'_' || bytes[i] == b'$' || bytes[i].is_ascii_alphanumeric())
                {
                    i += 1;
                }
                Token::Ident(source[start..i].to_string())
            }
            other => {
                return Err(err(offset, &format!("unexpected character '{}'", other as char)));
            }
        };

        tokens.push(Spanned { token, offset });
    }

    Ok(tokens)
}

fn lex_string(source: &str, start: usize) -> Result<(String, usize), ExprError> {
    let bytes = source.as_bytes();
    let quote = bytes[start];
    let mut out = String::new();
    let mut i = start + 1;

    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                let escaped = bytes
                    .get(i + 1)
                    .ok_or_else(|| err(i, "unterminated escape"))?;
                out.push(match escaped {
                    b'n' => '\n',
                    b't' => '\t',
                    b'r' => '\r',
                    b'\\' => '\\',
                    b'\'' => '\'',
                    b'"' => '"',
                    other => {
                        return Err(err(i, &format!("unknown escape '\\{}'", *other as char)))
                    }
                });
                i += 2;
            }
            c if c == quote => return Ok((out, i + 1)),
            _ => {
                // Advance over a full UTF-8 scalar, not a single byte.
                let ch = source[i..].chars().next().unwrap();
                out.push(ch);
                i += ch.len_utf8();
            }
        }
    }

    Err(err(start, "unterminated string literal"))
}

fn lex_number(source: &str, start: usize) -> Result<(f64, usize), ExprError> {
    let bytes = source.as_bytes();
    let mut i = start;
    let mut seen_dot = false;

    while i < bytes.len() {
        match bytes[i] {
            b'0'..=b'9' => i += 1,
            b'.' if !seen_dot && bytes.get(i + 1).is_some_and(|b| b.is_ascii_digit()) => {
                seen_dot = true;
                i += 1;
            }
            _ => break,
        }
    }

    source[start..i]
        .parse()
        .map(|n| (n, i))
        .map_err(|_| err(start, "invalid number literal"))
}

fn err(offset: usize, message: &str) -> ExprError {
    ExprError::Parse {
        offset,
        message: message.to_string(),
    }
}
