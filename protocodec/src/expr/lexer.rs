//! Hand-rolled tokenizer for the expression grammar.

use crate::error::{CodecError, Stage};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Bang,
    Amp,
    Pipe,
    Caret,
    Tilde,
    Shl,
    Shr,
    LParen,
    RParen,
    Comma,
    Question,
    Colon,
    Eof,
}

pub fn lex(src: &str) -> Result<Vec<Token>, CodecError> {
    let mut chars = src.chars().peekable();
    let mut tokens = Vec::new();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '\'' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => s.push(ch),
                        None => {
                            return Err(CodecError::expr_syntax(
                                Stage::Plan,
                                "",
                                "unterminated string literal",
                            ))
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            '0'..='9' => {
                tokens.push(lex_number(&mut chars)?);
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut s = String::new();
                while let Some(&nc) = chars.peek() {
                    if nc.is_alphanumeric() || nc == '_' {
                        s.push(nc);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(s));
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '%' => {
                chars.next();
                tokens.push(Token::Percent);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '?' => {
                chars.next();
                tokens.push(Token::Question);
            }
            ':' => {
                chars.next();
                tokens.push(Token::Colon);
            }
            '~' => {
                chars.next();
                tokens.push(Token::Tilde);
            }
            '=' => {
                chars.next();
                expect_char(&mut chars, '=')?;
                tokens.push(Token::EqEq);
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::NotEq);
                } else {
                    tokens.push(Token::Bang);
                }
            }
            '<' => {
                chars.next();
                match chars.peek() {
                    Some(&'=') => {
                        chars.next();
                        tokens.push(Token::Le);
                    }
                    Some(&'<') => {
                        chars.next();
                        tokens.push(Token::Shl);
                    }
                    _ => tokens.push(Token::Lt),
                }
            }
            '>' => {
                chars.next();
                match chars.peek() {
                    Some(&'=') => {
                        chars.next();
                        tokens.push(Token::Ge);
                    }
                    Some(&'>') => {
                        chars.next();
                        tokens.push(Token::Shr);
                    }
                    _ => tokens.push(Token::Gt),
                }
            }
            '&' => {
                chars.next();
                if chars.peek() == Some(&'&') {
                    chars.next();
                    tokens.push(Token::AndAnd);
                } else {
                    tokens.push(Token::Amp);
                }
            }
            '|' => {
                chars.next();
                if chars.peek() == Some(&'|') {
                    chars.next();
                    tokens.push(Token::OrOr);
                } else {
                    tokens.push(Token::Pipe);
                }
            }
            '^' => {
                chars.next();
                tokens.push(Token::Caret);
            }
            other => {
                return Err(CodecError::expr_syntax(
                    Stage::Plan,
                    "",
                    format!("unexpected character '{other}'"),
                ))
            }
        }
    }

    tokens.push(Token::Eof);
    Ok(tokens)
}

fn expect_char(
    chars: &mut std::iter::Peekable<std::str::Chars>,
    expected: char,
) -> Result<(), CodecError> {
    match chars.next() {
        Some(c) if c == expected => Ok(()),
        _ => Err(CodecError::expr_syntax(
            Stage::Plan,
            "",
            format!("expected '{expected}'"),
        )),
    }
}

fn lex_number(chars: &mut std::iter::Peekable<std::str::Chars>) -> Result<Token, CodecError> {
    let mut s = String::new();
    if chars.peek() == Some(&'0') {
        s.push(chars.next().unwrap());
        match chars.peek() {
            Some(&'x') | Some(&'X') => {
                chars.next();
                let mut hex = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_hexdigit() {
                        hex.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let v = u64::from_str_radix(&hex, 16).map_err(|e| {
                    CodecError::expr_syntax(Stage::Plan, "", format!("bad hex literal: {e}"))
                })?;
                return Ok(Token::UInt(v));
            }
            Some(&'b') | Some(&'B') => {
                chars.next();
                let mut bin = String::new();
                while let Some(&c) = chars.peek() {
                    if c == '0' || c == '1' {
                        bin.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let v = u64::from_str_radix(&bin, 2).map_err(|e| {
                    CodecError::expr_syntax(Stage::Plan, "", format!("bad binary literal: {e}"))
                })?;
                return Ok(Token::UInt(v));
            }
            _ => {}
        }
    }

    while let Some(&c) = chars.peek() {
        if c.is_ascii_digit() {
            s.push(c);
            chars.next();
        } else {
            break;
        }
    }

    let mut is_float = false;
    if chars.peek() == Some(&'.') {
        is_float = true;
        s.push('.');
        chars.next();
        while let Some(&c) = chars.peek() {
            if c.is_ascii_digit() {
                s.push(c);
                chars.next();
            } else {
                break;
            }
        }
    }

    if is_float {
        s.parse::<f64>()
            .map(Token::Float)
            .map_err(|e| CodecError::expr_syntax(Stage::Plan, "", format!("bad float literal: {e}")))
    } else {
        s.parse::<u64>()
            .map(Token::UInt)
            .map_err(|e| CodecError::expr_syntax(Stage::Plan, "", format!("bad int literal: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexes_arithmetic() {
        let toks = lex("1 + 2 * 3").unwrap();
        assert_eq!(
            toks,
            vec![
                Token::UInt(1),
                Token::Plus,
                Token::UInt(2),
                Token::Star,
                Token::UInt(3),
                Token::Eof
            ]
        );
    }

    #[test]
    fn lexes_hex_and_binary_literals() {
        let toks = lex("0x1F 0b101").unwrap();
        assert_eq!(toks, vec![Token::UInt(31), Token::UInt(5), Token::Eof]);
    }

    #[test]
    fn lexes_comparison_and_logical_operators() {
        let toks = lex("a >= 2 && b != 0").unwrap();
        assert_eq!(
            toks,
            vec![
                Token::Ident("a".into()),
                Token::Ge,
                Token::UInt(2),
                Token::AndAnd,
                Token::Ident("b".into()),
                Token::NotEq,
                Token::UInt(0),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn lexes_shift_operators() {
        let toks = lex("a << 2 >> 1").unwrap();
        assert_eq!(
            toks,
            vec![
                Token::Ident("a".into()),
                Token::Shl,
                Token::UInt(2),
                Token::Shr,
                Token::UInt(1),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn lexes_string_literal() {
        let toks = lex("'md5'").unwrap();
        assert_eq!(toks, vec![Token::Str("md5".into()), Token::Eof]);
    }

    #[test]
    fn unterminated_string_is_an_error() {
        assert!(lex("'oops").is_err());
    }
}
