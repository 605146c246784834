//! Hand-rolled tokenizer for the script surface grammar.
//!
//! Spec.md §1 explicitly leaves "lexer/parser grammar particulars" out
//! of scope, so the exact surface syntax here is Moonflower's own design
//! rather than a port of anything in `original_source` (which drove its
//! grammar through flex/bison, tooling this crate deliberately doesn't
//! pull in — see DESIGN.md). The scanning style — a `Vec<char>` cursor,
//! one `next_token` per call — mirrors how `emdash-udashboard`'s
//! `bytecode.rs::decode_word` walks its own input character by character.

use crate::messages::SourceLocation;

#[derive(Clone, Debug, PartialEq)]
pub enum TokenKind {
    Ident(String),
    Int(i32),
    Float(f32),
    LParen,
    RParen,
    LBrace,
    RBrace,
    Colon,
    Comma,
    Semi,
    Plus,
    Minus,
    Star,
    Slash,
    Lt,
    Eq,
    Arrow,
    Eof,
}

#[derive(Clone, Debug)]
pub struct Token {
    pub kind: TokenKind,
    pub loc: SourceLocation,
}

pub fn lex(source: &str) -> Vec<Token> {
    let chars: Vec<char> = source.chars().collect();
    let mut pos = 0;
    let mut line = 1u32;
    let mut col = 1u32;
    let mut out = Vec::new();

    let mut advance = |pos: &mut usize, line: &mut u32, col: &mut u32| {
        if chars[*pos] == '\n' {
            *line += 1;
            *col = 1;
        } else {
            *col += 1;
        }
        *pos += 1;
    };

    while pos < chars.len() {
        let c = chars[pos];

        if c.is_whitespace() {
            advance(&mut pos, &mut line, &mut col);
            continue;
        }
        if c == '/' && chars.get(pos + 1) == Some(&'/') {
            while pos < chars.len() && chars[pos] != '\n' {
                advance(&mut pos, &mut line, &mut col);
            }
            continue;
        }

        let loc = SourceLocation::new(line, col);

        if c.is_ascii_digit() {
            let start = pos;
            while pos < chars.len() && chars[pos].is_ascii_digit() {
                advance(&mut pos, &mut line, &mut col);
            }
            let mut is_float = false;
            if pos < chars.len() && chars[pos] == '.' && chars.get(pos + 1).map_or(false, |c| c.is_ascii_digit()) {
                is_float = true;
                advance(&mut pos, &mut line, &mut col);
                while pos < chars.len() && chars[pos].is_ascii_digit() {
                    advance(&mut pos, &mut line, &mut col);
                }
            }
            let text: String = chars[start..pos].iter().collect();
            let kind = if is_float {
                TokenKind::Float(text.parse().unwrap_or(0.0))
            } else {
                TokenKind::Int(text.parse().unwrap_or(0))
            };
            out.push(Token { kind, loc });
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            let start = pos;
            while pos < chars.len() && (chars[pos].is_alphanumeric() || chars[pos] == '_') {
                advance(&mut pos, &mut line, &mut col);
            }
            let text: String = chars[start..pos].iter().collect();
            out.push(Token { kind: TokenKind::Ident(text), loc });
            continue;
        }

        if c == '-' && chars.get(pos + 1) == Some(&'>') {
            advance(&mut pos, &mut line, &mut col);
            advance(&mut pos, &mut line, &mut col);
            out.push(Token { kind: TokenKind::Arrow, loc });
            continue;
        }

        let kind = match c {
            '(' => Some(TokenKind::LParen),
            ')' => Some(TokenKind::RParen),
            '{' => Some(TokenKind::LBrace),
            '}' => Some(TokenKind::RBrace),
            ':' => Some(TokenKind::Colon),
            ',' => Some(TokenKind::Comma),
            ';' => Some(TokenKind::Semi),
            '+' => Some(TokenKind::Plus),
            '-' => Some(TokenKind::Minus),
            '*' => Some(TokenKind::Star),
            '/' => Some(TokenKind::Slash),
            '<' => Some(TokenKind::Lt),
            '=' => Some(TokenKind::Eq),
            _ => None,
        };
        advance(&mut pos, &mut line, &mut col);
        if let Some(kind) = kind {
            out.push(Token { kind, loc });
        }
        // Unrecognized characters are silently dropped; the parser will
        // report a more useful error once it hits the resulting gap.
    }

    out.push(Token { kind: TokenKind::Eof, loc: SourceLocation::new(line, col) });
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexes_a_minimal_function() {
        let tokens = lex("fn add1(n: int) -> int { return n + 1; }");
        let kinds: Vec<TokenKind> = tokens.into_iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Ident("fn".into()),
                TokenKind::Ident("add1".into()),
                TokenKind::LParen,
                TokenKind::Ident("n".into()),
                TokenKind::Colon,
                TokenKind::Ident("int".into()),
                TokenKind::RParen,
                TokenKind::Arrow,
                TokenKind::Ident("int".into()),
                TokenKind::LBrace,
                TokenKind::Ident("return".into()),
                TokenKind::Ident("n".into()),
                TokenKind::Plus,
                TokenKind::Int(1),
                TokenKind::Semi,
                TokenKind::RBrace,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn lexes_floats_distinctly_from_ints() {
        let tokens = lex("3.5 4");
        assert_eq!(tokens[0].kind, TokenKind::Float(3.5));
        assert_eq!(tokens[1].kind, TokenKind::Int(4));
    }

    #[test]
    fn skips_line_comments() {
        let tokens = lex("1 // ignore this\n2");
        let kinds: Vec<TokenKind> = tokens.into_iter().map(|t| t.kind).collect();
        assert_eq!(kinds, vec![TokenKind::Int(1), TokenKind::Int(2), TokenKind::Eof]);
    }
}
