//! Tokenizer for executable GraphQL documents.
//!
//! Commas are insignificant in GraphQL and are skipped like whitespace.

use crate::error::DocumentError;

/// Token kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Name(String),
    Int(i64),
    Float(f64),
    String(String),

    LBrace,
    RBrace,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Colon,
    Bang,
    Equals,
    At,
    Dollar,
    Spread,

    Eof,
}

impl TokenKind {
    /// Short human-readable description used in error messages.
    pub fn describe(&self) -> String {
        match self {
            Self::Name(n) => format!("name '{n}'"),
            Self::Int(i) => format!("int {i}"),
            Self::Float(f) => format!("float {f}"),
            Self::String(_) => "string".into(),
            Self::LBrace => "'{'".into(),
            Self::RBrace => "'}'".into(),
            Self::LParen => "'('".into(),
            Self::RParen => "')'".into(),
            Self::LBracket => "'['".into(),
            Self::RBracket => "']'".into(),
            Self::Colon => "':'".into(),
            Self::Bang => "'!'".into(),
            Self::Equals => "'='".into(),
            Self::At => "'@'".into(),
            Self::Dollar => "'$'".into(),
            Self::Spread => "'...'".into(),
            Self::Eof => "end of document".into(),
        }
    }
}

/// A token with its source position.
#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
    pub column: usize,
}

/// Lexer over a document source.
pub struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
    column: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            chars: source.chars().peekable(),
            line: 1,
            column: 1,
        }
    }

    /// Tokenize the whole source, ending with [`TokenKind::Eof`].
    pub fn tokenize(mut self) -> Result<Vec<Token>, DocumentError> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let is_eof = token.kind == TokenKind::Eof;
            tokens.push(token);
            if is_eof {
                break;
            }
        }
        Ok(tokens)
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.chars.next()?;
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(ch)
    }

    fn skip_ignored(&mut self) {
        while let Some(&ch) = self.chars.peek() {
            match ch {
                ' ' | '\t' | '\n' | '\r' | ',' | '\u{feff}' => {
                    self.bump();
                }
                '#' => {
                    while let Some(&c) = self.chars.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                _ => break,
            }
        }
    }

    fn next_token(&mut self) -> Result<Token, DocumentError> {
        self.skip_ignored();
        let (line, column) = (self.line, self.column);
        let token = |kind| Token { kind, line, column };

        let Some(ch) = self.bump() else {
            return Ok(token(TokenKind::Eof));
        };

        let kind = match ch {
            '{' => TokenKind::LBrace,
            '}' => TokenKind::RBrace,
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '[' => TokenKind::LBracket,
            ']' => TokenKind::RBracket,
            ':' => TokenKind::Colon,
            '!' => TokenKind::Bang,
            '=' => TokenKind::Equals,
            '@' => TokenKind::At,
            '$' => TokenKind::Dollar,
            '.' => {
                if self.bump() == Some('.') && self.bump() == Some('.') {
                    TokenKind::Spread
                } else {
                    return Err(DocumentError::UnexpectedChar { ch, line, column });
                }
            }
            '"' => self.string(line, column)?,
            c if c == '_' || c.is_ascii_alphabetic() => {
                let mut name = String::from(c);
                while let Some(&next) = self.chars.peek() {
                    if next == '_' || next.is_ascii_alphanumeric() {
                        name.push(next);
                        self.bump();
                    } else {
                        break;
                    }
                }
                TokenKind::Name(name)
            }
            c if c == '-' || c.is_ascii_digit() => self.number(c, line, column)?,
            other => {
                return Err(DocumentError::UnexpectedChar {
                    ch: other,
                    line,
                    column,
                })
            }
        };
        Ok(token(kind))
    }

    fn string(&mut self, line: usize, column: usize) -> Result<TokenKind, DocumentError> {
        let mut out = String::new();
        loop {
            match self.bump() {
                None | Some('\n') => return Err(DocumentError::UnterminatedString { line, column }),
                Some('"') => return Ok(TokenKind::String(out)),
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some('b') => out.push('\u{8}'),
                    Some('f') => out.push('\u{c}'),
                    Some('u') => {
                        let mut code = String::new();
                        for _ in 0..4 {
                            match self.bump() {
                                Some(h) => code.push(h),
                                None => {
                                    return Err(DocumentError::UnterminatedString { line, column })
                                }
                            }
                        }
                        let decoded = u32::from_str_radix(&code, 16)
                            .ok()
                            .and_then(char::from_u32)
                            .unwrap_or('\u{fffd}');
                        out.push(decoded);
                    }
                    Some(other) => out.push(other),
                    None => return Err(DocumentError::UnterminatedString { line, column }),
                },
                Some(c) => out.push(c),
            }
        }
    }

    fn number(&mut self, first: char, line: usize, column: usize) -> Result<TokenKind, DocumentError> {
        let mut text = String::from(first);
        let mut is_float = false;
        while let Some(&next) = self.chars.peek() {
            match next {
                '0'..='9' => {}
                '.' | 'e' | 'E' => is_float = true,
                '+' | '-' if is_float => {}
                _ => break,
            }
            text.push(next);
            self.bump();
        }
        let invalid = || DocumentError::Expected {
            expected: "number".into(),
            found: text.clone(),
            line,
            column,
        };
        if is_float {
            text.parse::<f64>().map(TokenKind::Float).map_err(|_| invalid())
        } else {
            text.parse::<i64>().map(TokenKind::Int).map_err(|_| invalid())
        }
    }
}
