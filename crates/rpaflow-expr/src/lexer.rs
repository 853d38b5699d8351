//! Tokenizer shared by conditions and scripts.

use crate::error::ExprError;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Number(f64),
    Str(String),
    Ident(String),

    // Keywords
    Let,
    If,
    Else,
    For,
    In,
    Return,
    Throw,
    True,
    False,
    Null,

    // Delimiters
    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,
    LeftBrace,
    RightBrace,
    Comma,
    Dot,
    Colon,
    Semicolon,

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    EqEq,
    NotEq,
    Less,
    LessEq,
    Greater,
    GreaterEq,
    And,
    Or,
    Assign,
    RegexMatch,

    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Byte offset of the first character.
    pub pos: usize,
}

pub struct Lexer<'a> {
    input: &'a str,
    position: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self { input, position: 0 }
    }

    /// Tokenize the whole input. The last token is always `Eof`.
    pub fn tokenize(mut self) -> Result<Vec<Token>, ExprError> {
        let mut tokens = Vec::with_capacity((self.input.len() / 4).max(8));
        loop {
            let token = self.next_token()?;
            let done = token.kind == TokenKind::Eof;
            tokens.push(token);
            if done {
                return Ok(tokens);
            }
        }
    }

    fn next_token(&mut self) -> Result<Token, ExprError> {
        self.skip_trivia();
        let start = self.position;

        let Some(ch) = self.current() else {
            return Ok(Token {
                kind: TokenKind::Eof,
                pos: start,
            });
        };

        let kind = match ch {
            '(' => self.single(TokenKind::LeftParen),
            ')' => self.single(TokenKind::RightParen),
            '[' => self.single(TokenKind::LeftBracket),
            ']' => self.single(TokenKind::RightBracket),
            '{' => self.single(TokenKind::LeftBrace),
            '}' => self.single(TokenKind::RightBrace),
            ',' => self.single(TokenKind::Comma),
            '.' => self.single(TokenKind::Dot),
            ':' => self.single(TokenKind::Colon),
            ';' => self.single(TokenKind::Semicolon),
            '+' => self.single(TokenKind::Plus),
            '-' => self.single(TokenKind::Minus),
            '*' => self.single(TokenKind::Star),
            '/' => self.single(TokenKind::Slash),
            '%' => self.single(TokenKind::Percent),

            '=' => {
                self.advance();
                match self.current() {
                    Some('=') => {
                        self.advance();
                        // `===` is accepted as an alias of `==`
                        if self.current() == Some('=') {
                            self.advance();
                        }
                        TokenKind::EqEq
                    }
                    Some('~') => {
                        self.advance();
                        TokenKind::RegexMatch
                    }
                    _ => TokenKind::Assign,
                }
            }
            '!' => {
                self.advance();
                if self.current() == Some('=') {
                    self.advance();
                    if self.current() == Some('=') {
                        self.advance();
                    }
                    TokenKind::NotEq
                } else {
                    TokenKind::Bang
                }
            }
            '<' => {
                self.advance();
                if self.current() == Some('=') {
                    self.advance();
                    TokenKind::LessEq
                } else {
                    TokenKind::Less
                }
            }
            '>' => {
                self.advance();
                if self.current() == Some('=') {
                    self.advance();
                    TokenKind::GreaterEq
                } else {
                    TokenKind::Greater
                }
            }
            '&' => {
                self.advance();
                if self.current() != Some('&') {
                    return Err(ExprError::syntax(start, "expected '&&'"));
                }
                self.advance();
                TokenKind::And
            }
            '|' => {
                self.advance();
                if self.current() != Some('|') {
                    return Err(ExprError::syntax(start, "expected '||'"));
                }
                self.advance();
                TokenKind::Or
            }

            '"' | '\'' => self.read_string(ch)?,
            c if c.is_ascii_digit() => self.read_number()?,
            c if c.is_alphabetic() || c == '_' || c == '$' => self.read_ident(),

            other => {
                return Err(ExprError::syntax(
                    start,
                    format!("unexpected character '{other}'"),
                ))
            }
        };

        Ok(Token { kind, pos: start })
    }

    fn current(&self) -> Option<char> {
        self.input[self.position..].chars().next()
    }

    fn peek(&self) -> Option<char> {
        let mut chars = self.input[self.position..].chars();
        chars.next();
        chars.next()
    }

    fn advance(&mut self) {
        if let Some(c) = self.current() {
            self.position += c.len_utf8();
        }
    }

    fn single(&mut self, kind: TokenKind) -> TokenKind {
        self.advance();
        kind
    }

    /// Skip whitespace and `//` / `/* */` comments.
    fn skip_trivia(&mut self) {
        loop {
            match (self.current(), self.peek()) {
                (Some(c), _) if c.is_whitespace() => self.advance(),
                (Some('/'), Some('/')) => {
                    while let Some(c) = self.current() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                (Some('/'), Some('*')) => {
                    self.advance();
                    self.advance();
                    while let Some(c) = self.current() {
                        if c == '*' && self.peek() == Some('/') {
                            self.advance();
                            self.advance();
                            break;
                        }
                        self.advance();
                    }
                }
                _ => return,
            }
        }
    }

    fn read_string(&mut self, quote: char) -> Result<TokenKind, ExprError> {
        let start = self.position;
        self.advance();
        let mut out = String::new();
        loop {
            let Some(c) = self.current() else {
                return Err(ExprError::syntax(start, "unterminated string"));
            };
            self.advance();
            match c {
                c if c == quote => return Ok(TokenKind::Str(out)),
                '\\' => {
                    let Some(esc) = self.current() else {
                        return Err(ExprError::syntax(start, "unterminated string"));
                    };
                    self.advance();
                    match esc {
                        'n' => out.push('\n'),
                        't' => out.push('\t'),
                        'r' => out.push('\r'),
                        '0' => out.push('\0'),
                        other => out.push(other),
                    }
                }
                other => out.push(other),
            }
        }
    }

    fn read_number(&mut self) -> Result<TokenKind, ExprError> {
        let start = self.position;
        while matches!(self.current(), Some(c) if c.is_ascii_digit()) {
            self.advance();
        }
        // A dot only continues the number when a digit follows, so `1.toString`
        // style member access stays unambiguous.
        if self.current() == Some('.') && matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.advance();
            while matches!(self.current(), Some(c) if c.is_ascii_digit()) {
                self.advance();
            }
        }
        if self.at_exponent() {
            self.advance();
            if matches!(self.current(), Some('+' | '-')) {
                self.advance();
            }
            while matches!(self.current(), Some(c) if c.is_ascii_digit()) {
                self.advance();
            }
        }
        let text = &self.input[start..self.position];
        text.parse::<f64>()
            .map(TokenKind::Number)
            .map_err(|_| ExprError::syntax(start, format!("invalid number '{text}'")))
    }

    /// `e`/`E` followed by digits, optionally signed.
    fn at_exponent(&self) -> bool {
        let mut chars = self.input[self.position..].chars();
        if !matches!(chars.next(), Some('e' | 'E')) {
            return false;
        }
        match chars.next() {
            Some('+' | '-') => matches!(chars.next(), Some(c) if c.is_ascii_digit()),
            Some(c) => c.is_ascii_digit(),
            None => false,
        }
    }

    fn read_ident(&mut self) -> TokenKind {
        let start = self.position;
        while matches!(self.current(), Some(c) if c.is_alphanumeric() || c == '_' || c == '$') {
            self.advance();
        }
        match &self.input[start..self.position] {
            "let" | "const" | "var" => TokenKind::Let,
            "if" => TokenKind::If,
            "else" => TokenKind::Else,
            "for" => TokenKind::For,
            "in" | "of" => TokenKind::In,
            "return" => TokenKind::Return,
            "throw" => TokenKind::Throw,
            "true" => TokenKind::True,
            "false" => TokenKind::False,
            "null" | "undefined" => TokenKind::Null,
            ident => TokenKind::Ident(ident.to_string()),
        }
    }
}

/// Tokenize `input`.
pub fn tokenize(input: &str) -> Result<Vec<Token>, ExprError> {
    Lexer::new(input).tokenize()
}
