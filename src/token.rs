//! Token definitions for rill
//!
//! Tokens are position descriptors only: a kind plus a byte range. The text
//! of a token is recovered from the source through its [`Slice`].

use std::fmt;

/// Half-open byte range into source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Slice {
    pub index: usize,
    pub length: usize,
}

impl Slice {
    pub fn new(index: usize, length: usize) -> Self {
        Self { index, length }
    }

    /// One past the last byte.
    pub fn end(&self) -> usize {
        self.index + self.length
    }

    /// Smallest slice covering both `self` and `other`.
    pub fn merge(&self, other: Slice) -> Slice {
        let start = self.index.min(other.index);
        let end = self.end().max(other.end());
        Slice::new(start, end - start)
    }

    /// Moves the slice by `offset` bytes.
    pub fn shifted(&self, offset: usize) -> Slice {
        Slice::new(self.index + offset, self.length)
    }
}

/// Token types in rill
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    // Trivia (never reaches the parser)
    Whitespace,
    Comment,

    // Literals
    Int,
    Float,
    String,
    True,
    False,

    // Identifiers
    Ident,

    // Keywords
    Let,        // immutable binding
    Mut,        // mutable binding
    Fn,         // function definition
    Return,     // return from function
    If,         // conditional
    Else,       // else branch
    While,      // while loop
    And,        // short-circuit and
    Or,         // short-circuit or

    // Operators
    Plus,       // +
    Minus,      // -
    Star,       // *
    Slash,      // /
    Percent,    // %

    // Comparison
    Equal,      // =
    EqualEqual, // ==
    BangEqual,  // !=
    Less,       // <
    LessEqual,  // <=
    Greater,    // >
    GreaterEqual, // >=
    Bang,       // !

    // Special
    Arrow,      // ->

    // Delimiters
    LeftParen,  // (
    RightParen, // )
    LeftBrace,  // {
    RightBrace, // }
    Comma,      // ,
    Colon,      // :
    Dot,        // .

    // Special tokens
    Error,      // unscannable input
    End,        // end of input
}

impl TokenKind {
    /// Trivia tokens are dropped by the tokenizer before the parser sees them.
    pub fn is_trivia(&self) -> bool {
        matches!(self, TokenKind::Whitespace | TokenKind::Comment)
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TokenKind::Whitespace => "whitespace",
            TokenKind::Comment => "comment",
            TokenKind::Int => "integer",
            TokenKind::Float => "float",
            TokenKind::String => "string",
            TokenKind::True => "true",
            TokenKind::False => "false",
            TokenKind::Ident => "identifier",
            TokenKind::Let => "let",
            TokenKind::Mut => "mut",
            TokenKind::Fn => "fn",
            TokenKind::Return => "return",
            TokenKind::If => "if",
            TokenKind::Else => "else",
            TokenKind::While => "while",
            TokenKind::And => "and",
            TokenKind::Or => "or",
            TokenKind::Plus => "+",
            TokenKind::Minus => "-",
            TokenKind::Star => "*",
            TokenKind::Slash => "/",
            TokenKind::Percent => "%",
            TokenKind::Equal => "=",
            TokenKind::EqualEqual => "==",
            TokenKind::BangEqual => "!=",
            TokenKind::Less => "<",
            TokenKind::LessEqual => "<=",
            TokenKind::Greater => ">",
            TokenKind::GreaterEqual => ">=",
            TokenKind::Bang => "!",
            TokenKind::Arrow => "->",
            TokenKind::LeftParen => "(",
            TokenKind::RightParen => ")",
            TokenKind::LeftBrace => "{",
            TokenKind::RightBrace => "}",
            TokenKind::Comma => ",",
            TokenKind::Colon => ":",
            TokenKind::Dot => ".",
            TokenKind::Error => "invalid input",
            TokenKind::End => "end of input",
        };
        write!(f, "{}", text)
    }
}

/// A token with its kind and location
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub index: usize,
    pub length: usize,
}

impl Token {
    pub fn new(kind: TokenKind, index: usize, length: usize) -> Self {
        Self { kind, index, length }
    }

    pub fn slice(&self) -> Slice {
        Slice::new(self.index, self.length)
    }

    /// The token's text within `source`.
    pub fn text<'s>(&self, source: &'s str) -> &'s str {
        source.get(self.index..self.index + self.length).unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_merge() {
        let a = Slice::new(2, 3);
        let b = Slice::new(8, 2);
        assert_eq!(a.merge(b), Slice::new(2, 8));
        assert_eq!(b.merge(a), Slice::new(2, 8));
    }

    #[test]
    fn test_token_text() {
        let token = Token::new(TokenKind::Ident, 4, 3);
        assert_eq!(token.text("let foo = 1"), "foo");
        assert_eq!(token.slice().end(), 7);
    }
}
