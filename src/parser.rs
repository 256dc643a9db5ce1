//! Parser cursor for rill
//!
//! One token of lookahead (`current`) plus one token of trailing context
//! (`previous`). Errors use panic mode: the first error at a position is
//! recorded and every later one is dropped until [`Parser::synchronize`]
//! clears the flag. The grammar itself lives in the compiler, which emits
//! bytecode while it drives this cursor.

use crate::error::CompileError;
use crate::lexer::{ScannerSet, Tokenizer};
use crate::token::{Slice, Token, TokenKind};

/// The parser state
pub struct Parser<'a> {
    tokenizer: Tokenizer<'a>,
    source: &'a str,
    /// Chunk-wide index of the first byte of `source`.
    offset: usize,
    pub previous: Token,
    pub current: Token,
    panic_mode: bool,
    errors: Vec<CompileError>,
    /// Stop recording after this many errors (0 = unlimited).
    max_errors: usize,
}

impl<'a> Parser<'a> {
    /// Create a parser over `source`, whose bytes start at chunk-wide
    /// index `offset`.
    pub fn new(source: &'a str, scanners: &'a ScannerSet, offset: usize, max_errors: usize) -> Self {
        let start = Token::new(TokenKind::End, offset, 0);
        let mut parser = Self {
            tokenizer: Tokenizer::with_offset(source, scanners, offset),
            source,
            offset,
            previous: start,
            current: start,
            panic_mode: false,
            errors: Vec::new(),
            max_errors,
        };
        parser.advance();
        parser
    }

    /// Move to the next valid token, reporting unscannable input on the way.
    pub fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.tokenizer.next_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = format!("unexpected character '{}'", self.text(&self.current));
            self.error_at(self.current.slice(), message);
        }
    }

    pub fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    pub fn match_kind(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    /// Advance past `kind`, or record "expected ..." at the current token.
    pub fn consume(&mut self, kind: TokenKind, message: &str) -> bool {
        if self.check(kind) {
            self.advance();
            return true;
        }
        self.error_at_current(message);
        false
    }

    /// Source text of a token produced by this parser.
    pub fn text(&self, token: &Token) -> &'a str {
        let start = token.index.saturating_sub(self.offset);
        self.source.get(start..start + token.length).unwrap_or("")
    }

    pub fn error_at_current(&mut self, message: &str) {
        let found = match self.current.kind {
            TokenKind::End => "end of input".to_string(),
            _ => format!("'{}'", self.text(&self.current)),
        };
        self.error_at(self.current.slice(), format!("{}, found {}", message, found));
    }

    pub fn error_at_previous(&mut self, message: impl Into<String>) {
        self.error_at(self.previous.slice(), message);
    }

    /// Record an error unless already panicking.
    pub fn error_at(&mut self, slice: Slice, message: impl Into<String>) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        if self.max_errors == 0 || self.errors.len() < self.max_errors {
            self.errors.push(CompileError::new(slice, message));
        }
    }

    pub fn panic_mode(&self) -> bool {
        self.panic_mode
    }

    /// Leave panic mode and skip ahead to a token accepted by `boundary`.
    pub fn synchronize(&mut self, boundary: fn(TokenKind) -> bool) {
        self.panic_mode = false;
        while !self.check(TokenKind::End) && !boundary(self.current.kind) {
            self.advance();
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn into_errors(self) -> Vec<CompileError> {
        self.errors
    }
}

/// Tokens where a statement may start or a block ends.
pub fn statement_boundary(kind: TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::Let
            | TokenKind::Mut
            | TokenKind::While
            | TokenKind::If
            | TokenKind::Return
            | TokenKind::RightBrace
    )
}

/// Tokens where a top-level declaration may start.
pub fn declaration_boundary(kind: TokenKind) -> bool {
    kind == TokenKind::Fn
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser<'a>(source: &'a str, scanners: &'static ScannerSet) -> Parser<'a> {
        let _ = scanners;
        Parser::new(source, scanners, 0, 0)
    }

    fn scanners() -> &'static ScannerSet {
        Box::leak(Box::new(ScannerSet::language()))
    }

    #[test]
    fn test_previous_and_current() {
        let mut p = parser("let x", scanners());
        assert_eq!(p.current.kind, TokenKind::Let);
        p.advance();
        assert_eq!(p.previous.kind, TokenKind::Let);
        assert_eq!(p.current.kind, TokenKind::Ident);
        assert_eq!(p.text(&p.current), "x");
    }

    #[test]
    fn test_consume_reports_expected() {
        let mut p = parser("let x", scanners());
        assert!(!p.consume(TokenKind::Fn, "expected 'fn'"));
        let errors = p.into_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "expected 'fn', found 'let'");
        assert_eq!(errors[0].slice, Slice::new(0, 3));
    }

    #[test]
    fn test_panic_mode_suppresses_cascades() {
        let mut p = parser("a b c", scanners());
        p.error_at_current("first");
        p.advance();
        p.error_at_current("second");
        assert!(p.panic_mode());
        p.synchronize(|_| true);
        p.error_at_current("third");
        let errors = p.into_errors();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].message.starts_with("first"));
        assert!(errors[1].message.starts_with("third"));
    }

    #[test]
    fn test_error_tokens_are_reported_once_per_panic() {
        let p = parser("@@ x", scanners());
        assert_eq!(p.current.kind, TokenKind::Ident);
        let errors = p.into_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "unexpected character '@'");
    }

    #[test]
    fn test_synchronize_stops_at_boundary() {
        let mut p = parser("1 2 let y", scanners());
        p.error_at_current("bad");
        p.synchronize(statement_boundary);
        assert_eq!(p.current.kind, TokenKind::Let);
        assert!(!p.panic_mode());
    }
}
