//! Tokenizer for rill
//!
//! Converts source code into a stream of tokens using an ordered set of
//! scanners. At every position all scanners are tried and the longest match
//! wins; ties go to the scanner registered first, which is how keywords beat
//! the identifier scanner.

use crate::token::{Token, TokenKind};

/// Recognizes one token kind at the start of its input.
#[derive(Debug, Clone, Copy)]
pub enum Scanner {
    /// Matches the exact text.
    Literal(&'static str),
    /// Returns the matched byte length, 0 for no match.
    Rule(fn(&str) -> usize),
}

impl Scanner {
    /// Length in bytes of the match at the start of `input` (0 if none).
    pub fn scan(&self, input: &str) -> usize {
        match self {
            Scanner::Literal(text) => {
                if input.starts_with(text) {
                    text.len()
                } else {
                    0
                }
            }
            Scanner::Rule(rule) => rule(input),
        }
    }
}

/// Ordered scanner registry. Registration order breaks ties.
#[derive(Debug, Clone, Default)]
pub struct ScannerSet {
    scanners: Vec<(TokenKind, Scanner)>,
}

impl ScannerSet {
    pub fn new() -> Self {
        Self { scanners: Vec::new() }
    }

    pub fn add(&mut self, kind: TokenKind, scanner: Scanner) -> &mut Self {
        self.scanners.push((kind, scanner));
        self
    }

    pub fn len(&self) -> usize {
        self.scanners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scanners.is_empty()
    }

    /// Best match at the start of `input`: longest wins, earliest on ties.
    pub fn longest_match(&self, input: &str) -> Option<(TokenKind, usize)> {
        let mut best: Option<(TokenKind, usize)> = None;
        for (kind, scanner) in &self.scanners {
            let length = scanner.scan(input);
            if length == 0 {
                continue;
            }
            match best {
                Some((_, best_length)) if best_length >= length => {}
                _ => best = Some((*kind, length)),
            }
        }
        best
    }

    /// The scanners for the rill language.
    pub fn language() -> Self {
        let mut set = Self::new();
        set.add(TokenKind::Whitespace, Scanner::Rule(scan_whitespace))
            .add(TokenKind::Comment, Scanner::Rule(scan_comment));

        // Keywords precede the identifier scanner so they win ties.
        for (kind, text) in [
            (TokenKind::Let, "let"),
            (TokenKind::Mut, "mut"),
            (TokenKind::Fn, "fn"),
            (TokenKind::Return, "return"),
            (TokenKind::If, "if"),
            (TokenKind::Else, "else"),
            (TokenKind::While, "while"),
            (TokenKind::And, "and"),
            (TokenKind::Or, "or"),
            (TokenKind::True, "true"),
            (TokenKind::False, "false"),
        ] {
            set.add(kind, Scanner::Literal(text));
        }

        set.add(TokenKind::Ident, Scanner::Rule(scan_identifier))
            .add(TokenKind::Int, Scanner::Rule(scan_int))
            .add(TokenKind::Float, Scanner::Rule(scan_float))
            .add(TokenKind::String, Scanner::Rule(scan_string));

        for (kind, text) in [
            (TokenKind::Arrow, "->"),
            (TokenKind::EqualEqual, "=="),
            (TokenKind::BangEqual, "!="),
            (TokenKind::LessEqual, "<="),
            (TokenKind::GreaterEqual, ">="),
            (TokenKind::Plus, "+"),
            (TokenKind::Minus, "-"),
            (TokenKind::Star, "*"),
            (TokenKind::Slash, "/"),
            (TokenKind::Percent, "%"),
            (TokenKind::Equal, "="),
            (TokenKind::Less, "<"),
            (TokenKind::Greater, ">"),
            (TokenKind::Bang, "!"),
            (TokenKind::LeftParen, "("),
            (TokenKind::RightParen, ")"),
            (TokenKind::LeftBrace, "{"),
            (TokenKind::RightBrace, "}"),
            (TokenKind::Comma, ","),
            (TokenKind::Colon, ":"),
            (TokenKind::Dot, "."),
        ] {
            set.add(kind, Scanner::Literal(text));
        }
        set
    }
}

fn scan_whitespace(input: &str) -> usize {
    input
        .char_indices()
        .find(|(_, c)| !c.is_whitespace())
        .map_or(input.len(), |(i, _)| i)
}

fn scan_comment(input: &str) -> usize {
    if !input.starts_with("//") {
        return 0;
    }
    input.find('\n').unwrap_or(input.len())
}

fn scan_identifier(input: &str) -> usize {
    let mut chars = input.char_indices();
    match chars.next() {
        Some((_, c)) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return 0,
    }
    chars
        .find(|(_, c)| !(c.is_ascii_alphanumeric() || *c == '_'))
        .map_or(input.len(), |(i, _)| i)
}

fn scan_digits(input: &str) -> usize {
    input
        .bytes()
        .position(|b| !b.is_ascii_digit())
        .unwrap_or(input.len())
}

fn scan_int(input: &str) -> usize {
    scan_digits(input)
}

fn scan_float(input: &str) -> usize {
    let whole = scan_digits(input);
    if whole == 0 || input.as_bytes().get(whole) != Some(&b'.') {
        return 0;
    }
    let fraction = scan_digits(&input[whole + 1..]);
    if fraction == 0 {
        return 0;
    }
    whole + 1 + fraction
}

fn scan_string(input: &str) -> usize {
    let mut chars = input.char_indices();
    if !matches!(chars.next(), Some((_, '"'))) {
        return 0;
    }
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return i + 1,
            '\\' => {
                // The escaped character is consumed whatever it is.
                if chars.next().is_none() {
                    return 0;
                }
            }
            _ => {}
        }
    }
    // Unterminated
    0
}

/// Decodes the escapes of a string literal's text (quotes included).
pub fn unescape_string(literal: &str) -> String {
    let inner = literal
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(literal);
    let mut value = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            value.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => value.push('\n'),
            Some('t') => value.push('\t'),
            Some('r') => value.push('\r'),
            Some('0') => value.push('\0'),
            Some(other) => value.push(other),
            None => {}
        }
    }
    value
}

/// Pull-mode tokenizer. Trivia is skipped; unscannable input yields
/// single-character `Error` tokens; `End` repeats once input is exhausted.
pub struct Tokenizer<'a> {
    source: &'a str,
    scanners: &'a ScannerSet,
    position: usize,
    /// Added to every produced index, for multi-source compiles.
    offset: usize,
}

impl<'a> Tokenizer<'a> {
    pub fn new(source: &'a str, scanners: &'a ScannerSet) -> Self {
        Self::with_offset(source, scanners, 0)
    }

    pub fn with_offset(source: &'a str, scanners: &'a ScannerSet, offset: usize) -> Self {
        Self {
            source,
            scanners,
            position: 0,
            offset,
        }
    }

    /// Get the next non-trivia token
    pub fn next_token(&mut self) -> Token {
        loop {
            let rest = &self.source[self.position..];
            let Some(first) = rest.chars().next() else {
                return Token::new(TokenKind::End, self.offset + self.source.len(), 0);
            };

            let start = self.position;
            match self.scanners.longest_match(rest) {
                Some((kind, length)) => {
                    self.position += length;
                    if kind.is_trivia() {
                        continue;
                    }
                    return Token::new(kind, self.offset + start, length);
                }
                None => {
                    // Always advance at least one character.
                    let length = first.len_utf8();
                    self.position += length;
                    return Token::new(TokenKind::Error, self.offset + start, length);
                }
            }
        }
    }
}

/// Result of a batch tokenization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenStream {
    /// Valid tokens in order, terminated by `End`.
    pub tokens: Vec<Token>,
    /// Start index of each contiguous run of unscannable input.
    pub errors: Vec<usize>,
}

/// Tokenize the entire source. Adjacent invalid characters are coalesced
/// into one recorded error index.
pub fn tokenize(source: &str, scanners: &ScannerSet) -> TokenStream {
    let mut stream = TokenStream::default();
    let mut position = 0;
    let mut in_error_run = false;

    while let Some(first) = source[position..].chars().next() {
        match scanners.longest_match(&source[position..]) {
            Some((kind, length)) => {
                if !kind.is_trivia() {
                    stream.tokens.push(Token::new(kind, position, length));
                }
                position += length;
                in_error_run = false;
            }
            None => {
                if !in_error_run {
                    stream.errors.push(position);
                    in_error_run = true;
                }
                position += first.len_utf8();
            }
        }
    }

    stream.tokens.push(Token::new(TokenKind::End, source.len(), 0));
    stream
}
