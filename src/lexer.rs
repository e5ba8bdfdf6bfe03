//! Lexer for the kernel dialect using logos
//!
//! Supports tokens like:
//! - Identifiers and keywords: `def`, `team_member`, `nonlocal`
//! - Numbers: `1`, `2.5`, `1e-3`
//! - Operators: `+`, `//`, `**`, `+=`, `<=`, `->`
//! - Layout: logical newlines, INDENT and DEDENT derived from leading whitespace
//!
//! Newlines inside brackets do not end a logical line and `#` comments are skipped.

use logos::Logos;

use crate::error::{KernelError, KernelResult, Location};

/// Raw token types produced by logos
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\f]+")]
#[logos(skip r"#[^\n]*")]
#[logos(skip r"\\\r?\n")]
pub enum Token {
    // Physical line break, carrying the indentation width of the next line
    #[regex(r"\r?\n[ \t]*", |lex| indent_width(lex.slice()))]
    Newline(usize),

    // Literals
    #[regex(r"[0-9]+\.[0-9]*([eE][+-]?[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    #[regex(r"[0-9]+[eE][+-]?[0-9]+", |lex| lex.slice().parse::<f64>().ok())]
    #[regex(r"\.[0-9]+([eE][+-]?[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    Float(f64),

    #[regex(r"[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    Int(i64),

    #[regex(r#""[^"\n]*""#, |lex| { let s = lex.slice(); s[1..s.len() - 1].to_string() })]
    #[regex(r#"'[^'\n]*'"#, |lex| { let s = lex.slice(); s[1..s.len() - 1].to_string() })]
    Str(String),

    // Keywords
    #[token("def")]
    Def,
    #[token("if")]
    If,
    #[token("elif")]
    Elif,
    #[token("else")]
    Else,
    #[token("while")]
    While,
    #[token("for")]
    For,
    #[token("in")]
    In,
    #[token("return")]
    Return,
    #[token("break")]
    Break,
    #[token("continue")]
    Continue,
    #[token("pass")]
    Pass,
    #[token("nonlocal")]
    Nonlocal,
    #[token("and")]
    And,
    #[token("or")]
    Or,
    #[token("not")]
    Not,
    #[token("True")]
    True,
    #[token("False")]
    False,
    #[token("None")]
    NoneLit,

    // Identifiers
    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    // Operators
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("**")]
    DoubleStar,
    #[token("/")]
    Slash,
    #[token("//")]
    DoubleSlash,
    #[token("%")]
    Percent,
    #[token("&")]
    Amp,
    #[token("|")]
    Pipe,
    #[token("^")]
    Caret,
    #[token("~")]
    Tilde,
    #[token("<<")]
    Shl,
    #[token(">>")]
    Shr,
    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("<")]
    Lt,
    #[token("<=")]
    Le,
    #[token(">")]
    Gt,
    #[token(">=")]
    Ge,
    #[token("=")]
    Equals,
    #[token("+=")]
    PlusEq,
    #[token("-=")]
    MinusEq,
    #[token("*=")]
    StarEq,
    #[token("/=")]
    SlashEq,
    #[token("//=")]
    DoubleSlashEq,
    #[token("%=")]
    PercentEq,
    #[token("->")]
    Arrow,
    #[token(".")]
    Dot,

    // Punctuation
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(",")]
    Comma,
    #[token(":")]
    Colon,
    #[token(";")]
    Semicolon,

    // Layout tokens, synthesized by `Lexer::tokenize`
    Indent,
    Dedent,
    Eof,
}

fn indent_width(slice: &str) -> usize {
    slice.chars().filter(|c| *c == ' ' || *c == '\t').count()
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Newline(_) => write!(f, "newline"),
            Token::Float(n) => write!(f, "{}", n),
            Token::Int(n) => write!(f, "{}", n),
            Token::Str(s) => write!(f, "\"{}\"", s),
            Token::Def => write!(f, "def"),
            Token::If => write!(f, "if"),
            Token::Elif => write!(f, "elif"),
            Token::Else => write!(f, "else"),
            Token::While => write!(f, "while"),
            Token::For => write!(f, "for"),
            Token::In => write!(f, "in"),
            Token::Return => write!(f, "return"),
            Token::Break => write!(f, "break"),
            Token::Continue => write!(f, "continue"),
            Token::Pass => write!(f, "pass"),
            Token::Nonlocal => write!(f, "nonlocal"),
            Token::And => write!(f, "and"),
            Token::Or => write!(f, "or"),
            Token::Not => write!(f, "not"),
            Token::True => write!(f, "True"),
            Token::False => write!(f, "False"),
            Token::NoneLit => write!(f, "None"),
            Token::Ident(s) => write!(f, "{}", s),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::DoubleStar => write!(f, "**"),
            Token::Slash => write!(f, "/"),
            Token::DoubleSlash => write!(f, "//"),
            Token::Percent => write!(f, "%"),
            Token::Amp => write!(f, "&"),
            Token::Pipe => write!(f, "|"),
            Token::Caret => write!(f, "^"),
            Token::Tilde => write!(f, "~"),
            Token::Shl => write!(f, "<<"),
            Token::Shr => write!(f, ">>"),
            Token::EqEq => write!(f, "=="),
            Token::NotEq => write!(f, "!="),
            Token::Lt => write!(f, "<"),
            Token::Le => write!(f, "<="),
            Token::Gt => write!(f, ">"),
            Token::Ge => write!(f, ">="),
            Token::Equals => write!(f, "="),
            Token::PlusEq => write!(f, "+="),
            Token::MinusEq => write!(f, "-="),
            Token::StarEq => write!(f, "*="),
            Token::SlashEq => write!(f, "/="),
            Token::DoubleSlashEq => write!(f, "//="),
            Token::PercentEq => write!(f, "%="),
            Token::Arrow => write!(f, "->"),
            Token::Dot => write!(f, "."),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
            Token::Comma => write!(f, ","),
            Token::Colon => write!(f, ":"),
            Token::Semicolon => write!(f, ";"),
            Token::Indent => write!(f, "indent"),
            Token::Dedent => write!(f, "dedent"),
            Token::Eof => write!(f, "end of input"),
        }
    }
}

/// A token together with where it starts in the source
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub location: Location,
}

/// Lexer wrapper that turns physical lines into a logical token stream
pub struct Lexer<'source> {
    source: &'source str,
    line_starts: Vec<usize>,
}

impl<'source> Lexer<'source> {
    pub fn new(source: &'source str) -> Self {
        let mut line_starts = vec![0];
        line_starts.extend(source.match_indices('\n').map(|(i, _)| i + 1));
        Self { source, line_starts }
    }

    /// Translate a byte offset into a 1-based line and column
    pub fn location(&self, offset: usize) -> Location {
        let line = match self.line_starts.binary_search(&offset) {
            Ok(line) => line,
            Err(next) => next - 1,
        };
        Location::new(line + 1, offset - self.line_starts[line] + 1)
    }

    /// Indentation of the first line that carries code
    fn base_indent(&self) -> usize {
        self.source
            .lines()
            .find(|line| {
                let trimmed = line.trim_start();
                !trimmed.is_empty() && !trimmed.starts_with('#')
            })
            .map(|line| indent_width(&line[..line.len() - line.trim_start().len()]))
            .unwrap_or(0)
    }

    /// Tokenize the whole source, synthesizing layout tokens
    pub fn tokenize(&self) -> KernelResult<Vec<Spanned>> {
        let mut inner = Token::lexer(self.source);
        let mut tokens: Vec<Spanned> = Vec::new();
        let mut indents = vec![self.base_indent()];
        let mut depth = 0usize;
        let mut pending_indent: Option<(usize, Location)> = None;

        while let Some(result) = inner.next() {
            let location = self.location(inner.span().start);
            let token = result.map_err(|_| {
                KernelError::syntax(
                    location,
                    format!("unexpected character '{}'", inner.slice()),
                )
            })?;

            match token {
                Token::Newline(width) => {
                    if depth == 0 {
                        // Blank and comment-only lines collapse into the last break
                        pending_indent = Some((width, location));
                    }
                    continue;
                }
                Token::LParen | Token::LBracket => depth += 1,
                Token::RParen | Token::RBracket => depth = depth.saturating_sub(1),
                _ => {}
            }

            if let Some((width, at)) = pending_indent.take() {
                if !tokens.is_empty() {
                    self.close_line(&mut tokens, &mut indents, width, at)?;
                }
            }
            tokens.push(Spanned { token, location });
        }

        let end = self.location(self.source.len());
        if !tokens.is_empty() {
            let base = indents[0];
            self.close_line(&mut tokens, &mut indents, base, end)?;
        }
        tokens.push(Spanned { token: Token::Eof, location: end });
        Ok(tokens)
    }

    fn close_line(
        &self,
        tokens: &mut Vec<Spanned>,
        indents: &mut Vec<usize>,
        width: usize,
        location: Location,
    ) -> KernelResult<()> {
        tokens.push(Spanned { token: Token::Newline(width), location });

        let current = *indents.last().unwrap_or(&0);
        if width > current {
            indents.push(width);
            tokens.push(Spanned { token: Token::Indent, location });
        } else if width < current {
            while indents.len() > 1 && *indents.last().unwrap_or(&0) > width {
                indents.pop();
                tokens.push(Spanned { token: Token::Dedent, location });
            }
            if *indents.last().unwrap_or(&0) != width {
                return Err(KernelError::syntax(
                    location,
                    "unindent does not match any outer indentation level",
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        Lexer::new(source)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|s| s.token)
            .collect()
    }

    #[test]
    fn test_simple_tokens() {
        assert_eq!(
            kinds("x += a // 2 ** b"),
            vec![
                Token::Ident("x".to_string()),
                Token::PlusEq,
                Token::Ident("a".to_string()),
                Token::DoubleSlash,
                Token::Int(2),
                Token::DoubleStar,
                Token::Ident("b".to_string()),
                Token::Newline(0),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            kinds("1 2.5 1e3 .5"),
            vec![
                Token::Int(1),
                Token::Float(2.5),
                Token::Float(1000.0),
                Token::Float(0.5),
                Token::Newline(0),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_indentation() {
        let source = "def f(i: int):\n    x = 1\n\n    # note\n    if x:\n        x = 2\n    y = 3\n";
        let tokens = kinds(source);
        let indents = tokens.iter().filter(|t| **t == Token::Indent).count();
        let dedents = tokens.iter().filter(|t| **t == Token::Dedent).count();
        assert_eq!(indents, 2);
        assert_eq!(dedents, 2);
        assert_eq!(tokens.last(), Some(&Token::Eof));
    }

    #[test]
    fn test_blocks_close_at_end_of_input() {
        let tokens = kinds("def f(i: int):\n    if i:\n        x = 2");
        let indents = tokens.iter().filter(|t| **t == Token::Indent).count();
        let dedents = tokens.iter().filter(|t| **t == Token::Dedent).count();
        assert_eq!((indents, dedents), (2, 2));
        assert_eq!(tokens[tokens.len() - 2], Token::Dedent);
    }

    #[test]
    fn test_newlines_inside_brackets_are_ignored() {
        let tokens = kinds("f(a,\n      b)\n");
        assert!(!tokens.contains(&Token::Indent));
        assert_eq!(tokens.iter().filter(|t| matches!(t, Token::Newline(_))).count(), 1);
    }

    #[test]
    fn test_indented_source_block() {
        let source = "\n        def f(i):\n            pass\n        ";
        let tokens = kinds(source);
        assert_eq!(tokens[0], Token::Def);
        assert_eq!(tokens.iter().filter(|t| **t == Token::Indent).count(), 1);
        assert_eq!(tokens.iter().filter(|t| **t == Token::Dedent).count(), 1);
    }

    #[test]
    fn test_bad_dedent() {
        let source = "def f(i):\n        x = 1\n    y = 2\n";
        let err = Lexer::new(source).tokenize().unwrap_err();
        assert_eq!(err.location().map(|l| l.line), Some(2));
    }

    #[test]
    fn test_unexpected_character() {
        let err = Lexer::new("x = $").tokenize().unwrap_err();
        assert_eq!(err.location(), Some(Location::new(1, 5)));
    }
}
