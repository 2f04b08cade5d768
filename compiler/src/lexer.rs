// Lexer for Weft .weft source files.
//
// Uses the `logos` crate for DFA-based lexing. Identifiers and string
// literals carry their text so the parser never needs the source buffer.
//
// Preconditions: input is valid UTF-8.
// Postconditions: returns all tokens with byte-offset spans, plus any lex errors.
// Failure modes: unrecognized characters produce `LexError`; lexing continues.
// Side effects: none.

use logos::Logos;
use std::fmt;

/// Byte-offset span in source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

/// A lexer error with location.
#[derive(Debug, Clone, PartialEq)]
pub struct LexError {
    pub span: Span,
    pub message: String,
}

/// Result of lexing: tokens plus any errors (non-fatal).
#[derive(Debug)]
pub struct LexResult {
    pub tokens: Vec<(Token, Span)>,
    pub errors: Vec<LexError>,
}

/// Weft token types.
///
/// Keywords and symbols are matched as fixed strings. Base type names
/// (`int`, `file`, ...) are plain identifiers resolved by the registrar.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n\f]+")]
#[logos(skip r"//[^\n]*")]
#[logos(skip r"#[^\n]*")]
pub enum Token {
    // ── Keywords ──
    #[token("import")]
    Import,
    #[token("type")]
    Type,
    #[token("typedef")]
    Typedef,
    #[token("global")]
    Global,
    #[token("const")]
    Const,
    #[token("app")]
    App,
    #[token("if")]
    If,
    #[token("else")]
    Else,
    #[token("switch")]
    Switch,
    #[token("case")]
    Case,
    #[token("default")]
    Default,
    #[token("foreach")]
    Foreach,
    #[token("in")]
    In,
    #[token("for")]
    For,
    #[token("iterate")]
    Iterate,
    #[token("until")]
    Until,
    #[token("wait")]
    Wait,
    #[token("deep")]
    Deep,
    #[token("true")]
    True,
    #[token("false")]
    False,

    // ── Symbols ──
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(",")]
    Comma,
    #[token(";")]
    Semi,
    #[token(":")]
    Colon,
    #[token(":=")]
    ColonEq,
    #[token("...")]
    Ellipsis,
    #[token(".")]
    Dot,
    #[token("=>")]
    Chain,
    #[token("=")]
    Eq,
    #[token("@")]
    At,

    // ── Operators ──
    #[token("||")]
    OrOr,
    #[token("&&")]
    AndAnd,
    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("<=")]
    LtEq,
    #[token(">=")]
    GtEq,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("**")]
    StarStar,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%/")]
    PercentSlash,
    #[token("%%")]
    PercentPercent,
    #[token("!")]
    Bang,

    // ── Literals ──
    #[regex(r"[0-9]+\.[0-9]+([eE][+-]?[0-9]+)?", parse_float, priority = 3)]
    #[regex(r"[0-9]+[eE][+-]?[0-9]+", parse_float)]
    FloatLit(f64),

    #[regex(r"[0-9]+", parse_int, priority = 2)]
    IntLit(i64),

    #[regex(r#""([^"\\\n]|\\.)*""#, parse_string)]
    StringLit(String),

    // ── Identifiers ──
    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    /// Never produced: the callback skips the comment or fails.
    #[token("/*", block_comment)]
    BlockComment,
}

/// Consume up to and including the closing `*/`.
fn block_comment(lex: &mut logos::Lexer<'_, Token>) -> logos::FilterResult<(), ()> {
    match lex.remainder().find("*/") {
        Some(end) => {
            lex.bump(end + 2);
            logos::FilterResult::Skip
        }
        None => {
            lex.bump(lex.remainder().len());
            logos::FilterResult::Error(())
        }
    }
}

fn parse_float(lex: &mut logos::Lexer<'_, Token>) -> Option<f64> {
    lex.slice().parse().ok()
}

fn parse_int(lex: &mut logos::Lexer<'_, Token>) -> Option<i64> {
    lex.slice().parse().ok()
}

/// Strip quotes and process `\"`, `\\`, `\n`, `\t` escapes.
fn parse_string(lex: &mut logos::Lexer<'_, Token>) -> Option<String> {
    let slice = lex.slice();
    let inner = &slice[1..slice.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next()? {
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            '"' => out.push('"'),
            '\\' => out.push('\\'),
            _ => return None,
        }
    }
    Some(out)
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Import => write!(f, "import"),
            Token::Type => write!(f, "type"),
            Token::Typedef => write!(f, "typedef"),
            Token::Global => write!(f, "global"),
            Token::Const => write!(f, "const"),
            Token::App => write!(f, "app"),
            Token::If => write!(f, "if"),
            Token::Else => write!(f, "else"),
            Token::Switch => write!(f, "switch"),
            Token::Case => write!(f, "case"),
            Token::Default => write!(f, "default"),
            Token::Foreach => write!(f, "foreach"),
            Token::In => write!(f, "in"),
            Token::For => write!(f, "for"),
            Token::Iterate => write!(f, "iterate"),
            Token::Until => write!(f, "until"),
            Token::Wait => write!(f, "wait"),
            Token::Deep => write!(f, "deep"),
            Token::True => write!(f, "true"),
            Token::False => write!(f, "false"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LBrace => write!(f, "{{"),
            Token::RBrace => write!(f, "}}"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
            Token::Comma => write!(f, ","),
            Token::Semi => write!(f, ";"),
            Token::Colon => write!(f, ":"),
            Token::ColonEq => write!(f, ":="),
            Token::Ellipsis => write!(f, "..."),
            Token::Dot => write!(f, "."),
            Token::Chain => write!(f, "=>"),
            Token::Eq => write!(f, "="),
            Token::At => write!(f, "@"),
            Token::OrOr => write!(f, "||"),
            Token::AndAnd => write!(f, "&&"),
            Token::EqEq => write!(f, "=="),
            Token::NotEq => write!(f, "!="),
            Token::LtEq => write!(f, "<="),
            Token::GtEq => write!(f, ">="),
            Token::Lt => write!(f, "<"),
            Token::Gt => write!(f, ">"),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::StarStar => write!(f, "**"),
            Token::Star => write!(f, "*"),
            Token::Slash => write!(f, "/"),
            Token::PercentSlash => write!(f, "%/"),
            Token::PercentPercent => write!(f, "%%"),
            Token::Bang => write!(f, "!"),
            Token::FloatLit(v) => write!(f, "{}", v),
            Token::IntLit(v) => write!(f, "{}", v),
            Token::StringLit(s) => write!(f, "{:?}", s),
            Token::Ident(name) => write!(f, "{}", name),
            Token::BlockComment => write!(f, "/*"),
        }
    }
}

/// Lex a Weft source string into tokens with spans.
///
/// Returns all successfully lexed tokens and any errors encountered.
/// Lexing does not stop at the first error.
pub fn lex(source: &str) -> LexResult {
    let lexer = Token::lexer(source);
    let mut tokens = Vec::new();
    let mut errors = Vec::new();

    for (result, range) in lexer.spanned() {
        let span = Span {
            start: range.start,
            end: range.end,
        };
        match result {
            Ok(token) => tokens.push((token, span)),
            Err(()) => {
                let text = &source[span.start..span.end];
                let message = if text.starts_with("/*") {
                    "unterminated block comment".to_string()
                } else {
                    format!("unexpected character: {:?}", text)
                };
                errors.push(LexError { span, message });
            }
        }
    }

    LexResult { tokens, errors }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn lex_ok(source: &str) -> Vec<Token> {
        let result = lex(source);
        assert!(
            result.errors.is_empty(),
            "unexpected lex errors: {:?}",
            result.errors
        );
        result.tokens.into_iter().map(|(t, _)| t).collect()
    }

    fn ident(name: &str) -> Token {
        Token::Ident(name.to_string())
    }

    #[test]
    fn keywords_and_identifiers() {
        assert_eq!(
            lex_ok("foreach x in A"),
            vec![Token::Foreach, ident("x"), Token::In, ident("A")]
        );
        assert_eq!(lex_ok("iterate_count"), vec![ident("iterate_count")]);
    }

    #[test]
    fn multi_char_symbols() {
        assert_eq!(
            lex_ok("=> = == := ... . %/ %% ** *"),
            vec![
                Token::Chain,
                Token::Eq,
                Token::EqEq,
                Token::ColonEq,
                Token::Ellipsis,
                Token::Dot,
                Token::PercentSlash,
                Token::PercentPercent,
                Token::StarStar,
                Token::Star,
            ]
        );
    }

    #[test]
    fn numeric_literals() {
        assert_eq!(
            lex_ok("42 3.5 1e3"),
            vec![Token::IntLit(42), Token::FloatLit(3.5), Token::FloatLit(1000.0)]
        );
    }

    #[test]
    fn string_escapes() {
        assert_eq!(
            lex_ok(r#""a\"b\n""#),
            vec![Token::StringLit("a\"b\n".to_string())]
        );
    }

    #[test]
    fn comments_are_skipped() {
        let source = "x // line\n# hash\n/* block\n * more */ y";
        assert_eq!(lex_ok(source), vec![ident("x"), ident("y")]);
    }

    #[test]
    fn block_comment_forms() {
        for source in ["/* a */ x", "/* a * b */ x", "/** doc */ x", "/* a\n b */ x", "/**/ x"] {
            assert_eq!(lex_ok(source), vec![ident("x")], "{:?}", source);
        }
        assert_eq!(lex_ok("a /* x */ / b"), vec![ident("a"), Token::Slash, ident("b")]);
    }

    #[test]
    fn unterminated_block_comment() {
        let result = lex("x /* never closed");
        assert_eq!(result.tokens.len(), 1);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].message, "unterminated block comment");
        assert_eq!(result.errors[0].span, Span { start: 2, end: 17 });
    }

    #[test]
    fn spans_are_byte_offsets() {
        let result = lex("int  x;");
        let spans: Vec<(usize, usize)> =
            result.tokens.iter().map(|(_, s)| (s.start, s.end)).collect();
        assert_eq!(spans, vec![(0, 3), (5, 6), (6, 7)]);
    }

    #[test]
    fn bad_character_is_reported_and_lexing_continues() {
        let result = lex("x $ y");
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].span, Span { start: 2, end: 3 });
        assert_eq!(result.tokens.len(), 2);
    }
}
