//! Recursive-descent parser for the textual filter syntax.
//!
//! The grammar, with `\` escaping any single character:
//!
//! ```text
//! filter     := '(' expr ')'
//! expr       := '&' filter+ | '|' filter+ | '!' filter | comparison
//! comparison := key ('=' | '>' | '>=' | '<' | '<=') value
//! ```
//!
//! Equality values may contain `*` wildcards; a value that is exactly one
//! unescaped `*` is a presence test. Comparison values must spell a
//! 64-bit signed integer.

use super::{Filter, FilterError, GlobPattern, ValuePattern};

/// One lexed character of a key or value: a literal (possibly escaped)
/// character or an unescaped `*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    Literal(char),
    Wildcard,
}

pub(super) fn parse(text: &str) -> Result<Filter, FilterError> {
    let mut parser = Parser::new(text);
    let filter = parser.filter()?;
    parser.expect_end()?;
    Ok(filter)
}

struct Parser<'a> {
    input: &'a str,
    /// Byte offset of the next unread character.
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn error(&self, reason: &'static str) -> FilterError {
        FilterError::Syntax {
            offset: self.pos,
            reason,
        }
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn eat(&mut self, expected: char) -> Result<(), FilterError> {
        match self.peek() {
            Some(c) if c == expected => {
                self.bump();
                Ok(())
            },
            _ => Err(self.error(match expected {
                '(' => "expected '('",
                ')' => "expected ')'",
                _ => "unexpected character",
            })),
        }
    }

    fn expect_end(&self) -> Result<(), FilterError> {
        if self.pos == self.input.len() {
            Ok(())
        } else {
            Err(self.error("trailing characters after filter"))
        }
    }

    fn filter(&mut self) -> Result<Filter, FilterError> {
        self.eat('(')?;
        let node = match self.peek() {
            Some('&') => {
                self.bump();
                Filter::And(self.subfilters()?)
            },
            Some('|') => {
                self.bump();
                Filter::Or(self.subfilters()?)
            },
            Some('!') => {
                self.bump();
                Filter::Not(Box::new(self.filter()?))
            },
            _ => self.comparison()?,
        };
        self.eat(')')?;
        Ok(node)
    }

    /// One or more parenthesized subfilters, for `&` and `|`.
    fn subfilters(&mut self) -> Result<Vec<Filter>, FilterError> {
        let mut subs = Vec::new();
        while self.peek() == Some('(') {
            subs.push(self.filter()?);
        }
        if subs.is_empty() {
            return Err(self.error("composite filter needs at least one subfilter"));
        }
        Ok(subs)
    }

    fn comparison(&mut self) -> Result<Filter, FilterError> {
        let key = self.key()?;
        match self.bump() {
            Some('=') => self.equality(key),
            Some('>') => {
                let inclusive = self.eat_optional('=');
                let limit = self.int_value()?;
                Ok(if inclusive {
                    Filter::GreaterEq { key, limit }
                } else {
                    Filter::Greater { key, limit }
                })
            },
            Some('<') => {
                let inclusive = self.eat_optional('=');
                let limit = self.int_value()?;
                Ok(if inclusive {
                    Filter::LessEq { key, limit }
                } else {
                    Filter::Less { key, limit }
                })
            },
            _ => Err(self.error("expected '=', '<' or '>' after key")),
        }
    }

    fn eat_optional(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.bump();
            true
        } else {
            false
        }
    }

    /// Reads a key: literal characters up to the relational operator.
    fn key(&mut self) -> Result<String, FilterError> {
        let mut key = String::new();
        loop {
            match self.peek() {
                Some('=' | '<' | '>') => break,
                Some('(' | ')' | '*' | '&' | '|' | '!') | None => {
                    return Err(self.error("unexpected character in key"));
                },
                Some('\\') => key.push(self.escaped()?),
                Some(c) => {
                    self.bump();
                    key.push(c);
                },
            }
        }
        if key.is_empty() {
            return Err(self.error("empty key"));
        }
        Ok(key)
    }

    /// Reads an equality value up to the closing parenthesis and builds
    /// the matching leaf: presence for a lone `*`, a literal when no
    /// wildcard occurs, a glob otherwise.
    fn equality(&mut self, key: String) -> Result<Filter, FilterError> {
        let tokens = self.value_tokens()?;

        if tokens == [Token::Wildcard] {
            return Ok(Filter::Present { key });
        }
        if tokens.iter().all(|t| matches!(t, Token::Literal(_))) {
            let text = tokens
                .iter()
                .filter_map(|t| match t {
                    Token::Literal(c) => Some(*c),
                    Token::Wildcard => None,
                })
                .collect();
            return Ok(Filter::Equal {
                key,
                pattern: ValuePattern::literal(text),
            });
        }

        // Collapse the token stream into glob segments: literal runs
        // separated by one or more wildcards.
        let mut segments = Vec::new();
        let mut current = String::new();
        for token in &tokens {
            match token {
                Token::Literal(c) => current.push(*c),
                Token::Wildcard => {
                    if !current.is_empty() {
                        segments.push(std::mem::take(&mut current));
                    }
                },
            }
        }
        let anchored_start = matches!(tokens.first(), Some(Token::Literal(_)));
        let anchored_end = matches!(tokens.last(), Some(Token::Literal(_)));
        if !current.is_empty() {
            segments.push(current);
        }
        Ok(Filter::Equal {
            key,
            pattern: ValuePattern::Glob(GlobPattern::new(segments, anchored_start, anchored_end)),
        })
    }

    fn value_tokens(&mut self) -> Result<Vec<Token>, FilterError> {
        let mut tokens = Vec::new();
        loop {
            match self.peek() {
                Some(')') | None => break,
                Some('(') => return Err(self.error("unescaped '(' in value")),
                Some('*') => {
                    self.bump();
                    tokens.push(Token::Wildcard);
                },
                Some('\\') => tokens.push(Token::Literal(self.escaped()?)),
                Some(c) => {
                    self.bump();
                    tokens.push(Token::Literal(c));
                },
            }
        }
        Ok(tokens)
    }

    fn int_value(&mut self) -> Result<i64, FilterError> {
        let start = self.pos;
        let mut text = String::new();
        loop {
            match self.peek() {
                Some(')') | None => break,
                Some('\\') => {
                    text.push(self.escaped()?);
                },
                Some('*') => return Err(self.error("wildcard not allowed in integer comparison")),
                Some(c) => {
                    self.bump();
                    text.push(c);
                },
            }
        }
        text.parse().map_err(|_| FilterError::Syntax {
            offset: start,
            reason: "integer value expected",
        })
    }

    /// Consumes a backslash escape and returns the escaped character.
    fn escaped(&mut self) -> Result<char, FilterError> {
        let _ = self.bump(); // the backslash
        self.bump().ok_or_else(|| self.error("dangling escape"))
    }
}
