//! Dot-delimited glob patterns shared by guards and event subscriptions.
//!
//! A pattern is a list of dot separated segments. `*` matches exactly one segment and `**`
//! matches one or more segments; any other segment must match literally. Wildcards cannot
//! be mixed with literal text inside a segment.

use std::cmp::Ordering;
use std::cmp::Reverse;
use std::fmt;

use displaydoc::Display;
use thiserror::Error;

/// Glob compilation error.
#[derive(Clone, Debug, Display, Error, PartialEq, Eq)]
pub enum GlobError {
    /// pattern is empty
    Empty,
    /// pattern '{pattern}' contains an empty segment
    EmptySegment { pattern: String },
    /// pattern '{pattern}' mixes wildcards and literal text in segment '{segment}'
    PartialWildcard { pattern: String, segment: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum Token {
    Literal(String),
    /// Exactly one segment.
    One,
    /// Zero or more segments. `**` compiles to `One` followed by `Rest`.
    Rest,
}

/// How specific a pattern is. Greater is more specific.
///
/// Ordered by the number of leading literal segments, then by fewer `**` wildcards, then by
/// fewer `*` wildcards, then by the total number of literal segments.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Specificity {
    literal_prefix: usize,
    multi_wildcards: Reverse<usize>,
    single_wildcards: Reverse<usize>,
    literals: usize,
}

/// A compiled glob pattern.
#[derive(Clone)]
pub struct Glob {
    source: String,
    tokens: Vec<Token>,
    specificity: Specificity,
}

impl Glob {
    pub fn new(pattern: &str) -> Result<Self, GlobError> {
        if pattern.is_empty() {
            return Err(GlobError::Empty);
        }

        let mut tokens = Vec::new();
        let mut literal_prefix = 0;
        let mut prefix_open = true;
        let mut multi = 0;
        let mut single = 0;
        let mut literals = 0;

        for segment in pattern.split('.') {
            match segment {
                "" => {
                    return Err(GlobError::EmptySegment {
                        pattern: pattern.to_string(),
                    });
                }
                "*" => {
                    prefix_open = false;
                    single += 1;
                    tokens.push(Token::One);
                }
                "**" => {
                    prefix_open = false;
                    multi += 1;
                    tokens.push(Token::One);
                    tokens.push(Token::Rest);
                }
                literal if literal.contains('*') || literal.contains('?') => {
                    return Err(GlobError::PartialWildcard {
                        pattern: pattern.to_string(),
                        segment: literal.to_string(),
                    });
                }
                literal => {
                    literals += 1;
                    if prefix_open {
                        literal_prefix += 1;
                    }
                    tokens.push(Token::Literal(literal.to_string()));
                }
            }
        }

        Ok(Self {
            source: pattern.to_string(),
            tokens,
            specificity: Specificity {
                literal_prefix,
                multi_wildcards: Reverse(multi),
                single_wildcards: Reverse(single),
                literals,
            },
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// True when the pattern has no wildcard at all.
    pub fn is_literal(&self) -> bool {
        self.tokens
            .iter()
            .all(|token| matches!(token, Token::Literal(_)))
    }

    pub fn matches(&self, name: &str) -> bool {
        let segments: Vec<&str> = name.split('.').collect();
        match_tokens(&self.tokens, &segments)
    }

    pub fn specificity(&self) -> Specificity {
        self.specificity
    }

    /// Compares specificity, see [`Specificity`].
    pub fn cmp_specificity(&self, other: &Glob) -> Ordering {
        self.specificity.cmp(&other.specificity)
    }

    /// True when at least one name is matched by both patterns.
    pub fn overlaps(&self, other: &Glob) -> bool {
        overlap(&self.tokens, &other.tokens)
    }
}

impl fmt::Debug for Glob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Glob").field(&self.source).finish()
    }
}

impl fmt::Display for Glob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl PartialEq for Glob {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for Glob {}

/// Matches `name` against `pattern`. Invalid patterns match nothing.
pub fn matches(name: &str, pattern: &str) -> bool {
    Glob::new(pattern)
        .map(|glob| glob.matches(name))
        .unwrap_or(false)
}

fn match_tokens(tokens: &[Token], segments: &[&str]) -> bool {
    match tokens.split_first() {
        None => segments.is_empty(),
        Some((Token::Rest, rest)) => {
            (0..=segments.len()).any(|skip| match_tokens(rest, &segments[skip..]))
        }
        Some((Token::One, rest)) => !segments.is_empty() && match_tokens(rest, &segments[1..]),
        Some((Token::Literal(literal), rest)) => {
            segments.first().is_some_and(|segment| segment == literal)
                && match_tokens(rest, &segments[1..])
        }
    }
}

fn overlap(left: &[Token], right: &[Token]) -> bool {
    match (left.first(), right.first()) {
        (None, None) => true,
        (Some(Token::Rest), _) => {
            overlap(&left[1..], right) || (!right.is_empty() && overlap(left, &right[1..]))
        }
        (_, Some(Token::Rest)) => {
            overlap(left, &right[1..]) || (!left.is_empty() && overlap(&left[1..], right))
        }
        (Some(l), Some(r)) => {
            let compatible = match (l, r) {
                (Token::Literal(l), Token::Literal(r)) => l == r,
                _ => true,
            };
            compatible && overlap(&left[1..], &right[1..])
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn glob(pattern: &str) -> Glob {
        Glob::new(pattern).unwrap()
    }

    #[test]
    fn matches_event_names() {
        for pattern in ["user.**", "user.created", "*.created", "**"] {
            assert!(matches("user.created", pattern), "{pattern}");
        }
        for pattern in ["user.updated", "order.created", "user", "user.*.x"] {
            assert!(!matches("user.created", pattern), "{pattern}");
        }
    }

    #[test]
    fn double_star_needs_at_least_one_segment() {
        assert!(!matches("user", "user.**"));
        assert!(matches("user.a.b.c", "user.**"));
        assert!(matches("a.x.y.b", "a.**.b"));
        assert!(!matches("a.b", "a.**.b"));
    }

    #[test]
    fn rejects_malformed_patterns() {
        assert_eq!(Glob::new("").unwrap_err(), GlobError::Empty);
        assert!(matches!(
            Glob::new("user..get"),
            Err(GlobError::EmptySegment { .. })
        ));
        assert!(matches!(
            Glob::new("user.get*"),
            Err(GlobError::PartialWildcard { .. })
        ));
        assert!(!matches("user.getx", "user.get*"));
    }

    #[test]
    fn longest_literal_prefix_is_most_specific() {
        let more_specific = [
            ("iam.user.get", "iam.user.*"),
            ("iam.user.*", "iam.**"),
            ("iam.*.get", "*.user.get"),
            ("user.*", "user.**"),
        ];
        for (left, right) in more_specific {
            assert_eq!(
                glob(left).cmp_specificity(&glob(right)),
                Ordering::Greater,
                "{left} vs {right}"
            );
        }
        assert_eq!(
            glob("*.a.*").cmp_specificity(&glob("*.*.b")),
            Ordering::Equal
        );
    }

    #[test]
    fn detects_overlapping_patterns() {
        assert!(glob("*.a.*").overlaps(&glob("*.*.b")));
        assert!(glob("iam.**").overlaps(&glob("*.user.get")));
        assert!(glob("a.**.z").overlaps(&glob("a.b.**")));
        assert!(!glob("iam.*").overlaps(&glob("billing.*")));
        assert!(!glob("a.*").overlaps(&glob("a.*.*")));
        assert!(!glob("a.**").overlaps(&glob("a")));
    }
}
