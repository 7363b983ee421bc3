use std::fmt;

use smol_str::SmolStr;

/// Option tag for reliable provisional responses (RFC 3262).
pub const EXTENSION_100REL: &str = "100rel";

/// Comma-separated token list used by Require, Supported, and Unsupported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenList {
    tokens: Vec<SmolStr>,
}

impl TokenList {
    /// Parses a comma-separated token list, dropping empty segments.
    pub fn parse(value: &str) -> Self {
        Self {
            tokens: value
                .split(',')
                .map(|t| t.trim())
                .filter(|t| !t.is_empty())
                .map(SmolStr::new)
                .collect(),
        }
    }

    /// Returns the tokens in received order.
    pub fn tokens(&self) -> &[SmolStr] {
        &self.tokens
    }

    /// Case-insensitive membership test.
    pub fn contains(&self, token: &str) -> bool {
        self.tokens.iter().any(|t| t.eq_ignore_ascii_case(token))
    }

    /// Returns true when no tokens are present.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl fmt::Display for TokenList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, token) in self.tokens.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            f.write_str(token)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_finds_tokens() {
        let list = TokenList::parse("100rel, timer, replaces");
        assert_eq!(list.tokens().len(), 3);
        assert!(list.contains("100REL"));
        assert!(!list.contains("gruu"));
    }

    #[test]
    fn empty_segments_dropped() {
        let list = TokenList::parse(" , 100rel,,");
        assert_eq!(list.tokens().len(), 1);
        assert!(list.contains(EXTENSION_100REL));
    }
}
