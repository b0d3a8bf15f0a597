//! Username format validation.
//!
//! Rules (spec.md §3): non-empty, ≤50 chars, starts with a letter,
//! lowercase-alphanumeric only, not `server`, not a reserved keyword.
//! Validation is total and deterministic — no I/O, no registry lookup.

use crate::error::UsernameError;

const MAX_LEN: usize = 50;

/// Reserved keywords a username may never equal.
///
/// The distilled spec only says "a fixed reserved-keyword set"; the original
/// implementation enumerates Python's own keyword list, so this Rust port
/// keeps the same literal set rather than inventing a new one.
const RESERVED_KEYWORDS: &[&str] = &[
    "none", "true", "false", "and", "or", "not", "if", "else", "elif", "while", "for", "in",
    "def", "class", "import", "from", "as", "return", "break", "continue",
];

/// Validates a username against every format rule, returning the first
/// violation found. Does not check registry membership or block status —
/// those are the server's concern, not the format's.
pub fn validate(username: &str) -> Result<(), UsernameError> {
    if username.is_empty() {
        return Err(UsernameError::Empty);
    }
    if username.len() > MAX_LEN {
        return Err(UsernameError::TooLong);
    }
    let first = username.chars().next().expect("checked non-empty above");
    if !first.is_ascii_alphabetic() {
        return Err(UsernameError::NotAlphaStart);
    }
    let lower_alnum = username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() && !c.is_ascii_uppercase());
    if !lower_alnum {
        return Err(UsernameError::NotLowerAlphanumeric);
    }
    if username == "server" {
        return Err(UsernameError::ReservedServer);
    }
    if RESERVED_KEYWORDS.contains(&username) {
        return Err(UsernameError::ReservedKeyword);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_lowercase_name() {
        assert!(validate("alice").is_ok());
        assert!(validate("bob2").is_ok());
    }

    #[test]
    fn rejects_empty() {
        assert_eq!(validate(""), Err(UsernameError::Empty));
    }

    #[test]
    fn rejects_too_long() {
        let name = "a".repeat(51);
        assert_eq!(validate(&name), Err(UsernameError::TooLong));
    }

    #[test]
    fn rejects_leading_digit() {
        assert_eq!(validate("1alice"), Err(UsernameError::NotAlphaStart));
    }

    #[test]
    fn rejects_uppercase() {
        assert_eq!(
            validate("Alice"),
            Err(UsernameError::NotLowerAlphanumeric)
        );
    }

    #[test]
    fn rejects_non_alphanumeric() {
        assert_eq!(
            validate("alice_bob"),
            Err(UsernameError::NotLowerAlphanumeric)
        );
    }

    #[test]
    fn rejects_server_literal() {
        assert_eq!(validate("server"), Err(UsernameError::ReservedServer));
    }

    #[test]
    fn rejects_reserved_keyword() {
        assert_eq!(validate("import"), Err(UsernameError::ReservedKeyword));
        assert_eq!(validate("class"), Err(UsernameError::ReservedKeyword));
    }

    #[test]
    fn rejects_exactly_fifty_plus_one() {
        assert!(validate(&"a".repeat(50)).is_ok());
        assert!(validate(&"a".repeat(51)).is_err());
    }
}
