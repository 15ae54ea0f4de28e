//! Name sanitization for on-disk path segments.
//!
//! Library names become lowercase kebab slugs used as directory names;
//! usernames are validated but never transformed.

use crate::error::AppError;

/// Library display names: 1–50 characters before sanitization.
pub const MAX_NAME_LEN: usize = 50;

/// Usernames: 3–20 of `[A-Za-z0-9-]`.
pub const USERNAME_MIN: usize = 3;
pub const USERNAME_MAX: usize = 20;

/// Canonicalize a user-supplied name into a safe filesystem segment.
///
/// Lowercases, maps whitespace to `-`, strips everything outside `[a-z0-9-]`,
/// collapses runs of `-`, and trims leading/trailing `-`. Fails when the
/// input violates the length bounds or the result is empty.
pub fn sanitize(name: &str) -> Result<String, AppError> {
    if name.is_empty() || name.chars().count() > MAX_NAME_LEN {
        return Err(AppError::validation_field(
            "name",
            format!("must be 1-{MAX_NAME_LEN} characters"),
        ));
    }

    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_whitespace() {
            slug.push('-');
        } else if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
            slug.push(c);
        }
        // everything else is dropped
    }

    // collapse runs of '-'
    let mut collapsed = String::with_capacity(slug.len());
    let mut prev_dash = false;
    for c in slug.chars() {
        if c == '-' {
            if !prev_dash {
                collapsed.push('-');
            }
            prev_dash = true;
        } else {
            collapsed.push(c);
            prev_dash = false;
        }
    }
    let result = collapsed.trim_matches('-').to_string();

    if result.is_empty() {
        return Err(AppError::validation_field("name", "contains no usable characters"));
    }
    Ok(result)
}

/// Validate a username without transforming it.
pub fn validate_username(username: &str) -> Result<(), AppError> {
    let len = username.chars().count();
    if len < USERNAME_MIN || len > USERNAME_MAX {
        return Err(AppError::validation_field(
            "username",
            format!("must be {USERNAME_MIN}-{USERNAME_MAX} characters"),
        ));
    }
    if !username.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(AppError::validation_field(
            "username",
            "may only contain letters, digits, and '-'",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_and_kebabs() {
        assert_eq!(sanitize("My Notes").unwrap(), "my-notes");
        assert_eq!(sanitize("Reading  List").unwrap(), "reading-list");
    }

    #[test]
    fn strips_punctuation_and_collapses() {
        assert_eq!(sanitize("Hello, World!").unwrap(), "hello-world");
        assert_eq!(sanitize("a---b").unwrap(), "a-b");
        assert_eq!(sanitize("--edge--").unwrap(), "edge");
    }

    #[test]
    fn rejects_empty_results() {
        assert!(sanitize("").is_err());
        assert!(sanitize("!!!").is_err());
        assert!(sanitize("   ").is_err());
        assert!(sanitize(&"x".repeat(51)).is_err());
    }

    #[test]
    fn unicode_is_dropped_not_mangled() {
        assert_eq!(sanitize("café notes").unwrap(), "caf-notes");
    }

    #[test]
    fn username_bounds() {
        assert!(validate_username("alice").is_ok());
        assert!(validate_username("al").is_err());
        assert!(validate_username(&"a".repeat(21)).is_err());
        assert!(validate_username("bad space").is_err());
        assert!(validate_username("dot.name").is_err());
        assert!(validate_username("A-ok-123").is_ok());
    }
}
