//! Folder-name grammar: the one gate every ingress point (webhook
//! registration, IPC `register_group`, CLI `repos register`) must pass
//! before a string is ever used as a filesystem path component.

use thiserror::Error;

const MAX_LEN: usize = 128;
const RESERVED_NAMES: &[&str] = &["global"];

/// The folder name reserved for the main/home group — never mounted
/// read-only, always present, always authorized.
pub const MAIN_GROUP_FOLDER: &str = "main";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FolderError {
    #[error("folder name must not be empty")]
    Empty,
    #[error("folder name '{0}' exceeds {MAX_LEN} characters")]
    TooLong(String),
    #[error("folder name '{0}' contains a disallowed character (only alphanumerics, '_', '.', '-' are allowed, and it must start with an alphanumeric)")]
    InvalidCharacters(String),
    #[error("folder name '{0}' is a reserved name")]
    Reserved(String),
}

/// Validates a folder name against the strict grammar: alphanumeric
/// start, then alphanumeric/`_`/`.`/`-`, length 1..=128, no path
/// separators (implied by the allowed character set), no `..`, and no
/// reserved name.
pub fn validate_folder_name(name: &str) -> Result<(), FolderError> {
    if name.is_empty() {
        return Err(FolderError::Empty);
    }
    if name.len() > MAX_LEN {
        return Err(FolderError::TooLong(name.to_string()));
    }

    let mut chars = name.chars();
    let first = chars.next().expect("checked non-empty above");
    if !first.is_ascii_alphanumeric() {
        return Err(FolderError::InvalidCharacters(name.to_string()));
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')) {
        return Err(FolderError::InvalidCharacters(name.to_string()));
    }
    if name.contains("..") {
        return Err(FolderError::InvalidCharacters(name.to_string()));
    }

    if RESERVED_NAMES.iter().any(|reserved| *reserved == name) {
        return Err(FolderError::Reserved(name.to_string()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_simple_names() {
        assert!(validate_folder_name("acme-widgets").is_ok());
        assert!(validate_folder_name("widgets_2").is_ok());
        assert!(validate_folder_name("a").is_ok());
        assert!(validate_folder_name(MAIN_GROUP_FOLDER).is_ok());
    }

    #[test]
    fn rejects_empty() {
        assert_eq!(validate_folder_name(""), Err(FolderError::Empty));
    }

    #[test]
    fn rejects_path_separators() {
        assert!(matches!(
            validate_folder_name("a/b"),
            Err(FolderError::InvalidCharacters(_))
        ));
        assert!(matches!(
            validate_folder_name("a\\b"),
            Err(FolderError::InvalidCharacters(_))
        ));
    }

    #[test]
    fn rejects_parent_traversal() {
        assert!(matches!(
            validate_folder_name("..").unwrap_err(),
            FolderError::InvalidCharacters(_)
        ));
        assert!(matches!(
            validate_folder_name("a..b"),
            Err(FolderError::InvalidCharacters(_))
        ));
    }

    #[test]
    fn rejects_leading_non_alphanumeric() {
        assert!(matches!(
            validate_folder_name("-widgets"),
            Err(FolderError::InvalidCharacters(_))
        ));
        assert!(matches!(
            validate_folder_name(".widgets"),
            Err(FolderError::InvalidCharacters(_))
        ));
    }

    #[test]
    fn rejects_reserved_name() {
        assert_eq!(
            validate_folder_name("global"),
            Err(FolderError::Reserved("global".to_string()))
        );
    }

    #[test]
    fn rejects_too_long() {
        let name = "a".repeat(129);
        assert!(matches!(
            validate_folder_name(&name),
            Err(FolderError::TooLong(_))
        ));
        let name = "a".repeat(128);
        assert!(validate_folder_name(&name).is_ok());
    }
}
