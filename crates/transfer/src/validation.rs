use crate::TransferError;

/// Longest object key both providers accept, in bytes.
pub const MAX_KEY_LEN: usize = 1024;

/// Validates an object key before it is put on the wire.
///
/// Rejects:
/// - Empty keys
/// - Keys longer than [`MAX_KEY_LEN`] bytes of UTF-8
/// - Keys starting with `/` (the path separator belongs to the URL)
/// - Control characters
pub fn validate_object_key(key: &str) -> Result<(), TransferError> {
    if key.is_empty() {
        return Err(TransferError::InvalidKey("empty key".into()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(TransferError::InvalidKey(format!(
            "key is {} bytes, limit is {MAX_KEY_LEN}",
            key.len()
        )));
    }
    if key.starts_with('/') {
        return Err(TransferError::InvalidKey(format!(
            "leading slash not allowed: {key}"
        )));
    }
    if key.chars().any(char::is_control) {
        return Err(TransferError::InvalidKey(format!(
            "control character in key: {key:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_key() {
        assert!(validate_object_key("").is_err());
    }

    #[test]
    fn rejects_leading_slash() {
        assert!(validate_object_key("/photos/a.jpg").is_err());
    }

    #[test]
    fn rejects_control_characters() {
        assert!(validate_object_key("a\nb").is_err());
        assert!(validate_object_key("tab\there").is_err());
        assert!(validate_object_key("nul\0").is_err());
    }

    #[test]
    fn length_limit_counts_bytes() {
        assert!(validate_object_key(&"a".repeat(MAX_KEY_LEN)).is_ok());
        assert!(validate_object_key(&"a".repeat(MAX_KEY_LEN + 1)).is_err());
        // 2 bytes per char.
        assert!(validate_object_key(&"é".repeat(MAX_KEY_LEN / 2 + 1)).is_err());
    }

    #[test]
    fn accepts_normal_keys() {
        assert!(validate_object_key("file.txt").is_ok());
        assert!(validate_object_key("dir/sub dir/photo (1).jpg").is_ok());
        assert!(validate_object_key("unicode/日本語.txt").is_ok());
        assert!(validate_object_key("trailing/").is_ok());
    }

    #[test]
    fn error_names_the_problem() {
        let err = validate_object_key("/x").unwrap_err();
        assert!(err.to_string().contains("leading slash"));
    }
}
