use thiserror::Error;

/// Shared lightweight error type for core primitive operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A service or characteristic identifier could not be parsed.
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
}

#[cfg(test)]
mod tests {
    use super::CoreError;

    #[test]
    fn error_messages_are_stable() {
        assert_eq!(
            CoreError::InvalidIdentifier("zz".into()).to_string(),
            "invalid identifier: zz"
        );
    }
}
