//! Result type definition and extension traits.

use crate::error::Error;

/// The standard Result type for Conductor operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Extension trait for results produced on cleanup paths, where an error is
/// logged and the caller carries on.
pub trait ResultExt<T> {
    /// Convert to an Option, logging the error at `warn` with the given context.
    fn warn_on_err(self, context: &str) -> Option<T>;

    /// Inspect the error without consuming the Result.
    fn inspect_error<F: FnOnce(&Error)>(self, f: F) -> Self;
}

impl<T> ResultExt<T> for Result<T> {
    fn warn_on_err(self, context: &str) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(error = %e, kind = e.kind(), "{context}");
                None
            }
        }
    }

    fn inspect_error<F: FnOnce(&Error)>(self, f: F) -> Self {
        if let Err(ref e) = self {
            f(e);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warn_on_err_ok() {
        let result: Result<i32> = Ok(42);
        assert_eq!(result.warn_on_err("release"), Some(42));
    }

    #[test]
    fn test_warn_on_err_err() {
        let result: Result<i32> = Err(Error::not_found("universe", "u1"));
        assert_eq!(result.warn_on_err("release"), None);
    }

    #[test]
    fn test_inspect_error() {
        let mut seen = None;
        let result: Result<()> = Err(Error::cancelled("abort"));
        let _ = result.inspect_error(|e| seen = Some(e.kind()));
        assert_eq!(seen, Some("cancelled"));
    }
}
