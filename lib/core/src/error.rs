//! Error handling foundation for runwright.
//!
//! This module provides only the `Result` type alias using rootcause.
//! Each crate defines its own domain-specific error enums in its own
//! error module; process-level code wraps them in a `Report` as they
//! propagate up to bootstrap.

use rootcause::Report;

/// A Result type alias using rootcause's Report for error handling.
pub type Result<T, C = ()> = std::result::Result<T, Report<C>>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[derive(Debug)]
    struct StartupFailed;

    impl fmt::Display for StartupFailed {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("startup failed")
        }
    }

    impl std::error::Error for StartupFailed {}

    fn boot(fail: bool) -> Result<u8, StartupFailed> {
        if fail {
            Err(StartupFailed)?;
        }
        Ok(1)
    }

    #[test]
    fn typed_errors_propagate_into_reports() {
        assert_eq!(boot(false).expect("should boot"), 1);
        let report = boot(true).expect_err("should fail");
        assert!(report.to_string().contains("startup failed"));
    }
}
