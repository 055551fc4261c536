//! Process exit codes reported by a main instance.

use std::fmt;

/// Exit code of a finished (or never started) runtime environment.
///
/// Guest-provided codes pass through unchanged; the associated constants
/// name the codes the host itself produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExitCode(i32);

impl ExitCode {
    /// Normal completion.
    pub const NO_FAILURE: Self = Self(0);

    /// The guest trapped or ran out of fuel.
    pub const GENERIC_USER_ERROR: Self = Self(1);

    /// The environment could not be linked or instantiated.
    pub const BOOTSTRAP_FAILURE: Self = Self(10);

    /// The startup snapshot could not be used.
    pub const STARTUP_SNAPSHOT_FAILURE: Self = Self(14);

    /// Wrap a raw exit code.
    pub const fn new(code: i32) -> Self {
        Self(code)
    }

    /// The raw exit code.
    pub const fn code(self) -> i32 {
        self.0
    }

    /// Returns `true` for a zero exit code.
    pub const fn is_success(self) -> bool {
        self.0 == 0
    }
}

impl From<i32> for ExitCode {
    fn from(code: i32) -> Self {
        Self(code)
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code.0
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success() {
        assert!(ExitCode::NO_FAILURE.is_success());
        assert!(!ExitCode::BOOTSTRAP_FAILURE.is_success());
        assert!(!ExitCode::new(42).is_success());
    }

    #[test]
    fn test_conversions() {
        let code: ExitCode = 42.into();
        assert_eq!(code.code(), 42);
        assert_eq!(i32::from(ExitCode::BOOTSTRAP_FAILURE), 10);
        assert_eq!(ExitCode::new(-3).to_string(), "-3");
    }
}
