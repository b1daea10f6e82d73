//! Exit codes for the `tq` CLI.
//!
//! Exit code ranges:
//! - 0-1: Operational outcomes
//! - 10-19: User/environment errors (recoverable by user action)
//! - 20-29: Environment failures outside the user's control

/// Exit codes for `tq` commands. Stable contract for scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Success.
    Clean = 0,

    /// Command ran but left work behind (e.g. drain stopped on a failure).
    Partial = 1,

    /// Invalid arguments.
    ArgsError = 10,

    /// Config file missing required shape or failing validation.
    ConfigError = 11,

    /// Persisted store unreadable or unwritable.
    StorageError = 12,

    /// Filesystem or runtime failure outside the queue.
    IoError = 20,
}

impl ExitCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn is_success(self) -> bool {
        self == ExitCode::Clean
    }

    pub fn is_user_error(self) -> bool {
        (10..20).contains(&self.as_i32())
    }

    pub fn is_error(self) -> bool {
        self.as_i32() >= 10
    }

    /// Error code name for JSON output.
    pub fn code_name(&self) -> &'static str {
        match self {
            ExitCode::Clean => "OK",
            ExitCode::Partial => "OK_PARTIAL",
            ExitCode::ArgsError => "ERR_ARGS",
            ExitCode::ConfigError => "ERR_CONFIG",
            ExitCode::StorageError => "ERR_STORAGE",
            ExitCode::IoError => "ERR_IO",
        }
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code.as_i32()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranges() {
        assert!(ExitCode::Clean.is_success());
        assert!(!ExitCode::Partial.is_error());
        assert!(ExitCode::ConfigError.is_user_error());
        assert!(ExitCode::IoError.is_error());
        assert!(!ExitCode::IoError.is_user_error());
        assert_eq!(i32::from(ExitCode::StorageError), 12);
    }
}
