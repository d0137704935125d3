use std::path::PathBuf;
use thiserror::Error;

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;

/// Errors surfaced by the command-line front end
#[derive(Error, Debug)]
pub enum CliError {
    /// Failure reported by the key lifecycle
    #[error(transparent)]
    Custody(#[from] keycustody::Error),

    /// Input and output name the same file
    #[error("input and output are the same file: {}", .0.display())]
    SamePath(PathBuf),

    /// A file could not be opened, read, or written
    #[error("{action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CliError {
    pub(crate) fn io(action: &'static str, path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io {
            action,
            path,
            source,
        }
    }

    /// Process exit status for this error. Each failure class has its own code.
    pub fn exit_code(&self) -> u8 {
        use keycustody::Error;

        match self {
            Self::Custody(e) => match e {
                Error::VersionMismatch { .. } => 10,
                Error::PoolAllocation(_) => 11,
                Error::Generation(_) => 12,
                Error::InvalidKeySize { .. } => 13,
                Error::Cipher(_) => 14,
                Error::LifecycleViolation { .. } => 15,
                Error::Config(_) => 16,
                Error::KeyNotFound(_) => 18,
                Error::KeyBorrowed { .. } => 19,
            },
            Self::Io { .. } => 17,
            Self::SamePath(_) => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keycustody::{Error, LifecycleState};
    use std::io;

    #[test]
    fn test_exit_codes_are_distinct() {
        let errors = [
            CliError::from(Error::Generation("x".into())),
            CliError::from(Error::InvalidKeySize {
                expected: 32,
                actual: 3,
            }),
            CliError::from(Error::Cipher("x".into())),
            CliError::from(Error::LifecycleViolation {
                operation: "generate",
                state: LifecycleState::Terminated,
            }),
            CliError::from(Error::Config("x".into())),
            CliError::io("read", "/nonexistent")(io::Error::new(io::ErrorKind::NotFound, "gone")),
            CliError::from(Error::KeyBorrowed {
                operation: "shutdown",
            }),
            CliError::SamePath("/tmp/data".into()),
        ];
        let mut codes: Vec<u8> = errors.iter().map(CliError::exit_code).collect();
        assert_eq!(codes, vec![12, 13, 14, 15, 16, 17, 19, 2]);
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), 8);
    }

    #[test]
    fn test_io_error_names_path() {
        let err = CliError::io("open", "/tmp/key.bin")(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert_eq!(err.to_string(), "open /tmp/key.bin: gone");
    }
}
