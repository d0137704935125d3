use thiserror::Error;

/// Errors that can occur during memory-related system calls.
#[derive(Error, Debug)]
pub enum MemcallError {
    /// The call failed for a reason not covered below.
    #[error("System operation failed: {0}")]
    SystemError(String),

    /// Invalid arguments were provided to the operation.
    #[error("Invalid arguments: {0}")]
    InvalidArgument(String),

    /// The requested operation is not supported on this platform.
    #[error("Operation not supported on this platform: {0}")]
    NotSupported(String),

    /// The process hit a resource limit, typically `RLIMIT_MEMLOCK`.
    #[error("Resource limit reached: {0}")]
    ResourceLimit(String),

    /// The process lacks the privilege for the operation.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
}

impl MemcallError {
    /// Classifies the current `errno` for an operation described by `context`.
    #[cfg(unix)]
    pub(crate) fn last_os_error(context: &str) -> Self {
        let err = std::io::Error::last_os_error();
        let message = format!("{context} [Err: {err}]");
        match err.raw_os_error() {
            Some(libc::EPERM) | Some(libc::EACCES) => MemcallError::PermissionDenied(message),
            Some(libc::ENOMEM) | Some(libc::EAGAIN) => MemcallError::ResourceLimit(message),
            Some(libc::EINVAL) => MemcallError::InvalidArgument(message),
            _ => MemcallError::SystemError(message),
        }
    }

    /// Whether the error means the environment refused to lock memory.
    pub fn is_lock_refusal(&self) -> bool {
        matches!(
            self,
            MemcallError::PermissionDenied(_)
                | MemcallError::ResourceLimit(_)
                | MemcallError::NotSupported(_)
        )
    }
}
