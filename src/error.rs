//! Error types for the kernel compiler

use thiserror::Error;

/// Result type for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

/// Position in a kernel's source text (1-based)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Location {
    pub line: usize,
    pub column: usize,
}

impl Location {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Broad classification of a [`KernelError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Translation,
    Compilation,
    Resource,
    Precondition,
    Type,
    Execution,
    Io,
}

/// Kernel errors
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("Syntax error at {location}: {message}")]
    Syntax { location: Location, message: String },

    #[error("Translation error at {location}: {message}")]
    Translation { location: Location, message: String },

    #[error("Compilation of kernel '{kernel}' failed: {diagnostic}")]
    Compilation {
        kernel: String,
        source_code: String,
        diagnostic: String,
    },

    #[error("Resource error: {message}")]
    Resource { message: String },

    #[error("Precondition violated: {message}")]
    Precondition { message: String },

    #[error("Type error: {message}")]
    Type { message: String },

    #[error("Execution error: {message}")]
    Execution { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl KernelError {
    pub fn syntax(location: Location, msg: impl Into<String>) -> Self {
        KernelError::Syntax { location, message: msg.into() }
    }

    pub fn translation(location: Location, msg: impl Into<String>) -> Self {
        KernelError::Translation { location, message: msg.into() }
    }

    pub fn compilation(
        kernel: impl Into<String>,
        source_code: impl Into<String>,
        diagnostic: impl Into<String>,
    ) -> Self {
        KernelError::Compilation {
            kernel: kernel.into(),
            source_code: source_code.into(),
            diagnostic: diagnostic.into(),
        }
    }

    pub fn resource(msg: impl Into<String>) -> Self {
        KernelError::Resource { message: msg.into() }
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        KernelError::Precondition { message: msg.into() }
    }

    pub fn type_error(msg: impl Into<String>) -> Self {
        KernelError::Type { message: msg.into() }
    }

    pub fn execution(msg: impl Into<String>) -> Self {
        KernelError::Execution { message: msg.into() }
    }

    /// Syntax errors are reported as translation failures: both happen
    /// before any compilation attempt.
    pub fn kind(&self) -> ErrorKind {
        match self {
            KernelError::Syntax { .. } | KernelError::Translation { .. } => ErrorKind::Translation,
            KernelError::Compilation { .. } => ErrorKind::Compilation,
            KernelError::Resource { .. } => ErrorKind::Resource,
            KernelError::Precondition { .. } => ErrorKind::Precondition,
            KernelError::Type { .. } => ErrorKind::Type,
            KernelError::Execution { .. } => ErrorKind::Execution,
            KernelError::Io(_) | KernelError::Json(_) => ErrorKind::Io,
        }
    }

    /// Source location for errors raised while reading kernel source
    pub fn location(&self) -> Option<Location> {
        match self {
            KernelError::Syntax { location, .. } | KernelError::Translation { location, .. } => {
                Some(*location)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        let err = KernelError::syntax(Location::new(3, 4), "unexpected token");
        assert_eq!(err.kind(), ErrorKind::Translation);
        assert_eq!(err.location(), Some(Location::new(3, 4)));
        assert_eq!(err.to_string(), "Syntax error at 3:4: unexpected token");

        let err = KernelError::compilation("k", "int main() {}", "boom");
        assert_eq!(err.kind(), ErrorKind::Compilation);
        assert!(err.location().is_none());
    }
}
