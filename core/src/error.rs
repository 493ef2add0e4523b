use std::{io, path::PathBuf};

use serde::{Deserialize, Serialize};

/// The toolchain could not turn a source file into an executable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Compile error ({}): {message}", .source_path.to_string_lossy())]
pub struct CompileError {
    pub message: String,
    pub source_path: PathBuf,
}

impl CompileError {
    pub fn new(message: impl Into<String>, source_path: impl Into<PathBuf>) -> Self {
        Self {
            message: message.into(),
            source_path: source_path.into(),
        }
    }
}

/// Something went wrong while driving a process, as opposed to the process
/// itself misbehaving (which is a verdict, not an error).
#[derive(Debug, thiserror::Error)]
#[error("{message} ({})", .artifact.to_string_lossy())]
pub struct RunError {
    pub message: String,
    pub artifact: PathBuf,
    #[source]
    pub source: Option<io::Error>,
}

impl RunError {
    pub fn new(message: impl Into<String>, artifact: impl Into<PathBuf>) -> Self {
        Self {
            message: message.into(),
            artifact: artifact.into(),
            source: None,
        }
    }

    pub fn io(message: impl Into<String>, artifact: impl Into<PathBuf>, e: io::Error) -> Self {
        Self {
            message: message.into(),
            artifact: artifact.into(),
            source: Some(e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GuardError {
    #[error("{what} is busy, try again after the current operation finishes")]
    Busy { what: String },
}

/// Last error recorded on a test case. Stored in a serializable form so that
/// it survives a save/load of the test set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CaseError {
    Compile { message: String, source_path: PathBuf },
    Run { message: String, artifact: PathBuf },
    Internal { message: String },
}

impl CaseError {
    pub fn internal(e: &anyhow::Error) -> Self {
        Self::Internal {
            message: format!("{:#}", e),
        }
    }
}

impl From<&CompileError> for CaseError {
    fn from(e: &CompileError) -> Self {
        Self::Compile {
            message: e.message.clone(),
            source_path: e.source_path.clone(),
        }
    }
}

impl From<&RunError> for CaseError {
    fn from(e: &RunError) -> Self {
        let message = match &e.source {
            Some(src) => format!("{}: {}", e.message, src),
            None => e.message.clone(),
        };
        Self::Run {
            message,
            artifact: e.artifact.clone(),
        }
    }
}

impl std::fmt::Display for CaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Compile {
                message,
                source_path,
            } => write!(
                f,
                "Compile error ({}): {}",
                source_path.to_string_lossy(),
                message
            ),
            Self::Run { message, artifact } => {
                write!(f, "{} ({})", message, artifact.to_string_lossy())
            }
            Self::Internal { message } => f.write_str(message),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn run_error_keeps_system_error_in_case_error() {
        let e = RunError::io(
            "Failed to spawn",
            "/tmp/a.out",
            io::Error::new(io::ErrorKind::NotFound, "no such file"),
        );
        let c = CaseError::from(&e);
        assert_eq!(
            c,
            CaseError::Run {
                message: "Failed to spawn: no such file".into(),
                artifact: "/tmp/a.out".into(),
            }
        );
        assert_eq!(c.to_string(), "Failed to spawn: no such file (/tmp/a.out)");
    }

    #[test]
    fn case_error_serializes_with_kind_tag() {
        let c = CaseError::from(&CompileError::new("boom", "main.cpp"));
        let json = serde_json::to_string(&c).unwrap();
        assert!(json.contains(r#""kind":"compile""#));
        let back: CaseError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, c);
    }
}
