//! Error type shared by every reader, writer and constructor in the crate.
//!
//! Load failures never hand back a partially built model: readers build into
//! locals and only assemble an `NgramModel` once every table parsed cleanly.
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

/// Errors raised while constructing, loading or writing language models.
#[derive(Debug)]
pub enum LmError {
    /// Underlying I/O failure (missing file, truncated read, short write).
    Io {
        path: Option<PathBuf>,
        source: io::Error,
    },
    /// Malformed model file: bad magic, missing markers, ordering violations,
    /// counts exceeded, offset overflow.
    Format {
        path: Option<PathBuf>,
        line: Option<usize>,
        message: String,
    },
    /// Log base must be strictly greater than 1.0.
    InvalidLogBase(f64),
    /// Log table entries may only be 1, 2 or 4 bytes wide.
    InvalidLogWidth(u8),
    /// The add table cannot be represented in the requested width.
    LogTableOverflow { base: f64, width: u8, shift: u32 },
    /// Operation not available for this model or format.
    Unsupported(String),
    /// Model set lookup by name failed.
    UnknownModel(String),
    /// Invalid configuration.
    Config(String),
}

pub type Result<T> = std::result::Result<T, LmError>;

impl LmError {
    pub fn format(message: impl Into<String>) -> Self {
        LmError::Format {
            path: None,
            line: None,
            message: message.into(),
        }
    }

    pub fn format_at(line: usize, message: impl Into<String>) -> Self {
        LmError::Format {
            path: None,
            line: Some(line),
            message: message.into(),
        }
    }

    /// Attach a file path to I/O and format errors that do not carry one yet.
    pub fn with_path(self, p: &Path) -> Self {
        match self {
            LmError::Io { path: None, source } => LmError::Io {
                path: Some(p.to_path_buf()),
                source,
            },
            LmError::Format {
                path: None,
                line,
                message,
            } => LmError::Format {
                path: Some(p.to_path_buf()),
                line,
                message,
            },
            other => other,
        }
    }

    /// True for errors caused by file content rather than by the environment.
    pub fn is_format(&self) -> bool {
        matches!(self, LmError::Format { .. })
    }
}

impl fmt::Display for LmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LmError::Io { path, source } => match path {
                Some(p) => write!(f, "I/O error on {}: {}", p.display(), source),
                None => write!(f, "I/O error: {}", source),
            },
            LmError::Format {
                path,
                line,
                message,
            } => {
                write!(f, "format error")?;
                if let Some(p) = path {
                    write!(f, " in {}", p.display())?;
                }
                if let Some(l) = line {
                    write!(f, " at line {}", l)?;
                }
                write!(f, ": {}", message)
            }
            LmError::InvalidLogBase(b) => write!(f, "log base must be > 1.0, got {}", b),
            LmError::InvalidLogWidth(w) => {
                write!(f, "log table width must be 1, 2 or 4 bytes, got {}", w)
            }
            LmError::LogTableOverflow { base, width, shift } => write!(
                f,
                "log-add table for base {} does not fit in {} bytes with shift {}",
                base, width, shift
            ),
            LmError::Unsupported(msg) => write!(f, "unsupported: {}", msg),
            LmError::UnknownModel(name) => write!(f, "no language model named '{}'", name),
            LmError::Config(msg) => write!(f, "configuration error: {}", msg),
        }
    }
}

impl std::error::Error for LmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LmError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<io::Error> for LmError {
    fn from(source: io::Error) -> Self {
        LmError::Io { path: None, source }
    }
}

impl From<toml::de::Error> for LmError {
    fn from(e: toml::de::Error) -> Self {
        LmError::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for LmError {
    fn from(e: toml::ser::Error) -> Self {
        LmError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_error_mentions_path_and_line() {
        let e = LmError::format_at(12, "bigrams not in unigram order")
            .with_path(Path::new("model.arpa"));
        let s = e.to_string();
        assert!(s.contains("model.arpa"));
        assert!(s.contains("line 12"));
        assert!(s.contains("bigrams not in unigram order"));
        assert!(e.is_format());
    }

    #[test]
    fn with_path_keeps_existing_path() {
        let e = LmError::Io {
            path: Some(PathBuf::from("a.dmp")),
            source: io::Error::new(io::ErrorKind::UnexpectedEof, "short"),
        }
        .with_path(Path::new("b.dmp"));
        assert!(e.to_string().contains("a.dmp"));
    }
}
