use crate::{Error, Result};
use std::path::PathBuf;

/// Environment variable overriding the kurtosis binary location
pub const KURTOSIS_BIN_ENV: &str = "KURTOSIS_BIN";

/// Specifies which kurtosis CLI binary drives the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KurtosisBinary {
    /// Use `kurtosis` from PATH
    Installed,

    /// Use binary at specific path
    Path(PathBuf),
}

impl Default for KurtosisBinary {
    fn default() -> Self {
        match std::env::var_os(KURTOSIS_BIN_ENV) {
            Some(path) if !path.is_empty() => Self::Path(PathBuf::from(path)),
            _ => Self::Installed,
        }
    }
}

impl KurtosisBinary {
    /// Resolve to actual binary path
    pub fn resolve(&self) -> Result<PathBuf> {
        match self {
            Self::Installed => which::which("kurtosis").map_err(|_| {
                Error::InvalidBinary(
                    "kurtosis binary not found in PATH. See https://docs.kurtosis.com/install"
                        .into(),
                )
            }),
            Self::Path(p) => {
                if !p.exists() {
                    return Err(Error::InvalidBinary(format!(
                        "Binary not found: {}",
                        p.display()
                    )));
                }
                Ok(p.clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_path_is_rejected() {
        let binary = KurtosisBinary::Path(PathBuf::from("/definitely/not/here/kurtosis"));
        assert!(matches!(binary.resolve(), Err(Error::InvalidBinary(_))));
    }

    #[test]
    fn test_existing_path_resolves() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let binary = KurtosisBinary::Path(file.path().to_path_buf());
        assert_eq!(binary.resolve().unwrap(), file.path());
    }
}
