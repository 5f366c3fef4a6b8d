use thiserror::Error;

#[derive(Error, Debug)]
pub enum BlockCacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("File already exists: {0}")]
    FileAlreadyExists(String),

    #[error("Read past EOF: {name} (position {position}, length {length})")]
    ReadPastEof {
        name: String,
        position: u64,
        length: u64,
    },

    #[error("Not supported: {0}")]
    Unsupported(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Lock already held: {0}")]
    LockHeld(String),

    #[error("Storage is closed: {0}")]
    Closed(String),
}

impl BlockCacheError {
    /// True for errors caused by a file that does not exist (any more)
    pub fn is_not_found(&self) -> bool {
        match self {
            BlockCacheError::FileNotFound(_) => true,
            BlockCacheError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, BlockCacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_detection() {
        assert!(BlockCacheError::FileNotFound("a".into()).is_not_found());
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(BlockCacheError::from(io).is_not_found());
        assert!(!BlockCacheError::Unsupported("x".into()).is_not_found());
    }

    #[test]
    fn test_display() {
        let err = BlockCacheError::ReadPastEof {
            name: "_0.fdt".into(),
            position: 10,
            length: 5,
        };
        assert_eq!(
            err.to_string(),
            "Read past EOF: _0.fdt (position 10, length 5)"
        );
    }
}
