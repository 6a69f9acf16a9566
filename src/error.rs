use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Not enough resources: {0}")]
    Resource(String),

    #[error("Partition {partition} overflowed its planned size ({written} > {budget} bytes)")]
    PartitionOverflow {
        partition: usize,
        written: u64,
        budget: u64,
    },

    #[error("Malformed record in {path}: {reason}")]
    Codec { path: PathBuf, reason: String },

    #[error("Compaction invariant broken in partition {partition}: {reason}")]
    CompactionInvariant { partition: usize, reason: String },

    #[error("I/O failure on {path}: {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Configuration(String),
}

impl Error {
    pub fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Filesystem {
            path: path.into(),
            source,
        }
    }

    pub fn codec(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::Codec {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_the_offending_file() {
        let e = Error::codec("/tmp/p3.glue", "truncated header");
        assert!(e.to_string().contains("p3.glue"));
        assert!(e.to_string().contains("truncated header"));
    }
}
