use std::path::PathBuf;

/// One source → destination transfer.
///
/// Identity is the pair; two tasks for the same file from different URLs
/// are distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DownloadTask {
    pub source: String,
    pub destination: PathBuf,
}

impl DownloadTask {
    pub fn new(source: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
        }
    }
}
