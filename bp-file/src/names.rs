use std::path::{Path, PathBuf};

use crate::{DATA_FILE_PREFIX, INDEX_FILE_NAME, META_METADATA_FILE_NAME, METADATA_FILE_NAME};

/// File names of one dataset directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetPaths {
    root: PathBuf,
}

impl DatasetPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn index(&self) -> PathBuf {
        self.root.join(INDEX_FILE_NAME)
    }

    pub fn metadata(&self) -> PathBuf {
        self.root.join(METADATA_FILE_NAME)
    }

    pub fn meta_metadata(&self) -> PathBuf {
        self.root.join(META_METADATA_FILE_NAME)
    }

    pub fn data(&self, subfile: usize) -> PathBuf {
        self.root.join(format!("{DATA_FILE_PREFIX}{subfile}"))
    }

    /// The same dataset placed under a burst-buffer directory: `<burst>/<name>`.
    pub fn staged_under(&self, burst_buffer: &Path) -> Self {
        let name = self
            .root
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("dataset.bp"));
        Self::new(burst_buffer.join(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dataset_file_names() {
        let paths = DatasetPaths::new("/scratch/run/out.bp");
        assert_eq!(paths.index(), PathBuf::from("/scratch/run/out.bp/md.idx"));
        assert_eq!(paths.metadata(), PathBuf::from("/scratch/run/out.bp/md.0"));
        assert_eq!(paths.meta_metadata(), PathBuf::from("/scratch/run/out.bp/mmd.0"));
        assert_eq!(paths.data(3), PathBuf::from("/scratch/run/out.bp/data.3"));
        assert_eq!(
            paths.staged_under(Path::new("/local/bb")).data(0),
            PathBuf::from("/local/bb/out.bp/data.0")
        );
    }
}
