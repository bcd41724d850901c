use std::path::{Path, PathBuf};

use bp_error::{BpResult, WithContext};
use bp_io::{BpWrite, FileDrainer, FileTransport};

use crate::names::DatasetPaths;

/// Where a writer's files go: straight into the dataset, or into a burst-buffer copy that a
/// drainer mirrors to the dataset.
#[derive(Debug, Clone)]
pub(crate) struct Placement {
    target: DatasetPaths,
    staged: Option<DatasetPaths>,
    drain: bool,
}

impl Placement {
    pub(crate) fn new(target: DatasetPaths, burst_buffer: Option<&Path>, drain: bool) -> Self {
        let staged = burst_buffer.map(|bb| target.staged_under(bb));
        Self {
            target,
            staged,
            drain,
        }
    }

    pub(crate) fn target(&self) -> &DatasetPaths {
        &self.target
    }

    pub(crate) fn is_staged(&self) -> bool {
        self.staged.is_some()
    }

    /// Whether writes must be mirrored by a drainer.
    pub(crate) fn needs_drainer(&self) -> bool {
        self.staged.is_some() && self.drain
    }

    pub(crate) fn create_dirs(&self) -> BpResult<()> {
        for root in std::iter::once(&self.target).chain(&self.staged) {
            std::fs::create_dir_all(root.root())
                .map_err(bp_error::BpError::from)
                .with_context(|| format!("failed to create {}", root.root().display()))?;
        }
        Ok(())
    }

    fn local(&self, file: impl Fn(&DatasetPaths) -> PathBuf) -> (PathBuf, Option<PathBuf>) {
        match &self.staged {
            Some(staged) => (file(staged), self.drain.then(|| file(&self.target))),
            None => (file(&self.target), None),
        }
    }

    /// Create (truncating) the file named by `file`. With a drained burst buffer the target
    /// is created empty right away so every rank's drainer can copy into it.
    pub(crate) fn create(&self, file: impl Fn(&DatasetPaths) -> PathBuf) -> BpResult<Output> {
        let (local, target) = self.local(file);
        if let Some(target) = &target {
            FileTransport::create(target)
                .map_err(bp_error::BpError::from)
                .with_context(|| format!("failed to create {}", target.display()))?;
        }
        let transport = FileTransport::create(&local)
            .map_err(bp_error::BpError::from)
            .with_context(|| format!("failed to create {}", local.display()))?;
        Ok(Output { transport, target })
    }

    /// Open a file another rank created, without truncating it.
    pub(crate) fn open(&self, file: impl Fn(&DatasetPaths) -> PathBuf) -> BpResult<Output> {
        let (local, target) = self.local(file);
        let transport = FileTransport::open_write(&local)
            .map_err(bp_error::BpError::from)
            .with_context(|| format!("failed to open {}", local.display()))?;
        Ok(Output { transport, target })
    }
}

/// One file a writer appends to.
#[derive(Debug, Clone)]
pub(crate) struct Output {
    transport: FileTransport,
    /// Final location the drainer copies writes to.
    target: Option<PathBuf>,
}

impl Output {
    pub(crate) fn write_at(
        &self,
        data: &[u8],
        pos: u64,
        drainer: Option<&FileDrainer>,
    ) -> BpResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.transport
            .write_all_at(data, pos)
            .map_err(bp_error::BpError::from)
            .with_context(|| {
                format!(
                    "failed to write {} bytes at {pos} to {}",
                    data.len(),
                    self.transport.path().display()
                )
            })?;
        if let (Some(target), Some(drainer)) = (&self.target, drainer) {
            drainer.add_copy_at(self.transport.to_path_buf(), pos, target.clone(), pos, data.len() as u64);
        }
        Ok(())
    }

    pub(crate) fn flush(&self) -> BpResult<()> {
        Ok(self.transport.flush()?)
    }
}
