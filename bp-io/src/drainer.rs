use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bp_error::{BpResult, bp_err};
use bytes::Bytes;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::DEFAULT_COPY_CHUNK_SIZE;

/// One unit of work for the drainer thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOperation {
    /// Create (or truncate) the target file.
    Create { to: PathBuf },
    /// Open the target file for appending without truncating it.
    Open { to: PathBuf },
    /// Move the target's append position to its current end.
    SeekEnd { to: PathBuf },
    /// Copy `count` bytes from `from` at `from_offset` to `to` at `to_offset`.
    CopyAt {
        from: PathBuf,
        from_offset: u64,
        to: PathBuf,
        to_offset: u64,
        count: u64,
    },
    /// Copy `count` bytes from `from` at `from_offset`, appending them to `to`.
    Copy {
        from: PathBuf,
        from_offset: u64,
        to: PathBuf,
        count: u64,
    },
    /// Write `data` to `to` at `offset`.
    WriteAt { to: PathBuf, offset: u64, data: Bytes },
    /// Append `data` to `to`.
    Write { to: PathBuf, data: Bytes },
    /// Remove a file.
    Delete { path: PathBuf },
}

#[derive(Debug, Clone)]
pub struct DrainerOptions {
    chunk_size: usize,
    poll_interval: Duration,
}

impl Default for DrainerOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_COPY_CHUNK_SIZE,
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl DrainerOptions {
    /// Size of the scratch buffer copies go through.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// How long the thread sleeps when it finds the queue empty.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// What the drainer thread did over its lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub operations: u64,
    pub bytes_copied: u64,
    pub errors: u64,
}

/// A background thread that replays file operations queued by the foreground.
///
/// The writer pushes operations after each local write and carries on; the only blocking
/// call is [`FileDrainer::join`]. Failures inside the thread are logged and counted in
/// [`DrainStats`], there is no caller left to return them to.
///
/// The queue and the finish flag live behind separate mutexes and no code path holds both.
pub struct FileDrainer {
    /// Unbounded, so queueing never blocks the foreground. Its peak size is the data of the
    /// steps written between two `join`s, already held by the writer as copied payload.
    queue: Arc<Mutex<VecDeque<DrainOperation>>>,
    finish: Arc<Mutex<bool>>,
    handle: Option<JoinHandle<DrainStats>>,
    stats: Option<DrainStats>,
}

impl FileDrainer {
    pub fn start(options: DrainerOptions) -> BpResult<Self> {
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        let finish = Arc::new(Mutex::new(false));

        let handle = {
            let queue = queue.clone();
            let finish = finish.clone();
            std::thread::Builder::new()
                .name("bp-drainer".to_string())
                .spawn(move || DrainWorker::new(options).run(&queue, &finish))
                .map_err(|e| bp_err!("failed to spawn drainer thread: {e}"))?
        };

        Ok(Self {
            queue,
            finish,
            handle: Some(handle),
            stats: None,
        })
    }

    pub fn push(&self, operation: DrainOperation) {
        self.queue.lock().push_back(operation);
    }

    pub fn add_create(&self, to: impl Into<PathBuf>) {
        self.push(DrainOperation::Create { to: to.into() });
    }

    pub fn add_copy_at(
        &self,
        from: impl Into<PathBuf>,
        from_offset: u64,
        to: impl Into<PathBuf>,
        to_offset: u64,
        count: u64,
    ) {
        self.push(DrainOperation::CopyAt {
            from: from.into(),
            from_offset,
            to: to.into(),
            to_offset,
            count,
        });
    }

    pub fn add_write_at(&self, to: impl Into<PathBuf>, offset: u64, data: Bytes) {
        self.push(DrainOperation::WriteAt {
            to: to.into(),
            offset,
            data,
        });
    }

    /// Number of operations not yet picked up by the thread.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Ask the thread to finish once the queue is empty and wait for it to exit.
    pub fn join(&mut self) -> DrainStats {
        *self.finish.lock() = true;
        if let Some(handle) = self.handle.take() {
            let stats = handle.join().unwrap_or_else(|_| {
                log::error!("drainer thread panicked");
                DrainStats::default()
            });
            self.stats = Some(stats);
        }
        self.stats.clone().unwrap_or_default()
    }
}

impl Drop for FileDrainer {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.join();
        }
    }
}

struct OutputFile {
    file: File,
    position: u64,
}

struct DrainWorker {
    options: DrainerOptions,
    outputs: FxHashMap<PathBuf, OutputFile>,
    inputs: FxHashMap<PathBuf, File>,
    scratch: Vec<u8>,
    stats: DrainStats,
}

impl DrainWorker {
    fn new(options: DrainerOptions) -> Self {
        let scratch = vec![0; options.chunk_size];
        Self {
            options,
            outputs: FxHashMap::default(),
            inputs: FxHashMap::default(),
            scratch,
            stats: DrainStats::default(),
        }
    }

    fn run(
        mut self,
        queue: &Mutex<VecDeque<DrainOperation>>,
        finish: &Mutex<bool>,
    ) -> DrainStats {
        loop {
            let next = queue.lock().pop_front();
            match next {
                Some(operation) => {
                    self.stats.operations += 1;
                    if let Err(e) = self.execute(&operation) {
                        self.stats.errors += 1;
                        log::error!("drainer failed on {operation:?}: {e}");
                    }
                }
                None => {
                    let finished = *finish.lock();
                    // An operation may have been queued between the empty check and
                    // reading the flag.
                    if finished && queue.lock().is_empty() {
                        break;
                    }
                    if !finished {
                        std::thread::sleep(self.options.poll_interval);
                    }
                }
            }
        }
        self.close_all();
        log::debug!(
            "drainer finished after {} operations, {} bytes copied, {} errors",
            self.stats.operations,
            self.stats.bytes_copied,
            self.stats.errors
        );
        self.stats
    }

    fn execute(&mut self, operation: &DrainOperation) -> io::Result<()> {
        match operation {
            DrainOperation::Create { to } => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(to)?;
                self.outputs.insert(to.clone(), OutputFile { file, position: 0 });
                Ok(())
            }
            DrainOperation::Open { to } => {
                self.output(to)?;
                Ok(())
            }
            DrainOperation::SeekEnd { to } => {
                let output = self.output(to)?;
                output.position = output.file.metadata()?.len();
                Ok(())
            }
            DrainOperation::CopyAt {
                from,
                from_offset,
                to,
                to_offset,
                count,
            } => self.copy(from, *from_offset, to, Some(*to_offset), *count),
            DrainOperation::Copy {
                from,
                from_offset,
                to,
                count,
            } => self.copy(from, *from_offset, to, None, *count),
            DrainOperation::WriteAt { to, offset, data } => {
                let output = self.output(to)?;
                output.file.write_all_at(data, *offset)?;
                output.position = offset + data.len() as u64;
                Ok(())
            }
            DrainOperation::Write { to, data } => {
                let output = self.output(to)?;
                output.file.write_all_at(data, output.position)?;
                output.position += data.len() as u64;
                Ok(())
            }
            DrainOperation::Delete { path } => {
                self.outputs.remove(path);
                self.inputs.remove(path);
                std::fs::remove_file(path)
            }
        }
    }

    fn output(&mut self, to: &Path) -> io::Result<&mut OutputFile> {
        if !self.outputs.contains_key(to) {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(to)?;
            let position = file.metadata()?.len();
            self.outputs.insert(to.to_path_buf(), OutputFile { file, position });
        }
        self.outputs
            .get_mut(to)
            .ok_or_else(|| io::Error::other("output vanished from descriptor map"))
    }

    fn input(&mut self, from: &Path) -> io::Result<File> {
        if let Some(file) = self.inputs.get(from) {
            return file.try_clone();
        }
        let file = File::open(from)?;
        let clone = file.try_clone()?;
        self.inputs.insert(from.to_path_buf(), file);
        Ok(clone)
    }

    fn copy(
        &mut self,
        from: &Path,
        from_offset: u64,
        to: &Path,
        to_offset: Option<u64>,
        count: u64,
    ) -> io::Result<()> {
        let input = self.input(from)?;
        let mut scratch = std::mem::take(&mut self.scratch);
        let result = (|| {
            let output = self.output(to)?;
            let mut dst = to_offset.unwrap_or(output.position);
            let mut src = from_offset;
            let mut remaining = count;
            while remaining > 0 {
                let chunk = usize::try_from(remaining)
                    .unwrap_or(usize::MAX)
                    .min(scratch.len());
                let n = read_retrying(&input, &mut scratch[..chunk], src)?;
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!(
                            "{} ended at offset {src} with {remaining} bytes left to copy",
                            from.display()
                        ),
                    ));
                }
                output.file.write_all_at(&scratch[..n], dst)?;
                src += n as u64;
                dst += n as u64;
                remaining -= n as u64;
            }
            output.position = dst;
            Ok(())
        })();
        self.scratch = scratch;
        if result.is_ok() {
            self.stats.bytes_copied += count;
        }
        result
    }

    fn close_all(&mut self) {
        for (path, output) in self.outputs.drain() {
            if let Err(e) = output.file.sync_data() {
                log::error!("drainer failed to sync {}: {e}", path.display());
            }
        }
        self.inputs.clear();
    }
}

fn read_retrying(file: &File, buf: &mut [u8], pos: u64) -> io::Result<usize> {
    loop {
        match file.read_at(buf, pos) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::Duration;

    use bytes::Bytes;
    use rstest::rstest;

    use crate::{DrainOperation, DrainerOptions, FileDrainer};

    fn options() -> DrainerOptions {
        DrainerOptions::default()
            .with_chunk_size(7)
            .with_poll_interval(Duration::from_millis(1))
    }

    #[rstest]
    #[case(1)]
    #[case(7)]
    #[case(4096)]
    fn copies_segments_in_chunks(#[case] chunk_size: usize) {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("local.0");
        let remote = dir.path().join("remote.0");
        let payload: Vec<u8> = (0..100u8).collect();
        fs::write(&local, &payload).unwrap();

        let mut drainer = FileDrainer::start(options().with_chunk_size(chunk_size)).unwrap();
        drainer.add_create(&remote);
        drainer.add_copy_at(&local, 50, &remote, 50, 50);
        drainer.add_copy_at(&local, 0, &remote, 0, 50);
        let stats = drainer.join();

        assert_eq!(stats.errors, 0);
        assert_eq!(stats.bytes_copied, 100);
        assert_eq!(fs::read(&remote).unwrap(), payload);
    }

    #[test]
    fn appends_and_writes_at() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("local");
        let remote = dir.path().join("remote");
        fs::write(&local, b"abcdef").unwrap();

        let mut drainer = FileDrainer::start(options()).unwrap();
        drainer.add_create(&remote);
        drainer.push(DrainOperation::Copy {
            from: local.clone(),
            from_offset: 0,
            to: remote.clone(),
            count: 3,
        });
        drainer.push(DrainOperation::Write {
            to: remote.clone(),
            data: Bytes::from_static(b"XYZ"),
        });
        drainer.add_write_at(&remote, 0, Bytes::from_static(b"_"));
        drainer.join();

        assert_eq!(fs::read(&remote).unwrap(), b"_bcXYZ");
    }

    #[test]
    fn errors_are_counted_not_propagated() {
        let dir = tempfile::tempdir().unwrap();
        let mut drainer = FileDrainer::start(options()).unwrap();
        drainer.add_copy_at(dir.path().join("missing"), 0, dir.path().join("out"), 0, 10);
        drainer.add_write_at(dir.path().join("out2"), 0, Bytes::from_static(b"ok"));
        let stats = drainer.join();
        assert_eq!(stats.operations, 2);
        assert_eq!(stats.errors, 1);
        assert_eq!(fs::read(dir.path().join("out2")).unwrap(), b"ok");
    }

    #[test]
    fn join_is_idempotent() {
        let mut drainer = FileDrainer::start(options()).unwrap();
        assert_eq!(drainer.join(), drainer.join());
        assert_eq!(drainer.pending(), 0);
    }
}
