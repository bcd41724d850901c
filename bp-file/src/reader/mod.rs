//! The selective reader.
//!
//! [`BpReader`] opens a dataset that may still be written. In [`ReadMode::Streaming`] steps
//! are consumed in order with [`BpReader::begin_step`] and only the current step's metadata
//! is held; in [`ReadMode::RandomAccess`] every complete step is installed at open and read
//! with [`BpReader::get_at_step`].
//!
//! Gets are deferred. [`BpReader::get`] plans the byte ranges of a selection right away, and
//! [`BpReader::perform_gets`] fetches every pending plan at once so reads of one subfile can
//! be coalesced.

mod engine;

use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bp_comm::CommRef;
use bp_error::{BpResult, WithContext, bp_bail, bp_err};
use bp_io::{BpReadAt, FileTransport, TransportMan};
pub use engine::*;
use rustc_hash::FxHashMap;
use witchcraft_metrics::MetricRegistry;

use crate::collective::from_root;
use crate::deserializer::{BlockInfo, StepVariables, VarInfo};
use crate::dtype::{DataType, NativeType};
use crate::executor::{ReadExecutor, ReaderMetrics};
use crate::header::IndexHeader;
use crate::index::{MetadataIndex, TailPolicy};
use crate::metadata::{MetaMetadataTable, split_combined_metadata};
use crate::names::DatasetPaths;
use crate::operator::OperatorRegistry;
use crate::params::{BpOpenOptions, BpParams, ReadMode};
use crate::plan::{PlannedGet, StepContext, group_by_subfile, plan_get};
use crate::schema::AttributeValue;
use crate::selection::Selection;
use crate::{DATA_FILE_PREFIX, INDEX_HEADER_SIZE};

/// A get that has been performed but not taken yet.
#[derive(Debug)]
struct Completed {
    dtype: DataType,
    data: Vec<u8>,
}

/// What a poll of the index found, identical on every rank.
#[derive(Debug, Clone, Copy)]
struct IndexPoll {
    new_steps: usize,
    writer_active: bool,
    expired: bool,
}

/// Reads one dataset, optionally while it is being written.
pub struct BpReader {
    comm: CommRef,
    params: BpParams,
    mode: ReadMode,
    paths: DatasetPaths,
    registry: Arc<OperatorRegistry>,
    index: MetadataIndex,
    formats: MetaMetadataTable,
    index_file: FileTransport,
    metadata_file: FileTransport,
    meta_metadata_file: FileTransport,
    transports: TransportMan<FileTransport>,
    metric_registry: MetricRegistry,
    metrics: ReaderMetrics,
    attributes: BTreeMap<String, AttributeValue>,
    installed: BTreeMap<usize, StepVariables>,
    current: Option<usize>,
    next_step: usize,
    writer_active: bool,
    pending: Vec<(GetHandle, PlannedGet)>,
    completed: FxHashMap<GetHandle, Completed>,
    next_handle: usize,
    closed: bool,
}

impl BpReader {
    /// Open the dataset at `path`, waiting up to the open timeout for its index to appear.
    /// Collective on `comm`.
    pub fn open(
        path: impl AsRef<Path>,
        comm: CommRef,
        options: BpOpenOptions,
        registry: Arc<OperatorRegistry>,
    ) -> BpResult<Self> {
        let BpOpenOptions { params, mode } = options;
        params.validate()?;
        let paths = DatasetPaths::new(path.as_ref());

        let timeout = params.open_timeout();
        let poll = params.poll_interval(timeout);
        let [index_len] = from_root(&comm, &format!("open {}", paths.root().display()), || {
            wait_for_index(&paths, timeout, poll)
        })?;

        let index_file = open_file(&paths.index())?;
        let metadata_file = open_file(&paths.metadata())?;
        let meta_metadata_file = open_file(&paths.meta_metadata())?;

        let mut index = match mode {
            ReadMode::Streaming => MetadataIndex::new(TailPolicy::Retry)
                .with_metadata_budget(params.max_metadata_in_memory),
            ReadMode::RandomAccess => MetadataIndex::new(TailPolicy::Truncate),
        };
        let prefix = index_file.read_byte_range(0..index_len)?;
        if !index.parse_index_header(&prefix)? {
            bp_bail!(
                IncompatibleFormat: "index of {} is {index_len} bytes, too short for its header",
                paths.root().display()
            );
        }
        let writer_active = index.header()?.writer_active;
        if mode == ReadMode::RandomAccess {
            index.parse_step_records(&prefix, 0, false)?;
        }

        let data_root = paths.clone();
        let transports = TransportMan::new(
            move |subfile| FileTransport::open(data_root.data(subfile)),
            |subfile| format!("{DATA_FILE_PREFIX}{subfile}"),
        )
        .with_max_open(params.max_open_files_at_once);

        let metric_registry = MetricRegistry::default();
        let metrics = ReaderMetrics::new(&metric_registry);

        let mut reader = Self {
            comm,
            params,
            mode,
            paths,
            registry,
            index,
            formats: MetaMetadataTable::default(),
            index_file,
            metadata_file,
            meta_metadata_file,
            transports,
            metric_registry,
            metrics,
            attributes: BTreeMap::new(),
            installed: BTreeMap::new(),
            current: None,
            next_step: 0,
            writer_active,
            pending: Vec::new(),
            completed: FxHashMap::default(),
            next_handle: 0,
            closed: false,
        };

        if mode == ReadMode::RandomAccess {
            reader.refresh_formats()?;
            for step in 0..reader.index.steps().len() {
                let variables = reader.install_step(step)?;
                reader.installed.insert(step, variables);
            }
        }

        if reader.comm.rank() == 0 {
            let header = reader.index.header()?;
            log::info!(
                "opened {} for {:?} reading: {} writers, {} subfiles, {} steps, writer {}",
                reader.paths.root().display(),
                mode,
                header.writer_count,
                header.aggregator_count,
                reader.index.steps().len(),
                if writer_active { "active" } else { "closed" }
            );
        }
        Ok(reader)
    }

    fn check_open(&self) -> BpResult<()> {
        if self.closed {
            bp_bail!(InvalidArgument: "reader for {} is closed", self.paths.root().display());
        }
        Ok(())
    }

    pub fn paths(&self) -> &DatasetPaths {
        &self.paths
    }

    pub fn mode(&self) -> ReadMode {
        self.mode
    }

    /// Number of complete steps found so far.
    pub fn steps(&self) -> usize {
        self.index.steps().len()
    }

    /// The step opened by [`BpReader::begin_step`], if any.
    pub fn current_step(&self) -> Option<usize> {
        self.current
    }

    /// Subfile each writer rank wrote to.
    pub fn writer_map(&self) -> &[usize] {
        self.index.writer_map()
    }

    pub fn is_writer_active(&self) -> bool {
        self.writer_active
    }

    pub fn metrics(&self) -> &ReaderMetrics {
        &self.metrics
    }

    pub fn metric_registry(&self) -> &MetricRegistry {
        &self.metric_registry
    }

    /// Number of subfiles currently held open.
    pub fn open_subfiles(&self) -> usize {
        self.transports.open_count()
    }

    /// Attributes of every step installed so far; a later step's value replaces an earlier one.
    pub fn attributes(&self) -> &BTreeMap<String, AttributeValue> {
        &self.attributes
    }

    /// Wait up to `timeout` for the next step and make it current. Collective.
    pub fn begin_step(&mut self, timeout: Duration) -> BpResult<StepStatus> {
        self.check_open()?;
        if self.mode == ReadMode::RandomAccess {
            bp_bail!(InvalidArgument: "begin_step on a reader opened for random access");
        }
        if let Some(step) = self.current {
            bp_bail!(InvalidArgument: "begin_step called twice, step {step} is still open");
        }

        let deadline = Instant::now().checked_add(timeout);
        let poll = self.params.poll_interval(timeout);
        loop {
            if self.next_step < self.index.steps().len() {
                let step = self.next_step;
                self.refresh_formats()?;
                let variables = self.install_step(step)?;
                self.installed.clear();
                self.installed.insert(step, variables);
                self.current = Some(step);
                log::debug!("began step {step} of {}", self.paths.root().display());
                return Ok(StepStatus::Ok);
            }

            let found = self.poll_index(deadline)?;
            if found.new_steps > 0 {
                continue;
            }
            if !found.writer_active {
                return Ok(StepStatus::EndOfStream);
            }
            if found.expired {
                return Ok(StepStatus::NotReady);
            }
            std::thread::sleep(poll);
        }
    }

    /// Perform the pending gets of the current step and release it.
    pub fn end_step(&mut self) -> BpResult<()> {
        self.check_open()?;
        if self.mode == ReadMode::RandomAccess {
            bp_bail!(InvalidArgument: "end_step on a reader opened for random access");
        }
        let step = self
            .current
            .take()
            .ok_or_else(|| bp_err!(InvalidArgument: "end_step without begin_step"))?;
        if !self.pending.is_empty() {
            self.perform_gets()?;
        }
        self.installed.remove(&step);
        self.next_step = step + 1;
        Ok(())
    }

    /// Re-read the index and agree with the other ranks on what it holds. The writer-active
    /// flag is read before the records, so a closed writer with no new records is final.
    fn poll_index(&mut self, deadline: Option<Instant>) -> BpResult<IndexPoll> {
        let index_file = &self.index_file;
        let [index_len, writer_active, expired] =
            from_root(&self.comm, "poll the dataset index", || {
                let header = index_file.read_byte_range(0..INDEX_HEADER_SIZE as u64)?;
                let active = IndexHeader::is_writer_active(&header)?;
                let len = index_file.size()?;
                let expired = deadline.is_some_and(|deadline| Instant::now() >= deadline);
                Ok(Some([len, u64::from(active), u64::from(expired)]))
            })?;

        let cursor = self.index.cursor();
        let new_steps = if index_len > cursor {
            let records = self.index_file.read_byte_range(cursor..index_len)?;
            self.index.parse_step_records(&records, cursor, false)?
        } else {
            0
        };
        self.writer_active = writer_active != 0;
        Ok(IndexPoll {
            new_steps,
            writer_active: self.writer_active,
            expired: expired != 0,
        })
    }

    /// Install format descriptors appended to `mmd.0` since the last call.
    fn refresh_formats(&mut self) -> BpResult<()> {
        let consumed = self.formats.consumed();
        let len = self.meta_metadata_file.size()?;
        if len > consumed {
            let bytes = self.meta_metadata_file.read_byte_range(consumed..len)?;
            let endianness = self.index.header()?.endianness;
            let installed = self.formats.install(&bytes, endianness)?;
            log::debug!("installed {installed} format descriptors");
        }
        Ok(())
    }

    fn install_step(&mut self, step: usize) -> BpResult<StepVariables> {
        let record = self.index.step(step)?;
        let header = self.index.header()?;
        let block = self
            .metadata_file
            .read_byte_range(record.metadata_pos..record.metadata_pos + record.metadata_size)
            .map_err(bp_error::BpError::from)
            .with_context(|| format!("failed to read the metadata of step {step}"))?;
        let writers = split_combined_metadata(&block, header.writer_count as usize, header.endianness)?;
        StepVariables::install(
            step,
            &writers,
            &self.formats,
            header.column_major,
            &mut self.attributes,
        )
    }

    fn step_variables(&self, step: usize) -> BpResult<&StepVariables> {
        self.installed.get(&step).ok_or_else(|| match self.mode {
            ReadMode::Streaming => bp_err!(
                InvalidArgument: "step {step} is not the current step of a streaming reader"
            ),
            ReadMode::RandomAccess => bp_err!(OutOfBounds: step, 0, self.index.steps().len()),
        })
    }

    fn current_or_fail(&self) -> BpResult<usize> {
        match (self.mode, self.current) {
            (ReadMode::Streaming, Some(step)) => Ok(step),
            (ReadMode::Streaming, None) => Err(bp_err!(InvalidArgument: "no step is open")),
            (ReadMode::RandomAccess, _) => Err(bp_err!(
                InvalidArgument: "a random-access reader has no current step, name the step"
            )),
        }
    }

    /// Variables of the current step.
    pub fn variables(&self) -> BpResult<Vec<&VarInfo>> {
        self.variables_at(self.current_or_fail()?)
    }

    pub fn variables_at(&self, step: usize) -> BpResult<Vec<&VarInfo>> {
        self.check_open()?;
        Ok(self.step_variables(step)?.variables().collect())
    }

    pub fn inquire_variable(&self, name: &str) -> BpResult<&VarInfo> {
        self.inquire_variable_at(name, self.current_or_fail()?)
    }

    pub fn inquire_variable_at(&self, name: &str, step: usize) -> BpResult<&VarInfo> {
        self.check_open()?;
        self.step_variables(step)?.variable(name)
    }

    /// Every block written for `name` at the current step, ordered by writer.
    pub fn blocks_info(&self, name: &str) -> BpResult<&[BlockInfo]> {
        Ok(&self.inquire_variable(name)?.blocks)
    }

    pub fn blocks_info_at(&self, name: &str, step: usize) -> BpResult<&[BlockInfo]> {
        Ok(&self.inquire_variable_at(name, step)?.blocks)
    }

    /// Queue a read at the current step of a streaming reader.
    pub fn get(&mut self, variable: &str, selection: Selection) -> BpResult<GetHandle> {
        let step = self.current_or_fail()?;
        self.get_at_step(variable, selection, step)
    }

    /// Queue a read at `step`. A streaming reader only accepts its current step.
    pub fn get_at_step(
        &mut self,
        variable: &str,
        selection: Selection,
        step: usize,
    ) -> BpResult<GetHandle> {
        self.check_open()?;
        let swap_bytes = !self.index.header()?.endianness.is_native();
        let ctx = StepContext {
            step,
            variables: self.step_variables(step)?,
            record: self.index.step(step)?,
            index: &self.index,
            swap_bytes,
        };
        let plan = plan_get(self.pending.len(), variable, &selection, ctx)?;
        let handle = GetHandle(self.next_handle);
        self.next_handle += 1;
        self.pending.push((handle, plan));
        Ok(handle)
    }

    /// Fetch every pending get.
    pub fn perform_gets(&mut self) -> BpResult<()> {
        self.check_open()?;
        if self.pending.is_empty() {
            bp_bail!(InvalidArgument: "perform_gets with no pending get");
        }
        let (handles, plans): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending).into_iter().unzip();
        let map = group_by_subfile(&plans);
        let mut dests: Vec<Vec<u8>> = plans.iter().map(|plan| vec![0u8; plan.dest_len()]).collect();

        ReadExecutor::new(
            &self.transports,
            &self.registry,
            &self.metrics,
            self.params.read_coalescing_window,
        )
        .execute(&map, &mut dests)?;

        log::debug!(
            "performed {} gets over {} subfiles",
            plans.len(),
            self.transports.open_count()
        );
        for ((handle, plan), data) in handles.into_iter().zip(plans).zip(dests) {
            self.completed.insert(
                handle,
                Completed {
                    dtype: plan.dtype,
                    data,
                },
            );
        }
        Ok(())
    }

    /// The values of a performed get, in row-major order of its selection.
    pub fn take<T: NativeType>(&mut self, handle: GetHandle) -> BpResult<Vec<T>> {
        let completed = self.completed.remove(&handle).ok_or_else(|| {
            bp_err!(InvalidArgument: "get {} was not performed or was already taken", handle.0)
        })?;
        if completed.dtype != T::DTYPE {
            let dtype = completed.dtype;
            self.completed.insert(handle, completed);
            bp_bail!(InvalidArgument: "get {} holds {dtype}, not {}", handle.0, T::DTYPE);
        }
        Ok(T::from_bytes(&completed.data))
    }

    /// Get, perform and take in one call. Other pending gets are performed too.
    pub fn get_sync<T: NativeType>(
        &mut self,
        variable: &str,
        selection: Selection,
        step: usize,
    ) -> BpResult<Vec<T>> {
        let handle = self.get_at_step(variable, selection, step)?;
        self.perform_gets()?;
        self.take(handle)
    }

    /// Release the subfiles and every buffered result.
    pub fn close(&mut self) -> BpResult<()> {
        if self.closed {
            return Ok(());
        }
        if !self.pending.is_empty() {
            log::warn!(
                "closing {} with {} gets never performed",
                self.paths.root().display(),
                self.pending.len()
            );
        }
        self.pending.clear();
        self.completed.clear();
        self.installed.clear();
        self.current = None;
        self.transports.close_all();
        self.closed = true;
        log::info!(
            "closed {}: {} requests, {} reads, {} bytes",
            self.paths.root().display(),
            self.metrics.requests(),
            self.metrics.reads(),
            self.metrics.bytes()
        );
        Ok(())
    }
}

impl ReadEngine for BpReader {
    fn begin_step(&mut self, timeout: Duration) -> BpResult<StepStatus> {
        BpReader::begin_step(self, timeout)
    }

    fn end_step(&mut self) -> BpResult<()> {
        BpReader::end_step(self)
    }

    fn get(&mut self, variable: &str, selection: Selection) -> BpResult<GetHandle> {
        BpReader::get(self, variable, selection)
    }

    fn perform_gets(&mut self) -> BpResult<()> {
        BpReader::perform_gets(self)
    }

    fn close(&mut self) -> BpResult<()> {
        BpReader::close(self)
    }
}

fn open_file(path: &Path) -> BpResult<FileTransport> {
    FileTransport::open(path)
        .map_err(bp_error::BpError::from)
        .with_context(|| format!("failed to open {}", path.display()))
}

/// Poll until the index, metadata and meta-metadata files exist and the index holds its
/// header and writer map. Returns the index length, or `None` on timeout.
fn wait_for_index(
    paths: &DatasetPaths,
    timeout: Duration,
    poll: Duration,
) -> BpResult<Option<[u64; 1]>> {
    let deadline = Instant::now().checked_add(timeout);
    loop {
        if let Some(len) = index_ready(paths)? {
            return Ok(Some([len]));
        }
        let now = Instant::now();
        match deadline {
            Some(deadline) if now >= deadline => {
                log::warn!(
                    "{} did not appear within {timeout:?}",
                    paths.root().display()
                );
                return Ok(None);
            }
            _ => std::thread::sleep(poll),
        }
    }
}

fn index_ready(paths: &DatasetPaths) -> BpResult<Option<u64>> {
    if !paths.metadata().exists() || !paths.meta_metadata().exists() {
        return Ok(None);
    }
    let index = match FileTransport::open(paths.index()) {
        Ok(index) => index,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let len = index.size()?;
    if len < INDEX_HEADER_SIZE as u64 {
        return Ok(None);
    }
    let header = IndexHeader::decode(&index.read_byte_range(0..INDEX_HEADER_SIZE as u64)?)?;
    Ok((len >= header.step_records_offset()).then_some(len))
}
