//! Engine parameters.
//!
//! [`BpParams`] mirrors the engine's string parameters and deserializes from JSON with the
//! same keys (`{"NumAggregators": 4, "AggregationType": "EveryoneWrites"}`). The builders
//! [`BpWriteOptions`] and [`BpOpenOptions`] wrap it for programmatic use.

use std::path::PathBuf;
use std::time::Duration;

use bp_aggregator::SpinConfig;
use bp_error::{BpResult, bp_bail};
use serde::{Deserialize, Serialize};

use crate::format::Endianness;

/// How writer ranks get their data into subfiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AggregationType {
    /// Every rank writes its own data at an offset relayed along its group; the token moves
    /// on before the write.
    EveryoneWrites,
    /// Like `EveryoneWrites`, but a rank passes the token only after its write finished.
    EveryoneWritesSerial,
    /// Only the group consumers write; producers stream through a shared-memory buffer.
    #[default]
    TwoLevelShm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadMode {
    /// Steps are consumed in order with `begin_step`/`end_step` while the writer may still
    /// be appending.
    #[default]
    Streaming,
    /// Every step is installed at open and addressed directly.
    RandomAccess,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default, deny_unknown_fields)]
pub struct BpParams {
    pub open_timeout_secs: f64,
    pub begin_step_polling_frequency_secs: f64,
    /// Zero means one aggregator per compute node.
    pub num_aggregators: usize,
    /// Zero means one subfile per aggregator.
    pub num_sub_files: usize,
    pub aggregation_type: AggregationType,
    pub file_system_page_size: u64,
    /// Size of each of the two shared-memory buffers.
    pub max_shm_size: usize,
    pub burst_buffer_path: Option<PathBuf>,
    pub burst_buffer_drain: bool,
    /// Zero means no limit.
    pub max_open_files_at_once: usize,
    pub read_coalescing_window: u64,
    pub spin_limit: u32,
    pub spin_backoff_micros: u64,
    pub max_metadata_in_memory: u64,
}

impl Default for BpParams {
    fn default() -> Self {
        Self {
            open_timeout_secs: 3600.0,
            begin_step_polling_frequency_secs: 1.0,
            num_aggregators: 0,
            num_sub_files: 0,
            aggregation_type: AggregationType::default(),
            file_system_page_size: 4096,
            max_shm_size: bp_aggregator::DEFAULT_SHM_BUFFER_SIZE,
            burst_buffer_path: None,
            burst_buffer_drain: true,
            max_open_files_at_once: 512,
            read_coalescing_window: 64 << 10,
            spin_limit: 1000,
            spin_backoff_micros: 10,
            max_metadata_in_memory: 16 << 20,
        }
    }
}

impl BpParams {
    pub fn from_json(json: &str) -> BpResult<Self> {
        let params: Self = serde_json::from_str(json)?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> BpResult<()> {
        if !self.open_timeout_secs.is_finite() || self.open_timeout_secs < 0.0 {
            bp_bail!(InvalidArgument: "OpenTimeoutSecs must be non-negative, got {}", self.open_timeout_secs);
        }
        let poll = self.begin_step_polling_frequency_secs;
        if !poll.is_finite() || poll <= 0.0 {
            bp_bail!(
                InvalidArgument: "BeginStepPollingFrequencySecs must be positive, got {}",
                self.begin_step_polling_frequency_secs
            );
        }
        if self.file_system_page_size == 0 {
            bp_bail!(InvalidArgument: "FileSystemPageSize must be positive");
        }
        if self.max_shm_size == 0 {
            bp_bail!(InvalidArgument: "MaxShmSize must be positive");
        }
        Ok(())
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.open_timeout_secs)
    }

    /// The interval between polls, never longer than `timeout`.
    pub fn poll_interval(&self, timeout: Duration) -> Duration {
        Duration::from_secs_f64(self.begin_step_polling_frequency_secs).min(timeout)
    }

    pub fn spin_config(&self) -> SpinConfig {
        SpinConfig {
            spin_limit: self.spin_limit,
            backoff: Duration::from_micros(self.spin_backoff_micros),
        }
    }
}

/// Options for [`crate::BpWriter::open`].
#[derive(Debug, Clone)]
pub struct BpWriteOptions {
    pub(crate) params: BpParams,
    pub(crate) endianness: Endianness,
}

impl Default for BpWriteOptions {
    fn default() -> Self {
        Self {
            params: BpParams::default(),
            endianness: Endianness::native(),
        }
    }
}

impl BpWriteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_params(mut self, params: BpParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_num_aggregators(mut self, num_aggregators: usize) -> Self {
        self.params.num_aggregators = num_aggregators;
        self
    }

    pub fn with_num_sub_files(mut self, num_sub_files: usize) -> Self {
        self.params.num_sub_files = num_sub_files;
        self
    }

    pub fn with_aggregation_type(mut self, aggregation_type: AggregationType) -> Self {
        self.params.aggregation_type = aggregation_type;
        self
    }

    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.params.file_system_page_size = page_size;
        self
    }

    pub fn with_max_shm_size(mut self, max_shm_size: usize) -> Self {
        self.params.max_shm_size = max_shm_size;
        self
    }

    /// Write into `path` first and copy to the dataset in the background.
    pub fn with_burst_buffer(mut self, path: impl Into<PathBuf>) -> Self {
        self.params.burst_buffer_path = Some(path.into());
        self
    }

    pub fn with_burst_buffer_drain(mut self, drain: bool) -> Self {
        self.params.burst_buffer_drain = drain;
        self
    }

    /// Write the dataset in `endianness` instead of the host byte order.
    pub fn with_endianness(mut self, endianness: Endianness) -> Self {
        self.endianness = endianness;
        self
    }

    pub fn params(&self) -> &BpParams {
        &self.params
    }
}

/// Options for [`crate::BpReader::open`].
#[derive(Debug, Clone, Default)]
pub struct BpOpenOptions {
    pub(crate) params: BpParams,
    pub(crate) mode: ReadMode,
}

impl BpOpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_params(mut self, params: BpParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_mode(mut self, mode: ReadMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn random_access(self) -> Self {
        self.with_mode(ReadMode::RandomAccess)
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.params.open_timeout_secs = timeout.as_secs_f64();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.params.begin_step_polling_frequency_secs = interval.as_secs_f64();
        self
    }

    pub fn with_max_open_files(mut self, max_open: usize) -> Self {
        self.params.max_open_files_at_once = max_open;
        self
    }

    pub fn with_coalescing_window(mut self, window: u64) -> Self {
        self.params.read_coalescing_window = window;
        self
    }

    pub fn with_max_metadata_in_memory(mut self, bytes: u64) -> Self {
        self.params.max_metadata_in_memory = bytes;
        self
    }

    pub fn mode(&self) -> ReadMode {
        self.mode
    }

    pub fn params(&self) -> &BpParams {
        &self.params
    }
}
