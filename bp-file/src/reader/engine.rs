use std::time::Duration;

use bp_error::BpResult;

use crate::selection::Selection;

/// Outcome of waiting for the next step of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Ok,
    /// No new step within the timeout; the writer is still active.
    NotReady,
    /// The writer closed the dataset and every step has been consumed.
    EndOfStream,
}

/// A deferred `get`, redeemed with [`crate::BpReader::take`] after
/// [`ReadEngine::perform_gets`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GetHandle(pub(crate) usize);

/// The step-wise read interface shared by read engines.
pub trait ReadEngine {
    fn begin_step(&mut self, timeout: Duration) -> BpResult<StepStatus>;

    fn end_step(&mut self) -> BpResult<()>;

    /// Queue a read of `selection` of `variable` at the current step.
    fn get(&mut self, variable: &str, selection: Selection) -> BpResult<GetHandle>;

    /// Execute every queued get.
    fn perform_gets(&mut self) -> BpResult<()>;

    fn close(&mut self) -> BpResult<()>;
}
