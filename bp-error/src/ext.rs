use crate::{BpError, BpResult, ErrString};

/// Extension trait for BpResult
pub trait ResultExt<T>: private::Sealed {
    /// Flatten a nested [`BpResult`]. Helper function until <https://github.com/rust-lang/rust/issues/70142> is stabilized.
    fn flatten(self) -> BpResult<T>;
}

/// Attach a message to the error of a result.
pub trait WithContext<T>: private::SealedResult {
    /// Wrap the error, if any, in a [`BpError::Context`] built from `f`.
    fn with_context<M: Into<ErrString>, F: FnOnce() -> M>(self, f: F) -> BpResult<T>;
}

mod private {
    use crate::BpResult;

    pub trait Sealed {}

    pub trait SealedResult {}

    impl<T> Sealed for BpResult<BpResult<T>> {}
    impl<T> SealedResult for BpResult<T> {}
}

impl<T> ResultExt<T> for BpResult<BpResult<T>> {
    fn flatten(self) -> BpResult<T> {
        match self {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) | Err(e) => Err(e),
        }
    }
}

impl<T> WithContext<T> for BpResult<T> {
    fn with_context<M: Into<ErrString>, F: FnOnce() -> M>(self, f: F) -> BpResult<T> {
        self.map_err(|e: BpError| e.with_context(f()))
    }
}
