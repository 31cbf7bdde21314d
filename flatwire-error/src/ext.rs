use crate::{ErrString, FlatResult};

mod private {
    use crate::FlatResult;

    pub trait SealedResult {}

    impl<T> SealedResult for FlatResult<T> {}
}

/// Attach context to the error of a [`FlatResult`].
pub trait ContextExt<T>: private::SealedResult {
    /// Wraps the error, if any, in a [`crate::FlatError::Context`] built lazily from `msg`.
    fn context<M, F>(self, msg: F) -> FlatResult<T>
    where
        M: Into<ErrString>,
        F: FnOnce() -> M;
}

impl<T> ContextExt<T> for FlatResult<T> {
    fn context<M, F>(self, msg: F) -> FlatResult<T>
    where
        M: Into<ErrString>,
        F: FnOnce() -> M,
    {
        self.map_err(|e| e.with_context(msg()))
    }
}
