use std::sync::Arc;

/// Failure reported by a fetch callback, cheap to clone across every
/// waiter of a batch.
pub type FetchError = Arc<anyhow::Error>;

/// Error returned by the loader layers.
///
/// The registration variants are configuration failures: the request was
/// routed to an attribute or object type nothing was registered for.
/// Everything a fetcher reports surfaces as [`Error::Fetch`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("no loader registered for object type '{0}'")]
    ObjectTypeNotRegistered(String),

    #[error("no loader registered for attribute '{0}'")]
    AttributeNotRegistered(String),

    #[error("{0}")]
    Fetch(FetchError),
}

impl Error {
    /// Wraps an arbitrary fetch failure.
    pub fn fetch(err: anyhow::Error) -> Self {
        Error::Fetch(Arc::new(err))
    }
}

/// True for failures produced while resolving data, false for the
/// routing/configuration failures a retry cannot fix.
pub fn is_loading_error(err: &Error) -> bool {
    !matches!(
        err,
        Error::ObjectTypeNotRegistered(_) | Error::AttributeNotRegistered(_)
    )
}
