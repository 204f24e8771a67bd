use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::error::{GraphRagError, Result};

/// Races `future` against `token`. A cancelled token drops the in-flight future.
pub async fn cancellable<F, T>(token: &CancellationToken, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(GraphRagError::Cancelled),
        result = future => result,
    }
}
