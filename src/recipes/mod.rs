//! Coordination recipes built on sessions and the transactional KV API.

pub mod double_barrier;

use thiserror::Error;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::client::Client;
use crate::rpc::{Event, RpcError, WatchRequest};

pub use double_barrier::DoubleBarrier;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecipeError {
    #[error("too many clients")]
    TooManyClients,

    #[error("session expired")]
    SessionExpired,

    #[error("operation canceled")]
    Canceled,

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

pub type RecipeResult<T> = Result<T, RecipeError>;

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Feeds watch events to `on_event` until it returns true.
///
/// Gives up with `Canceled` when `cancel` fires and with `SessionExpired` when
/// `session_done` fires first.
pub(crate) async fn wait_events<F>(
    client: &Client,
    req: WatchRequest,
    cancel: &CancellationToken,
    session_done: Option<&CancellationToken>,
    mut on_event: F,
) -> RecipeResult<()>
where
    F: FnMut(&Event) -> bool,
{
    let mut stream = client.watch(req).await?;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(RecipeError::Canceled),
            _ = cancelled(session_done) => return Err(RecipeError::SessionExpired),
            resp = stream.next() => match resp {
                Some(Ok(resp)) => {
                    if resp.events.iter().any(&mut on_event) {
                        return Ok(());
                    }
                }
                Some(Err(e)) => return Err(e.into()),
                None => {
                    return Err(RecipeError::Rpc(RpcError::Unavailable(
                        "watch stream closed".to_string(),
                    )))
                }
            },
        }
    }
}
