//! Cancellation-aware channel plumbing shared by sources and the detector

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Send `item`, giving up if `token` fires first.
///
/// Returns `false` when the pipeline should stop: either the token was
/// cancelled or the receiver is gone.
pub(crate) async fn send_or_cancel<T>(
    tx: &mpsc::Sender<T>,
    item: T,
    token: &CancellationToken,
) -> bool {
    tokio::select! {
        biased;
        _ = token.cancelled() => false,
        sent = tx.send(item) => sent.is_ok(),
    }
}

/// Receive the next item, or `None` once `token` fires or the sender is gone.
pub(crate) async fn recv_or_cancel<T>(
    rx: &mut mpsc::Receiver<T>,
    token: &CancellationToken,
) -> Option<T> {
    tokio::select! {
        biased;
        _ = token.cancelled() => None,
        item = rx.recv() => item,
    }
}
