//! Turns a connection-owning future into a [`RawRecordStream`].
//!
//! The future runs on its own task and pushes records into a bounded
//! channel; the receiving half is the stream handed to the worker. When the
//! future fails, its error is the stream's last item. Cancelling the token
//! drops the future, which closes the connection.

use std::future::Future;

use chainpipe_core::{ConnectError, RawRecord, RawRecordStream};
use futures::channel::mpsc;
use futures::SinkExt;
use tokio_util::sync::CancellationToken;

const STREAM_BUFFER: usize = 512;

pub type RecordSender = mpsc::Sender<Result<RawRecord, ConnectError>>;

pub fn spawn_record_stream<F, Fut>(cancel: CancellationToken, run: F) -> RawRecordStream
where
    F: FnOnce(RecordSender) -> Fut,
    Fut: Future<Output = Result<(), ConnectError>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    let mut err_tx = tx.clone();
    let fut = run(tx);

    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            res = fut => {
                if let Err(e) = res {
                    let _ = err_tx.send(Err(e)).await;
                }
            }
        }
    });

    Box::pin(rx)
}

/// Push one record. Returns `false` once the worker has dropped the stream.
pub async fn emit(tx: &mut RecordSender, record: RawRecord) -> bool {
    tx.send(Ok(record)).await.is_ok()
}
