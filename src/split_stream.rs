//! Split Stream Module
//!
//! Produces two consumers of one origin byte stream: one drives the client
//! response, the other feeds a cache write. Both sinks observe the source
//! bytes in order. The pump awaits both bounded channels, so a slow cache
//! write couples into the client stream as backpressure rather than
//! unbounded buffering.
//!
//! Failure rules: a source error aborts both sinks; a client disconnect
//! aborts the cache sink too, so a truncated body never becomes a cache
//! entry; a cache sink that has gone away degrades to client-only streaming.

use crate::stores::ByteStream;
use crate::{GatewayError, Result};
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Both halves of a split stream plus the pump task driving them
pub struct SplitStream {
    pub client: ByteStream,
    pub cache: ByteStream,
    pub pump: JoinHandle<()>,
}

/// Number of in-flight frames each sink may buffer
pub const DEFAULT_CAPACITY: usize = 8;

/// Split `source` into a client stream and a cache stream
pub fn split(source: ByteStream, capacity: usize) -> SplitStream {
    let (client_tx, client_rx) = mpsc::channel::<Result<Bytes>>(capacity);
    let (cache_tx, cache_rx) = mpsc::channel::<Result<Bytes>>(capacity);

    let pump = tokio::spawn(pump_loop(source, client_tx, cache_tx));

    SplitStream {
        client: receiver_stream(client_rx),
        cache: receiver_stream(cache_rx),
        pump,
    }
}

async fn pump_loop(
    mut source: ByteStream,
    client_tx: mpsc::Sender<Result<Bytes>>,
    cache_tx: mpsc::Sender<Result<Bytes>>,
) {
    let mut cache_open = true;

    while let Some(frame) = source.next().await {
        match frame {
            Ok(chunk) => {
                if cache_open && cache_tx.send(Ok(chunk.clone())).await.is_err() {
                    // Cache consumer bailed; keep serving the client
                    debug!("cache sink closed, continuing client-only");
                    cache_open = false;
                }
                if client_tx.send(Ok(chunk)).await.is_err() {
                    debug!("client disconnected, aborting cache write");
                    if cache_open {
                        let _ = cache_tx
                            .send(Err(GatewayError::CacheWrite(
                                "client disconnected mid-stream".to_string(),
                            )))
                            .await;
                    }
                    return;
                }
            }
            Err(e) => {
                if cache_open {
                    let _ = cache_tx.send(Err(e.clone())).await;
                }
                let _ = client_tx.send(Err(e)).await;
                return;
            }
        }
    }
    // Clean end of stream: dropping the senders closes both sinks
}

fn receiver_stream(rx: mpsc::Receiver<Result<Bytes>>) -> ByteStream {
    futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .boxed()
}
