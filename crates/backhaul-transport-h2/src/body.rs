//! Helpers for moving bytes through h2 streams

use bytes::Bytes;
use futures::Stream;
use h2::{RecvStream, SendStream};
use std::io;

use backhaul_transport::{TransportError, TransportResult};

/// Adapt an h2 receive stream into a byte stream, releasing flow-control
/// capacity as chunks arrive
pub fn recv_stream_body(recv: RecvStream) -> impl Stream<Item = io::Result<Bytes>> + Send {
    futures::stream::unfold(Some(recv), |state| async move {
        let mut recv = state?;
        match recv.data().await {
            Some(Ok(chunk)) => {
                let _ = recv.flow_control().release_capacity(chunk.len());
                Some((Ok(chunk), Some(recv)))
            }
            Some(Err(e)) => Some((Err(io::Error::new(io::ErrorKind::ConnectionReset, e)), None)),
            None => None,
        }
    })
}

/// Send `data` on an h2 stream, waiting for send capacity as needed
pub async fn send_all(send: &mut SendStream<Bytes>, mut data: Bytes) -> TransportResult<()> {
    while !data.is_empty() {
        send.reserve_capacity(data.len());

        let available = match futures::future::poll_fn(|cx| send.poll_capacity(cx)).await {
            Some(Ok(n)) => n,
            Some(Err(e)) => {
                return Err(TransportError::ConnectionError(format!(
                    "H2 stream error: {}",
                    e
                )))
            }
            None => return Err(TransportError::StreamClosed),
        };

        if available == 0 {
            continue;
        }

        let chunk = data.split_to(available.min(data.len()));
        send.send_data(chunk, false)
            .map_err(|e| TransportError::ConnectionError(format!("H2 send failed: {}", e)))?;
    }

    Ok(())
}
