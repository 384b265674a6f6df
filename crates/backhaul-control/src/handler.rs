//! Gateway-side loop for one physical tunnel connection
//!
//! `Registered → (publish on demand → leased → reset)* → closed`

use backhaul_transport::{DuplexStream, TransportError};
use tracing::{debug, info, warn};

use crate::registry::Registration;
use crate::TunnelError;

/// Park `stream` under its registration until the connection ends
///
/// The stream's abort token must descend from
/// [`Registration::stream_token`]. Returns `Ok` when the physical connection
/// closed and an error when the identity was removed underneath it. Either
/// way the stream is aborted and the registration released on return.
pub async fn serve_tunnel(
    registration: Registration,
    mut stream: DuplexStream,
) -> Result<(), TunnelError> {
    let pair = registration.pair().clone();
    let abort = stream.abort_handle();
    let stream_id = stream.id().to_string();
    let mut sessions = 0u64;

    info!(
        identity = %registration.identity(),
        stream_id = %stream_id,
        "Tunnel connection parked"
    );

    let result = loop {
        tokio::select! {
            biased;
            _ = abort.aborted() => break Ok(()),
            ready = pair.wait_ready() => {
                if let Err(e) = ready {
                    break Err(e);
                }
            }
        }

        let (lease, completion) = stream.lease();
        tokio::select! {
            biased;
            _ = abort.aborted() => break Ok(()),
            published = pair.publish(lease) => {
                if let Err(e) = published {
                    break Err(e);
                }
            }
        }

        stream = tokio::select! {
            biased;
            _ = abort.aborted() => break Ok(()),
            returned = completion => match returned {
                Ok(stream) => stream,
                Err(e) => break Err(e.into()),
            },
        };

        sessions += 1;
        match stream.reset().await {
            Ok(()) => debug!(stream_id = %stream_id, sessions, "Tunnel stream reset"),
            Err(TransportError::Aborted) => break Ok(()),
            Err(e) => {
                warn!(stream_id = %stream_id, "Tunnel stream reset failed: {}", e);
                break Err(e.into());
            }
        }
    };

    abort.abort();
    info!(
        identity = %registration.identity(),
        stream_id = %stream_id,
        sessions,
        "Tunnel connection closed"
    );

    result
}
