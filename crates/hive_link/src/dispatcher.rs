//! Per-session receive loop.
//!
//! One task per established session reads frames, classifies them and
//! routes each to the inbox, the responder or the pending-call table. Any
//! read, decode or decrypt failure ends the session.

use std::sync::Arc;

use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::broadcast;
use tracing::debug;

use crate::endpoint::Endpoint;
use crate::security::SecureReader;
use crate::session::Session;

pub(crate) async fn run(
    endpoint: Arc<Endpoint>,
    session: Arc<Session>,
    mut reader: SecureReader<OwnedReadHalf>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let name = session.name().to_string();
    debug!(endpoint = %endpoint.name, peer = %name, "Dispatcher started");

    let cause = loop {
        tokio::select! {
            frame = reader.recv() => match frame {
                Ok(value) => endpoint.dispatch(&name, value),
                Err(e) => break Some(e),
            },
            _ = session.closed() => break None,
            _ = shutdown.recv() => {
                debug!(endpoint = %endpoint.name, peer = %name, "Dispatcher stopping on shutdown");
                return;
            }
        }
    };

    endpoint.teardown(&session, cause.as_ref()).await;
    debug!(endpoint = %endpoint.name, peer = %name, "Dispatcher exited");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
