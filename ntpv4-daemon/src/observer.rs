//! Serves JSON snapshots of the system and per-association state over a
//! unix socket, one snapshot per connection.

use std::path::PathBuf;
use std::sync::Arc;

use ntpv4_proto::{NtpClock, NtpCore, PeerSnapshot, SystemSnapshot};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::UnixListener;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Serialize, Deserialize)]
pub struct ObservableState {
    pub system: SystemSnapshot,
    pub peers: Vec<PeerSnapshot>,
}

pub async fn observer_task<C>(path: PathBuf, core: Arc<Mutex<NtpCore<C>>>)
where
    C: NtpClock + Send + 'static,
{
    // a socket file left behind by a previous run would block the bind
    let _ = std::fs::remove_file(&path);

    let listener = match UnixListener::bind(&path) {
        Ok(listener) => listener,
        Err(error) => {
            warn!(?error, ?path, "could not bind observation socket");
            return;
        }
    };

    debug!(?path, "observation socket ready");

    loop {
        let (mut stream, _) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(error) => {
                warn!(?error, "could not accept observation connection");
                continue;
            }
        };

        let state = {
            let core = core.lock().await;
            ObservableState {
                system: core.observe_system(),
                peers: core.observe_peers(),
            }
        };

        let mut bytes = match serde_json::to_vec(&state) {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(?error, "could not serialize observable state");
                continue;
            }
        };
        bytes.push(b'\n');

        if let Err(error) = stream.write_all(&bytes).await {
            debug!(?error, "observation connection dropped");
        }
    }
}
