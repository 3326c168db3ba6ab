use std::collections::HashMap;

use huddle_proto::ConnectionId;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::transport::MediaRenderer;
use crate::webrtc::RemoteTrack;

/// Stands in for a video surface: drains each remote track and logs how much
/// arrived.
#[derive(Default)]
pub struct LoggingRenderer {
    readers: Mutex<HashMap<ConnectionId, Vec<JoinHandle<()>>>>,
}

impl LoggingRenderer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MediaRenderer<RemoteTrack> for LoggingRenderer {
    fn show(&self, remote: &ConnectionId, track: RemoteTrack) {
        let remote_id = remote.clone();
        let reader = tokio::spawn(async move {
            let kind = track.kind();
            let mut packets: u64 = 0;
            while track.read_rtp().await.is_ok() {
                packets += 1;
                if packets % 500 == 0 {
                    debug!(remote_id = %remote_id, %kind, packets, "receiving media");
                }
            }
            info!(remote_id = %remote_id, %kind, packets, "remote track ended");
        });
        info!(remote_id = %remote, "rendering remote track");
        self.readers
            .lock()
            .entry(remote.clone())
            .or_default()
            .push(reader);
    }

    fn withdraw(&self, remote: &ConnectionId) {
        let readers = self.readers.lock().remove(remote);
        if let Some(readers) = readers {
            for reader in readers {
                reader.abort();
            }
            info!(remote_id = %remote, "stopped rendering");
        }
    }
}
