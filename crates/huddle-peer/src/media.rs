use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, warn};
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

pub type LocalTrack = Arc<dyn TrackLocal + Send + Sync>;

type ReleaseHook = Box<dyn FnOnce() + Send>;

/// Captured local tracks plus whatever must happen to give the capture
/// device back. The release hook runs exactly once: on [`LocalMedia::release`]
/// or when the guard is dropped, whichever comes first.
pub struct LocalMedia<T = LocalTrack> {
    tracks: Vec<T>,
    release: Option<ReleaseHook>,
}

impl<T> LocalMedia<T> {
    pub fn new(tracks: Vec<T>, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            tracks,
            release: Some(Box::new(release)),
        }
    }

    pub fn tracks(&self) -> &[T] {
        &self.tracks
    }

    pub fn is_released(&self) -> bool {
        self.release.is_none()
    }

    pub fn release(&mut self) {
        if let Some(release) = self.release.take() {
            self.tracks.clear();
            release();
            debug!("local media released");
        }
    }
}

impl<T> Drop for LocalMedia<T> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Opus frame carrying digital silence.
const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];
const FRAME_DURATION: Duration = Duration::from_millis(20);

/// An Opus audio track fed with silence, for running a peer without a
/// capture device. Releasing it stops the feeder task.
pub fn silent_audio() -> LocalMedia {
    let track = Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48_000,
            channels: 2,
            ..Default::default()
        },
        "audio".to_owned(),
        "huddle-local".to_owned(),
    ));

    let feeder_track = Arc::clone(&track);
    let feeder = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(FRAME_DURATION);
        loop {
            ticker.tick().await;
            let sample = Sample {
                data: Bytes::from_static(&OPUS_SILENCE),
                duration: FRAME_DURATION,
                ..Default::default()
            };
            if let Err(err) = feeder_track.write_sample(&sample).await {
                warn!(error = %err, "failed to write silent audio sample");
                break;
            }
        }
    });

    LocalMedia::new(vec![track as LocalTrack], move || feeder.abort())
}
