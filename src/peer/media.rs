//! Local and remote media handles.
//!
//! A [`MediaTrack`] is the crate's native track object: its `enabled` flag is
//! the source of truth for whether samples are sent, and `stop` releases it
//! for good. [`MediaStreamState`] is the cached per-kind view the UI reads.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use crate::error::{CallError, Result};
use crate::utils::random_id;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// What `acquire` is asked for.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// Authoritative enablement flags, changed only by the mute/video toggles.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaStreamState {
    pub audio_enabled: bool,
    pub video_enabled: bool,
}

impl Default for MediaStreamState {
    fn default() -> Self {
        Self {
            audio_enabled: true,
            video_enabled: true,
        }
    }
}

impl MediaStreamState {
    pub fn enabled(&self, kind: TrackKind) -> bool {
        match kind {
            TrackKind::Audio => self.audio_enabled,
            TrackKind::Video => self.video_enabled,
        }
    }
}

#[derive(Clone)]
pub enum TrackSource {
    Local(Arc<TrackLocalStaticSample>),
    Remote(Arc<TrackRemote>),
    /// No transport behind it; used by media doubles.
    Detached,
}

pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
    source: TrackSource,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind, source: TrackSource) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            source,
        }
    }

    pub fn detached(kind: TrackKind) -> Self {
        Self::new(random_id(), kind, TrackSource::Detached)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn source(&self) -> &TrackSource {
        &self.source
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Returns `true` when this call actually released the track.
    pub fn stop(&self) -> bool {
        let first = !self.stopped.swap(true, Ordering::SeqCst);
        if first {
            self.enabled.store(false, Ordering::SeqCst);
        }
        first
    }

    /// Pushes an encoded sample. Disabled or stopped tracks swallow it.
    pub async fn write_sample(&self, sample: &Sample) -> Result<bool> {
        if self.is_stopped() || !self.is_enabled() {
            return Ok(false);
        }
        match &self.source {
            TrackSource::Local(track) => {
                track.write_sample(sample).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = match self.source {
            TrackSource::Local(_) => "local",
            TrackSource::Remote(_) => "remote",
            TrackSource::Detached => "detached",
        };
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .field("source", &source)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<Arc<MediaTrack>>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<MediaTrack>>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<MediaTrack>] {
        &self.tracks
    }

    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &Arc<MediaTrack>> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    pub fn add_track(&mut self, track: Arc<MediaTrack>) {
        if !self.tracks.iter().any(|t| t.id() == track.id()) {
            self.tracks.push(track);
        }
    }

    /// Sets the enabled flag on every track of `kind`.
    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        for track in self.tracks_of(kind) {
            track.set_enabled(enabled);
        }
    }

    /// Stops every track; returns how many were actually released.
    pub fn stop_all(&self) -> usize {
        self.tracks.iter().filter(|t| t.stop()).count()
    }
}

/// The environment's "get user media" primitive.
#[async_trait]
pub trait MediaSource: Send + Sync + 'static {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<MediaStream>;
}

/// Produces `webrtc` sample tracks (Opus audio, VP8 video) that an encoder
/// pipeline feeds through [`MediaTrack::write_sample`].
#[derive(Debug, Default, Clone)]
pub struct SampleTrackSource;

impl SampleTrackSource {
    fn track(kind: TrackKind, stream_id: &str) -> Arc<MediaTrack> {
        let (mime, label) = match kind {
            TrackKind::Audio => (MIME_TYPE_OPUS, "audio"),
            TrackKind::Video => (MIME_TYPE_VP8, "video"),
        };
        let id = format!("{label}-{}", random_id());
        let local = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime.to_owned(),
                ..Default::default()
            },
            id.clone(),
            stream_id.to_owned(),
        ));
        Arc::new(MediaTrack::new(id, kind, TrackSource::Local(local)))
    }
}

#[async_trait]
impl MediaSource for SampleTrackSource {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<MediaStream> {
        if !constraints.audio && !constraints.video {
            return Err(CallError::media("no audio or video requested"));
        }
        let stream_id = random_id();
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(Self::track(TrackKind::Audio, &stream_id));
        }
        if constraints.video {
            tracks.push(Self::track(TrackKind::Video, &stream_id));
        }
        Ok(MediaStream::new(stream_id, tracks))
    }
}
