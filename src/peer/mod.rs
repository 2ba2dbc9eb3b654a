pub mod adapter;
pub mod connection;
pub mod media;
pub mod types;

pub use adapter::{Notifier, PeerConnection, PeerNotification};
pub use connection::RtcPeer;
pub use media::{
    MediaConstraints, MediaSource, MediaStream, MediaStreamState, MediaTrack, SampleTrackSource,
    TrackKind,
};
pub use types::{PeerId, SdpKind, ServerConfig, SessionDescription};
