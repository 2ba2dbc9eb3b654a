// Runtime configuration for a call session.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;

use crate::error::{CallError, Result};
use crate::peer::media::MediaConstraints;
use crate::peer::types::ServerConfig;
use crate::utils::add_ice_url_scheme;

/// Public STUN servers used when the operator configures none.
pub static DEFAULT_ICE_SERVERS: Lazy<Vec<ServerConfig>> = Lazy::new(|| {
    vec![
        ServerConfig {
            id: "default-stun".into(),
            r#type: "stun".into(),
            url: "stun:stun.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        ServerConfig {
            id: "default-stun-1".into(),
            r#type: "stun".into(),
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
});

pub const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct CallConfig {
    pub ice_servers: Vec<ServerConfig>,
    /// Devices requested when a call starts.
    pub media: MediaConstraints,
    /// How long a `Disconnected` transport may take to recover before the
    /// call is failed.
    pub disconnect_grace_secs: u64,
    /// Upper bound on ICE gathering before an SDP is handed to signaling.
    pub ice_gather_timeout_secs: u64,
    /// Used when `RUST_LOG` is not set.
    pub log_filter: String,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_ICE_SERVERS.clone(),
            media: MediaConstraints::default(),
            disconnect_grace_secs: 10,
            ice_gather_timeout_secs: 10,
            log_filter: DEFAULT_LOG_FILTER.into(),
        }
    }
}

impl CallConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text).map_err(CallError::config)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(CallError::config(format!(
                    "ICE server `{}` has an empty url",
                    server.id
                )));
            }
            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none())
            {
                return Err(CallError::config(format!(
                    "TURN server `{}` requires username and credential",
                    server.id
                )));
            }
        }
        if !self.media.audio && !self.media.video {
            return Err(CallError::config("media constraints request no tracks"));
        }
        Ok(())
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_secs(self.disconnect_grace_secs)
    }

    pub fn ice_gather_timeout(&self) -> Duration {
        Duration::from_secs(self.ice_gather_timeout_secs)
    }

    pub fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = self
            .ice_servers
            .iter()
            .map(|config| RTCIceServer {
                urls: vec![add_ice_url_scheme(config)],
                username: config.username.clone().unwrap_or_default(),
                credential: config.credential.clone().unwrap_or_default(),
            })
            .collect();

        RTCConfiguration {
            ice_servers,
            bundle_policy: RTCBundlePolicy::MaxBundle,
            rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
            ..Default::default()
        }
    }
}
