//! SFU Controller configuration.
//!
//! Configuration is loaded from environment variables. The negotiated codec
//! list is fixed at process start and is not configurable per room.

use crate::media::negotiation::router_capabilities;
use crate::media::WorkerSettings;
use signaling_protocol::rtp::{CodecParameters, MediaKind, RtcpFeedback, RtpCodecCapability};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

/// Default signaling (WebSocket) bind address.
pub const DEFAULT_SIGNALING_BIND_ADDRESS: &str = "0.0.0.0:4443";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default IP the media workers listen on.
pub const DEFAULT_RTC_LISTEN_IP: &str = "0.0.0.0";

/// Default IP advertised in ICE candidates.
pub const DEFAULT_RTC_ANNOUNCED_IP: &str = "127.0.0.1";

/// Default lower bound of the RTC port range.
pub const DEFAULT_RTC_MIN_PORT: u16 = 40000;

/// Default upper bound of the RTC port range.
pub const DEFAULT_RTC_MAX_PORT: u16 = 49999;

/// Default maximum number of rooms (0 = unlimited).
pub const DEFAULT_MAX_ROOMS: usize = 0;

/// Default maximum peers per room.
pub const DEFAULT_MAX_PEERS_PER_ROOM: usize = 50;

/// Default time a peer may stay in a room without a connected transport.
pub const DEFAULT_NEGOTIATION_TIMEOUT_SECONDS: u64 = 30;

/// Default time a connection may stay open without joining a room.
pub const DEFAULT_JOIN_TIMEOUT_SECONDS: u64 = 10;

/// Default maximum signaling frame size in bytes.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Default SFU instance ID prefix.
pub const DEFAULT_SFU_ID_PREFIX: &str = "sfu";

/// SFU Controller configuration.
#[derive(Clone)]
pub struct Config {
    /// Unique identifier for this SFU instance.
    pub sfu_id: String,

    /// WebSocket signaling bind address (default: "0.0.0.0:4443").
    pub signaling_bind_address: String,

    /// Health endpoint bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Number of media workers in the pool.
    pub num_workers: usize,

    /// IP the media workers listen on.
    pub rtc_listen_ip: IpAddr,

    /// IP advertised to clients in ICE candidates.
    pub rtc_announced_ip: String,

    /// Inclusive RTC port range shared by all workers.
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,

    /// Maximum concurrent rooms (0 = unlimited).
    pub max_rooms: usize,

    /// Maximum peers in one room.
    pub max_peers_per_room: usize,

    /// Peers without a connected transport after this long are removed (0 = never).
    pub negotiation_timeout_seconds: u64,

    /// Connections that have not joined a room after this long are closed.
    pub join_timeout_seconds: u64,

    /// Maximum size of one signaling frame.
    pub max_message_size: usize,

    /// Process-wide codec list every router is created with.
    pub media_codecs: Vec<RtpCodecCapability>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("sfu_id", &self.sfu_id)
            .field("signaling_bind_address", &self.signaling_bind_address)
            .field("health_bind_address", &self.health_bind_address)
            .field("num_workers", &self.num_workers)
            .field("rtc_listen_ip", &self.rtc_listen_ip)
            .field("rtc_announced_ip", &self.rtc_announced_ip)
            .field("rtc_ports", &format!("{}-{}", self.rtc_min_port, self.rtc_max_port))
            .field("max_rooms", &self.max_rooms)
            .field("max_peers_per_room", &self.max_peers_per_room)
            .field(
                "negotiation_timeout_seconds",
                &self.negotiation_timeout_seconds,
            )
            .field("join_timeout_seconds", &self.join_timeout_seconds)
            .field("max_message_size", &self.max_message_size)
            .field("media_codecs", &self.media_codecs.len())
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Parse an optional variable, failing on present-but-invalid values.
fn parse_var<T: std::str::FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{name}={raw}"))),
        None => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let signaling_bind_address = vars
            .get("SFU_SIGNALING_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SIGNALING_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("SFU_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let default_workers = std::thread::available_parallelism().map_or(1, usize::from);
        let num_workers: usize = parse_var(vars, "SFU_NUM_WORKERS", default_workers)?;
        if num_workers == 0 {
            return Err(ConfigError::InvalidValue(
                "SFU_NUM_WORKERS must be at least 1".to_string(),
            ));
        }

        let rtc_listen_ip: IpAddr = vars
            .get("SFU_RTC_LISTEN_IP")
            .map_or(DEFAULT_RTC_LISTEN_IP, String::as_str)
            .parse()
            .map_err(|e| ConfigError::InvalidValue(format!("SFU_RTC_LISTEN_IP: {e}")))?;

        let rtc_announced_ip = vars
            .get("SFU_RTC_ANNOUNCED_IP")
            .cloned()
            .unwrap_or_else(|| DEFAULT_RTC_ANNOUNCED_IP.to_string());

        let rtc_min_port: u16 = parse_var(vars, "SFU_RTC_MIN_PORT", DEFAULT_RTC_MIN_PORT)?;
        let rtc_max_port: u16 = parse_var(vars, "SFU_RTC_MAX_PORT", DEFAULT_RTC_MAX_PORT)?;
        if rtc_min_port > rtc_max_port {
            return Err(ConfigError::InvalidValue(format!(
                "SFU_RTC_MIN_PORT ({rtc_min_port}) is greater than SFU_RTC_MAX_PORT ({rtc_max_port})"
            )));
        }
        let port_count = usize::from(rtc_max_port - rtc_min_port) + 1;
        if port_count < num_workers {
            return Err(ConfigError::InvalidValue(format!(
                "RTC port range has {port_count} ports but {num_workers} workers are configured"
            )));
        }

        let max_rooms = parse_var(vars, "SFU_MAX_ROOMS", DEFAULT_MAX_ROOMS)?;
        let max_peers_per_room =
            parse_var(vars, "SFU_MAX_PEERS_PER_ROOM", DEFAULT_MAX_PEERS_PER_ROOM)?;
        let negotiation_timeout_seconds = parse_var(
            vars,
            "SFU_NEGOTIATION_TIMEOUT_SECONDS",
            DEFAULT_NEGOTIATION_TIMEOUT_SECONDS,
        )?;
        let join_timeout_seconds =
            parse_var(vars, "SFU_JOIN_TIMEOUT_SECONDS", DEFAULT_JOIN_TIMEOUT_SECONDS)?;
        let max_message_size = parse_var(vars, "SFU_MAX_MESSAGE_SIZE", DEFAULT_MAX_MESSAGE_SIZE)?;

        let sfu_id = vars.get("SFU_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().simple().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_SFU_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        let media_codecs = default_media_codecs();
        validate_media_codecs(&media_codecs)?;

        Ok(Config {
            sfu_id,
            signaling_bind_address,
            health_bind_address,
            num_workers,
            rtc_listen_ip,
            rtc_announced_ip,
            rtc_min_port,
            rtc_max_port,
            max_rooms,
            max_peers_per_room,
            negotiation_timeout_seconds,
            join_timeout_seconds,
            max_message_size,
            media_codecs,
        })
    }

    /// Worker settings covering the whole configured port range.
    #[must_use]
    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            listen_ip: self.rtc_listen_ip,
            announced_ip: self.rtc_announced_ip.clone(),
            min_port: self.rtc_min_port,
            max_port: self.rtc_max_port,
        }
    }

    #[must_use]
    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_seconds)
    }

    #[must_use]
    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_seconds)
    }
}

fn feedback(feedback_type: &str, parameter: &str) -> RtcpFeedback {
    RtcpFeedback {
        feedback_type: feedback_type.to_string(),
        parameter: parameter.to_string(),
    }
}

fn video_feedback() -> Vec<RtcpFeedback> {
    vec![
        feedback("nack", ""),
        feedback("nack", "pli"),
        feedback("ccm", "fir"),
        feedback("goog-remb", ""),
        feedback("transport-cc", ""),
    ]
}

/// Check that routers can be built from `codecs`.
///
/// Runs the same payload type assignment the workers do, so a bad list fails
/// at startup instead of on the first join.
pub fn validate_media_codecs(codecs: &[RtpCodecCapability]) -> Result<(), ConfigError> {
    router_capabilities(codecs)
        .map(|_| ())
        .map_err(|e| ConfigError::InvalidValue(format!("media codecs: {e}")))
}

/// Codecs every router is created with: Opus, VP8 and constrained-baseline H264.
#[must_use]
pub fn default_media_codecs() -> Vec<RtpCodecCapability> {
    let mut h264_parameters = CodecParameters::new();
    h264_parameters.insert("packetization-mode".to_string(), 1.into());
    h264_parameters.insert("profile-level-id".to_string(), "42e01f".into());
    h264_parameters.insert("level-asymmetry-allowed".to_string(), 1.into());

    vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            preferred_payload_type: None,
            clock_rate: 48000,
            channels: Some(2),
            parameters: CodecParameters::new(),
            rtcp_feedback: vec![feedback("transport-cc", "")],
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            preferred_payload_type: None,
            clock_rate: 90000,
            channels: None,
            parameters: CodecParameters::new(),
            rtcp_feedback: video_feedback(),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/H264".to_string(),
            preferred_payload_type: None,
            clock_rate: 90000,
            channels: None,
            parameters: h264_parameters,
            rtcp_feedback: video_feedback(),
        },
    ]
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&HashMap::new()).expect("Config should load successfully");

        assert_eq!(config.signaling_bind_address, DEFAULT_SIGNALING_BIND_ADDRESS);
        assert_eq!(config.health_bind_address, DEFAULT_HEALTH_BIND_ADDRESS);
        assert!(config.num_workers >= 1);
        assert_eq!(config.rtc_listen_ip.to_string(), DEFAULT_RTC_LISTEN_IP);
        assert_eq!(config.rtc_announced_ip, DEFAULT_RTC_ANNOUNCED_IP);
        assert_eq!(config.rtc_min_port, DEFAULT_RTC_MIN_PORT);
        assert_eq!(config.rtc_max_port, DEFAULT_RTC_MAX_PORT);
        assert_eq!(config.max_rooms, DEFAULT_MAX_ROOMS);
        assert_eq!(config.max_peers_per_room, DEFAULT_MAX_PEERS_PER_ROOM);
        assert_eq!(
            config.negotiation_timeout_seconds,
            DEFAULT_NEGOTIATION_TIMEOUT_SECONDS
        );
        assert_eq!(config.join_timeout_seconds, DEFAULT_JOIN_TIMEOUT_SECONDS);
        assert_eq!(config.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
        assert_eq!(config.media_codecs.len(), 3);
        assert!(config.sfu_id.starts_with("sfu-"));
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let vars = HashMap::from([
            ("SFU_ID".to_string(), "sfu-test-001".to_string()),
            (
                "SFU_SIGNALING_BIND_ADDRESS".to_string(),
                "127.0.0.1:5000".to_string(),
            ),
            ("SFU_NUM_WORKERS".to_string(), "4".to_string()),
            ("SFU_RTC_LISTEN_IP".to_string(), "10.0.0.5".to_string()),
            ("SFU_RTC_ANNOUNCED_IP".to_string(), "203.0.113.7".to_string()),
            ("SFU_RTC_MIN_PORT".to_string(), "50000".to_string()),
            ("SFU_RTC_MAX_PORT".to_string(), "50099".to_string()),
            ("SFU_MAX_ROOMS".to_string(), "10".to_string()),
            ("SFU_MAX_PEERS_PER_ROOM".to_string(), "8".to_string()),
            ("SFU_NEGOTIATION_TIMEOUT_SECONDS".to_string(), "0".to_string()),
        ]);

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.sfu_id, "sfu-test-001");
        assert_eq!(config.signaling_bind_address, "127.0.0.1:5000");
        assert_eq!(config.num_workers, 4);
        assert_eq!(config.rtc_listen_ip.to_string(), "10.0.0.5");
        assert_eq!(config.rtc_announced_ip, "203.0.113.7");
        assert_eq!(config.rtc_min_port, 50000);
        assert_eq!(config.rtc_max_port, 50099);
        assert_eq!(config.max_rooms, 10);
        assert_eq!(config.max_peers_per_room, 8);
        assert_eq!(config.negotiation_timeout(), Duration::ZERO);
    }

    #[test]
    fn test_invalid_number_is_rejected() {
        let vars = HashMap::from([("SFU_NUM_WORKERS".to_string(), "many".to_string())]);
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(v)) if v.contains("SFU_NUM_WORKERS")
        ));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let vars = HashMap::from([("SFU_NUM_WORKERS".to_string(), "0".to_string())]);
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_inverted_port_range_rejected() {
        let vars = HashMap::from([
            ("SFU_RTC_MIN_PORT".to_string(), "50000".to_string()),
            ("SFU_RTC_MAX_PORT".to_string(), "40000".to_string()),
        ]);
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_port_range_smaller_than_worker_count_rejected() {
        let vars = HashMap::from([
            ("SFU_NUM_WORKERS".to_string(), "4".to_string()),
            ("SFU_RTC_MIN_PORT".to_string(), "40000".to_string()),
            ("SFU_RTC_MAX_PORT".to_string(), "40002".to_string()),
        ]);
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_invalid_listen_ip_rejected() {
        let vars = HashMap::from([("SFU_RTC_LISTEN_IP".to_string(), "not-an-ip".to_string())]);
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_default_codecs_cover_audio_and_video() {
        let codecs = default_media_codecs();
        assert!(codecs.iter().any(|c| c.kind == MediaKind::Audio));
        assert!(codecs.iter().any(|c| c.kind == MediaKind::Video));
    }

    #[test]
    fn test_validate_media_codecs() {
        assert!(validate_media_codecs(&default_media_codecs()).is_ok());
        assert!(matches!(
            validate_media_codecs(&[]),
            Err(ConfigError::InvalidValue(_))
        ));

        let mut rtx = default_media_codecs();
        if let Some(codec) = rtx.get_mut(1) {
            codec.mime_type = "video/rtx".to_string();
        }
        assert!(validate_media_codecs(&rtx).is_err());
    }
}
