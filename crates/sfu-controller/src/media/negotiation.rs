//! RTP and DTLS parameter negotiation.
//!
//! Pure functions shared by media engines:
//!
//! - [`router_capabilities`] turns the configured codec list into the
//!   capabilities advertised to clients (payload types assigned, RTX and
//!   header extensions added).
//! - [`validate_producer_parameters`] checks what a client wants to send
//!   against the router capabilities.
//! - [`consumer_parameters`] derives what a receiving client gets for a
//!   producer, given the receiver's capabilities.
//! - [`validate_dtls_parameters`] checks remote DTLS fingerprints.
//!
//! Errors are plain strings; callers wrap them in `EngineError::Negotiation`.

use signaling_protocol::rtp::{
    CodecParameters, MediaKind, RtcpParameters, RtpCapabilities, RtpCodecCapability,
    RtpCodecParameters, RtpEncodingParameters, RtpHeaderExtension, RtpHeaderExtensionParameters,
    RtpParameters, RtxParameters,
};
use signaling_protocol::transport::{DtlsFingerprint, DtlsParameters};
use std::collections::HashSet;
use std::ops::RangeInclusive;

/// Dynamic RTP payload type range (RFC 3551).
pub const DYNAMIC_PAYLOAD_TYPES: RangeInclusive<u8> = 96..=127;

pub const MID_URI: &str = "urn:ietf:params:rtp-hdrext:sdes:mid";
pub const AUDIO_LEVEL_URI: &str = "urn:ietf:params:rtp-hdrext:ssrc-audio-level";
pub const ABS_SEND_TIME_URI: &str = "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time";
pub const VIDEO_ORIENTATION_URI: &str = "urn:3gpp:video-orientation";

/// Supported DTLS fingerprint algorithms with their digest length in bytes.
const FINGERPRINT_ALGORITHMS: [(&str, usize); 5] = [
    ("sha-1", 20),
    ("sha-224", 28),
    ("sha-256", 32),
    ("sha-384", 48),
    ("sha-512", 64),
];

/// Codec fields that decide compatibility, borrowed from either a
/// capability or a negotiated codec.
struct CodecKey<'a> {
    mime_type: &'a str,
    clock_rate: u32,
    channels: Option<u8>,
    parameters: &'a CodecParameters,
}

impl<'a> From<&'a RtpCodecCapability> for CodecKey<'a> {
    fn from(codec: &'a RtpCodecCapability) -> Self {
        Self {
            mime_type: &codec.mime_type,
            clock_rate: codec.clock_rate,
            channels: codec.channels,
            parameters: &codec.parameters,
        }
    }
}

impl<'a> From<&'a RtpCodecParameters> for CodecKey<'a> {
    fn from(codec: &'a RtpCodecParameters) -> Self {
        Self {
            mime_type: &codec.mime_type,
            clock_rate: codec.clock_rate,
            channels: codec.channels,
            parameters: &codec.parameters,
        }
    }
}

impl CodecKey<'_> {
    fn matches(&self, other: &CodecKey<'_>) -> bool {
        if !self.mime_type.eq_ignore_ascii_case(other.mime_type)
            || self.clock_rate != other.clock_rate
        {
            return false;
        }

        let kind = MediaKind::from_mime_type(self.mime_type);
        if kind == Some(MediaKind::Audio) && self.channels.unwrap_or(1) != other.channels.unwrap_or(1)
        {
            return false;
        }

        let lower = self.mime_type.to_ascii_lowercase();
        match lower.as_str() {
            "video/h264" => {
                param_u64(self.parameters, "packetization-mode").unwrap_or(0)
                    == param_u64(other.parameters, "packetization-mode").unwrap_or(0)
            }
            "video/vp9" => {
                param_u64(self.parameters, "profile-id").unwrap_or(0)
                    == param_u64(other.parameters, "profile-id").unwrap_or(0)
            }
            _ => true,
        }
    }
}

/// Read a numeric fmtp parameter that may be encoded as a number or a string.
fn param_u64(parameters: &CodecParameters, key: &str) -> Option<u64> {
    let value = parameters.get(key)?;
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

fn is_rtx_mime(mime_type: &str) -> bool {
    mime_type
        .rsplit_once('/')
        .is_some_and(|(_, name)| name.eq_ignore_ascii_case("rtx"))
}

/// Hands out dynamic payload types not yet taken.
struct PayloadTypeAllocator {
    used: HashSet<u8>,
}

impl PayloadTypeAllocator {
    fn next(&mut self) -> Result<u8, String> {
        let pt = DYNAMIC_PAYLOAD_TYPES
            .clone()
            .find(|pt| !self.used.contains(pt))
            .ok_or_else(|| "no free dynamic payload types left".to_string())?;
        self.used.insert(pt);
        Ok(pt)
    }
}

/// Build router capabilities from the configured codec list.
///
/// Keeps unique preferred payload types, assigns the rest from the dynamic
/// range, adds one RTX entry per video codec and the standard header
/// extensions.
pub fn router_capabilities(codecs: &[RtpCodecCapability]) -> Result<RtpCapabilities, String> {
    if codecs.is_empty() {
        return Err("media codec list is empty".to_string());
    }

    let mut allocator = PayloadTypeAllocator {
        used: HashSet::new(),
    };
    let mut pending = Vec::with_capacity(codecs.len());

    for codec in codecs {
        if is_rtx_mime(&codec.mime_type) {
            return Err(format!(
                "{} must not be configured explicitly",
                codec.mime_type
            ));
        }
        if MediaKind::from_mime_type(&codec.mime_type) != Some(codec.kind) {
            return Err(format!(
                "codec {} does not match kind {}",
                codec.mime_type, codec.kind
            ));
        }
        if codec.clock_rate == 0 {
            return Err(format!("codec {} has no clock rate", codec.mime_type));
        }

        let mut codec = codec.clone();
        if codec.kind == MediaKind::Audio && codec.channels.is_none() {
            codec.channels = Some(1);
        }
        if codec.kind == MediaKind::Video {
            codec.channels = None;
        }
        // Keep the first claim on a preferred payload type.
        if let Some(pt) = codec.preferred_payload_type {
            if !allocator.used.insert(pt) {
                codec.preferred_payload_type = None;
            }
        }
        pending.push(codec);
    }

    let mut capabilities = RtpCapabilities::default();
    for mut codec in pending {
        let pt = match codec.preferred_payload_type {
            Some(pt) => pt,
            None => allocator.next()?,
        };
        codec.preferred_payload_type = Some(pt);
        let kind = codec.kind;
        let clock_rate = codec.clock_rate;
        capabilities.codecs.push(codec);

        if kind == MediaKind::Video {
            let mut parameters = CodecParameters::new();
            parameters.insert("apt".to_string(), pt.into());
            capabilities.codecs.push(RtpCodecCapability {
                kind,
                mime_type: "video/rtx".to_string(),
                preferred_payload_type: Some(allocator.next()?),
                clock_rate,
                channels: None,
                parameters,
                rtcp_feedback: Vec::new(),
            });
        }
    }

    capabilities.header_extensions = standard_header_extensions();
    Ok(capabilities)
}

fn standard_header_extensions() -> Vec<RtpHeaderExtension> {
    let ext = |kind, uri: &str, preferred_id| RtpHeaderExtension {
        kind,
        uri: uri.to_string(),
        preferred_id,
    };
    vec![
        ext(MediaKind::Audio, MID_URI, 1),
        ext(MediaKind::Video, MID_URI, 1),
        ext(MediaKind::Audio, AUDIO_LEVEL_URI, 10),
        ext(MediaKind::Audio, ABS_SEND_TIME_URI, 4),
        ext(MediaKind::Video, ABS_SEND_TIME_URI, 4),
        ext(MediaKind::Video, VIDEO_ORIENTATION_URI, 11),
    ]
}

/// Check producer parameters against the router capabilities.
pub fn validate_producer_parameters(
    kind: MediaKind,
    parameters: &RtpParameters,
    capabilities: &RtpCapabilities,
) -> Result<(), String> {
    let Some(first) = parameters.codecs.first() else {
        return Err("rtpParameters.codecs is empty".to_string());
    };
    if first.is_rtx() {
        return Err("first codec must be a media codec".to_string());
    }
    if parameters.encodings.is_empty() {
        return Err("rtpParameters.encodings is empty".to_string());
    }

    let mut payload_types = HashSet::new();
    for codec in &parameters.codecs {
        if !payload_types.insert(codec.payload_type) {
            return Err(format!("duplicate payload type {}", codec.payload_type));
        }
    }

    for codec in &parameters.codecs {
        if codec.is_rtx() {
            let apt = param_u64(&codec.parameters, "apt")
                .ok_or_else(|| format!("rtx codec {} has no apt", codec.payload_type))?;
            let points_at_media = parameters
                .codecs
                .iter()
                .any(|c| !c.is_rtx() && u64::from(c.payload_type) == apt);
            if !points_at_media {
                return Err(format!(
                    "rtx codec {} references unknown payload type {apt}",
                    codec.payload_type
                ));
            }
            continue;
        }

        if MediaKind::from_mime_type(&codec.mime_type) != Some(kind) {
            return Err(format!(
                "codec {} does not match kind {kind}",
                codec.mime_type
            ));
        }

        let key = CodecKey::from(codec);
        let supported = capabilities
            .codecs
            .iter()
            .any(|cap| cap.kind == kind && CodecKey::from(cap).matches(&key));
        if !supported {
            return Err(format!("unsupported codec {}", codec.mime_type));
        }
    }

    for (index, encoding) in parameters.encodings.iter().enumerate() {
        if encoding.ssrc.is_none() && encoding.rid.is_none() {
            return Err(format!("encoding {index} has neither ssrc nor rid"));
        }
    }

    Ok(())
}

/// Whether a receiver with `capabilities` can decode the producer's media.
#[must_use]
pub fn can_consume(
    kind: MediaKind,
    producer: &RtpParameters,
    capabilities: &RtpCapabilities,
) -> bool {
    primary_codec(producer).is_some_and(|codec| {
        let key = CodecKey::from(codec);
        capabilities
            .codecs
            .iter()
            .any(|cap| cap.kind == kind && CodecKey::from(cap).matches(&key))
    })
}

fn primary_codec(parameters: &RtpParameters) -> Option<&RtpCodecParameters> {
    parameters.codecs.iter().find(|codec| !codec.is_rtx())
}

/// Derive consumer parameters for a producer.
///
/// The consumer receives the producer's primary codec only, mapped onto the
/// receiver's payload types, as a single encoding with fresh SSRCs. RTX is
/// kept when both sides support it.
pub fn consumer_parameters(
    kind: MediaKind,
    producer: &RtpParameters,
    capabilities: &RtpCapabilities,
    ssrc: u32,
    rtx_ssrc: u32,
    mid: Option<String>,
) -> Result<RtpParameters, String> {
    let codec = primary_codec(producer)
        .ok_or_else(|| "producer has no media codec".to_string())?;
    let key = CodecKey::from(codec);
    let capability = capabilities
        .codecs
        .iter()
        .find(|cap| cap.kind == kind && CodecKey::from(*cap).matches(&key))
        .ok_or_else(|| format!("receiver cannot decode {}", codec.mime_type))?;

    let payload_type = capability
        .preferred_payload_type
        .unwrap_or(codec.payload_type);

    let mut codecs = vec![RtpCodecParameters {
        mime_type: codec.mime_type.clone(),
        payload_type,
        clock_rate: codec.clock_rate,
        channels: codec.channels,
        parameters: codec.parameters.clone(),
        rtcp_feedback: capability.rtcp_feedback.clone(),
    }];

    let producer_has_rtx = producer.codecs.iter().any(|c| {
        c.is_rtx() && param_u64(&c.parameters, "apt") == Some(u64::from(codec.payload_type))
    });
    let rtx_capability = capabilities.codecs.iter().find(|cap| {
        is_rtx_mime(&cap.mime_type)
            && param_u64(&cap.parameters, "apt") == Some(u64::from(payload_type))
    });

    let mut encoding = RtpEncodingParameters {
        ssrc: Some(ssrc),
        ..RtpEncodingParameters::default()
    };

    if let (true, Some(rtx)) = (producer_has_rtx, rtx_capability) {
        if let Some(rtx_payload_type) = rtx.preferred_payload_type {
            let mut parameters = CodecParameters::new();
            parameters.insert("apt".to_string(), payload_type.into());
            codecs.push(RtpCodecParameters {
                mime_type: rtx.mime_type.clone(),
                payload_type: rtx_payload_type,
                clock_rate: rtx.clock_rate,
                channels: None,
                parameters,
                rtcp_feedback: Vec::new(),
            });
            encoding.rtx = Some(RtxParameters { ssrc: rtx_ssrc });
        }
    }

    let header_extensions = producer
        .header_extensions
        .iter()
        .filter_map(|ext| {
            capabilities
                .header_extensions
                .iter()
                .find(|cap| cap.kind == kind && cap.uri == ext.uri)
                .map(|cap| RtpHeaderExtensionParameters {
                    uri: cap.uri.clone(),
                    id: cap.preferred_id,
                    encrypt: ext.encrypt,
                })
        })
        .collect();

    Ok(RtpParameters {
        mid,
        codecs,
        header_extensions,
        encodings: vec![encoding],
        rtcp: RtcpParameters {
            cname: producer.rtcp.cname.clone(),
            reduced_size: true,
        },
    })
}

/// Check remote DTLS parameters.
pub fn validate_dtls_parameters(parameters: &DtlsParameters) -> Result<(), String> {
    if parameters.fingerprints.is_empty() {
        return Err("dtlsParameters.fingerprints is empty".to_string());
    }

    for fingerprint in &parameters.fingerprints {
        let algorithm = fingerprint.algorithm.to_ascii_lowercase();
        let Some((_, expected_len)) = FINGERPRINT_ALGORITHMS
            .iter()
            .find(|(name, _)| *name == algorithm)
        else {
            return Err(format!(
                "unsupported fingerprint algorithm {}",
                fingerprint.algorithm
            ));
        };

        let bytes: Vec<&str> = fingerprint.value.split(':').collect();
        let well_formed = bytes.len() == *expected_len
            && bytes
                .iter()
                .all(|b| b.len() == 2 && b.chars().all(|c| c.is_ascii_hexdigit()));
        if !well_formed {
            return Err(format!("malformed {algorithm} fingerprint"));
        }
    }

    Ok(())
}

/// SHA-256 fingerprint of a DER certificate in SDP notation.
#[must_use]
pub fn certificate_fingerprint(der: &[u8]) -> DtlsFingerprint {
    let digest = ring::digest::digest(&ring::digest::SHA256, der);
    let hex = hex::encode_upper(digest.as_ref());
    let value = hex
        .as_bytes()
        .chunks(2)
        .map(|pair| String::from_utf8_lossy(pair).into_owned())
        .collect::<Vec<_>>()
        .join(":");

    DtlsFingerprint {
        algorithm: "sha-256".to_string(),
        value,
    }
}
