//! Signaling test fixtures.
//!
//! Producer parameters shaped like what browsers send, receiver
//! capabilities, and DTLS parameters that pass fingerprint validation.

use sfu_controller::config::default_media_codecs;
use sfu_controller::media::negotiation::router_capabilities;
use signaling_protocol::rtp::{
    CodecParameters, MediaKind, RtcpParameters, RtpCapabilities, RtpCodecParameters,
    RtpEncodingParameters, RtpParameters,
};
use signaling_protocol::transport::{DtlsFingerprint, DtlsParameters, DtlsRole};

/// SDP-style SHA-256 fingerprint (32 colon-separated bytes).
pub const TEST_FINGERPRINT: &str = "A1:B2:C3:D4:E5:F6:07:18:29:3A:4B:5C:6D:7E:8F:90:\
                                    01:12:23:34:45:56:67:78:89:9A:AB:BC:CD:DE:EF:F0";

fn single_codec(
    mime_type: &str,
    payload_type: u8,
    clock_rate: u32,
    channels: Option<u8>,
    ssrc: u32,
) -> RtpParameters {
    RtpParameters {
        mid: Some("0".to_string()),
        codecs: vec![RtpCodecParameters {
            mime_type: mime_type.to_string(),
            payload_type,
            clock_rate,
            channels,
            parameters: CodecParameters::new(),
            rtcp_feedback: Vec::new(),
        }],
        header_extensions: Vec::new(),
        encodings: vec![RtpEncodingParameters {
            ssrc: Some(ssrc),
            ..RtpEncodingParameters::default()
        }],
        rtcp: RtcpParameters {
            cname: Some(format!("cname-{ssrc}")),
            reduced_size: true,
        },
    }
}

/// VP8 video producer parameters.
#[must_use]
pub fn vp8_parameters(ssrc: u32) -> RtpParameters {
    single_codec("video/VP8", 96, 90000, None, ssrc)
}

/// VP8 with an RTX stream.
#[must_use]
pub fn vp8_rtx_parameters(ssrc: u32) -> RtpParameters {
    let mut parameters = vp8_parameters(ssrc);
    let mut apt = CodecParameters::new();
    apt.insert("apt".to_string(), 96.into());
    parameters.codecs.push(RtpCodecParameters {
        mime_type: "video/rtx".to_string(),
        payload_type: 97,
        clock_rate: 90000,
        channels: None,
        parameters: apt,
        rtcp_feedback: Vec::new(),
    });
    parameters
}

/// Stereo Opus audio producer parameters.
#[must_use]
pub fn opus_parameters(ssrc: u32) -> RtpParameters {
    single_codec("audio/opus", 111, 48000, Some(2), ssrc)
}

/// H265 video, which routers with the default codec set do not support.
#[must_use]
pub fn h265_parameters(ssrc: u32) -> RtpParameters {
    single_codec("video/H265", 100, 90000, None, ssrc)
}

/// Parameters for `kind` with the codec every default router supports.
#[must_use]
pub fn parameters_for(kind: MediaKind, ssrc: u32) -> RtpParameters {
    match kind {
        MediaKind::Audio => opus_parameters(ssrc),
        MediaKind::Video => vp8_parameters(ssrc),
    }
}

/// Receiver capabilities matching a router built with the default codecs.
#[must_use]
pub fn client_capabilities() -> RtpCapabilities {
    router_capabilities(&default_media_codecs()).unwrap()
}

/// Receiver capabilities without any video codec.
#[must_use]
pub fn audio_only_capabilities() -> RtpCapabilities {
    let mut capabilities = client_capabilities();
    capabilities.codecs.retain(|codec| codec.kind == MediaKind::Audio);
    capabilities
        .header_extensions
        .retain(|ext| ext.kind == MediaKind::Audio);
    capabilities
}

/// Client DTLS parameters with a well-formed SHA-256 fingerprint.
#[must_use]
pub fn dtls_parameters() -> DtlsParameters {
    DtlsParameters {
        role: DtlsRole::Client,
        fingerprints: vec![DtlsFingerprint {
            algorithm: "sha-256".to_string(),
            value: TEST_FINGERPRINT.to_string(),
        }],
    }
}

/// DTLS parameters whose fingerprint has the wrong length.
#[must_use]
pub fn malformed_dtls_parameters() -> DtlsParameters {
    DtlsParameters {
        role: DtlsRole::Client,
        fingerprints: vec![DtlsFingerprint {
            algorithm: "sha-256".to_string(),
            value: "AB:CD".to_string(),
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfu_controller::media::negotiation::{
        can_consume, validate_dtls_parameters, validate_producer_parameters,
    };

    #[test]
    fn test_supported_parameters_validate() {
        let caps = client_capabilities();
        for parameters in [vp8_parameters(1), vp8_rtx_parameters(2)] {
            validate_producer_parameters(MediaKind::Video, &parameters, &caps).unwrap();
        }
        validate_producer_parameters(MediaKind::Audio, &opus_parameters(3), &caps).unwrap();
    }

    #[test]
    fn test_h265_is_rejected() {
        let caps = client_capabilities();
        assert!(validate_producer_parameters(MediaKind::Video, &h265_parameters(1), &caps).is_err());
    }

    #[test]
    fn test_audio_only_receiver_cannot_consume_video() {
        let caps = audio_only_capabilities();
        assert!(!can_consume(MediaKind::Video, &vp8_parameters(1), &caps));
        assert!(can_consume(MediaKind::Audio, &opus_parameters(1), &caps));
    }

    #[test]
    fn test_dtls_fixtures() {
        assert!(validate_dtls_parameters(&dtls_parameters()).is_ok());
        assert!(validate_dtls_parameters(&malformed_dtls_parameters()).is_err());
    }
}
