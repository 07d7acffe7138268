//! Minimal session descriptions for the simulated media engine.
//!
//! Produces one `m=` section per transport slot (BUNDLE-style, one set of
//! ICE credentials) and parses the sections back. Real engines produce far
//! richer SDP; the call engine treats it as opaque either way.

use anyhow::{bail, Context, Result};

use super::rtc::MediaKind;

/// Direction attribute of a media section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl Direction {
    fn as_attr(&self) -> &'static str {
        match self {
            Direction::SendRecv => "sendrecv",
            Direction::SendOnly => "sendonly",
            Direction::RecvOnly => "recvonly",
            Direction::Inactive => "inactive",
        }
    }

    fn from_attr(attr: &str) -> Option<Self> {
        match attr {
            "sendrecv" => Some(Direction::SendRecv),
            "sendonly" => Some(Direction::SendOnly),
            "recvonly" => Some(Direction::RecvOnly),
            "inactive" => Some(Direction::Inactive),
            _ => None,
        }
    }

    pub fn sends(&self) -> bool {
        matches!(self, Direction::SendRecv | Direction::SendOnly)
    }
}

/// One media section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSection {
    pub kind: MediaKind,
    pub mid: String,
    pub direction: Direction,
    /// Sending track, announced with `a=msid:`.
    pub track_id: Option<String>,
}

/// Everything needed to write one description.
pub struct SdpParams<'a> {
    pub session_id: u64,
    pub version: u64,
    pub host: &'a str,
    pub stream_id: &'a str,
    pub ice_ufrag: &'a str,
    pub ice_pwd: &'a str,
    pub sections: &'a [MediaSection],
}

pub fn write(p: &SdpParams) -> String {
    let mut sdp = String::new();
    sdp.push_str("v=0\r\n");
    sdp.push_str(&format!(
        "o=- {} {} IN IP4 {}\r\n",
        p.session_id, p.version, p.host
    ));
    sdp.push_str("s=-\r\n");
    sdp.push_str("t=0 0\r\n");
    let mids: Vec<&str> = p.sections.iter().map(|s| s.mid.as_str()).collect();
    sdp.push_str(&format!("a=group:BUNDLE {}\r\n", mids.join(" ")));

    for section in p.sections {
        match section.kind {
            MediaKind::Audio => {
                sdp.push_str("m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n");
                sdp.push_str("a=rtpmap:111 opus/48000/2\r\n");
            }
            MediaKind::Video => {
                sdp.push_str("m=video 9 UDP/TLS/RTP/SAVPF 96\r\n");
                sdp.push_str("a=rtpmap:96 VP8/90000\r\n");
            }
        }
        sdp.push_str(&format!("c=IN IP4 {}\r\n", p.host));
        sdp.push_str(&format!("a=mid:{}\r\n", section.mid));
        sdp.push_str(&format!("a={}\r\n", section.direction.as_attr()));
        if let Some(ref track) = section.track_id {
            sdp.push_str(&format!("a=msid:{} {}\r\n", p.stream_id, track));
        }
        sdp.push_str(&format!("a=ice-ufrag:{}\r\n", p.ice_ufrag));
        sdp.push_str(&format!("a=ice-pwd:{}\r\n", p.ice_pwd));
        sdp.push_str("a=rtcp-mux\r\n");
    }
    sdp
}

/// Parse the media sections of a description.
pub fn parse_sections(sdp: &str) -> Result<Vec<MediaSection>> {
    if !sdp.trim_start().starts_with("v=0") {
        bail!("not a session description");
    }

    let mut sections: Vec<MediaSection> = Vec::new();
    for line in sdp.lines() {
        let line = line.trim();
        if let Some(media) = line.strip_prefix("m=") {
            let kind = match media.split_whitespace().next() {
                Some("audio") => MediaKind::Audio,
                Some("video") => MediaKind::Video,
                other => bail!("unsupported media section: {:?}", other),
            };
            sections.push(MediaSection {
                kind,
                mid: sections.len().to_string(),
                direction: Direction::SendRecv,
                track_id: None,
            });
            continue;
        }

        let Some(current) = sections.last_mut() else {
            continue;
        };
        if let Some(mid) = line.strip_prefix("a=mid:") {
            current.mid = mid.to_string();
        } else if let Some(msid) = line.strip_prefix("a=msid:") {
            let track = msid
                .split_whitespace()
                .nth(1)
                .context("msid without track id")?;
            current.track_id = Some(track.to_string());
        } else if let Some(dir) = line.strip_prefix("a=").and_then(Direction::from_attr) {
            current.direction = dir;
        }
    }
    Ok(sections)
}

/// Random 4-character ICE ufrag.
pub fn generate_ice_ufrag() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..4].to_string()
}

/// Random 24-character ICE password (hex only, accepted by every parser).
pub fn generate_ice_pwd() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..24].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sections() -> Vec<MediaSection> {
        vec![
            MediaSection {
                kind: MediaKind::Audio,
                mid: "0".into(),
                direction: Direction::SendRecv,
                track_id: Some("mic-1".into()),
            },
            MediaSection {
                kind: MediaKind::Video,
                mid: "1".into(),
                direction: Direction::RecvOnly,
                track_id: None,
            },
        ]
    }

    fn params<'a>(sections: &'a [MediaSection]) -> SdpParams<'a> {
        SdpParams {
            session_id: 42,
            version: 1,
            host: "10.0.0.1",
            stream_id: "stream-a",
            ice_ufrag: "abcd",
            ice_pwd: "0123456789abcdef01234567",
            sections,
        }
    }

    #[test]
    fn test_write_audio_with_empty_video_slot() {
        let s = sections();
        let sdp = write(&params(&s));
        assert!(sdp.starts_with("v=0\r\n"));
        assert!(sdp.contains("a=group:BUNDLE 0 1"));
        assert!(sdp.contains("m=audio"));
        assert!(sdp.contains("m=video"));
        assert!(sdp.contains("a=msid:stream-a mic-1"));
        assert!(sdp.contains("a=recvonly"));
    }

    #[test]
    fn test_parse_sections_recovers_layout() {
        let s = sections();
        let parsed = parse_sections(&write(&params(&s))).unwrap();
        assert_eq!(parsed, s);
    }

    #[test]
    fn test_video_track_parsed_as_sending() {
        let mut s = sections();
        s[1].direction = Direction::SendRecv;
        s[1].track_id = Some("cam-1".into());
        let parsed = parse_sections(&write(&params(&s))).unwrap();
        assert!(parsed[1].direction.sends());
        assert_eq!(parsed[1].track_id.as_deref(), Some("cam-1"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_sections("hello").is_err());
        assert!(parse_sections("v=0\r\nm=application 9 DTLS/SCTP 5000\r\n").is_err());
    }

    #[test]
    fn test_generated_credentials() {
        assert_eq!(generate_ice_ufrag().len(), 4);
        let pwd = generate_ice_pwd();
        assert_eq!(pwd.len(), 24);
        assert!(pwd.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
