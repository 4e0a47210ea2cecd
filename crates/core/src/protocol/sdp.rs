//! SDP (Session Description Protocol) line model (RFC 4566 / RFC 8866).
//!
//! The relay never generates descriptions from scratch: it copies the
//! source's description and rewrites a handful of lines. The model therefore
//! keeps every line verbatim and in order, split into the session section
//! and one section per `m=` line:
//!
//! ```text
//! v=0                                  ┐
//! o=- 1 1 IN IP4 10.0.0.5              │ session section
//! s=Camera                             │
//! c=IN IP4 10.0.0.5                    │
//! t=0 0                                │
//! a=control:*                          ┘
//! m=video 0 RTP/AVP 96                 ┐
//! a=rtpmap:96 H264/90000               │ media section
//! a=control:trackID=1                  ┘
//! ```

use std::fmt;

use crate::error::{Result, RtspError};

/// MIME type of an SDP body (`Content-Type` in DESCRIBE responses).
pub const MIME_TYPE: &str = "application/sdp";

/// One `<type>=<value>` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpLine {
    pub kind: char,
    pub value: String,
}

impl SdpLine {
    pub fn new(kind: char, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }

    fn parse(line: &str) -> Option<Self> {
        let mut chars = line.chars();
        let kind = chars.next().filter(char::is_ascii_alphabetic)?;
        if chars.next()? != '=' {
            return None;
        }
        Some(Self::new(kind, &line[2..]))
    }

    /// Whether this is `a=<name>` or `a=<name>:<value>`.
    pub fn is_attribute(&self, name: &str) -> bool {
        self.kind == 'a'
            && self
                .value
                .strip_prefix(name)
                .is_some_and(|rest| rest.is_empty() || rest.starts_with(':'))
    }

    /// Value of `a=<name>:<value>`.
    pub fn attribute_value(&self, name: &str) -> Option<&str> {
        if self.kind != 'a' {
            return None;
        }
        self.value.strip_prefix(name)?.strip_prefix(':')
    }
}

impl fmt::Display for SdpLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.kind, self.value)
    }
}

/// One media section: the `m=` line followed by its own lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDescription {
    /// `lines[0]` is always the `m=` line.
    pub lines: Vec<SdpLine>,
}

impl MediaDescription {
    /// Media type token of the `m=` line (`video`, `audio`, ...).
    pub fn media_type(&self) -> &str {
        self.lines
            .first()
            .and_then(|m| m.value.split_whitespace().next())
            .unwrap_or("")
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.lines.iter().find_map(|l| l.attribute_value(name))
    }

    pub fn control(&self) -> Option<&str> {
        self.attribute("control")
    }
}

/// A parsed session description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub session: Vec<SdpLine>,
    pub media: Vec<MediaDescription>,
}

impl SessionDescription {
    /// Parse SDP text. Accepts CRLF or LF line endings; blank lines are
    /// skipped. The description must start with `v=`.
    pub fn parse(text: &str) -> Result<Self> {
        let mut session = Vec::new();
        let mut media: Vec<MediaDescription> = Vec::new();

        for raw in text.lines() {
            let raw = raw.trim_end();
            if raw.is_empty() {
                continue;
            }
            let line = SdpLine::parse(raw)
                .ok_or_else(|| RtspError::Sdp(format!("malformed line: {raw}")))?;

            if line.kind == 'm' {
                media.push(MediaDescription { lines: vec![line] });
            } else if let Some(current) = media.last_mut() {
                current.lines.push(line);
            } else {
                session.push(line);
            }
        }

        match session.first() {
            Some(first) if first.kind == 'v' => Ok(Self { session, media }),
            _ => Err(RtspError::Sdp("description must start with v=".to_string())),
        }
    }

    pub fn control(&self) -> Option<&str> {
        self.session.iter().find_map(|l| l.attribute_value("control"))
    }

    /// Total number of lines across all sections.
    pub fn line_count(&self) -> usize {
        self.session.len() + self.media.iter().map(|m| m.lines.len()).sum::<usize>()
    }
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let media_lines = self.media.iter().flat_map(|m| m.lines.iter());
        for line in self.session.iter().chain(media_lines) {
            write!(f, "{}\r\n", line)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAMERA_SDP: &str = "v=0\r\n\
        o=- 1 1 IN IP4 10.0.0.5\r\n\
        s=Camera\r\n\
        c=IN IP4 10.0.0.5\r\n\
        t=0 0\r\n\
        a=control:*\r\n\
        m=video 0 RTP/AVP 96\r\n\
        a=rtpmap:96 H264/90000\r\n\
        a=control:trackID=1\r\n\
        m=audio 0 RTP/AVP 97\r\n\
        a=rtpmap:97 MPEG4-GENERIC/48000/2\r\n\
        a=control:trackID=2\r\n";

    #[test]
    fn splits_session_and_media_sections() {
        let sdp = SessionDescription::parse(CAMERA_SDP).unwrap();
        assert_eq!(sdp.session.len(), 6);
        assert_eq!(sdp.media.len(), 2);
        assert_eq!(sdp.media[0].media_type(), "video");
        assert_eq!(sdp.media[1].media_type(), "audio");
        assert_eq!(sdp.control(), Some("*"));
        assert_eq!(sdp.media[1].control(), Some("trackID=2"));
    }

    #[test]
    fn display_is_verbatim() {
        let sdp = SessionDescription::parse(CAMERA_SDP).unwrap();
        assert_eq!(sdp.to_string(), CAMERA_SDP);
    }

    #[test]
    fn attribute_matching_is_exact() {
        let line = SdpLine::new('a', "controlx:foo");
        assert!(!line.is_attribute("control"));
        assert!(SdpLine::new('a', "recvonly").is_attribute("recvonly"));
        assert_eq!(
            SdpLine::new('a', "control:rtsp://h/x").attribute_value("control"),
            Some("rtsp://h/x")
        );
    }

    #[test]
    fn rejects_missing_version() {
        assert!(SessionDescription::parse("s=x\r\nm=video 0 RTP/AVP 96\r\n").is_err());
        assert!(SessionDescription::parse("v=0\r\ngarbage\r\n").is_err());
    }

    #[test]
    fn accepts_lf_endings() {
        let sdp = SessionDescription::parse("v=0\no=- 1 1 IN IP4 h\ns=x\nm=audio 0 RTP/AVP 0\n").unwrap();
        assert_eq!(sdp.line_count(), 4);
    }
}
