//! Frame extraction for self-delimited XML messages.
//!
//! The peer writes one element after another with no length prefix, so the
//! only way to find a message boundary is to look at the markup itself.
//! [`XmlCodec`] is a two-state machine over the receive buffer:
//!
//! ```text
//!            '>' found, "/>"              end tag found
//!          ┌───────────────┐          ┌──────────────────┐
//!          ▼               │          │                  ▼
//!   SeekingOpen ───────────┴──► SeekingClose ──── emit ──► SeekingOpen
//!              '>' found, paired tag
//! ```
//!
//! Boundary detection runs on raw bytes. A fragment is decoded as UTF-8 and
//! parsed only once its closing boundary has arrived, so a read that splits
//! a message (or a multi-byte character) anywhere yields the same messages
//! as one large read.
//!
//! The closing boundary is the first literal occurrence of `</name>`; nested
//! elements with the same name as the outer element are not tracked. Payload
//! text that may contain markup has to travel as raw text (CDATA).

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::LinkError;
use crate::message::Message;

// ── FrameState ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Default)]
enum FrameState {
    /// Between messages: looking for the end of the opening tag.
    #[default]
    SeekingOpen,

    /// Inside a paired element: looking for its closing tag literal.
    SeekingClose {
        end_tag: Vec<u8>,
        /// Buffer length already searched without finding `end_tag`.
        scanned: usize,
    },
}

// ── XmlCodec ─────────────────────────────────────────────────────

/// `tokio_util` codec turning a byte stream into [`Message`]s and back.
#[derive(Debug, Default)]
pub struct XmlCodec {
    state: FrameState,
}

impl XmlCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// The closing tag the codec is waiting for, if it is inside a
    /// partially received element.
    pub fn awaiting(&self) -> Option<String> {
        match &self.state {
            FrameState::SeekingOpen => None,
            FrameState::SeekingClose { end_tag, .. } => {
                Some(String::from_utf8_lossy(end_tag).into_owned())
            }
        }
    }

    /// Length of the first complete frame in `buf`, or `None` if more
    /// bytes are needed. Discards inter-message whitespace, comments and
    /// declarations in front of the frame.
    fn frame_len(&mut self, buf: &mut BytesMut) -> Result<Option<usize>, LinkError> {
        if let FrameState::SeekingOpen = self.state {
            loop {
                let skip = buf.iter().take_while(|b| b.is_ascii_whitespace()).count();
                buf.advance(skip);

                if buf.is_empty() {
                    return Ok(None);
                }
                if buf[0] != b'<' {
                    let upto = find(buf, b"<", 0).unwrap_or(buf.len());
                    return Err(LinkError::malformed(
                        String::from_utf8_lossy(&buf[..upto]),
                        "unexpected data between messages",
                    ));
                }

                let prolog_end = if buf.starts_with(b"<?") {
                    Some(b"?>".as_slice())
                } else if buf.starts_with(b"<!--") {
                    Some(b"-->".as_slice())
                } else {
                    None
                };
                match prolog_end {
                    Some(marker) => match find(buf, marker, 2) {
                        Some(pos) => buf.advance(pos + marker.len()),
                        None => return Ok(None),
                    },
                    None => break,
                }
            }

            if buf.len() > 1 && matches!(buf[1], b'/' | b'!') {
                // A partial comment opener still needs more bytes.
                if buf.len() < 4 && b"<!--".starts_with(&buf[..]) {
                    return Ok(None);
                }
                let upto = find(buf, b">", 0).map_or(buf.len(), |end| end + 1);
                return Err(LinkError::malformed(
                    String::from_utf8_lossy(&buf[..upto]),
                    "no element starts here",
                ));
            }

            let Some(end) = find(buf, b">", 0) else {
                return Ok(None);
            };

            if buf[end - 1] == b'/' {
                return Ok(Some(end + 1));
            }

            let name_end = buf[..end]
                .iter()
                .position(|b| b.is_ascii_whitespace())
                .unwrap_or(end);
            let name = &buf[1..name_end];
            if name.is_empty() {
                return Err(LinkError::malformed(
                    String::from_utf8_lossy(&buf[..=end]),
                    "opening tag without a name",
                ));
            }

            let mut end_tag = Vec::with_capacity(name.len() + 3);
            end_tag.extend_from_slice(b"</");
            end_tag.extend_from_slice(name);
            end_tag.push(b'>');
            self.state = FrameState::SeekingClose {
                end_tag,
                scanned: 0,
            };
        }

        let FrameState::SeekingClose { end_tag, scanned } = &mut self.state else {
            return Ok(None);
        };

        // Resume where the last search stopped, backing off far enough to
        // catch a tag split across two reads.
        let from = scanned.saturating_sub(end_tag.len() - 1).max(1);
        match find(buf, &end_tag[..], from) {
            Some(pos) => {
                let len = pos + end_tag.len();
                self.state = FrameState::SeekingOpen;
                Ok(Some(len))
            }
            None => {
                *scanned = buf.len();
                Ok(None)
            }
        }
    }
}

impl Decoder for XmlCodec {
    type Item = Message;
    type Error = LinkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(len) = self.frame_len(src)? else {
            return Ok(None);
        };

        let frame = src.split_to(len);
        let text = std::str::from_utf8(&frame)?;
        Message::parse(text).map(Some)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // A trailing partial fragment is left in the buffer for diagnostics
        // rather than reported as an error.
        self.decode(buf)
    }
}

impl Encoder<&Message> for XmlCodec {
    type Error = LinkError;

    fn encode(&mut self, item: &Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(item.to_xml().as_bytes());
        Ok(())
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() || needle.len() > haystack.len() - from {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}
