//! Streaming framer : a two-mode state machine that turns an
//! incoming byte stream into an ordered sequence of [`FramerEvent`]s, and
//! serializes outgoing [`Chunk`]s back to bytes.
//!
//! Wired into `tokio_util::codec::Framed` via the `Decoder`/`Encoder`
//! impls below, so any `Framed<S, Framer>` gets a `Stream`/`Sink` of
//! whole chunk-boundary events for free.

use std::collections::VecDeque;

use bytes::{Buf, Bytes, BytesMut};
use regex::bytes::Regex as BytesRegex;
use tokio_util::codec::{Decoder, Encoder};

use crate::chunk::{Chunk, ContFlag, FirstLine};

lazy_static::lazy_static! {
    static ref FIRST_LINE_RE: regex::Regex = regex::Regex::new(
        r"^MSRP ([A-Za-z0-9][A-Za-z0-9.+%=-]{3,31}) (?:([A-Z_]+)|(\d{3})(?: (.+))?)$"
    ).unwrap();
}

/// Default per-line cap.
pub const MAX_LINE_LENGTH: usize = 16384;
/// Default header-line cap.
pub const MAX_HEADER_LINES: usize = 64;

/// One event out of the framer.
#[derive(Debug)]
pub enum FramerEvent {
    DataStart(Chunk),
    DataWrite(Bytes),
    DataFinalWrite(Bytes),
    DataEnd(ContFlag),
    /// Not one of the four RFC event tags; surfaces a byte run the framer
    /// discarded (bad first line, unparsable header, cap exceeded) so it
    /// can reach a `TrafficLogger::received_illegal_data` hook.
    Illegal(Bytes),
}

struct PendingChunk {
    chunk: Chunk,
    header_lines: usize,
}

struct RawMatcher {
    /// `(?s)^(.*)TERMINATOR([$#+])\r\n(.*)$`, TERMINATOR escaped.
    term_regex: BytesRegex,
    /// Proper prefixes of `TERMINATOR<flag>\r\n`, longest first, checked
    /// against the tail of the buffer so a terminator split across two
    /// reads isn't mistaken for payload.
    substrings: Vec<Vec<u8>>,
}

impl RawMatcher {
    fn new(transaction_id: &str) -> Self {
        let terminator = format!("\r\n-------{}", transaction_id);
        let pattern = format!(r"(?s)^(.*){}([$#+])\r\n(.*)$", regex::escape(&terminator));
        let term_regex = BytesRegex::new(&pattern).expect("valid terminator regex");

        let term_bytes = terminator.as_bytes();
        let mut substrings: Vec<Vec<u8>> =
            (1..=term_bytes.len()).map(|i| term_bytes[..i].to_vec()).collect();
        for flag in ['$', '+', '#'] {
            let mut ext = term_bytes.to_vec();
            ext.push(flag as u8);
            // len+1 (just the flag) and len+2 (flag + \r) — the len+3 case
            // (flag + \r\n) is a full match, handled by `term_regex`.
            substrings.push(ext.clone());
            ext.push(b'\r');
            substrings.push(ext);
        }
        substrings.sort_by_key(|b| std::cmp::Reverse(b.len()));

        Self { term_regex, substrings }
    }
}

enum Mode {
    Idle,
    Headers(PendingChunk),
    Payload(Chunk, RawMatcher),
}

/// The framer state machine. Use via the `Decoder`/`Encoder`
/// impls with `tokio_util::codec::Framed`, or drive it directly with
/// [`Framer::decode_from`] for in-process tests.
pub struct Framer {
    mode: Mode,
    queue: VecDeque<FramerEvent>,
    max_line_length: usize,
    max_header_lines: usize,
}

impl Default for Framer {
    fn default() -> Self {
        Self {
            mode: Mode::Idle,
            queue: VecDeque::new(),
            max_line_length: MAX_LINE_LENGTH,
            max_header_lines: MAX_HEADER_LINES,
        }
    }
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs the state machine forward as far as `src` allows, then returns
    /// the next queued event (if any).
    pub fn decode_from(&mut self, src: &mut BytesMut) -> Option<FramerEvent> {
        if let Some(event) = self.queue.pop_front() {
            return Some(event);
        }
        while self.step(src) {
            if !self.queue.is_empty() {
                break;
            }
        }
        self.queue.pop_front()
    }

    /// Advances the state machine by (at most) one line/match. Returns
    /// `true` if progress was made (more stepping may be profitable),
    /// `false` if the machine is blocked awaiting more bytes.
    fn step(&mut self, src: &mut BytesMut) -> bool {
        match &mut self.mode {
            Mode::Idle => self.step_idle(src),
            Mode::Headers(_) => self.step_headers(src),
            Mode::Payload(_, _) => self.step_payload(src),
        }
    }

    fn take_line(&mut self, src: &mut BytesMut) -> Option<Result<Bytes, Bytes>> {
        if let Some(pos) = find_crlf(src) {
            if pos > self.max_line_length {
                let discarded = src.split_to(pos + 2).freeze();
                return Some(Err(discarded));
            }
            let line = src.split_to(pos).freeze();
            src.advance(2); // the CRLF itself
            Some(Ok(line))
        } else if src.len() > self.max_line_length {
            // No terminator within the cap: the current line is too long.
            // Discard everything accumulated so far.
            let discarded = src.split_to(src.len()).freeze();
            Some(Err(discarded))
        } else {
            None
        }
    }

    fn step_idle(&mut self, src: &mut BytesMut) -> bool {
        match self.take_line(src) {
            Some(Ok(line)) => {
                let text = match std::str::from_utf8(&line) {
                    Ok(t) => t,
                    Err(_) => {
                        self.queue.push_back(FramerEvent::Illegal(line));
                        return true;
                    }
                };
                match FIRST_LINE_RE.captures(text) {
                    Some(caps) => {
                        let transaction_id = caps[1].to_string();
                        let chunk = if let Some(method) = caps.get(2) {
                            Chunk::request(transaction_id, method.as_str())
                        } else {
                            let code: u16 = caps[3].parse().unwrap();
                            let comment = caps.get(4).map(|m| m.as_str().to_string());
                            Chunk::response(transaction_id, code, comment)
                        };
                        self.mode = Mode::Headers(PendingChunk { chunk, header_lines: 0 });
                    }
                    None => self.queue.push_back(FramerEvent::Illegal(line)),
                }
                true
            }
            Some(Err(discarded)) => {
                self.queue.push_back(FramerEvent::Illegal(discarded));
                true
            }
            None => false,
        }
    }

    fn step_headers(&mut self, src: &mut BytesMut) -> bool {
        let line = match self.take_line(src) {
            Some(Ok(line)) => line,
            Some(Err(discarded)) => {
                self.queue.push_back(FramerEvent::Illegal(discarded));
                self.mode = Mode::Idle;
                return true;
            }
            None => return false,
        };

        let transaction_id = match &self.mode {
            Mode::Headers(pending) => pending.chunk.transaction_id().to_string(),
            _ => unreachable!(),
        };

        // Edge case : a chunk with no headers and no blank
        // line, whose end-line immediately follows the first line.
        let bare_terminator = format!("-------{}", transaction_id);
        if let Some(rest) = line.strip_prefix(bare_terminator.as_bytes()) {
            if rest.len() == 1 {
                if let Some(flag) = ContFlag::from_char(rest[0] as char) {
                    let Mode::Headers(pending) = std::mem::replace(&mut self.mode, Mode::Idle) else {
                        unreachable!()
                    };
                    self.queue.push_back(FramerEvent::DataStart(pending.chunk));
                    self.queue.push_back(FramerEvent::DataEnd(flag));
                    return true;
                }
            }
        }

        if line.is_empty() {
            let Mode::Headers(pending) = std::mem::replace(&mut self.mode, Mode::Idle) else {
                unreachable!()
            };
            let matcher = RawMatcher::new(pending.chunk.transaction_id());
            self.queue.push_back(FramerEvent::DataStart(pending.chunk.clone()));
            self.mode = Mode::Payload(pending.chunk, matcher);
            return true;
        }

        let Mode::Headers(pending) = &mut self.mode else { unreachable!() };

        pending.header_lines += 1;
        if pending.header_lines > self.max_header_lines {
            self.queue.push_back(FramerEvent::Illegal(line));
            self.mode = Mode::Idle;
            return true;
        }

        // A line without the `: ` separator is silently dropped rather
        // than treated as a framing error — lenient on purpose.
        if let Ok(text) = std::str::from_utf8(&line) {
            if let Some((name, value)) = text.split_once(": ") {
                pending.chunk.add_header_text(name, value);
            }
        }
        true
    }

    fn step_payload(&mut self, src: &mut BytesMut) -> bool {
        let Mode::Payload(_, matcher) = &self.mode else { unreachable!() };
        if let Some(caps) = matcher.term_regex.captures(&src[..]) {
            let contents = caps.get(1).unwrap().as_bytes().to_vec();
            let flag_byte = caps.get(2).unwrap().as_bytes()[0];
            let extra_len = caps.get(3).unwrap().as_bytes().len();
            let consumed = src.len() - extra_len;

            let Mode::Payload(_, _) = std::mem::replace(&mut self.mode, Mode::Idle) else {
                unreachable!()
            };
            if !contents.is_empty() {
                self.queue.push_back(FramerEvent::DataFinalWrite(Bytes::from(contents)));
            }
            let flag = ContFlag::from_char(flag_byte as char).expect("regex only matches $+#");
            self.queue.push_back(FramerEvent::DataEnd(flag));
            src.advance(consumed);
            return true;
        }

        // No full match yet: hold back the longest possible terminator
        // prefix, stream the rest out as a write.
        let hold = matcher
            .substrings
            .iter()
            .find(|term| src.len() >= term.len() && src[src.len() - term.len()..] == term[..]);

        match hold {
            Some(term) if term.len() == src.len() => false, // whole buffer could still be a terminator
            Some(term) => {
                let emit_len = src.len() - term.len();
                let data = src.split_to(emit_len).freeze();
                self.queue.push_back(FramerEvent::DataWrite(data));
                true
            }
            None => {
                if src.is_empty() {
                    false
                } else {
                    let data = src.split_to(src.len()).freeze();
                    self.queue.push_back(FramerEvent::DataWrite(data));
                    true
                }
            }
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

impl Decoder for Framer {
    type Item = FramerEvent;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.decode_from(src))
    }
}

impl Encoder<Chunk> for Framer {
    type Error = std::io::Error;

    fn encode(&mut self, mut item: Chunk, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&item.encode());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(framer: &mut Framer, buf: &mut BytesMut) -> Vec<FramerEvent> {
        let mut events = Vec::new();
        while let Some(event) = framer.decode_from(buf) {
            events.push(event);
        }
        events
    }

    #[test]
    fn simple_send_with_payload() {
        let wire = b"MSRP abcd SEND\r\nTo-Path: msrp://b.example;tcp\r\nFrom-Path: msrp://a.example;tcp\r\nContent-Type: text/plain\r\n\r\nhello\r\n-------abcd$\r\n";
        let mut buf = BytesMut::from(&wire[..]);
        let mut framer = Framer::new();
        let events = drain(&mut framer, &mut buf);
        assert!(matches!(events[0], FramerEvent::DataStart(_)));
        let payload: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                FramerEvent::DataWrite(b) | FramerEvent::DataFinalWrite(b) => Some(b.to_vec()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(payload, b"hello");
        assert!(matches!(events.last(), Some(FramerEvent::DataEnd(ContFlag::Complete))));
    }

    #[test]
    fn zero_payload_no_blank_line() {
        let wire = b"MSRP abcd SEND\r\n-------abcd$\r\n";
        let mut buf = BytesMut::from(&wire[..]);
        let mut framer = Framer::new();
        let events = drain(&mut framer, &mut buf);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], FramerEvent::DataStart(_)));
        assert!(matches!(events[1], FramerEvent::DataEnd(ContFlag::Complete)));
    }

    #[test]
    fn payload_split_across_many_buffers() {
        let whole = b"MSRP abcd SEND\r\nTo-Path: msrp://b.example;tcp\r\nFrom-Path: msrp://a.example;tcp\r\nContent-Type: text/plain\r\n\r\nhello world\r\n-------abcd$\r\n".to_vec();
        let mut framer = Framer::new();
        let mut buf = BytesMut::new();
        let mut all_events = Vec::new();
        for byte in &whole {
            buf.extend_from_slice(&[*byte]);
            while let Some(event) = framer.decode_from(&mut buf) {
                all_events.push(event);
            }
        }
        let payload: Vec<u8> = all_events
            .iter()
            .filter_map(|e| match e {
                FramerEvent::DataWrite(b) | FramerEvent::DataFinalWrite(b) => Some(b.to_vec()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(payload, b"hello world");
        assert!(matches!(all_events.last(), Some(FramerEvent::DataEnd(ContFlag::Complete))));
    }

    #[test]
    fn too_many_headers_discards_chunk() {
        let mut wire = String::from("MSRP abcd SEND\r\n");
        for i in 0..70 {
            wire.push_str(&format!("X-Extra-{}: v\r\n", i));
        }
        let mut buf = BytesMut::from(wire.as_bytes());
        let mut framer = Framer::new();
        let events = drain(&mut framer, &mut buf);
        assert!(events.iter().any(|e| matches!(e, FramerEvent::Illegal(_))));
        assert!(!events.iter().any(|e| matches!(e, FramerEvent::DataStart(_))));
    }

    #[test]
    fn header_without_separator_is_dropped_silently() {
        let wire = b"MSRP abcd SEND\r\nTo-Path: msrp://b.example;tcp\r\nFrom-Path: msrp://a.example;tcp\r\nGarbageLine\r\n\r\n-------abcd$\r\n";
        let mut buf = BytesMut::from(&wire[..]);
        let mut framer = Framer::new();
        let events = drain(&mut framer, &mut buf);
        let chunk = events.iter().find_map(|e| match e {
            FramerEvent::DataStart(c) => Some(c),
            _ => None,
        }).unwrap();
        assert!(!chunk.has_header("GarbageLine"));
        assert!(chunk.has_header("To-Path"));
    }

    #[test]
    fn continuation_flag_plus() {
        let wire = b"MSRP abcd SEND\r\nTo-Path: msrp://b.example;tcp\r\nFrom-Path: msrp://a.example;tcp\r\n\r\npart1\r\n-------abcd+\r\n";
        let mut buf = BytesMut::from(&wire[..]);
        let mut framer = Framer::new();
        let events = drain(&mut framer, &mut buf);
        assert!(matches!(events.last(), Some(FramerEvent::DataEnd(ContFlag::Continued))));
    }

    #[test]
    fn payload_containing_terminator_like_bytes_of_other_transaction() {
        // Payload contains a dash-run that is NOT our transaction's
        // terminator and must be passed through as data.
        let wire = b"MSRP abcd SEND\r\nTo-Path: msrp://b.example;tcp\r\nFrom-Path: msrp://a.example;tcp\r\n\r\n-------wxyz$\r\n-------abcd$\r\n";
        let mut buf = BytesMut::from(&wire[..]);
        let mut framer = Framer::new();
        let events = drain(&mut framer, &mut buf);
        let payload: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                FramerEvent::DataWrite(b) | FramerEvent::DataFinalWrite(b) => Some(b.to_vec()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(payload, b"-------wxyz$\r\n");
    }
}
