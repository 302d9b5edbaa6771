//! Engine session.
//!
//! The engine drives the connection synchronously: display output
//! accumulates in the encoder, a flush ships it, and the operations
//! that need an answer (geometry, keyin) stamp a serial and block until
//! the reply that echoes it arrives. Anything else the client sends
//! while the engine waits is asynchronous traffic: keepalives, break,
//! trap notifications. A reply tag carrying the wrong serial means the
//! two ends disagree about where they are, and the session dies.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::client::decoder::FieldRequest;
use crate::error::{Result, SessionError};
use crate::keys::{KeyBitmap, ENTER, TIMEOUT_FINISH};
use crate::proto::element::{first_element, parse, Element};
use crate::proto::frame::{Frame, FrameError, FrameReader, FrameWriter};
use crate::server::encoder::Encoder;
use crate::term::{ColorMode, PackedCell};

/// Completed keyin: the field text plus the key that finished it.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyinResult {
    pub text: Vec<u8>,
    pub endkey: i32,
}

/// Keepalive interval used until the embedder sets one.
const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(20);

pub struct ServerSession<R: Read, W: Write> {
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
    pub encoder: Encoder,
    trap_map: KeyBitmap,
    traps: VecDeque<u16>,
    break_seen: bool,
    saved: Vec<Vec<PackedCell>>,
    keepalive: Duration,
    last_recv: Instant,
    last_send: Instant,
}

impl<R: Read, W: Write> ServerSession<R, W> {
    pub fn new(reader: FrameReader<R>, writer: FrameWriter<W>, mode: ColorMode) -> Self {
        Self {
            reader,
            writer,
            // placeholder geometry until the client reports its own
            encoder: Encoder::new(mode, 24, 80),
            trap_map: KeyBitmap::new(),
            traps: VecDeque::new(),
            break_seen: false,
            saved: Vec::new(),
            keepalive: DEFAULT_KEEPALIVE,
            last_recv: Instant::now(),
            last_send: Instant::now(),
        }
    }

    /// Pace the dead-peer check. The transport's read timeout should sit
    /// near this interval so `await_reply` wakes up to run it.
    pub fn set_keepalive(&mut self, interval: Duration) {
        self.keepalive = interval;
    }

    /// Ask the client for its screen extents and size the mirror to
    /// match. Must run before any display output.
    pub fn negotiate_geometry(&mut self) -> Result<(u16, u16)> {
        let mode = self.encoder.shadow.mode;
        let serial = self.writer.send_request(b"<getwindow/>")?;
        let frame = self.await_reply(serial)?;
        let nodes = parse(&frame.payload)?;
        let elem = first_element(&nodes).ok_or_else(|| {
            SessionError::HandshakeProtocol("empty getwindow reply".into())
        })?;
        let lines = elem.int_attr("b").unwrap_or(23).max(0) as u16 + 1;
        let columns = elem.int_attr("r").unwrap_or(79).max(0) as u16 + 1;
        self.encoder = Encoder::new(mode, lines, columns);
        info!(lines, columns, "client geometry");
        Ok((lines, columns))
    }

    /// Ship any pending display output as its own frame.
    pub fn flush(&mut self) -> Result<()> {
        if !self.encoder.is_empty() {
            let payload = self.encoder.take();
            self.writer.send_request(&payload)?;
        }
        Ok(())
    }

    /// Send a keyin request: pending display output, then the fields
    /// wrapped in `<k>`. Returns the serial the reply must echo.
    pub fn send_keyin(&mut self, fields: &[FieldRequest]) -> Result<u32> {
        let mut payload = self.encoder.take();
        payload.extend_from_slice(b"<k>");
        for field in fields {
            field.to_elem().serialize_into(&mut payload);
        }
        payload.extend_from_slice(b"</k>");
        Ok(self.writer.send_request(&payload)?)
    }

    /// Block until the reply for `serial`, then unpack it.
    pub fn await_keyin(&mut self, serial: u32) -> Result<KeyinResult> {
        let frame = self.await_reply(serial)?;
        let nodes = parse(&frame.payload)?;
        let elem = first_element(&nodes)
            .ok_or_else(|| SessionError::HandshakeProtocol("empty keyin reply".into()))?;
        let endkey = match elem.get_attr("e") {
            None => ENTER as i32,
            Some("0") => TIMEOUT_FINISH,
            Some(v) => v.parse().unwrap_or(0),
        };
        let text = elem.text_content();
        // The client echoes the finished field at the cursor; the mirror
        // has to follow or the next snapshot diff drifts.
        if self.encoder.keyin.echo && !self.encoder.keyin.secret {
            self.encoder.shadow.write_text(&text);
        }
        Ok(KeyinResult { text, endkey })
    }

    pub fn keyin(&mut self, fields: &[FieldRequest]) -> Result<KeyinResult> {
        let serial = self.send_keyin(fields)?;
        self.await_keyin(serial)
    }

    /// Wait for the frame answering `serial`, servicing asynchronous
    /// client traffic on the way. A read timeout from the transport is
    /// a wakeup, not an error: an alive check goes out and the wait
    /// resumes until the grace period runs out.
    fn await_reply(&mut self, serial: u32) -> Result<Frame> {
        loop {
            let frame = match self.reader.read_frame() {
                Ok(frame) => frame,
                Err(FrameError::Io(err))
                    if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
                {
                    if self.last_recv.elapsed() >= self.keepalive * 4 {
                        return Err(SessionError::KeepaliveExpired);
                    }
                    if self.last_send.elapsed() >= self.keepalive {
                        self.send_alivechk()?;
                    }
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            self.last_recv = Instant::now();
            let nodes = parse(&frame.payload)?;
            let tag = first_element(&nodes).map(|e| e.tag.clone()).unwrap_or_default();
            match tag.as_str() {
                "alivechk" => debug!("alivechk"),
                "break" => self.break_seen = true,
                "t" => {
                    if let Some(elem) = first_element(&nodes) {
                        self.note_trap(elem);
                    }
                }
                _ => {
                    frame.check_serial(serial)?;
                    return Ok(frame);
                }
            }
        }
    }

    fn note_trap(&mut self, elem: &Element) {
        let text = elem.text_content();
        let code = std::str::from_utf8(&text)
            .ok()
            .and_then(|t| t.trim().parse::<u16>().ok());
        match code {
            Some(code) if self.trap_map.contains(code) => self.traps.push_back(code),
            Some(code) => debug!(code, "trap for unregistered key"),
            None => debug!("unreadable trap notification"),
        }
    }

    // --- traps and break ---

    /// Register trap keys on the client. A match mid-keyin forces the
    /// field to finish and comes back as a `<t>` notification.
    pub fn set_traps(&mut self, codes: &[u16]) -> Result<()> {
        for &code in codes {
            self.trap_map.set(code);
        }
        self.writer.send_request(&endkey_payload("ts", codes))?;
        Ok(())
    }

    pub fn clear_traps(&mut self, codes: &[u16]) -> Result<()> {
        for &code in codes {
            self.trap_map.clear(code);
            self.traps.retain(|&c| c != code);
        }
        self.writer.send_request(&endkey_payload("tc", codes))?;
        Ok(())
    }

    pub fn clear_all_traps(&mut self) -> Result<()> {
        self.trap_map = KeyBitmap::new();
        self.traps.clear();
        self.writer.send_request(b"<tc><all/></tc>")?;
        Ok(())
    }

    pub fn take_trap(&mut self) -> Option<u16> {
        self.traps.pop_front()
    }

    pub fn take_break(&mut self) -> bool {
        std::mem::take(&mut self.break_seen)
    }

    // --- endkey maps ---

    /// Add finish keys on the client: printable keys travel as text,
    /// anything else as a `<c>` child.
    pub fn set_endkeys(&mut self, codes: &[u16]) -> Result<()> {
        self.writer.send_request(&endkey_payload("se", codes))?;
        Ok(())
    }

    pub fn clear_endkeys(&mut self, codes: &[u16]) -> Result<()> {
        self.writer.send_request(&endkey_payload("ce", codes))?;
        Ok(())
    }

    pub fn clear_all_endkeys(&mut self) -> Result<()> {
        self.writer.send_request(b"<ce><all/></ce>")?;
        Ok(())
    }

    // --- screen state stack ---

    /// Remember the whole mirror as it stands.
    pub fn save_screen(&mut self) {
        let s = &self.encoder.shadow;
        self.saved
            .push(s.get_rect(0, s.lines - 1, 0, s.columns - 1));
    }

    /// Pop the newest saved screen back into the mirror and ship it to
    /// the client as a snapshot restore.
    pub fn restore_screen(&mut self) -> Result<()> {
        if let Some(cells) = self.saved.pop() {
            let (lines, columns) = (self.encoder.shadow.lines, self.encoder.shadow.columns);
            self.encoder
                .shadow
                .put_rect(0, lines - 1, 0, columns - 1, &cells);
            self.encoder.put_restore();
            self.flush()?;
        }
        Ok(())
    }

    // --- lifecycle ---

    pub fn cancel_keyin(&mut self) -> Result<()> {
        self.writer.send_request(b"<cancel/>")?;
        Ok(())
    }

    pub fn send_alivechk(&mut self) -> Result<()> {
        self.writer.send_request(b"<alivechk/>")?;
        self.last_send = Instant::now();
        Ok(())
    }

    pub fn last_heard(&self) -> Instant {
        self.last_recv
    }

    /// Orderly shutdown: tell the client, then stop sending.
    pub fn quit(&mut self) -> Result<()> {
        self.writer.send_request(b"<quit/>")?;
        self.writer.shutdown();
        Ok(())
    }
}

fn endkey_payload(tag: &str, codes: &[u16]) -> Vec<u8> {
    let mut elem = Element::new(tag);
    let mut chars = Vec::new();
    for &code in codes {
        if (0x20..0x7F).contains(&code) {
            chars.push(code as u8);
        } else {
            elem = elem.child(Element::new("c").text(code.to_string().as_bytes()));
        }
    }
    if !chars.is_empty() {
        elem = elem.text(&chars);
    }
    elem.to_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys;

    fn wire(serial: &str, payload: &str) -> Vec<u8> {
        format!("{}{:08}{}", serial, payload.len(), payload).into_bytes()
    }

    fn server(incoming: Vec<u8>) -> ServerSession<std::io::Cursor<Vec<u8>>, Vec<u8>> {
        ServerSession::new(
            FrameReader::new(std::io::Cursor::new(incoming)),
            FrameWriter::new(Vec::new()),
            ColorMode::Legacy,
        )
    }

    fn sent(s: &ServerSession<std::io::Cursor<Vec<u8>>, Vec<u8>>) -> String {
        String::from_utf8(s.writer.get_ref().clone()).unwrap()
    }

    #[test]
    fn test_geometry_negotiation() {
        let mut s = server(wire("00000001", "<getwindow b=42 r=131/>"));
        let (lines, columns) = s.negotiate_geometry().unwrap();
        assert_eq!((lines, columns), (43, 132));
        assert_eq!(s.encoder.shadow.lines, 43);
        assert_eq!(sent(&s), "0000000100000012<getwindow/>");
    }

    #[test]
    fn test_keyin_round_trip() {
        let mut s = server(wire("00000001", "<r>AB   </r>"));
        let field = FieldRequest {
            numeric: false,
            width: 5,
            right_digits: 0,
            comma_decimal: false,
            max_keys: None,
            edit: false,
            prefill: b"ABCDE".to_vec(),
        };
        let result = s.keyin(&[field]).unwrap();
        assert_eq!(result.text, b"AB   ");
        assert_eq!(result.endkey, ENTER as i32);
        assert_eq!(sent(&s), "0000000100000025<k><cf w=5>ABCDE</cf></k>");
    }

    #[test]
    fn test_keyin_echo_lands_in_mirror() {
        let mut s = server(wire("00000001", "<r>hi</r>"));
        s.encoder.shadow.set_cursor(3, 0);
        let serial = s.writer.send_request(b"<k><cf w=2/></k>").unwrap();
        s.await_keyin(serial).unwrap();
        assert_eq!(s.encoder.shadow.cell(3, 0).ch(), b'h');
        assert_eq!(s.encoder.shadow.cell(4, 0).ch(), b'i');

        // secret fields never touch the mirror
        let mut s = server(wire("00000001", "<r>pw</r>"));
        s.encoder.keyin.secret = true;
        let serial = s.writer.send_request(b"<k><cf w=2/></k>").unwrap();
        s.await_keyin(serial).unwrap();
        assert_eq!(s.encoder.shadow.cell(0, 0).ch(), b' ');
    }

    #[test]
    fn test_keyin_endkey_and_timeout_forms() {
        let mut s = server(wire("00000001", "<r e=305>x</r>"));
        let serial = s.writer.send_request(b"<k><cf w=1/></k>").unwrap();
        let result = s.await_keyin(serial).unwrap();
        assert_eq!(result.endkey, (keys::F1 + 4) as i32);

        let mut s = server(wire("00000001", "<r e=0/>"));
        let serial = s.writer.send_request(b"<k><cf w=1/></k>").unwrap();
        let result = s.await_keyin(serial).unwrap();
        assert_eq!(result.endkey, TIMEOUT_FINISH);
        assert!(result.text.is_empty());
    }

    #[test]
    fn test_async_traffic_while_waiting() {
        let mut incoming = wire("00000011", "<alivechk/>");
        incoming.extend(wire("00000012", "<t>505</t>"));
        incoming.extend(wire("00000013", "<break/>"));
        incoming.extend(wire("00000002", "<r>done </r>"));
        let mut s = server(incoming);
        s.set_traps(&[keys::INTERRUPT]).unwrap();

        let serial = s.writer.send_request(b"<k><cf w=5/></k>").unwrap();
        let result = s.await_keyin(serial).unwrap();
        assert_eq!(result.text, b"done ");
        assert_eq!(s.take_trap(), Some(keys::INTERRUPT));
        assert_eq!(s.take_trap(), None);
        assert!(s.take_break());
        assert!(!s.take_break());
    }

    #[test]
    fn test_trap_registration_marshalled() {
        let mut s = server(Vec::new());
        s.set_traps(&[b'x' as u16, keys::F1]).unwrap();
        s.clear_traps(&[b'x' as u16]).unwrap();
        s.clear_all_traps().unwrap();
        assert_eq!(
            sent(&s),
            "0000000100000020<ts><c>301</c>x</ts>\
             0000000200000010<tc>x</tc>\
             0000000300000015<tc><all/></tc>"
        );
        assert_eq!(s.take_trap(), None);
    }

    #[test]
    fn test_silent_client_expires_keepalive() {
        /// Reader whose socket read timeout fires forever.
        struct Stalled;
        impl std::io::Read for Stalled {
            fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
                Err(std::io::Error::from(ErrorKind::WouldBlock))
            }
        }
        let mut s = ServerSession::new(
            FrameReader::new(Stalled),
            FrameWriter::new(Vec::new()),
            ColorMode::Legacy,
        );
        s.set_keepalive(Duration::ZERO);
        let serial = s.writer.send_request(b"<k><cf w=1/></k>").unwrap();
        let err = s.await_keyin(serial).unwrap_err();
        assert!(matches!(err, SessionError::KeepaliveExpired));
    }

    #[test]
    fn test_unregistered_trap_dropped() {
        let mut incoming = wire("00000011", "<t>301</t>");
        incoming.extend(wire("00000001", "<r/>"));
        let mut s = server(incoming);
        let serial = s.writer.send_request(b"<k><cf w=1/></k>").unwrap();
        s.await_keyin(serial).unwrap();
        assert_eq!(s.take_trap(), None);
    }

    #[test]
    fn test_serial_mismatch_is_fatal() {
        let mut s = server(wire("00000009", "<r>late</r>"));
        let serial = s.writer.send_request(b"<k><cf w=4/></k>").unwrap();
        let err = s.await_keyin(serial).unwrap_err();
        assert!(matches!(
            err,
            SessionError::Frame(crate::proto::frame::FrameError::SerialMismatch { expected: 1, .. })
        ));
    }

    #[test]
    fn test_endkey_payloads() {
        let mut s = server(Vec::new());
        s.set_endkeys(&[b'x' as u16, keys::ESCAPE, b'z' as u16])
            .unwrap();
        s.clear_all_endkeys().unwrap();
        assert_eq!(
            sent(&s),
            "0000000100000021<se><c>257</c>xz</se>\
             0000000200000015<ce><all/></ce>"
        );
    }

    #[test]
    fn test_save_restore_reaches_client() {
        let mut s = server(Vec::new());
        s.encoder.put(&crate::server::encoder::DisplayOp::Text(b"keep".to_vec()));
        s.flush().unwrap();
        s.save_screen();
        s.encoder.put(&crate::server::encoder::DisplayOp::EraseScreen);
        s.flush().unwrap();
        s.restore_screen().unwrap();
        assert_eq!(s.encoder.shadow.cell(0, 0).ch(), b'k');
        assert!(sent(&s).contains("<scrnrest>"));
    }

    #[test]
    fn test_flush_skips_empty() {
        let mut s = server(Vec::new());
        s.flush().unwrap();
        assert!(sent(&s).is_empty());
    }
}
