//! Client session.
//!
//! Connection lifecycle, built around one background reader thread
//! feeding a channel the foreground drains:
//!
//! 1. greet the main port, check the server release
//! 2. request a sub-session and reconnect to the port it names
//! 3. exchange version/utc-offset greetings
//! 4. steady state: apply display frames, run keyin fields, send one
//!    reply per field request, keep the link alive when idle
//!
//! All protocol state lives on the foreground thread; the reader thread
//! only moves raw frames.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::client::decoder::{Decoder, FieldRequest, TerminalDevice};
use crate::error::{Result, SessionError};
use crate::keys::{KeyBitmap, ENTER, TIMEOUT_FINISH};
use crate::proto::element::{first_element, parse, Element, Node};
use crate::proto::frame::{Frame, FrameError, FrameReader, FrameWriter, Serial, SERIAL_LEN};
use crate::term::ColorMode;

/// Release string this client reports in its greetings.
pub const CLIENT_RELEASE: &str = "16.2";

/// Read-side half of the greeting, shared by both connect stages.
fn expect_ok<R: Read>(reader: &mut FrameReader<R>) -> Result<Vec<u8>> {
    let frame = reader.read_frame()?;
    let nodes = parse(&frame.payload)?;
    let elem = first_element(&nodes)
        .ok_or_else(|| SessionError::HandshakeProtocol("empty greeting reply".into()))?;
    match elem.tag.as_str() {
        "ok" => Ok(elem.text_content()),
        "err" => Err(SessionError::HandshakeRejected(
            String::from_utf8_lossy(&elem.text_content()).into_owned(),
        )),
        tag => Err(SessionError::HandshakeProtocol(format!(
            "expected ok or err, got {}",
            tag
        ))),
    }
}

fn major_of(release: &str) -> Option<u32> {
    release.split('.').next()?.trim().parse().ok()
}

/// First round trip on the main port: `<hello>` and the release check.
/// A server newer than this client is refused.
pub fn hello<R: Read, W: Write>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
) -> Result<()> {
    let greeting = format!("<hello>DB/C SC {}</hello>", CLIENT_RELEASE);
    writer.send(Serial::Greeting, greeting.as_bytes())?;
    let banner = expect_ok(reader)?;
    let banner = String::from_utf8_lossy(&banner).into_owned();
    let server_major = banner
        .rsplit(' ')
        .next()
        .and_then(major_of)
        .ok_or_else(|| SessionError::HandshakeProtocol(format!("bad banner: {}", banner)))?;
    let client_major = major_of(CLIENT_RELEASE).unwrap_or(0);
    if server_major > client_major {
        return Err(SessionError::VersionMismatch {
            server: server_major,
            client: client_major,
        });
    }
    info!(banner = %banner, "server accepted greeting");
    Ok(())
}

/// Second round trip: ask for a sub-session. The reply names the port
/// to reconnect to.
pub fn start_session<R: Read, W: Write>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    port: u16,
    user: &str,
    dir: &str,
) -> Result<u16> {
    let start = Element::new("start")
        .attr("port", port)
        .attr("user", user)
        .attr("dir", dir)
        .attr("encryption", "n");
    writer.send(Serial::Greeting, &start.to_bytes())?;
    let reply = expect_ok(reader)?;
    std::str::from_utf8(&reply)
        .ok()
        .and_then(|t| t.trim().parse().ok())
        .ok_or_else(|| {
            SessionError::HandshakeProtocol(format!(
                "bad sub-session port: {}",
                String::from_utf8_lossy(&reply)
            ))
        })
}

/// Version and utc-offset exchange on the sub-session connection.
pub fn smart_greeting<R: Read, W: Write>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    utc_offset: &str,
) -> Result<String> {
    let greeting = Element::new("smartclient")
        .attr("version", CLIENT_RELEASE)
        .attr("utcoffset", utc_offset);
    writer.send(Serial::Greeting, &greeting.to_bytes())?;
    let frame = reader.read_frame()?;
    let nodes = parse(&frame.payload)?;
    match first_element(&nodes) {
        Some(elem) if elem.tag == "smartserver" => {
            Ok(elem.get_attr("version").unwrap_or_default().to_string())
        }
        _ => Err(SessionError::HandshakeProtocol(
            "expected smartserver greeting".into(),
        )),
    }
}

/// Spawn the reader thread. Frames and read errors flow through the
/// channel; the flag drops when the reader stops for any reason.
pub fn spawn_reader<R: Read + Send + 'static>(
    mut reader: FrameReader<R>,
) -> (
    Receiver<std::result::Result<Frame, FrameError>>,
    Arc<AtomicBool>,
    JoinHandle<()>,
) {
    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        loop {
            if !flag.load(Ordering::SeqCst) {
                break;
            }
            match reader.read_frame() {
                Ok(frame) => {
                    if tx.send(Ok(frame)).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    let _ = tx.send(Err(err));
                    break;
                }
            }
        }
        flag.store(false, Ordering::SeqCst);
    });
    (rx, running, handle)
}

/// What the foreground loop should do with a frame it was handed.
#[derive(Debug, PartialEq)]
pub enum ClientEvent {
    /// Screen content changed; repaint.
    Redraw,
    /// A keyin request to run; reply exactly once with `reply_keyin`.
    Keyin(KeyinRequest),
    /// The pending keyin was canceled by the engine.
    Canceled,
    /// Orderly shutdown requested by the engine.
    Quit,
    /// Nothing for the caller (keepalive, map updates).
    Idle,
}

#[derive(Debug, PartialEq)]
pub struct KeyinRequest {
    pub serial: [u8; SERIAL_LEN],
    pub fields: Vec<FieldRequest>,
}

pub struct ClientSession<W: Write> {
    pub writer: FrameWriter<W>,
    pub decoder: Decoder,
    pub finish_map: KeyBitmap,
    /// Keys the engine wants `<t>` notifications for.
    pub trap_map: KeyBitmap,
    frames: Receiver<std::result::Result<Frame, FrameError>>,
    running: Arc<AtomicBool>,
    keepalive: Duration,
    last_recv: Instant,
    last_send: Instant,
}

impl<W: Write> ClientSession<W> {
    pub fn new(
        writer: FrameWriter<W>,
        frames: Receiver<std::result::Result<Frame, FrameError>>,
        running: Arc<AtomicBool>,
        mode: ColorMode,
        lines: u16,
        columns: u16,
        xkeys: bool,
        keepalive: Duration,
    ) -> Self {
        Self {
            writer,
            decoder: Decoder::new(mode, lines, columns),
            finish_map: KeyBitmap::default_finish_map(xkeys),
            trap_map: KeyBitmap::new(),
            frames,
            running,
            keepalive,
            last_recv: Instant::now(),
            last_send: Instant::now(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Wait up to `timeout` for a frame and handle it.
    pub fn poll(&mut self, timeout: Duration, device: &mut dyn TerminalDevice) -> Result<ClientEvent> {
        match self.frames.recv_timeout(timeout) {
            Ok(Ok(frame)) => {
                self.last_recv = Instant::now();
                self.handle_frame(frame, device)
            }
            Ok(Err(err)) => Err(err.into()),
            Err(RecvTimeoutError::Timeout) => {
                self.tick()?;
                Ok(ClientEvent::Idle)
            }
            Err(RecvTimeoutError::Disconnected) => Err(SessionError::ConnectionClosed),
        }
    }

    /// Idle housekeeping: keep the link warm, notice a dead peer.
    fn tick(&mut self) -> Result<()> {
        if self.last_send.elapsed() >= self.keepalive {
            self.send_alivechk()?;
        }
        if self.last_recv.elapsed() >= self.keepalive * 4 {
            return Err(SessionError::KeepaliveExpired);
        }
        Ok(())
    }

    pub fn handle_frame(
        &mut self,
        frame: Frame,
        device: &mut dyn TerminalDevice,
    ) -> Result<ClientEvent> {
        let nodes = parse(&frame.payload)?;
        let mut event = ClientEvent::Idle;
        let mut redraw = false;
        // Display nodes are applied where they stand; element order
        // within one message is part of the protocol.
        for node in &nodes {
            let elem = match node {
                Node::Elem(elem) => elem,
                Node::Text(text) => {
                    self.decoder.shadow.write_text(text);
                    redraw = true;
                    continue;
                }
            };
            match elem.tag.as_str() {
                "getwindow" => self.reply_getwindow(frame.serial)?,
                "k" => {
                    event = ClientEvent::Keyin(self.read_keyin(frame.serial, elem, device)?);
                }
                "se" => Self::update_keymap(&mut self.finish_map, elem, true),
                "ce" => Self::update_keymap(&mut self.finish_map, elem, false),
                "ts" => Self::update_keymap(&mut self.trap_map, elem, true),
                "tc" => Self::update_keymap(&mut self.trap_map, elem, false),
                "alivechk" => debug!("alivechk"),
                "cancel" => event = ClientEvent::Canceled,
                "quit" => {
                    self.writer.shutdown();
                    self.running.store(false, Ordering::SeqCst);
                    return Ok(ClientEvent::Quit);
                }
                _ => {
                    self.decoder.apply(elem, device)?;
                    redraw = true;
                }
            }
        }
        if redraw && event == ClientEvent::Idle {
            event = ClientEvent::Redraw;
        }
        Ok(event)
    }

    fn reply_getwindow(&mut self, serial: [u8; SERIAL_LEN]) -> Result<()> {
        let reply = Element::new("getwindow")
            .attr("b", self.decoder.shadow.lines - 1)
            .attr("r", self.decoder.shadow.columns - 1);
        self.send(Serial::Echo(serial), &reply.to_bytes())
    }

    /// Pull the field requests out of a `<k>` wrapper. Presentation
    /// elements inside it go through the decoder first, so the field
    /// sees the echo and case state the engine just set.
    fn read_keyin(
        &mut self,
        serial: [u8; SERIAL_LEN],
        k: &Element,
        device: &mut dyn TerminalDevice,
    ) -> Result<KeyinRequest> {
        let mut fields = Vec::new();
        for child in k.child_elems() {
            if let Some(req) = FieldRequest::from_elem(child) {
                fields.push(req);
            } else {
                self.decoder.apply(child, device)?;
            }
        }
        Ok(KeyinRequest { serial, fields })
    }

    /// Shared set/clear logic for the endkey and trap maps: printable
    /// keys travel as text, anything else as `<c>` children, and
    /// `<all/>` on a clear empties the map.
    fn update_keymap(map: &mut KeyBitmap, elem: &Element, set: bool) {
        if !set && elem.child_elems().any(|c| c.tag == "all") {
            map.clear_all();
            return;
        }
        for &ch in &elem.text_content() {
            if set {
                map.set(ch as u16);
            } else {
                map.clear(ch as u16);
            }
        }
        for child in elem.child_elems() {
            if child.tag == "c" {
                if let Some(code) = child
                    .text_content()
                    .iter()
                    .try_fold(0u16, |acc, &d| {
                        d.is_ascii_digit()
                            .then(|| acc * 10 + (d - b'0') as u16)
                    })
                {
                    if set {
                        map.set(code);
                    } else {
                        map.clear(code);
                    }
                }
            }
        }
    }

    /// The one reply a field request gets: `<r e=K>text</r>`, with the
    /// endkey attribute left off for a plain ENTER and `0` standing in
    /// for a timeout.
    pub fn reply_keyin(
        &mut self,
        serial: [u8; SERIAL_LEN],
        text: &[u8],
        endkey: i32,
    ) -> Result<()> {
        let mut reply = Element::new("r");
        if endkey == TIMEOUT_FINISH {
            reply = reply.attr("e", 0);
        } else if endkey != ENTER as i32 {
            reply = reply.attr("e", endkey);
        }
        if !text.is_empty() {
            reply = reply.text(text);
        }
        self.send(Serial::Echo(serial), &reply.to_bytes())
    }

    /// Empty reply for a canceled field.
    pub fn reply_canceled(&mut self, serial: [u8; SERIAL_LEN]) -> Result<()> {
        warn!("keyin canceled by engine");
        self.send(Serial::Echo(serial), Element::new("r").to_bytes().as_slice())
    }

    pub fn send_alivechk(&mut self) -> Result<()> {
        let payload = b"<alivechk/>".to_vec();
        self.writer.send_request(&payload)?;
        self.last_send = Instant::now();
        Ok(())
    }

    pub fn send_break(&mut self) -> Result<()> {
        self.writer.send_request(b"<break/>")?;
        self.last_send = Instant::now();
        Ok(())
    }

    /// Asynchronous trap notification for a hot key.
    pub fn send_trap(&mut self, code: u16) -> Result<()> {
        let trap = Element::new("t").text(code.to_string().as_bytes());
        self.writer.send_request(&trap.to_bytes())?;
        self.last_send = Instant::now();
        Ok(())
    }

    fn send(&mut self, serial: Serial, payload: &[u8]) -> Result<()> {
        self.writer.send(serial, payload)?;
        self.last_send = Instant::now();
        Ok(())
    }
}
