//! termwire - remote terminal for DB/C style application engines
//!
//! termwire connects to an application engine, runs the character-mode
//! handshake, and turns the engine's display stream into a live local
//! terminal with full keyin editing.
//!
//! # Quick Start
//!
//! ```text
//! termwire server.example.com          # Connect on the default port
//! termwire -u ops server.example.com   # Connect as user "ops"
//! termwire -a -g 43x132 server:9600    # 256-color mode, custom geometry
//! ```
//!
//! Settings not given on the command line come from
//! `~/.termwire/config.toml`.

use std::io::{self, Write};
use std::net::{Shutdown, TcpStream};
use std::time::{Duration, Instant};

use crossterm::cursor::{Hide, MoveTo, SetCursorStyle, Show};
use crossterm::event::{self, Event, KeyEventKind};
use crossterm::execute;
use crossterm::style::{
    Attribute, Color, ResetColor, SetAttribute, SetBackgroundColor, SetForegroundColor,
};
use crossterm::terminal::{self, Clear, ClearType, EnterAlternateScreen, LeaveAlternateScreen};
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use termwire::client::decoder::TerminalDevice;
use termwire::client::keyin::{KeyinField, Press};
use termwire::client::session::{
    hello, smart_greeting, spawn_reader, start_session, ClientEvent, ClientSession, KeyinRequest,
};
use termwire::config::Config;
use termwire::error::SessionError;
use termwire::keys::{self, map_key_event, TIMEOUT_FINISH};
use termwire::proto::frame::{FrameReader, FrameWriter};
use termwire::server::encoder::CursorStyle;
use termwire::term::cell::{graphic_char, ATTR_MASK};
use termwire::term::{Attrs, ColorMode, ShadowState};

/// Control port used when neither the command line nor the config file
/// names one.
const DEFAULT_PORT: u16 = 9584;

/// Version string from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_version() {
    eprintln!("termwire {}", VERSION);
}

fn print_help() {
    eprintln!("termwire {} - remote terminal for DB/C style engines", VERSION);
    eprintln!();
    eprintln!("Usage: termwire [OPTIONS] [HOST[:PORT]]");
    eprintln!();
    eprintln!("Connection options:");
    eprintln!("  -u, --user <NAME>     User name sent on session start");
    eprintln!("  -d, --dir <DIR>       Working directory sent on session start");
    eprintln!("  -k, --keepalive <S>   Keepalive interval in seconds (0 disables)");
    eprintln!();
    eprintln!("Terminal options:");
    eprintln!("  -a, --ansi            256-color cells instead of the legacy palette");
    eprintln!("  -g, --geometry <LxC>  Screen size, e.g. 24x80 or 43x132");
    eprintln!("  -x, --xkeys           Extended finish keys (ESC, TAB, INSERT..PGDN)");
    eprintln!();
    eprintln!("Other options:");
    eprintln!("  -v, --version         Show version");
    eprintln!("  -h, --help            Show this help");
    eprintln!();
    eprintln!("Examples:");
    eprintln!("  termwire db.example.com");
    eprintln!("  termwire -u ops -d /work db.example.com:9600");
    eprintln!();
    eprintln!("Configuration: ~/.termwire/config.toml");
    eprintln!();
    eprintln!("Exit: the engine ends the session; Ctrl+C sends a break");
}

fn parse_args() -> Result<Config, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::load();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "-v" | "--version" => {
                print_version();
                std::process::exit(0);
            }
            "-u" | "--user" => {
                i += 1;
                let value = args.get(i).ok_or("Missing user argument")?;
                config.user = value.clone();
            }
            "-d" | "--dir" => {
                i += 1;
                let value = args.get(i).ok_or("Missing dir argument")?;
                config.dir = value.clone();
            }
            "-k" | "--keepalive" => {
                i += 1;
                let value = args.get(i).ok_or("Missing keepalive argument")?;
                config.keepalive_secs = value
                    .parse()
                    .map_err(|_| format!("Bad keepalive interval: {}", value))?;
            }
            "-a" | "--ansi" => {
                config.color_mode = "ansi256".to_string();
            }
            "-x" | "--xkeys" => {
                config.terminal.xkeys = true;
            }
            "-g" | "--geometry" => {
                i += 1;
                let value = args.get(i).ok_or("Missing geometry argument")?;
                let (lines, columns) = value
                    .split_once('x')
                    .and_then(|(l, c)| Some((l.parse().ok()?, c.parse().ok()?)))
                    .ok_or_else(|| format!("Bad geometry (want LxC): {}", value))?;
                config.terminal.lines = lines;
                config.terminal.columns = columns;
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            host => {
                match host.rsplit_once(':') {
                    Some((name, port)) => {
                        config.host = Some(name.to_string());
                        config.port =
                            Some(port.parse().map_err(|_| format!("Bad port: {}", port))?);
                    }
                    None => config.host = Some(host.to_string()),
                }
            }
        }
        i += 1;
    }
    Ok(config)
}

/// Route log output to `~/.termwire/<log.file>`; stderr is the screen.
fn init_logging(config: &Config) {
    let log_path = match config.log_path() {
        Some(path) => path,
        None => return,
    };
    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .ok();

    if let Some(file) = log_file {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&config.log.level))
            .unwrap_or_else(|_| EnvFilter::new("info"));
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }
}

fn main() -> anyhow::Result<()> {
    let config = match parse_args() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("termwire: {}", err);
            eprintln!("Try 'termwire --help' for usage.");
            std::process::exit(2);
        }
    };
    init_logging(&config);
    info!("termwire {} starting", VERSION);
    run(config)
}

fn run(config: Config) -> anyhow::Result<()> {
    let host = config
        .host
        .clone()
        .ok_or_else(|| anyhow::anyhow!("no host given (command line or config file)"))?;
    let port = config.port.unwrap_or(DEFAULT_PORT);

    // Stage one: greeting and session grant on the control port.
    info!(%host, port, "connecting");
    let control = TcpStream::connect((host.as_str(), port))?;
    let mut reader = FrameReader::new(control.try_clone()?);
    let mut writer = FrameWriter::new(control);
    hello(&mut reader, &mut writer)?;
    let subport = start_session(&mut reader, &mut writer, port, &config.user, &config.dir)?;
    info!(subport, "sub-session granted");
    drop(reader);
    drop(writer);

    // Stage two: reconnect to the granted port and go interactive.
    let data = TcpStream::connect((host.as_str(), subport))?;
    let sock = data.try_clone()?;
    let mut reader = FrameReader::new(data.try_clone()?);
    let mut writer = FrameWriter::new(data);
    let server_version = smart_greeting(&mut reader, &mut writer, &config.utc_offset)?;
    info!(version = %server_version, "session established");

    let keepalive = if config.keepalive_secs == 0 {
        Duration::from_secs(u32::MAX as u64)
    } else {
        Duration::from_secs(config.keepalive_secs)
    };
    let (frames, running, handle) = spawn_reader(reader);
    let mut session = ClientSession::new(
        writer,
        frames,
        running.clone(),
        config.color_mode(),
        config.terminal.lines as u16,
        config.terminal.columns as u16,
        config.terminal.xkeys,
        keepalive,
    );

    let mut renderer = Renderer::new();
    renderer.init()?;
    let result = event_loop(&mut session, &mut renderer);
    renderer.cleanup();

    running.store(false, std::sync::atomic::Ordering::SeqCst);
    let _ = sock.shutdown(Shutdown::Both);
    let _ = handle.join();
    info!("session ended");
    result
}

fn event_loop<W: Write>(
    session: &mut ClientSession<W>,
    renderer: &mut Renderer,
) -> anyhow::Result<()> {
    renderer.draw(&session.decoder.shadow)?;
    while session.is_running() {
        // Keys outside a field only matter as break and trap traffic,
        // and traps only for keys the engine registered.
        if event::poll(Duration::from_millis(25))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    match map_key_event(&key) {
                        Some(keys::INTERRUPT) => session.send_break()?,
                        Some(code) if session.trap_map.contains(code) => {
                            session.send_trap(code)?
                        }
                        _ => {}
                    }
                }
            }
        }
        match session.poll(Duration::from_millis(25), renderer) {
            Ok(ClientEvent::Redraw) => renderer.draw(&session.decoder.shadow)?,
            Ok(ClientEvent::Keyin(req)) => {
                if !run_keyin(session, renderer, req)? {
                    break;
                }
            }
            Ok(ClientEvent::Quit) => break,
            Ok(ClientEvent::Canceled) | Ok(ClientEvent::Idle) => {}
            Err(SessionError::ConnectionClosed) => {
                info!("connection closed by engine");
                break;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// Run one field request to completion and send its reply.
///
/// Returns `false` when the engine quit underneath the field.
fn run_keyin<W: Write>(
    session: &mut ClientSession<W>,
    renderer: &mut Renderer,
    req: KeyinRequest,
) -> anyhow::Result<bool> {
    let mut answer: Vec<u8> = Vec::new();
    let mut endkey = keys::ENTER as i32;
    let mut trapped = false;

    for field in req.fields {
        let shadow = &session.decoder.shadow;
        let origin_v = shadow.v;
        let origin_h = shadow
            .h
            .saturating_add(answer.len() as u16)
            .min(shadow.columns - 1);
        let attrs = session.decoder.keyin.clone();
        let width = field.width;
        let mut editor = KeyinField::new(field, attrs.clone(), session.finish_map.clone());

        let deadline = match session.decoder.timeout.take() {
            Some(0) => {
                editor.force_finish(TIMEOUT_FINISH);
                None
            }
            Some(secs) => Some(Instant::now() + Duration::from_secs(secs as u64)),
            None => None,
        };

        renderer.draw_field(&session.decoder.shadow, origin_h, origin_v, width, &editor, attrs.echo)?;
        while !editor.is_done() {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    editor.force_finish(TIMEOUT_FINISH);
                    break;
                }
            }
            if event::poll(Duration::from_millis(25))? {
                if let Event::Key(key) = event::read()? {
                    if key.kind == KeyEventKind::Press {
                        if let Some(code) = map_key_event(&key) {
                            if code == keys::INTERRUPT && !session.finish_map.contains(code) {
                                session.send_break()?;
                                continue;
                            }
                            // A registered trap ends the whole request;
                            // the notification goes out ahead of the
                            // reply, finish keys take precedence.
                            if session.trap_map.contains(code)
                                && !session.finish_map.contains(code)
                            {
                                session.send_trap(code)?;
                                editor.force_finish(keys::ENTER as i32);
                                trapped = true;
                                continue;
                            }
                            match editor.press(code) {
                                Press::Rejected => renderer.beep(),
                                Press::Accepted | Press::Finished(_) => renderer.draw_field(
                                    &session.decoder.shadow,
                                    origin_h,
                                    origin_v,
                                    width,
                                    &editor,
                                    attrs.echo,
                                )?,
                            }
                        }
                    }
                }
            }
            // Service async engine traffic without blocking the editor.
            match session.poll(Duration::from_millis(1), renderer) {
                Ok(ClientEvent::Redraw) => {
                    renderer.draw(&session.decoder.shadow)?;
                    renderer.draw_field(
                        &session.decoder.shadow,
                        origin_h,
                        origin_v,
                        width,
                        &editor,
                        attrs.echo,
                    )?;
                }
                Ok(ClientEvent::Canceled) => {
                    session.reply_canceled(req.serial)?;
                    return Ok(true);
                }
                Ok(ClientEvent::Quit) => return Ok(false),
                Ok(ClientEvent::Keyin(_)) => {
                    warn!("keyin request while one is outstanding, dropped");
                }
                Ok(ClientEvent::Idle) => {}
                Err(SessionError::ConnectionClosed) => return Ok(false),
                Err(err) => return Err(err.into()),
            }
        }

        endkey = editor.endkey();
        answer.extend_from_slice(&editor.result());
        // A finish key other than ENTER, or a trap, ends the whole
        // request.
        if trapped || endkey != keys::ENTER as i32 {
            break;
        }
    }

    // The finished text lands in the shadow so both ends stay in step.
    if session.decoder.keyin.echo && !session.decoder.keyin.secret {
        session.decoder.shadow.write_text(&answer);
    }
    session.reply_keyin(req.serial, &answer, endkey)?;
    renderer.draw(&session.decoder.shadow)?;
    Ok(true)
}

/// Paints the shadow store onto the local terminal.
struct Renderer {
    initialized: bool,
    cursor_visible: bool,
}

impl Renderer {
    fn new() -> Self {
        Self {
            initialized: false,
            cursor_visible: true,
        }
    }

    /// Initialize the terminal for rendering
    fn init(&mut self) -> io::Result<()> {
        terminal::enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(
            stdout,
            EnterAlternateScreen,
            Clear(ClearType::All),
            MoveTo(0, 0)
        )?;
        stdout.flush()?;
        self.initialized = true;
        Ok(())
    }

    /// Restore the terminal
    fn cleanup(&mut self) {
        if !self.initialized {
            return;
        }
        let mut stdout = io::stdout();
        let _ = execute!(stdout, ResetColor, SetAttribute(Attribute::Reset));
        let _ = execute!(stdout, Show);
        let _ = execute!(stdout, LeaveAlternateScreen);
        let _ = terminal::disable_raw_mode();
        self.initialized = false;
    }

    /// Repaint the whole screen from the shadow store.
    fn draw(&mut self, shadow: &ShadowState) -> io::Result<()> {
        let mut stdout = io::stdout();
        execute!(stdout, Hide)?;
        let mut last_attr = None;
        for v in 0..shadow.lines {
            execute!(stdout, MoveTo(0, v))?;
            let mut run = String::with_capacity(shadow.columns as usize);
            for h in 0..shadow.columns {
                let cell = shadow.cell(h, v);
                let attr = cell.attr();
                if last_attr != Some(attr) {
                    if !run.is_empty() {
                        stdout.write_all(run.as_bytes())?;
                        run.clear();
                    }
                    apply_attr(&mut stdout, shadow.mode, attr)?;
                    last_attr = Some(attr);
                }
                run.push(visible_char(&cell));
            }
            if !run.is_empty() {
                stdout.write_all(run.as_bytes())?;
            }
        }
        execute!(stdout, MoveTo(shadow.h, shadow.v))?;
        if self.cursor_visible {
            execute!(stdout, Show)?;
        }
        stdout.flush()
    }

    /// Paint the live echo of a field under edit. The shadow is not
    /// touched until the field completes.
    fn draw_field(
        &mut self,
        shadow: &ShadowState,
        h: u16,
        v: u16,
        width: u16,
        editor: &KeyinField,
        echo: bool,
    ) -> io::Result<()> {
        let mut stdout = io::stdout();
        if echo {
            execute!(stdout, MoveTo(h, v))?;
            apply_attr(&mut stdout, shadow.mode, shadow.attr)?;
            let mut text = editor.display();
            text.truncate(width as usize);
            stdout.write_all(&text)?;
        }
        let offset = editor.cursor_offset().min(width.saturating_sub(1));
        execute!(stdout, MoveTo(h.saturating_add(offset), v), Show)?;
        stdout.flush()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.cleanup();
    }
}

impl TerminalDevice for Renderer {
    fn beep(&mut self) {
        let mut stdout = io::stdout();
        let _ = stdout.write_all(b"\x07");
        let _ = stdout.flush();
    }

    fn cursor_style(&mut self, style: CursorStyle) {
        let mut stdout = io::stdout();
        let result = match style {
            CursorStyle::Off => {
                self.cursor_visible = false;
                execute!(stdout, Hide)
            }
            CursorStyle::On | CursorStyle::Normal => {
                self.cursor_visible = true;
                execute!(stdout, Show, SetCursorStyle::DefaultUserShape)
            }
            CursorStyle::Uline | CursorStyle::Half => {
                self.cursor_visible = true;
                execute!(stdout, Show, SetCursorStyle::SteadyUnderScore)
            }
            CursorStyle::Block => {
                self.cursor_visible = true;
                execute!(stdout, Show, SetCursorStyle::SteadyBlock)
            }
        };
        if let Err(err) = result {
            debug!(%err, "cursor style");
        }
    }
}

/// Apply the display attributes packed into a cell or cursor attr word.
fn apply_attr(out: &mut impl Write, mode: ColorMode, word: u64) -> io::Result<()> {
    let flags = Attrs::from_bits_truncate(word & ATTR_MASK);
    execute!(out, SetAttribute(Attribute::Reset))?;
    if flags.contains(Attrs::BOLD) {
        execute!(out, SetAttribute(Attribute::Bold))?;
    }
    if flags.contains(Attrs::DIM) {
        execute!(out, SetAttribute(Attribute::Dim))?;
    }
    if flags.contains(Attrs::UNDERLINE) {
        execute!(out, SetAttribute(Attribute::Underlined))?;
    }
    if flags.contains(Attrs::BLINK) {
        execute!(out, SetAttribute(Attribute::SlowBlink))?;
    }
    if flags.contains(Attrs::REVERSE) {
        execute!(out, SetAttribute(Attribute::Reverse))?;
    }
    execute!(
        out,
        SetForegroundColor(cell_color(mode, mode.fg(word))),
        SetBackgroundColor(cell_color(mode, mode.bg(word)))
    )
}

/// The printable form of a cell; graphics go through the symbol table.
fn visible_char(cell: &termwire::term::PackedCell) -> char {
    if cell.flags().contains(Attrs::GRAPHIC) {
        graphic_char(cell.ch())
    } else {
        let b = cell.ch();
        if (0x20..0x7F).contains(&b) {
            b as char
        } else {
            ' '
        }
    }
}

fn cell_color(mode: ColorMode, index: u8) -> Color {
    match mode {
        ColorMode::Ansi256 => Color::AnsiValue(index),
        ColorMode::Legacy => match index {
            0 => Color::Black,
            1 => Color::DarkBlue,
            2 => Color::DarkGreen,
            3 => Color::DarkCyan,
            4 => Color::DarkRed,
            5 => Color::DarkMagenta,
            6 => Color::DarkYellow,
            7 => Color::Grey,
            8 => Color::DarkGrey,
            9 => Color::Blue,
            10 => Color::Green,
            11 => Color::Cyan,
            12 => Color::Red,
            13 => Color::Magenta,
            14 => Color::Yellow,
            _ => Color::White,
        },
    }
}
