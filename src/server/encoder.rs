//! Display command encoder.
//!
//! The engine expresses screen updates as [`DisplayOp`] values; the
//! encoder turns them into element text in a pending output buffer and
//! mirrors every one into a private [`ShadowState`]. The mirror is what
//! makes the stream cheap: an attribute, color or cursor position the
//! client already has produces no output at all.
//!
//! Output survives an allocation failure: the buffer latches, further
//! output is discarded, and [`Encoder::cancel_puts`] clears the latch.

use tracing::error;

use crate::proto::element::escape_into;
use crate::term::cell::GRAPHIC_TAGS;
use crate::term::{Attrs, ColorMode, RollDir, ShadowState};

/// Minimum run length worth a counted repeat element.
pub const REPEAT_MIN: usize = 30;

/// Cursor presentation styles, `<cursor>block</cursor>` and friends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CursorStyle {
    On,
    Off,
    Normal,
    Uline,
    Half,
    Block,
}

impl CursorStyle {
    pub fn as_str(self) -> &'static str {
        match self {
            CursorStyle::On => "on",
            CursorStyle::Off => "off",
            CursorStyle::Normal => "norm",
            CursorStyle::Uline => "uline",
            CursorStyle::Half => "half",
            CursorStyle::Block => "block",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "on" => Some(CursorStyle::On),
            "off" => Some(CursorStyle::Off),
            "norm" => Some(CursorStyle::Normal),
            "uline" => Some(CursorStyle::Uline),
            "half" => Some(CursorStyle::Half),
            "block" => Some(CursorStyle::Block),
            _ => None,
        }
    }
}

/// Letter case handling for keyed input.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum KeyCase {
    #[default]
    Normal,
    Upper,
    Lower,
    Invert,
}

/// Field justification applied when a typed field completes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Justify {
    #[default]
    None,
    Left,
    Right,
}

/// Keyin presentation state the encoder diffs against.
#[derive(Clone, Debug, PartialEq)]
pub struct KeyinAttrs {
    pub echo: bool,
    pub secret: bool,
    pub echo_char: u8,
    pub auto_enter: bool,
    pub edit: bool,
    pub click: bool,
    pub overstrike: bool,
    pub case: KeyCase,
    pub justify: Justify,
    pub zero_fill: bool,
}

impl Default for KeyinAttrs {
    fn default() -> Self {
        Self {
            echo: true,
            secret: false,
            echo_char: b'*',
            auto_enter: false,
            edit: false,
            click: false,
            overstrike: false,
            case: KeyCase::Normal,
            justify: Justify::None,
            zero_fill: false,
        }
    }
}

/// One display operation, engine's view.
#[derive(Clone, Debug, PartialEq)]
pub enum DisplayOp {
    Text(Vec<u8>),
    RepeatDown { ch: u8, count: u16 },
    SetCursor { h: u16, v: u16 },
    MoveH(i32),
    MoveV(i32),
    SetWindow { top: u16, bottom: u16, left: u16, right: u16 },
    ResetWindow,
    Reverse(bool),
    Underline(bool),
    Blink(bool),
    Bold(bool),
    Dim(bool),
    AllOff,
    Fg(u8),
    Bg(u8),
    EraseScreen,
    EraseFrom,
    EraseLine,
    Roll(RollDir),
    OpenLine,
    CloseLine,
    InsertLine,
    DeleteLine,
    InsertChar { h: u16, v: u16 },
    DeleteChar { h: u16, v: u16 },
    CarriageReturn,
    NewLine,
    LineFeed,
    HomeUp,
    HomeDown,
    EndUp,
    EndDown,
    Graphic(u8),
    Cursor(CursorStyle),
    HorzDouble(bool),
    VertDouble(bool),
    Beep,
    Click,
    Echo(bool),
    EchoSecret(bool),
    EchoChar(u8),
    AutoEnter(bool),
    Edit(bool),
    ClickMode(bool),
    Overstrike(bool),
    Case(KeyCase),
    JustifyRight,
    JustifyLeft,
    ZeroFill,
    /// Clears justification and zero-fill ahead of the next field.
    KbdReset,
    Timeout(u32),
}

pub struct Encoder {
    pub shadow: ShadowState,
    pub keyin: KeyinAttrs,
    cursor_style: CursorStyle,
    buf: Vec<u8>,
    nomem: bool,
}

impl Encoder {
    pub fn new(mode: ColorMode, lines: u16, columns: u16) -> Self {
        Self {
            shadow: ShadowState::new(mode, lines, columns),
            keyin: KeyinAttrs::default(),
            cursor_style: CursorStyle::Normal,
            buf: Vec::with_capacity(crate::proto::frame::INIT_SIZE),
            nomem: false,
        }
    }

    /// Pending element text, leaving the buffer empty.
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Drop pending output and clear the no-memory latch.
    pub fn cancel_puts(&mut self) {
        self.buf.clear();
        self.nomem = false;
    }

    pub fn out_of_memory(&self) -> bool {
        self.nomem
    }

    fn put_raw(&mut self, bytes: &[u8]) {
        if self.nomem {
            return;
        }
        if self.buf.try_reserve(bytes.len()).is_err() {
            error!("ERR: NO MEMORY");
            self.nomem = true;
            return;
        }
        self.buf.extend_from_slice(bytes);
    }

    fn put_str(&mut self, s: &str) {
        self.put_raw(s.as_bytes());
    }

    fn put_text(&mut self, text: &[u8]) {
        if self.nomem {
            return;
        }
        let mut escaped = Vec::new();
        escape_into(text, &mut escaped);
        self.put_raw(&escaped);
    }

    pub fn put(&mut self, op: &DisplayOp) {
        match *op {
            DisplayOp::Text(ref text) => self.put_text_runs(text),
            DisplayOp::RepeatDown { ch, count } => {
                self.put_str(&format!("<rptdown n={}>", count));
                self.put_text(&[ch]);
                self.put_str("</rptdown>");
                self.shadow.repeat_down(ch, count);
            }
            DisplayOp::SetCursor { h, v } => self.set_cursor(h, v),
            DisplayOp::MoveH(delta) => {
                if delta != 0 {
                    self.put_str(&format!("<ha>{}</ha>", delta));
                    self.shadow.move_h(delta);
                }
            }
            DisplayOp::MoveV(delta) => {
                if delta != 0 {
                    self.put_str(&format!("<va>{}</va>", delta));
                    self.shadow.move_v(delta);
                }
            }
            DisplayOp::SetWindow { top, bottom, left, right } => {
                self.put_str(&format!(
                    "<setsw t={} b={} l={} r={}/>",
                    top, bottom, left, right
                ));
                self.shadow.set_window(top, bottom, left, right);
            }
            DisplayOp::ResetWindow => {
                self.put_str("<resetsw/>");
                self.shadow.reset_window();
            }
            DisplayOp::Reverse(on) => self.flag(Attrs::REVERSE, on, "<revon/>", "<revoff/>"),
            DisplayOp::Underline(on) => self.flag(Attrs::UNDERLINE, on, "<ulon/>", "<uloff/>"),
            DisplayOp::Blink(on) => self.flag(Attrs::BLINK, on, "<blinkon/>", "<blinkoff/>"),
            DisplayOp::Bold(on) => self.flag(Attrs::BOLD, on, "<boldon/>", "<boldoff/>"),
            DisplayOp::Dim(on) => self.flag(Attrs::DIM, on, "<dimon/>", "<dimoff/>"),
            DisplayOp::AllOff => {
                if self.shadow.attr & Attrs::all().bits() != 0 {
                    self.put_str("<alloff/>");
                    self.shadow.all_flags_off();
                }
            }
            DisplayOp::Fg(color) => {
                if self.shadow.fg() != color {
                    self.put_color(color, false);
                    self.shadow.set_fg(color);
                }
            }
            DisplayOp::Bg(color) => {
                if self.shadow.bg() != color {
                    self.put_color(color, true);
                    self.shadow.set_bg(color);
                }
            }
            DisplayOp::EraseScreen => {
                self.put_str("<es/>");
                self.shadow.erase_screen();
            }
            DisplayOp::EraseFrom => {
                self.put_str("<ef/>");
                self.shadow.erase_from();
            }
            DisplayOp::EraseLine => {
                self.put_str("<el/>");
                self.shadow.erase_line();
            }
            DisplayOp::Roll(dir) => {
                self.put_str(match dir {
                    RollDir::Up => "<ru/>",
                    RollDir::Down => "<rd/>",
                    RollDir::Left => "<scrleft/>",
                    RollDir::Right => "<scrright/>",
                });
                self.shadow.roll(dir);
            }
            DisplayOp::OpenLine => {
                self.put_str("<opnlin/>");
                self.shadow.open_line();
            }
            DisplayOp::CloseLine => {
                self.put_str("<clslin/>");
                self.shadow.close_line();
            }
            DisplayOp::InsertLine => {
                self.put_str("<inslin/>");
                self.shadow.insert_line();
            }
            DisplayOp::DeleteLine => {
                self.put_str("<dellin/>");
                self.shadow.delete_line();
            }
            DisplayOp::InsertChar { h, v } => {
                self.put_str(&format!("<inschr h={} v={}/>", h, v));
                self.shadow.insert_char(h, v);
            }
            DisplayOp::DeleteChar { h, v } => {
                self.put_str(&format!("<delchr h={} v={}/>", h, v));
                self.shadow.delete_char(h, v);
            }
            DisplayOp::CarriageReturn => {
                self.put_str("<cr/>");
                self.shadow.carriage_return();
            }
            DisplayOp::NewLine => {
                self.put_str("<nl/>");
                self.shadow.new_line();
            }
            DisplayOp::LineFeed => {
                self.put_str("<lf/>");
                self.shadow.line_feed();
            }
            DisplayOp::HomeUp => {
                self.put_str("<hu/>");
                self.shadow.home_up();
            }
            DisplayOp::HomeDown => {
                self.put_str("<hd/>");
                self.shadow.home_down();
            }
            DisplayOp::EndUp => {
                self.put_str("<eu/>");
                self.shadow.end_up();
            }
            DisplayOp::EndDown => {
                self.put_str("<ed/>");
                self.shadow.end_down();
            }
            DisplayOp::Graphic(sym) => {
                if let Some(tag) = GRAPHIC_TAGS.get(sym as usize) {
                    self.put_str(&format!("<{}/>", tag));
                    self.shadow.write_graphic(sym);
                }
            }
            DisplayOp::Cursor(style) => {
                if self.cursor_style != style {
                    self.put_str(&format!("<cursor>{}</cursor>", style.as_str()));
                    self.cursor_style = style;
                }
            }
            DisplayOp::HorzDouble(on) => {
                self.put_str(if on { "<hdblon/>" } else { "<hdbloff/>" });
                self.shadow.set_dbl(crate::term::shadow::DBL_HORZ, on);
            }
            DisplayOp::VertDouble(on) => {
                self.put_str(if on { "<vdblon/>" } else { "<vdbloff/>" });
                self.shadow.set_dbl(crate::term::shadow::DBL_VERT, on);
            }
            DisplayOp::Beep => self.put_str("<b/>"),
            DisplayOp::Click => self.put_str("<click/>"),
            DisplayOp::Echo(on) => {
                if self.keyin.echo != on {
                    self.put_str(if on { "<eon/>" } else { "<eoff/>" });
                    self.keyin.echo = on;
                }
            }
            DisplayOp::EchoSecret(on) => {
                if self.keyin.secret != on {
                    self.put_str(if on { "<eson/>" } else { "<esoff/>" });
                    self.keyin.secret = on;
                }
            }
            DisplayOp::EchoChar(ch) => {
                if self.keyin.echo_char != ch {
                    self.put_str("<eschar>");
                    self.put_text(&[ch]);
                    self.put_str("</eschar>");
                    self.keyin.echo_char = ch;
                }
            }
            DisplayOp::AutoEnter(on) => {
                if self.keyin.auto_enter != on {
                    self.put_str(if on { "<kcon/>" } else { "<kcoff/>" });
                    self.keyin.auto_enter = on;
                }
            }
            DisplayOp::Edit(on) => {
                if self.keyin.edit != on {
                    self.put_str(if on { "<editon/>" } else { "<editoff/>" });
                    self.keyin.edit = on;
                }
            }
            DisplayOp::ClickMode(on) => {
                if self.keyin.click != on {
                    self.put_str(if on { "<clickon/>" } else { "<clickoff/>" });
                    self.keyin.click = on;
                }
            }
            DisplayOp::Overstrike(on) => {
                if self.keyin.overstrike != on {
                    self.put_str(if on { "<ovsmode/>" } else { "<insmode/>" });
                    self.keyin.overstrike = on;
                }
            }
            DisplayOp::Case(case) => {
                if self.keyin.case != case {
                    self.put_str(match case {
                        KeyCase::Upper => "<uc/>",
                        KeyCase::Lower => "<lc/>",
                        KeyCase::Invert => "<it/>",
                        KeyCase::Normal => "<in/>",
                    });
                    self.keyin.case = case;
                }
            }
            DisplayOp::JustifyRight => {
                if self.keyin.justify != Justify::Right {
                    self.put_str("<jr/>");
                    self.keyin.justify = Justify::Right;
                }
            }
            DisplayOp::JustifyLeft => {
                if self.keyin.justify != Justify::Left {
                    self.put_str("<jl/>");
                    self.keyin.justify = Justify::Left;
                }
            }
            DisplayOp::ZeroFill => {
                if !self.keyin.zero_fill {
                    self.put_str("<zf/>");
                    self.keyin.zero_fill = true;
                }
            }
            DisplayOp::KbdReset => {
                if self.keyin.justify != Justify::None || self.keyin.zero_fill {
                    self.put_str("<kbdrst/>");
                    self.keyin.justify = Justify::None;
                    self.keyin.zero_fill = false;
                }
            }
            DisplayOp::Timeout(secs) => {
                self.put_str(&format!("<timeout n={}/>", secs));
            }
        }
    }

    /// Resend the whole mirror as a snapshot restore element.
    pub fn put_restore(&mut self) {
        let body = crate::term::snapshot::encode(
            &self.shadow,
            0,
            self.shadow.lines - 1,
            0,
            self.shadow.columns - 1,
        );
        self.put_str("<scrnrest>");
        self.put_text(&body);
        self.put_str("</scrnrest>");
    }

    /// Emit the shortest cursor element that gets the client there.
    fn set_cursor(&mut self, h: u16, v: u16) {
        let (ch, cv) = (self.shadow.h, self.shadow.v);
        if (h, v) == (ch, cv) {
            return;
        }
        if v == cv {
            self.put_str(&format!("<h>{}</h>", h));
        } else if h == ch {
            self.put_str(&format!("<v>{}</v>", v));
        } else {
            self.put_str(&format!("<p h={} v={}/>", h, v));
        }
        self.shadow.set_cursor(h, v);
    }

    fn flag(&mut self, flag: Attrs, on: bool, tag_on: &str, tag_off: &str) {
        if self.shadow.has_flag(flag) == on {
            return;
        }
        self.put_str(if on { tag_on } else { tag_off });
        self.shadow.set_flag(flag, on);
    }

    fn put_color(&mut self, color: u8, background: bool) {
        if let Some(tag) = self.shadow.mode.color_tag(color) {
            if background {
                self.put_str(&format!("<bg{}/>", tag));
            } else {
                self.put_str(&format!("<{}/>", tag));
            }
        } else if background {
            self.put_str(&format!("<bgcolor v={}/>", color));
        } else {
            self.put_str(&format!("<color v={}/>", color));
        }
    }

    /// Emit text, folding long single-character runs into counted
    /// repeat elements.
    fn put_text_runs(&mut self, text: &[u8]) {
        let mut i = 0;
        while i < text.len() {
            let ch = text[i];
            let mut run = 1;
            while i + run < text.len() && text[i + run] == ch {
                run += 1;
            }
            if run >= REPEAT_MIN {
                self.put_str(&format!("<rptchar n={}>", run));
                self.put_text(&[ch]);
                self.put_str("</rptchar>");
            } else {
                self.put_text(&text[i..i + run]);
            }
            self.shadow.write_text(&text[i..i + run]);
            i += run;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoder() -> Encoder {
        Encoder::new(ColorMode::Legacy, 24, 80)
    }

    fn drain(enc: &mut Encoder) -> String {
        String::from_utf8(enc.take()).unwrap()
    }

    #[test]
    fn test_attribute_idempotence() {
        let mut enc = encoder();
        enc.put(&DisplayOp::Reverse(true));
        enc.put(&DisplayOp::Reverse(true));
        enc.put(&DisplayOp::Bold(true));
        assert_eq!(drain(&mut enc), "<revon/><boldon/>");
        enc.put(&DisplayOp::Reverse(false));
        enc.put(&DisplayOp::Reverse(false));
        assert_eq!(drain(&mut enc), "<revoff/>");
    }

    #[test]
    fn test_color_names_follow_mode() {
        let mut enc = encoder();
        enc.put(&DisplayOp::Fg(1));
        enc.put(&DisplayOp::Bg(4));
        assert_eq!(drain(&mut enc), "<blue/><bgred/>");

        let mut enc = Encoder::new(ColorMode::Ansi256, 24, 80);
        enc.put(&DisplayOp::Fg(1));
        enc.put(&DisplayOp::Fg(196));
        assert_eq!(drain(&mut enc), "<red/><color v=196/>");
    }

    #[test]
    fn test_same_color_not_resent() {
        let mut enc = encoder();
        enc.put(&DisplayOp::Fg(2));
        enc.put(&DisplayOp::Fg(2));
        assert_eq!(drain(&mut enc), "<green/>");
        // white is the starting foreground
        enc.put(&DisplayOp::Fg(2));
        enc.put(&DisplayOp::Fg(7));
        assert_eq!(drain(&mut enc), "<white/>");
    }

    #[test]
    fn test_cursor_shortest_form() {
        let mut enc = encoder();
        enc.put(&DisplayOp::SetCursor { h: 10, v: 5 });
        enc.put(&DisplayOp::SetCursor { h: 20, v: 5 });
        enc.put(&DisplayOp::SetCursor { h: 20, v: 8 });
        enc.put(&DisplayOp::SetCursor { h: 20, v: 8 });
        assert_eq!(drain(&mut enc), "<p h=10 v=5/><h>20</h><v>8</v>");
    }

    #[test]
    fn test_text_mirrors_and_escapes() {
        let mut enc = encoder();
        enc.put(&DisplayOp::Text(b"a<b".to_vec()));
        assert_eq!(drain(&mut enc), "a&lt;b");
        assert_eq!(enc.shadow.cell(1, 0).ch(), b'<');
        assert_eq!(enc.shadow.h, 3);
    }

    #[test]
    fn test_long_run_becomes_rptchar() {
        let mut enc = encoder();
        let mut text = vec![b'X'; 50];
        text.extend_from_slice(b"end");
        enc.put(&DisplayOp::Text(text));
        assert_eq!(drain(&mut enc), "<rptchar n=50>X</rptchar>end");
        assert_eq!(enc.shadow.cell(49, 0).ch(), b'X');
        assert_eq!(enc.shadow.cell(52, 0).ch(), b'd');
    }

    #[test]
    fn test_short_run_stays_literal() {
        let mut enc = encoder();
        enc.put(&DisplayOp::Text(vec![b'-'; REPEAT_MIN - 1]));
        assert_eq!(drain(&mut enc), "-".repeat(REPEAT_MIN - 1));
    }

    #[test]
    fn test_keyin_attrs_diffed() {
        let mut enc = encoder();
        enc.put(&DisplayOp::Echo(true)); // already on
        enc.put(&DisplayOp::Echo(false));
        enc.put(&DisplayOp::EchoSecret(true));
        enc.put(&DisplayOp::EchoChar(b'#'));
        enc.put(&DisplayOp::EchoChar(b'#'));
        enc.put(&DisplayOp::Case(KeyCase::Upper));
        assert_eq!(drain(&mut enc), "<eoff/><eson/><eschar>#</eschar><uc/>");
    }

    #[test]
    fn test_justify_tags_diffed() {
        let mut enc = encoder();
        enc.put(&DisplayOp::KbdReset); // nothing set yet
        enc.put(&DisplayOp::JustifyRight);
        enc.put(&DisplayOp::JustifyRight);
        enc.put(&DisplayOp::ZeroFill);
        enc.put(&DisplayOp::JustifyLeft);
        enc.put(&DisplayOp::KbdReset);
        assert_eq!(drain(&mut enc), "<jr/><zf/><jl/><kbdrst/>");
        assert_eq!(enc.keyin.justify, Justify::None);
        assert!(!enc.keyin.zero_fill);
    }

    #[test]
    fn test_cancel_puts_discards() {
        let mut enc = encoder();
        enc.put(&DisplayOp::EraseScreen);
        enc.cancel_puts();
        assert!(enc.is_empty());
        assert!(!enc.out_of_memory());
    }

    #[test]
    fn test_roll_and_motion_tags() {
        let mut enc = encoder();
        enc.put(&DisplayOp::Roll(RollDir::Up));
        enc.put(&DisplayOp::NewLine);
        enc.put(&DisplayOp::HomeUp);
        assert_eq!(drain(&mut enc), "<ru/><nl/><hu/>");
    }
}
