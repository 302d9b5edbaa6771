//! Display element decoder.
//!
//! Applies the display vocabulary to the client's shadow store, keeping
//! it byte-identical with the mirror the engine's encoder maintains.
//! Side effects that live outside the cell grid (sounds, cursor
//! presentation) go through [`TerminalDevice`]. Unknown tags are logged
//! and skipped; the engine may be newer than this client.

use tracing::debug;

use crate::error::Result;
use crate::proto::element::{Element, Node};
use crate::server::encoder::{CursorStyle, Justify, KeyCase, KeyinAttrs};
use crate::term::cell::graphic_index;
use crate::term::{snapshot, Attrs, ColorMode, PackedCell, RollDir, ShadowState};

/// Terminal-side effects the decoder cannot express as cell updates.
pub trait TerminalDevice {
    fn beep(&mut self) {}
    fn click(&mut self) {}
    fn cursor_style(&mut self, _style: CursorStyle) {}
}

/// Device that swallows everything; used by the engine-side tests and
/// anywhere the grid alone matters.
pub struct NullDevice;

impl TerminalDevice for NullDevice {}

pub struct Decoder {
    pub shadow: ShadowState,
    pub keyin: KeyinAttrs,
    /// Keyin timeout in seconds, cleared after each field.
    pub timeout: Option<u32>,
}

impl Decoder {
    pub fn new(mode: ColorMode, lines: u16, columns: u16) -> Self {
        Self {
            shadow: ShadowState::new(mode, lines, columns),
            keyin: KeyinAttrs::default(),
            timeout: None,
        }
    }

    /// Apply one display element.
    pub fn apply(&mut self, elem: &Element, device: &mut dyn TerminalDevice) -> Result<()> {
        let s = &mut self.shadow;
        match elem.tag.as_str() {
            "p" => {
                let h = elem.int_attr("h").unwrap_or(0).max(0) as u16;
                let v = elem.int_attr("v").unwrap_or(0).max(0) as u16;
                s.set_cursor(h, v);
            }
            "h" => s.set_h(text_int(elem).max(0) as u16),
            "v" => s.set_v(text_int(elem).max(0) as u16),
            "ha" => s.move_h(text_int(elem)),
            "va" => s.move_v(text_int(elem)),
            "setsw" => {
                let t = elem.int_attr("t").unwrap_or(0).max(0) as u16;
                let b = elem.int_attr("b").unwrap_or(0).max(0) as u16;
                let l = elem.int_attr("l").unwrap_or(0).max(0) as u16;
                let r = elem.int_attr("r").unwrap_or(0).max(0) as u16;
                s.set_window(t, b, l, r);
            }
            "resetsw" => s.reset_window(),
            "revon" => s.set_flag(Attrs::REVERSE, true),
            "revoff" => s.set_flag(Attrs::REVERSE, false),
            "ulon" => s.set_flag(Attrs::UNDERLINE, true),
            "uloff" => s.set_flag(Attrs::UNDERLINE, false),
            "blinkon" => s.set_flag(Attrs::BLINK, true),
            "blinkoff" => s.set_flag(Attrs::BLINK, false),
            "boldon" => s.set_flag(Attrs::BOLD, true),
            "boldoff" => s.set_flag(Attrs::BOLD, false),
            "dimon" => s.set_flag(Attrs::DIM, true),
            "dimoff" => s.set_flag(Attrs::DIM, false),
            "alloff" => s.all_flags_off(),
            "color" => s.set_fg(elem.int_attr("v").unwrap_or(0).clamp(0, 255) as u8),
            "bgcolor" => s.set_bg(elem.int_attr("v").unwrap_or(0).clamp(0, 255) as u8),
            "es" => s.erase_screen(),
            "ef" => s.erase_from(),
            "el" => s.erase_line(),
            "ru" => s.roll(RollDir::Up),
            "rd" => s.roll(RollDir::Down),
            "scrleft" => s.roll(RollDir::Left),
            "scrright" => s.roll(RollDir::Right),
            "opnlin" => s.open_line(),
            "clslin" => s.close_line(),
            "inslin" => s.insert_line(),
            "dellin" => s.delete_line(),
            "inschr" => {
                let h = elem.int_attr("h").unwrap_or(0).max(0) as u16;
                let v = elem.int_attr("v").unwrap_or(0).max(0) as u16;
                s.insert_char(h, v);
            }
            "delchr" => {
                let h = elem.int_attr("h").unwrap_or(0).max(0) as u16;
                let v = elem.int_attr("v").unwrap_or(0).max(0) as u16;
                s.delete_char(h, v);
            }
            "cr" => s.carriage_return(),
            "nl" => s.new_line(),
            "lf" => s.line_feed(),
            "hu" => s.home_up(),
            "hd" => s.home_down(),
            "eu" => s.end_up(),
            "ed" => s.end_down(),
            "rptchar" => {
                let n = elem.int_attr("n").unwrap_or(0).max(0) as usize;
                if let Some(&ch) = elem.text_content().first() {
                    s.write_text(&vec![ch; n]);
                }
            }
            "rptdown" => {
                let n = elem.int_attr("n").unwrap_or(0).max(0) as u16;
                if let Some(&ch) = elem.text_content().first() {
                    s.repeat_down(ch, n);
                }
            }
            "hdblon" => s.set_dbl(crate::term::shadow::DBL_HORZ, true),
            "hdbloff" => s.set_dbl(crate::term::shadow::DBL_HORZ, false),
            "vdblon" => s.set_dbl(crate::term::shadow::DBL_VERT, true),
            "vdbloff" => s.set_dbl(crate::term::shadow::DBL_VERT, false),
            "cursor" => {
                let text = elem.text_content();
                let name = String::from_utf8_lossy(&text).into_owned();
                if let Some(style) = CursorStyle::from_str(&name) {
                    device.cursor_style(style);
                } else {
                    debug!(style = %name, "unknown cursor style");
                }
            }
            "b" => device.beep(),
            "click" => device.click(),
            "eon" => self.keyin.echo = true,
            "eoff" => self.keyin.echo = false,
            "eson" => self.keyin.secret = true,
            "esoff" => self.keyin.secret = false,
            "eschar" => {
                if let Some(&ch) = elem.text_content().first() {
                    self.keyin.echo_char = ch;
                }
            }
            "kcon" => self.keyin.auto_enter = true,
            "kcoff" => self.keyin.auto_enter = false,
            "editon" => self.keyin.edit = true,
            "editoff" => self.keyin.edit = false,
            "clickon" => self.keyin.click = true,
            "clickoff" => self.keyin.click = false,
            "ovsmode" => self.keyin.overstrike = true,
            "insmode" => self.keyin.overstrike = false,
            "uc" => self.keyin.case = KeyCase::Upper,
            "lc" => self.keyin.case = KeyCase::Lower,
            "it" => self.keyin.case = KeyCase::Invert,
            "in" => self.keyin.case = KeyCase::Normal,
            "jr" => self.keyin.justify = Justify::Right,
            "jl" => self.keyin.justify = Justify::Left,
            "zf" => self.keyin.zero_fill = true,
            "kbdrst" => {
                self.keyin.justify = Justify::None;
                self.keyin.zero_fill = false;
            }
            "timeout" => self.timeout = elem.int_attr("n").map(|n| n.max(0) as u32),
            "scrnrest" => {
                let (lines, columns) = (s.lines, s.columns);
                snapshot::restore(s, 0, lines - 1, 0, columns - 1, &elem.text_content())?;
            }
            "winrest" => {
                let w = s.window;
                snapshot::restore(s, w.top, w.bottom, w.left, w.right, &elem.text_content())?;
            }
            "charrest" => self.restore_chars(&elem.text_content())?,
            tag => {
                if let Some(sym) = graphic_index(tag) {
                    s.write_graphic(sym);
                } else if let Some(color) = s.mode.color_index(tag) {
                    s.set_fg(color);
                } else if let Some(color) =
                    tag.strip_prefix("bg").and_then(|t| s.mode.color_index(t))
                {
                    s.set_bg(color);
                } else {
                    debug!(tag, "unhandled element");
                }
            }
        }
        Ok(())
    }

    /// Apply a whole payload's worth of nodes in order. Bare text is a
    /// display run at the cursor.
    pub fn apply_all(&mut self, nodes: &[Node], device: &mut dyn TerminalDevice) -> Result<()> {
        for node in nodes {
            match node {
                Node::Text(text) => self.shadow.write_text(text),
                Node::Elem(elem) => self.apply(elem, device)?,
            }
        }
        Ok(())
    }

    /// Character-only restore: decoded cells replace the characters in
    /// the window but leave the attributes on screen alone.
    fn restore_chars(&mut self, data: &[u8]) -> Result<()> {
        let w = self.shadow.window;
        let cells = snapshot::decode(
            self.shadow.mode,
            w.bottom - w.top + 1,
            w.right - w.left + 1,
            data,
        )?;
        let mut it = cells.iter();
        for v in w.top..=w.bottom {
            for h in w.left..=w.right {
                if let Some(cell) = it.next() {
                    let old = self.shadow.cell(h, v);
                    self.shadow.set_cell(h, v, PackedCell::new(cell.ch(), old.attr()));
                }
            }
        }
        Ok(())
    }
}

fn text_int(elem: &Element) -> i32 {
    let text = elem.text_content();
    std::str::from_utf8(&text)
        .ok()
        .and_then(|t| t.trim().parse().ok())
        .unwrap_or(0)
}

/// Decoded keyin field request, the payload of `<cf>` or `<cn>`.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldRequest {
    pub numeric: bool,
    pub width: u16,
    /// Digits allowed right of the decimal separator (numeric only).
    pub right_digits: u16,
    /// Comma is the decimal separator.
    pub comma_decimal: bool,
    /// Keystroke limit below the field width, when given.
    pub max_keys: Option<u16>,
    /// Prefill is editable in place.
    pub edit: bool,
    pub prefill: Vec<u8>,
}

impl FieldRequest {
    /// Parse `<cf .../>` or `<cn .../>`; `None` for any other tag.
    pub fn from_elem(elem: &Element) -> Option<Self> {
        let numeric = match elem.tag.as_str() {
            "cf" => false,
            "cn" => true,
            _ => return None,
        };
        let yes = |name: &str| elem.get_attr(name) == Some("y");
        Some(Self {
            numeric,
            width: elem.int_attr("w").unwrap_or(1).max(1) as u16,
            right_digits: elem.int_attr("r").unwrap_or(0).max(0) as u16,
            comma_decimal: yes("dc"),
            max_keys: elem.int_attr("kl").map(|n| n.max(0) as u16),
            edit: yes("edit") || yes("de"),
            prefill: elem.text_content(),
        })
    }

    /// The wire form the engine sends, inverse of [`from_elem`].
    ///
    /// [`from_elem`]: FieldRequest::from_elem
    pub fn to_elem(&self) -> Element {
        let mut elem = Element::new(if self.numeric { "cn" } else { "cf" }).attr("w", self.width);
        if self.numeric {
            if self.right_digits > 0 {
                elem = elem.attr("r", self.right_digits);
            }
            if self.comma_decimal {
                elem = elem.attr("dc", "y");
            }
        } else {
            if let Some(kl) = self.max_keys {
                elem = elem.attr("kl", kl);
            }
            if self.edit {
                elem = elem.attr("edit", "y");
            }
        }
        if !self.prefill.is_empty() {
            elem = elem.text(&self.prefill);
        }
        elem
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::element::{first_element, parse};
    use crate::server::encoder::{DisplayOp, Encoder};

    fn replay(mode: ColorMode, ops: &[DisplayOp]) -> (Encoder, Decoder) {
        let mut enc = Encoder::new(mode, 24, 80);
        for op in ops {
            enc.put(op);
        }
        let mut dec = Decoder::new(mode, 24, 80);
        let elems = parse(&enc.take()).unwrap();
        dec.apply_all(&elems, &mut NullDevice).unwrap();
        (enc, dec)
    }

    #[test]
    fn test_shadows_stay_identical() {
        let ops = vec![
            DisplayOp::SetCursor { h: 4, v: 2 },
            DisplayOp::Reverse(true),
            DisplayOp::Fg(3),
            DisplayOp::Text(b"diffed <text> &c".to_vec()),
            DisplayOp::Reverse(false),
            DisplayOp::SetWindow { top: 1, bottom: 20, left: 0, right: 79 },
            DisplayOp::NewLine,
            DisplayOp::Text(vec![b'-'; 45]),
            DisplayOp::Roll(RollDir::Up),
            DisplayOp::EraseLine,
            DisplayOp::InsertChar { h: 2, v: 3 },
            DisplayOp::Graphic(4),
            DisplayOp::ResetWindow,
            DisplayOp::EraseFrom,
        ];
        for mode in [ColorMode::Legacy, ColorMode::Ansi256] {
            let (enc, dec) = replay(mode, &ops);
            assert_eq!(enc.shadow, dec.shadow);
        }
    }

    #[test]
    fn test_repeat_decodes_with_cursor_clamp() {
        // a 50-wide repeat landing near the right edge pins the cursor
        let ops = vec![
            DisplayOp::SetCursor { h: 60, v: 0 },
            DisplayOp::Text(vec![b'X'; 50]),
        ];
        let (enc, dec) = replay(ColorMode::Legacy, &ops);
        assert_eq!(dec.shadow.h, 79);
        assert_eq!(dec.shadow.cell(79, 0).ch(), b'X');
        assert_eq!(dec.shadow.cell(59, 0).ch(), b' ');
        assert_eq!(enc.shadow, dec.shadow);
    }

    #[test]
    fn test_keyin_attr_elements() {
        let mut dec = Decoder::new(ColorMode::Legacy, 24, 80);
        let elems = parse(b"<eoff/><eson/><eschar>#</eschar><uc/><jr/><zf/><timeout n=30/>").unwrap();
        dec.apply_all(&elems, &mut NullDevice).unwrap();
        assert!(!dec.keyin.echo);
        assert!(dec.keyin.secret);
        assert_eq!(dec.keyin.echo_char, b'#');
        assert_eq!(dec.keyin.case, KeyCase::Upper);
        assert_eq!(dec.keyin.justify, Justify::Right);
        assert!(dec.keyin.zero_fill);
        assert_eq!(dec.timeout, Some(30));

        let elems = parse(b"<kbdrst/>").unwrap();
        dec.apply_all(&elems, &mut NullDevice).unwrap();
        assert_eq!(dec.keyin.justify, Justify::None);
        assert!(!dec.keyin.zero_fill);
    }

    #[test]
    fn test_out_of_range_insert_coords_clamp() {
        // well-formed elements with bad coordinates must never panic
        let ops = vec![
            DisplayOp::Text(b"edge".to_vec()),
            DisplayOp::InsertChar { h: 100, v: 100 },
            DisplayOp::DeleteChar { h: 90, v: 90 },
        ];
        let (enc, dec) = replay(ColorMode::Legacy, &ops);
        assert_eq!(dec.shadow.cell(0, 0).ch(), b'e');
        assert_eq!(enc.shadow, dec.shadow);
    }

    #[test]
    fn test_device_calls() {
        #[derive(Default)]
        struct Recorder {
            beeps: u32,
            style: Option<CursorStyle>,
        }
        impl TerminalDevice for Recorder {
            fn beep(&mut self) {
                self.beeps += 1;
            }
            fn cursor_style(&mut self, style: CursorStyle) {
                self.style = Some(style);
            }
        }
        let mut dec = Decoder::new(ColorMode::Legacy, 24, 80);
        let mut dev = Recorder::default();
        let elems = parse(b"<b/><cursor>block</cursor>").unwrap();
        dec.apply_all(&elems, &mut dev).unwrap();
        assert_eq!(dev.beeps, 1);
        assert_eq!(dev.style, Some(CursorStyle::Block));
    }

    #[test]
    fn test_unknown_tag_ignored() {
        let mut dec = Decoder::new(ColorMode::Legacy, 24, 80);
        let before = dec.shadow.clone();
        let elems = parse(b"<mystery a=1>stuff</mystery>").unwrap();
        dec.apply_all(&elems, &mut NullDevice).unwrap();
        assert_eq!(dec.shadow, before);
    }

    #[test]
    fn test_field_request_parse() {
        let elems = parse(b"<cf w=5 kl=8 edit=y>ABCDE</cf>").unwrap();
        let req = FieldRequest::from_elem(first_element(&elems).unwrap()).unwrap();
        assert!(!req.numeric);
        assert_eq!(req.width, 5);
        assert_eq!(req.max_keys, Some(8));
        assert!(req.edit);
        assert_eq!(req.prefill, b"ABCDE");

        let elems = parse(b"<cn w=8 r=2 dc=y/>").unwrap();
        let req = FieldRequest::from_elem(first_element(&elems).unwrap()).unwrap();
        assert!(req.numeric);
        assert_eq!(req.right_digits, 2);
        assert!(req.comma_decimal);
        assert!(req.prefill.is_empty());
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let mut enc = Encoder::new(ColorMode::Legacy, 8, 40);
        enc.put(&DisplayOp::SetCursor { h: 0, v: 2 });
        enc.put(&DisplayOp::Bold(true));
        enc.put(&DisplayOp::Text(b"saved state".to_vec()));
        enc.take();
        let body = crate::term::snapshot::encode(&enc.shadow, 0, 7, 0, 39);

        let mut payload = b"<scrnrest>".to_vec();
        crate::proto::element::escape_into(&body, &mut payload);
        payload.extend_from_slice(b"</scrnrest>");
        let mut dec = Decoder::new(ColorMode::Legacy, 8, 40);
        let elems = parse(&payload).unwrap();
        dec.apply_all(&elems, &mut NullDevice).unwrap();
        assert_eq!(
            dec.shadow.get_rect(0, 7, 0, 39),
            enc.shadow.get_rect(0, 7, 0, 39)
        );
    }
}
