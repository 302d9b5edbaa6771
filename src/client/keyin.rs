//! Keyin field editor.
//!
//! One `KeyinField` lives for the duration of a single field request and
//! is fed protocol key codes, so it can be driven by the real keyboard
//! or entirely synthetically. It owns the typed buffer, the numeric
//! shape rules and the finish decision; echoing what it holds back onto
//! the screen is the session's job via [`display`].
//!
//! Character fields come in two flavors. A plain field shows its
//! prefill until the first keystroke and then collects fresh input. An
//! edit field starts positioned on the prefill and edits it in place,
//! with INSERT toggling overstrike and the usual travel keys active.
//!
//! Numeric fields enforce their shape as keys arrive: digits, one
//! leading minus, at most one decimal separator, and no more digits
//! right of the separator than the field declares.
//!
//! [`display`]: KeyinField::display

use crate::client::decoder::FieldRequest;
use crate::keys::{self, KeyBitmap};
use crate::server::encoder::{Justify, KeyCase, KeyinAttrs};

/// Outcome of feeding one key to the editor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Press {
    Accepted,
    /// The key does not fit the field's shape.
    Rejected,
    /// The field is complete; the value is the finish key code.
    Finished(i32),
}

pub struct KeyinField {
    req: FieldRequest,
    attrs: KeyinAttrs,
    finish: KeyBitmap,
    buf: Vec<u8>,
    /// Edit cursor within the buffer.
    pos: usize,
    /// Keystrokes accepted since the field opened.
    typed: usize,
    overstrike: bool,
    done: Option<i32>,
}

impl KeyinField {
    pub fn new(req: FieldRequest, attrs: KeyinAttrs, finish: KeyBitmap) -> Self {
        let buf = if req.edit {
            let mut buf = req.prefill.clone();
            buf.truncate(req.width as usize);
            buf
        } else {
            Vec::new()
        };
        let overstrike = attrs.overstrike;
        Self {
            req,
            attrs,
            finish,
            buf,
            pos: 0,
            typed: 0,
            overstrike,
            done: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done.is_some()
    }

    pub fn endkey(&self) -> i32 {
        self.done.unwrap_or(0)
    }

    /// Complete the field from outside: timeout, trap or cancel.
    pub fn force_finish(&mut self, endkey: i32) {
        self.done = Some(endkey);
    }

    fn max_len(&self) -> usize {
        let width = self.req.width as usize;
        match self.req.max_keys {
            Some(kl) => width.min(kl as usize),
            None => width,
        }
    }

    fn separator(&self) -> u8 {
        if self.req.comma_decimal {
            b','
        } else {
            b'.'
        }
    }

    fn sep_pos(&self) -> Option<usize> {
        let sep = self.separator();
        self.buf.iter().position(|&b| b == sep)
    }

    pub fn press(&mut self, key: u16) -> Press {
        if self.done.is_some() {
            return Press::Rejected;
        }
        match key {
            keys::CANCEL => {
                self.buf.clear();
                self.pos = 0;
                self.typed = self.typed.saturating_add(1);
                Press::Accepted
            }
            keys::BKSPC => {
                if self.req.edit {
                    if self.pos > 0 {
                        self.pos -= 1;
                        self.buf.remove(self.pos);
                    }
                } else {
                    self.buf.pop();
                }
                Press::Accepted
            }
            keys::LEFT if self.req.edit => {
                self.pos = self.pos.saturating_sub(1);
                Press::Accepted
            }
            keys::RIGHT if self.req.edit => {
                if self.pos < self.buf.len() {
                    self.pos += 1;
                }
                Press::Accepted
            }
            keys::HOME if self.req.edit => {
                self.pos = 0;
                Press::Accepted
            }
            keys::END if self.req.edit => {
                self.pos = self.buf.len();
                Press::Accepted
            }
            keys::INSERT if self.req.edit => {
                self.overstrike = !self.overstrike;
                Press::Accepted
            }
            keys::DELETE if self.req.edit => {
                if self.pos < self.buf.len() {
                    self.buf.remove(self.pos);
                }
                Press::Accepted
            }
            // codes past the keyboard range always finish
            key if key >= 10000 || self.finish.contains(key) => {
                self.done = Some(key as i32);
                Press::Finished(key as i32)
            }
            key if (0x20..0xFF).contains(&key) => self.type_char(key as u8),
            _ => Press::Rejected,
        }
    }

    fn type_char(&mut self, ch: u8) -> Press {
        let ch = if self.req.numeric {
            ch
        } else {
            match self.attrs.case {
                KeyCase::Normal => ch,
                KeyCase::Upper => ch.to_ascii_uppercase(),
                KeyCase::Lower => ch.to_ascii_lowercase(),
                KeyCase::Invert => {
                    if ch.is_ascii_lowercase() {
                        ch.to_ascii_uppercase()
                    } else {
                        ch.to_ascii_lowercase()
                    }
                }
            }
        };
        if self.req.numeric && !self.numeric_accepts(ch) {
            return Press::Rejected;
        }
        let at_capacity = if self.req.edit {
            self.overstrike && self.pos >= self.max_len()
                || !self.overstrike && self.buf.len() >= self.max_len() && self.pos >= self.max_len()
        } else {
            self.buf.len() >= self.max_len()
        };
        if at_capacity {
            return Press::Rejected;
        }
        let ch = if self.req.numeric && (ch == b'.' || ch == b',') {
            self.separator()
        } else {
            ch
        };
        if self.req.edit {
            if self.overstrike && self.pos < self.buf.len() {
                self.buf[self.pos] = ch;
            } else if self.buf.len() < self.max_len() {
                self.buf.insert(self.pos.min(self.buf.len()), ch);
            } else {
                return Press::Rejected;
            }
            self.pos += 1;
        } else {
            self.buf.push(ch);
        }
        self.typed += 1;
        if self.auto_enter_fires() {
            self.done = Some(keys::ENTER as i32);
            return Press::Finished(keys::ENTER as i32);
        }
        Press::Accepted
    }

    fn numeric_accepts(&self, ch: u8) -> bool {
        match ch {
            b'0'..=b'9' => match self.sep_pos() {
                Some(p) => self.buf.len() - p - 1 < self.req.right_digits as usize,
                None => true,
            },
            b'.' | b',' => self.req.right_digits > 0 && self.sep_pos().is_none(),
            b'-' => self.buf.is_empty(),
            _ => false,
        }
    }

    /// Auto-enter completes a full field, or a numeric field whose
    /// fractional digits are all typed.
    fn auto_enter_fires(&self) -> bool {
        if !self.attrs.auto_enter {
            return false;
        }
        if self.buf.len() >= self.max_len() {
            return true;
        }
        if self.req.numeric {
            if let Some(p) = self.sep_pos() {
                return self.buf.len() - p - 1 >= self.req.right_digits as usize;
            }
        }
        false
    }

    /// Reply text for the engine. Justification and zero fill apply
    /// only once the field was actually typed into.
    ///
    /// A plain field nobody typed into answers with its prefill, the
    /// way the screen still shows it.
    pub fn result(&self) -> Vec<u8> {
        let width = self.req.width as usize;
        let source: &[u8] = if self.typed == 0 && !self.req.edit {
            &self.req.prefill
        } else {
            &self.buf
        };
        let mut out = source.to_vec();
        out.truncate(width);
        let touched = self.typed > 0;
        if self.req.numeric {
            if touched && self.attrs.justify == Justify::Left {
                // remaining digit positions fill with zeros
                out.resize(width, b'0');
            } else {
                while out.len() < width {
                    out.insert(0, b' ');
                }
            }
        } else {
            let fill = if touched && self.attrs.zero_fill {
                b'0'
            } else {
                b' '
            };
            if touched && self.attrs.justify == Justify::Right {
                while out.len() < width {
                    out.insert(0, fill);
                }
            } else {
                out.resize(width, fill);
            }
        }
        out
    }

    /// What the screen shows for the field right now, width-padded.
    pub fn display(&self) -> Vec<u8> {
        let width = self.req.width as usize;
        let mut out = if !self.attrs.echo {
            Vec::new()
        } else if self.attrs.secret {
            vec![self.attrs.echo_char; self.shown().len()]
        } else {
            self.shown().to_vec()
        };
        out.truncate(width);
        out.resize(width, b' ');
        out
    }

    fn shown(&self) -> &[u8] {
        if self.typed == 0 && !self.req.edit {
            &self.req.prefill
        } else {
            &self.buf
        }
    }

    /// Column offset of the edit cursor within the field.
    pub fn cursor_offset(&self) -> u16 {
        if self.req.edit {
            self.pos.min(self.req.width as usize) as u16
        } else {
            self.buf.len().min(self.req.width as usize - 1) as u16
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn char_field(width: u16, prefill: &[u8], edit: bool) -> FieldRequest {
        FieldRequest {
            numeric: false,
            width,
            right_digits: 0,
            comma_decimal: false,
            max_keys: None,
            edit,
            prefill: prefill.to_vec(),
        }
    }

    fn num_field(width: u16, right: u16, comma: bool) -> FieldRequest {
        FieldRequest {
            numeric: true,
            width,
            right_digits: right,
            comma_decimal: comma,
            max_keys: None,
            edit: false,
            prefill: Vec::new(),
        }
    }

    fn field(req: FieldRequest) -> KeyinField {
        KeyinField::new(req, KeyinAttrs::default(), KeyBitmap::default_finish_map(false))
    }

    fn type_str(f: &mut KeyinField, text: &str) {
        for b in text.bytes() {
            assert_eq!(f.press(b as u16), Press::Accepted);
        }
    }

    #[test]
    fn test_prefilled_field_replaced_by_typing() {
        let mut f = field(char_field(5, b"ABCDE", false));
        assert_eq!(f.display(), b"ABCDE");
        type_str(&mut f, "AB");
        assert_eq!(f.press(keys::ENTER), Press::Finished(keys::ENTER as i32));
        assert_eq!(f.result(), b"AB   ");
    }

    #[test]
    fn test_untouched_field_answers_prefill() {
        let mut f = field(char_field(5, b"ABCDE", false));
        assert_eq!(f.press(keys::ENTER), Press::Finished(keys::ENTER as i32));
        assert_eq!(f.result(), b"ABCDE");
    }

    #[test]
    fn test_numeric_rejects_bad_shape() {
        let mut f = field(num_field(8, 2, false));
        type_str(&mut f, "-12.3");
        // second separator
        assert_eq!(f.press(b'.' as u16), Press::Rejected);
        // second minus
        assert_eq!(f.press(b'-' as u16), Press::Rejected);
        // not a digit
        assert_eq!(f.press(b'x' as u16), Press::Rejected);
        // second right digit fits, a third does not
        assert_eq!(f.press(b'4' as u16), Press::Accepted);
        assert_eq!(f.press(b'5' as u16), Press::Rejected);
        f.press(keys::ENTER);
        assert_eq!(f.result(), b"  -12.34");
    }

    #[test]
    fn test_numeric_comma_mode() {
        let mut f = field(num_field(6, 2, true));
        type_str(&mut f, "7");
        assert_eq!(f.press(b'.' as u16), Press::Accepted);
        type_str(&mut f, "50");
        f.press(keys::ENTER);
        assert_eq!(f.result(), b"  7,50");
    }

    #[test]
    fn test_auto_enter_on_full_field() {
        let req = char_field(3, b"", false);
        let mut attrs = KeyinAttrs::default();
        attrs.auto_enter = true;
        let mut f = KeyinField::new(req, attrs, KeyBitmap::default_finish_map(false));
        assert_eq!(f.press(b'a' as u16), Press::Accepted);
        assert_eq!(f.press(b'b' as u16), Press::Accepted);
        assert_eq!(f.press(b'c' as u16), Press::Finished(keys::ENTER as i32));
        assert_eq!(f.result(), b"abc");
    }

    #[test]
    fn test_auto_enter_on_right_digits() {
        let req = num_field(8, 2, false);
        let mut attrs = KeyinAttrs::default();
        attrs.auto_enter = true;
        let mut f = KeyinField::new(req, attrs, KeyBitmap::default_finish_map(false));
        type_str(&mut f, "3.1");
        assert_eq!(f.press(b'4' as u16), Press::Finished(keys::ENTER as i32));
        assert_eq!(f.result(), b"    3.14");
    }

    #[test]
    fn test_edit_mode_travel_and_overstrike() {
        let mut f = field(char_field(6, b"HELLO", true));
        // cursor starts at the left of the prefill
        assert_eq!(f.press(keys::RIGHT), Press::Accepted);
        f.press(keys::INSERT); // overstrike on
        assert_eq!(f.press(b'A' as u16), Press::Accepted);
        f.press(keys::ENTER);
        assert_eq!(f.result(), b"HALLO ");
    }

    #[test]
    fn test_edit_mode_delete_and_insert() {
        let mut f = field(char_field(8, b"ABCD", true));
        f.press(keys::END);
        f.press(keys::HOME);
        f.press(keys::DELETE);
        f.press(b'x' as u16);
        f.press(keys::ENTER);
        assert_eq!(f.result(), b"xBCD    ");
    }

    #[test]
    fn test_cancel_clears_field() {
        let mut f = field(char_field(4, b"", false));
        type_str(&mut f, "abc");
        assert_eq!(f.press(keys::CANCEL), Press::Accepted);
        f.press(keys::ENTER);
        assert_eq!(f.result(), b"    ");
    }

    #[test]
    fn test_backspace() {
        let mut f = field(char_field(4, b"", false));
        type_str(&mut f, "abc");
        f.press(keys::BKSPC);
        f.press(keys::ENTER);
        assert_eq!(f.result(), b"ab  ");
    }

    #[test]
    fn test_finish_keys_and_function_keys() {
        let mut f = field(char_field(4, b"", false));
        assert_eq!(f.press(keys::F1), Press::Finished(keys::F1 as i32));
        assert!(f.is_done());
        // nothing accepted after completion
        assert_eq!(f.press(b'a' as u16), Press::Rejected);

        // codes past the keyboard range finish without being mapped
        let mut f = field(char_field(4, b"", false));
        assert_eq!(f.press(10001), Press::Finished(10001));
    }

    #[test]
    fn test_right_justify_and_zero_fill() {
        let mut attrs = KeyinAttrs::default();
        attrs.justify = Justify::Right;
        attrs.zero_fill = true;
        let mut f = KeyinField::new(char_field(5, b"", false), attrs.clone(), KeyBitmap::default_finish_map(false));
        type_str(&mut f, "12");
        f.press(keys::ENTER);
        assert_eq!(f.result(), b"00012");

        // an untouched field keeps its prefill, space padded
        let mut f = KeyinField::new(char_field(5, b"AB", false), attrs, KeyBitmap::default_finish_map(false));
        f.press(keys::ENTER);
        assert_eq!(f.result(), b"AB   ");
    }

    #[test]
    fn test_numeric_left_justify_zero_fills() {
        let mut attrs = KeyinAttrs::default();
        attrs.justify = Justify::Left;
        let mut f = KeyinField::new(num_field(6, 2, false), attrs, KeyBitmap::default_finish_map(false));
        type_str(&mut f, "3.1");
        f.press(keys::ENTER);
        assert_eq!(f.result(), b"3.1000");
    }

    #[test]
    fn test_key_case_modes() {
        let req = char_field(6, b"", false);
        let mut attrs = KeyinAttrs::default();
        attrs.case = KeyCase::Upper;
        let mut f = KeyinField::new(req.clone(), attrs, KeyBitmap::default_finish_map(false));
        type_str(&mut f, "aB");
        f.press(keys::ENTER);
        assert_eq!(f.result(), b"AB    ");

        let mut attrs = KeyinAttrs::default();
        attrs.case = KeyCase::Invert;
        let mut f = KeyinField::new(req, attrs, KeyBitmap::default_finish_map(false));
        type_str(&mut f, "aB");
        f.press(keys::ENTER);
        assert_eq!(f.result(), b"Ab    ");
    }

    #[test]
    fn test_keystroke_limit() {
        let mut req = char_field(8, b"", false);
        req.max_keys = Some(3);
        let mut f = field(req);
        type_str(&mut f, "abc");
        assert_eq!(f.press(b'd' as u16), Press::Rejected);
        f.press(keys::ENTER);
        assert_eq!(f.result(), b"abc     ");
    }

    #[test]
    fn test_secret_echo_display() {
        let req = char_field(5, b"", false);
        let mut attrs = KeyinAttrs::default();
        attrs.secret = true;
        let mut f = KeyinField::new(req, attrs, KeyBitmap::default_finish_map(false));
        type_str(&mut f, "pw");
        assert_eq!(f.display(), b"**   ");
        f.press(keys::ENTER);
        assert_eq!(f.result(), b"pw   ");
    }

    #[test]
    fn test_trap_ends_field_mid_edit() {
        // A trap key closes the field as if ENTER were pressed,
        // keeping whatever was typed so far.
        let mut f = field(char_field(5, b"ABCDE", false));
        type_str(&mut f, "xy");
        f.force_finish(keys::ENTER as i32);
        assert!(f.is_done());
        assert_eq!(f.endkey(), keys::ENTER as i32);
        assert_eq!(f.result(), b"xy   ");
    }

    #[test]
    fn test_timeout_force_finish() {
        let mut f = field(char_field(4, b"", false));
        type_str(&mut f, "ab");
        f.force_finish(keys::TIMEOUT_FINISH);
        assert!(f.is_done());
        assert_eq!(f.endkey(), keys::TIMEOUT_FINISH);
        assert_eq!(f.result(), b"ab  ");
    }
}
