//! Key codes and key maps.
//!
//! Converts crossterm key events to the protocol's integer key codes.
//! Printable characters are their byte value; everything else gets a code
//! above 255. The same codes index [`KeyBitmap`], the bit-per-key map
//! used for finish keys and trap keys.

use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

pub const ENTER: u16 = 256;
pub const ESCAPE: u16 = 257;
pub const BKSPC: u16 = 258;
pub const TAB: u16 = 259;
pub const BKTAB: u16 = 260;
pub const UP: u16 = 261;
pub const DOWN: u16 = 262;
pub const LEFT: u16 = 263;
pub const RIGHT: u16 = 264;
pub const INSERT: u16 = 265;
pub const DELETE: u16 = 266;
pub const HOME: u16 = 267;
pub const END: u16 = 268;
pub const PGUP: u16 = 269;
pub const PGDN: u16 = 270;
pub const F1: u16 = 301;
pub const F20: u16 = 320;
pub const SHIFTF1: u16 = 321;
pub const SHIFTF10: u16 = 330;
pub const INTERRUPT: u16 = 505;
pub const CANCEL: u16 = 506;
pub const MAXKEYVAL: u16 = 506;

/// Finish code reported when a keyin times out. Never a real key.
pub const TIMEOUT_FINISH: i32 = -1;

/// One bit per key code, `0..=MAXKEYVAL`.
#[derive(Clone, PartialEq)]
pub struct KeyBitmap {
    bits: [u8; (MAXKEYVAL as usize >> 3) + 1],
}

impl Default for KeyBitmap {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyBitmap {
    pub fn new() -> Self {
        Self {
            bits: [0; (MAXKEYVAL as usize >> 3) + 1],
        }
    }

    pub fn set(&mut self, code: u16) {
        if code <= MAXKEYVAL {
            self.bits[(code >> 3) as usize] |= 1 << (code & 0x07);
        }
    }

    pub fn clear(&mut self, code: u16) {
        if code <= MAXKEYVAL {
            self.bits[(code >> 3) as usize] &= !(1 << (code & 0x07));
        }
    }

    pub fn contains(&self, code: u16) -> bool {
        code <= MAXKEYVAL && self.bits[(code >> 3) as usize] & (1 << (code & 0x07)) != 0
    }

    pub fn clear_all(&mut self) {
        self.bits.fill(0);
    }

    /// Finish keys active when no explicit map has been sent: ENTER, the
    /// function keys, and the arrows. With `xkeys` the navigation block,
    /// ESCAPE, TAB and BKTAB finish as well.
    pub fn default_finish_map(xkeys: bool) -> Self {
        let mut map = Self::new();
        map.set(ENTER);
        for code in F1..=F20 {
            map.set(code);
        }
        for code in UP..=RIGHT {
            map.set(code);
        }
        if xkeys {
            for code in INSERT..=PGDN {
                map.set(code);
            }
            map.set(ESCAPE);
            map.set(TAB);
            map.set(BKTAB);
        }
        map
    }
}

impl std::fmt::Debug for KeyBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let set: Vec<u16> = (0..=MAXKEYVAL).filter(|&c| self.contains(c)).collect();
        f.debug_tuple("KeyBitmap").field(&set).finish()
    }
}

/// Map a crossterm key event to a protocol key code.
///
/// Returns `None` for events the protocol has no code for (bare
/// modifiers, alt chords, unmapped function keys).
pub fn map_key_event(event: &KeyEvent) -> Option<u16> {
    let shift = event.modifiers.contains(KeyModifiers::SHIFT);
    let ctrl = event.modifiers.contains(KeyModifiers::CONTROL);

    match event.code {
        KeyCode::Char(ch) => {
            if ctrl {
                // Ctrl+C raises the interrupt key
                if ch == 'c' || ch == 'C' {
                    return Some(INTERRUPT);
                }
                return None;
            }
            if ch.is_ascii() {
                Some(ch as u16)
            } else {
                None
            }
        }
        KeyCode::Enter => Some(ENTER),
        KeyCode::Esc => Some(ESCAPE),
        KeyCode::Backspace => Some(BKSPC),
        KeyCode::Tab => Some(if shift { BKTAB } else { TAB }),
        KeyCode::BackTab => Some(BKTAB),
        KeyCode::Up => Some(UP),
        KeyCode::Down => Some(DOWN),
        KeyCode::Left => Some(LEFT),
        KeyCode::Right => Some(RIGHT),
        KeyCode::Insert => Some(INSERT),
        KeyCode::Delete => Some(DELETE),
        KeyCode::Home => Some(HOME),
        KeyCode::End => Some(END),
        KeyCode::PageUp => Some(PGUP),
        KeyCode::PageDown => Some(PGDN),
        KeyCode::F(n) if (1..=10).contains(&n) && shift => Some(SHIFTF1 + n as u16 - 1),
        KeyCode::F(n) if (1..=20).contains(&n) => Some(F1 + n as u16 - 1),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_event(code: KeyCode, mods: KeyModifiers) -> KeyEvent {
        KeyEvent::new(code, mods)
    }

    #[test]
    fn test_char_and_function_keys() {
        let event = key_event(KeyCode::Char('a'), KeyModifiers::NONE);
        assert_eq!(map_key_event(&event), Some(b'a' as u16));

        let event = key_event(KeyCode::F(5), KeyModifiers::NONE);
        assert_eq!(map_key_event(&event), Some(F1 + 4));

        let event = key_event(KeyCode::F(3), KeyModifiers::SHIFT);
        assert_eq!(map_key_event(&event), Some(SHIFTF1 + 2));

        let event = key_event(KeyCode::Char('c'), KeyModifiers::CONTROL);
        assert_eq!(map_key_event(&event), Some(INTERRUPT));
    }

    #[test]
    fn test_bitmap_set_clear() {
        let mut map = KeyBitmap::new();
        map.set(ENTER);
        map.set(CANCEL);
        assert!(map.contains(ENTER));
        assert!(map.contains(CANCEL));
        assert!(!map.contains(ESCAPE));

        map.clear(ENTER);
        assert!(!map.contains(ENTER));

        map.clear_all();
        assert!(!map.contains(CANCEL));
    }

    #[test]
    fn test_default_finish_map() {
        let map = KeyBitmap::default_finish_map(false);
        assert!(map.contains(ENTER));
        assert!(map.contains(F20));
        assert!(map.contains(LEFT));
        assert!(!map.contains(ESCAPE));
        assert!(!map.contains(b'a' as u16));

        let xmap = KeyBitmap::default_finish_map(true);
        assert!(xmap.contains(ESCAPE));
        assert!(xmap.contains(PGDN));
        assert!(xmap.contains(BKTAB));
    }
}
