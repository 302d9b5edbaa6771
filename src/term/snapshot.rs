//! Screen snapshot codec.
//!
//! Save/restore ships a rectangle of cells as a compact byte stream
//! inside the restore elements. The stream is stateful: literal bytes
//! are characters drawn with the current decode state, and four marker
//! bytes mutate that state or compress runs:
//!
//! - `~` x — XOR the attribute flags with `x - '?'`
//! - `^` c — set foreground (`c - '?'` in legacy mode, three ASCII
//!   digits in 256-color mode)
//! - `!` c — set background, same encoding
//! - `` ` `` n c — draw `c` repeated `n - ' ' + 4` times
//! - `@` c — the next byte is a literal character
//!
//! Runs never cross a row boundary; rows are laid out in order and the
//! rectangle geometry is carried outside the stream. While the GRAPHIC
//! flag is toggled on, character bytes are symbol indexes offset by
//! `'?'` rather than text.
//!
//! Both ends start a stream with flags clear and white-on-black colors.

use thiserror::Error;

use super::cell::{ATTR_MASK, ATTR_SHIFT, BLACK, WHITE, Attrs, ColorMode, PackedCell};
use super::shadow::ShadowState;

const MARK_ATTR: u8 = b'~';
const MARK_FG: u8 = b'^';
const MARK_BG: u8 = b'!';
const MARK_RUN: u8 = b'`';
const MARK_ESC: u8 = b'@';

/// Shortest run worth counting.
const RUN_MIN: usize = 4;
/// Longest run one count byte can carry.
const RUN_MAX: usize = 98;

#[derive(Error, Debug, PartialEq)]
pub enum SnapshotError {
    #[error("snapshot stream ended early")]
    Truncated,

    #[error("snapshot stream has {0} bytes past the last cell")]
    TrailingData(usize),

    #[error("bad color value in snapshot stream")]
    BadColor,
}

struct StreamState {
    flags: u8,
    fg: u8,
    bg: u8,
}

impl StreamState {
    fn new() -> Self {
        Self {
            flags: 0,
            fg: WHITE,
            bg: BLACK,
        }
    }
}

fn cell_flags(cell: PackedCell) -> u8 {
    ((cell.0 & ATTR_MASK) >> ATTR_SHIFT) as u8
}

/// Encode a rectangle of `shadow` into a snapshot stream.
pub fn encode(shadow: &ShadowState, top: u16, bottom: u16, left: u16, right: u16) -> Vec<u8> {
    let mode = shadow.mode;
    let mut out = Vec::new();
    let mut state = StreamState::new();
    for v in top..=bottom {
        let mut h = left;
        while h <= right {
            let cell = shadow.cell(h, v);
            let mut run = 1usize;
            while run < RUN_MAX && h + (run as u16) <= right && shadow.cell(h + run as u16, v) == cell
            {
                run += 1;
            }
            encode_cell(&mut out, &mut state, mode, cell, run);
            h += run as u16;
        }
    }
    out
}

fn encode_cell(
    out: &mut Vec<u8>,
    state: &mut StreamState,
    mode: ColorMode,
    cell: PackedCell,
    run: usize,
) {
    let flags = cell_flags(cell);
    if flags != state.flags {
        out.push(MARK_ATTR);
        out.push((flags ^ state.flags) + b'?');
        state.flags = flags;
    }
    let fg = cell.fg(mode);
    if fg != state.fg {
        out.push(MARK_FG);
        push_color(out, mode, fg);
        state.fg = fg;
    }
    let bg = cell.bg(mode);
    if bg != state.bg {
        out.push(MARK_BG);
        push_color(out, mode, bg);
        state.bg = bg;
    }
    let ch = if cell.flags().contains(Attrs::GRAPHIC) {
        cell.ch() + b'?'
    } else {
        cell.ch()
    };
    if run >= RUN_MIN {
        out.push(MARK_RUN);
        out.push((run - RUN_MIN) as u8 + b' ');
    }
    if matches!(ch, MARK_ATTR | MARK_FG | MARK_BG | MARK_RUN | MARK_ESC) {
        out.push(MARK_ESC);
    }
    out.push(ch);
    if run > 1 && run < RUN_MIN {
        for _ in 1..run {
            if matches!(ch, MARK_ATTR | MARK_FG | MARK_BG | MARK_RUN | MARK_ESC) {
                out.push(MARK_ESC);
            }
            out.push(ch);
        }
    }
}

fn push_color(out: &mut Vec<u8>, mode: ColorMode, color: u8) {
    match mode {
        ColorMode::Legacy => out.push(color + b'?'),
        ColorMode::Ansi256 => out.extend_from_slice(format!("{:03}", color).as_bytes()),
    }
}

/// Decode a snapshot stream into a row-major rectangle of cells.
pub fn decode(
    mode: ColorMode,
    rows: u16,
    cols: u16,
    data: &[u8],
) -> Result<Vec<PackedCell>, SnapshotError> {
    let total = rows as usize * cols as usize;
    let mut cells = Vec::with_capacity(total);
    let mut state = StreamState::new();
    let mut pos = 0usize;

    let mut next = |pos: &mut usize| -> Result<u8, SnapshotError> {
        let b = *data.get(*pos).ok_or(SnapshotError::Truncated)?;
        *pos += 1;
        Ok(b)
    };

    while cells.len() < total {
        let mut run = 1usize;
        let mut b = next(&mut pos)?;
        loop {
            match b {
                MARK_ATTR => {
                    let x = next(&mut pos)?;
                    state.flags ^= x.wrapping_sub(b'?');
                }
                MARK_FG => {
                    state.fg = read_color(mode, data, &mut pos)?;
                }
                MARK_BG => {
                    state.bg = read_color(mode, data, &mut pos)?;
                }
                MARK_RUN => {
                    run = (next(&mut pos)?.wrapping_sub(b' ')) as usize + RUN_MIN;
                }
                MARK_ESC => {
                    b = next(&mut pos)?;
                    break;
                }
                _ => break,
            }
            b = next(&mut pos)?;
        }
        let graphic = state.flags & ((Attrs::GRAPHIC.bits() >> ATTR_SHIFT) as u8) != 0;
        let ch = if graphic { b.wrapping_sub(b'?') } else { b };
        let attr = mode.with_fg(mode.with_bg((state.flags as u64) << ATTR_SHIFT, state.bg), state.fg);
        let cell = PackedCell::new(ch, attr);
        for _ in 0..run {
            if cells.len() == total {
                return Err(SnapshotError::TrailingData(data.len() - pos));
            }
            cells.push(cell);
        }
    }
    if pos != data.len() {
        return Err(SnapshotError::TrailingData(data.len() - pos));
    }
    Ok(cells)
}

fn read_color(mode: ColorMode, data: &[u8], pos: &mut usize) -> Result<u8, SnapshotError> {
    match mode {
        ColorMode::Legacy => {
            let b = *data.get(*pos).ok_or(SnapshotError::Truncated)?;
            *pos += 1;
            b.checked_sub(b'?').ok_or(SnapshotError::BadColor)
        }
        ColorMode::Ansi256 => {
            let digits = data.get(*pos..*pos + 3).ok_or(SnapshotError::Truncated)?;
            *pos += 3;
            if !digits.iter().all(|d| d.is_ascii_digit()) {
                return Err(SnapshotError::BadColor);
            }
            let value = (digits[0] - b'0') as u32 * 100
                + (digits[1] - b'0') as u32 * 10
                + (digits[2] - b'0') as u32;
            u8::try_from(value).map_err(|_| SnapshotError::BadColor)
        }
    }
}

/// Restore a decoded rectangle into `shadow`.
pub fn restore(
    shadow: &mut ShadowState,
    top: u16,
    bottom: u16,
    left: u16,
    right: u16,
    data: &[u8],
) -> Result<(), SnapshotError> {
    let cells = decode(
        shadow.mode,
        bottom - top + 1,
        right - left + 1,
        data,
    )?;
    shadow.put_rect(top, bottom, left, right, &cells);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(shadow: &ShadowState) {
        let data = encode(shadow, 0, shadow.lines - 1, 0, shadow.columns - 1);
        let cells = decode(shadow.mode, shadow.lines, shadow.columns, &data).unwrap();
        assert_eq!(cells, shadow.get_rect(0, shadow.lines - 1, 0, shadow.columns - 1));
    }

    #[test]
    fn test_round_trip_plain_text() {
        for mode in [ColorMode::Legacy, ColorMode::Ansi256] {
            let mut s = ShadowState::new(mode, 4, 10);
            s.write_text(b"run of 1");
            round_trip(&s);
        }
    }

    #[test]
    fn test_round_trip_short_and_long_runs() {
        for mode in [ColorMode::Legacy, ColorMode::Ansi256] {
            // a 4-cell run, then a run far past one count byte
            let mut s = ShadowState::new(mode, 5, 80);
            s.set_cursor(0, 0);
            s.write_text(b"XXXXabc");
            for v in 1..5 {
                s.set_cursor(0, v);
                s.write_text(&[b'='; 80]);
            }
            let data = encode(&s, 0, 4, 0, 79);
            // 320 '=' cells cannot fit in one counted run
            assert!(data.iter().filter(|&&b| b == b'`').count() >= 4);
            round_trip(&s);
        }
    }

    #[test]
    fn test_attr_and_color_state_toggles() {
        let mut s = ShadowState::new(ColorMode::Legacy, 2, 20);
        s.set_flag(Attrs::REVERSE, true);
        s.set_fg(4);
        s.write_text(b"rev");
        s.set_flag(Attrs::REVERSE, false);
        s.set_flag(Attrs::BOLD, true);
        s.set_bg(2);
        s.write_text(b"bold");
        round_trip(&s);

        let data = encode(&s, 0, 1, 0, 19);
        // one toggle into reverse, one toggle swapping reverse for bold
        assert_eq!(data.iter().filter(|&&b| b == b'~').count(), 3);
    }

    #[test]
    fn test_graphic_cells_survive() {
        let mut s = ShadowState::new(ColorMode::Ansi256, 2, 10);
        s.write_graphic(0);
        s.write_graphic(2);
        s.write_text(b"?A");
        round_trip(&s);
    }

    #[test]
    fn test_marker_bytes_escaped() {
        let mut s = ShadowState::new(ColorMode::Legacy, 1, 12);
        s.write_text(b"~^!`@ ok");
        let data = encode(&s, 0, 0, 0, 11);
        round_trip(&s);
        assert_eq!(data.iter().filter(|&&b| b == MARK_ESC).count(), 6);
    }

    #[test]
    fn test_escaped_marker_run() {
        // a counted run whose literal is itself a marker byte
        let mut s = ShadowState::new(ColorMode::Legacy, 1, 10);
        s.write_text(b"@@@@@@@@@@");
        let data = encode(&s, 0, 0, 0, 9);
        assert_eq!(data, vec![MARK_RUN, b' ' + 6, MARK_ESC, MARK_ESC]);
        round_trip(&s);
    }

    #[test]
    fn test_truncated_stream() {
        let err = decode(ColorMode::Legacy, 1, 4, b"ab").unwrap_err();
        assert_eq!(err, SnapshotError::Truncated);
        let err = decode(ColorMode::Legacy, 1, 4, b"abc~").unwrap_err();
        assert_eq!(err, SnapshotError::Truncated);
    }

    #[test]
    fn test_trailing_data_rejected() {
        let err = decode(ColorMode::Legacy, 1, 2, b"abcd").unwrap_err();
        assert_eq!(err, SnapshotError::TrailingData(2));
    }

    #[test]
    fn test_restore_into_window() {
        let mut src = ShadowState::new(ColorMode::Legacy, 8, 40);
        src.set_cursor(0, 3);
        src.set_fg(2);
        src.write_text(b"window row");
        let data = encode(&src, 3, 4, 0, 39);

        let mut dst = ShadowState::new(ColorMode::Legacy, 8, 40);
        restore(&mut dst, 3, 4, 0, 39, &data).unwrap();
        assert_eq!(
            dst.get_rect(3, 4, 0, 39),
            src.get_rect(3, 4, 0, 39)
        );
    }
}
