//! Terminal shadow store.
//!
//! A rectangular grid of packed cells plus cursor, active window and
//! current attribute word. The engine's command encoder mirrors every
//! display operation into one of these, and the client's decoder applies
//! the resulting elements to its own; the two must stay byte-identical,
//! which is why every mutation lives here and nowhere else.
//!
//! Coordinates are absolute screen positions, `h` across and `v` down,
//! zero-based. The active window bounds are inclusive and every cursor
//! move clamps into the window.

use super::cell::{Attrs, ColorMode, PackedCell};

/// Active window bounds, inclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Window {
    pub top: u16,
    pub bottom: u16,
    pub left: u16,
    pub right: u16,
}

/// Roll direction for the active window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RollDir {
    Up,
    Down,
    Left,
    Right,
}

/// Per-row double-size flags.
pub const DBL_HORZ: u8 = 0x01;
pub const DBL_VERT: u8 = 0x02;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShadowState {
    pub mode: ColorMode,
    pub lines: u16,
    pub columns: u16,
    pub window: Window,
    /// Cursor column.
    pub h: u16,
    /// Cursor row.
    pub v: u16,
    /// Current attribute word: flags plus colors, no character byte.
    pub attr: u64,
    /// Rolling at the bottom edge (off means the cursor pins instead).
    pub roll_enabled: bool,
    grid: Vec<PackedCell>,
    dbl: Vec<u8>,
}

impl ShadowState {
    pub fn new(mode: ColorMode, lines: u16, columns: u16) -> Self {
        let attr = mode.default_attr();
        Self {
            mode,
            lines,
            columns,
            window: Window {
                top: 0,
                bottom: lines - 1,
                left: 0,
                right: columns - 1,
            },
            h: 0,
            v: 0,
            attr,
            roll_enabled: true,
            grid: vec![PackedCell::blank(attr); lines as usize * columns as usize],
            dbl: vec![0; lines as usize],
        }
    }

    pub fn cell(&self, h: u16, v: u16) -> PackedCell {
        self.grid[v as usize * self.columns as usize + h as usize]
    }

    pub fn set_cell(&mut self, h: u16, v: u16, cell: PackedCell) {
        self.grid[v as usize * self.columns as usize + h as usize] = cell;
    }

    fn blank(&self) -> PackedCell {
        PackedCell::blank(self.attr)
    }

    // --- cursor ---

    pub fn set_cursor(&mut self, h: u16, v: u16) {
        self.h = h.clamp(self.window.left, self.window.right);
        self.v = v.clamp(self.window.top, self.window.bottom);
    }

    pub fn set_h(&mut self, h: u16) {
        self.h = h.clamp(self.window.left, self.window.right);
    }

    pub fn set_v(&mut self, v: u16) {
        self.v = v.clamp(self.window.top, self.window.bottom);
    }

    pub fn move_h(&mut self, delta: i32) {
        self.set_h((self.h as i32 + delta).max(0) as u16);
    }

    pub fn move_v(&mut self, delta: i32) {
        self.set_v((self.v as i32 + delta).max(0) as u16);
    }

    pub fn carriage_return(&mut self) {
        self.h = self.window.left;
    }

    /// Line feed: down one row, rolling at the bottom when enabled.
    pub fn line_feed(&mut self) {
        if self.v < self.window.bottom {
            self.v += 1;
        } else if self.roll_enabled {
            self.roll(RollDir::Up);
        }
    }

    pub fn new_line(&mut self) {
        self.carriage_return();
        self.line_feed();
    }

    pub fn home_up(&mut self) {
        self.h = self.window.left;
        self.v = self.window.top;
    }

    pub fn home_down(&mut self) {
        self.h = self.window.left;
        self.v = self.window.bottom;
    }

    pub fn end_up(&mut self) {
        self.h = self.window.right;
        self.v = self.window.top;
    }

    pub fn end_down(&mut self) {
        self.h = self.window.right;
        self.v = self.window.bottom;
    }

    // --- window ---

    pub fn set_window(&mut self, top: u16, bottom: u16, left: u16, right: u16) {
        let top = top.min(self.lines - 1);
        let bottom = bottom.clamp(top, self.lines - 1);
        let left = left.min(self.columns - 1);
        let right = right.clamp(left, self.columns - 1);
        self.window = Window {
            top,
            bottom,
            left,
            right,
        };
        self.set_cursor(self.h, self.v);
    }

    pub fn reset_window(&mut self) {
        self.window = Window {
            top: 0,
            bottom: self.lines - 1,
            left: 0,
            right: self.columns - 1,
        };
    }

    // --- attributes ---

    pub fn set_flag(&mut self, flag: Attrs, on: bool) {
        if on {
            self.attr |= flag.bits();
        } else {
            self.attr &= !flag.bits();
        }
    }

    pub fn has_flag(&self, flag: Attrs) -> bool {
        self.attr & flag.bits() != 0
    }

    pub fn all_flags_off(&mut self) {
        self.attr &= !Attrs::all().bits();
    }

    pub fn set_fg(&mut self, color: u8) {
        self.attr = self.mode.with_fg(self.attr, color);
    }

    pub fn set_bg(&mut self, color: u8) {
        self.attr = self.mode.with_bg(self.attr, color);
    }

    pub fn fg(&self) -> u8 {
        self.mode.fg(self.attr)
    }

    pub fn bg(&self) -> u8 {
        self.mode.bg(self.attr)
    }

    // --- writing ---

    /// Write one character at the cursor, advancing unless the cursor is
    /// pinned at the window's right edge.
    pub fn write_char(&mut self, ch: u8) {
        let cell = PackedCell::new(ch, self.attr & !Attrs::GRAPHIC.bits());
        self.set_cell(self.h, self.v, cell);
        if self.h < self.window.right {
            self.h += 1;
        }
    }

    /// Write a run of characters. The run clamps at the window's right
    /// edge: overflow is discarded and the cursor stays pinned on the
    /// last column, one pending advance short of where the full run
    /// would have put it.
    pub fn write_text(&mut self, text: &[u8]) {
        let avail = (self.window.right - self.h + 1) as usize;
        let n = text.len().min(avail);
        for (i, &ch) in text[..n].iter().enumerate() {
            let h = self.h + i as u16;
            self.set_cell(h, self.v, PackedCell::new(ch, self.attr & !Attrs::GRAPHIC.bits()));
        }
        let end = self.h as usize + text.len();
        self.h = (end as u16).min(self.window.right);
    }

    /// Write a graphic symbol cell at the cursor.
    pub fn write_graphic(&mut self, sym: u8) {
        let cell = PackedCell::new(sym, self.attr | Attrs::GRAPHIC.bits());
        self.set_cell(self.h, self.v, cell);
        if self.h < self.window.right {
            self.h += 1;
        }
    }

    /// Repeat `ch` down the column starting at the cursor.
    pub fn repeat_down(&mut self, ch: u8, count: u16) {
        let end = (self.v + count.saturating_sub(1)).min(self.window.bottom);
        for v in self.v..=end {
            self.set_cell(
                self.h,
                v,
                PackedCell::new(ch, self.attr & !Attrs::GRAPHIC.bits()),
            );
        }
        self.v = end;
    }

    // --- erasing ---

    pub fn erase_rect(&mut self, top: u16, bottom: u16, left: u16, right: u16) {
        let blank = self.blank();
        for v in top..=bottom.min(self.lines - 1) {
            for h in left..=right.min(self.columns - 1) {
                self.set_cell(h, v, blank);
            }
        }
    }

    /// Erase the whole active window, cursor to its top-left.
    pub fn erase_screen(&mut self) {
        let Window {
            top,
            bottom,
            left,
            right,
        } = self.window;
        self.erase_rect(top, bottom, left, right);
        self.h = left;
        self.v = top;
        for v in top..=bottom {
            self.dbl[v as usize] = 0;
        }
    }

    /// Erase from the cursor to the end of the window.
    pub fn erase_from(&mut self) {
        let Window {
            bottom,
            left,
            right,
            ..
        } = self.window;
        self.erase_rect(self.v, self.v, self.h, right);
        if self.v < bottom {
            self.erase_rect(self.v + 1, bottom, left, right);
        }
    }

    /// Erase from the cursor to the end of the line.
    pub fn erase_line(&mut self) {
        self.erase_rect(self.v, self.v, self.h, self.window.right);
    }

    // --- rolling ---

    pub fn roll(&mut self, dir: RollDir) {
        let Window {
            top,
            bottom,
            left,
            right,
        } = self.window;
        self.roll_region(dir, top, bottom, left, right);
    }

    /// Roll a region by one cell. A degenerate region (single row for a
    /// vertical roll, single column for a horizontal one) just erases.
    pub fn roll_region(&mut self, dir: RollDir, top: u16, bottom: u16, left: u16, right: u16) {
        let blank = self.blank();
        match dir {
            RollDir::Up => {
                for v in top..bottom {
                    for h in left..=right {
                        let cell = self.cell(h, v + 1);
                        self.set_cell(h, v, cell);
                    }
                }
                self.erase_rect(bottom, bottom, left, right);
            }
            RollDir::Down => {
                for v in (top..bottom).rev() {
                    for h in left..=right {
                        let cell = self.cell(h, v);
                        self.set_cell(h, v + 1, cell);
                    }
                }
                self.erase_rect(top, top, left, right);
            }
            RollDir::Left => {
                for v in top..=bottom {
                    for h in left..right {
                        let cell = self.cell(h + 1, v);
                        self.set_cell(h, v, cell);
                    }
                    self.set_cell(right, v, blank);
                }
            }
            RollDir::Right => {
                for v in top..=bottom {
                    for h in (left..right).rev() {
                        let cell = self.cell(h, v);
                        self.set_cell(h + 1, v, cell);
                    }
                    self.set_cell(left, v, blank);
                }
            }
        }
    }

    // --- lines ---

    /// Open a blank line below the cursor row.
    pub fn open_line(&mut self) {
        if self.v < self.window.bottom {
            let Window { bottom, left, right, .. } = self.window;
            self.roll_region(RollDir::Down, self.v + 1, bottom, left, right);
        }
    }

    /// Close the line below the cursor row.
    pub fn close_line(&mut self) {
        if self.v < self.window.bottom {
            let Window { bottom, left, right, .. } = self.window;
            self.roll_region(RollDir::Up, self.v + 1, bottom, left, right);
        }
    }

    /// Insert a blank line at the cursor row, pushing the rest down.
    pub fn insert_line(&mut self) {
        let Window { bottom, left, right, .. } = self.window;
        self.roll_region(RollDir::Down, self.v, bottom, left, right);
    }

    /// Delete the cursor row, pulling the rest up.
    pub fn delete_line(&mut self) {
        let Window { bottom, left, right, .. } = self.window;
        self.roll_region(RollDir::Up, self.v, bottom, left, right);
    }

    // --- characters ---

    /// Insert a blank at (h, v), shifting the rest of the window row right.
    /// Coordinates clamp into the window; the wire may carry anything.
    pub fn insert_char(&mut self, h: u16, v: u16) {
        let h = h.clamp(self.window.left, self.window.right);
        let v = v.clamp(self.window.top, self.window.bottom);
        let right = self.window.right;
        for col in (h..right).rev() {
            let cell = self.cell(col, v);
            self.set_cell(col + 1, v, cell);
        }
        let blank = self.blank();
        self.set_cell(h, v, blank);
    }

    /// Delete the character at (h, v), shifting the rest of the window
    /// row left and blanking the last column.
    pub fn delete_char(&mut self, h: u16, v: u16) {
        let h = h.clamp(self.window.left, self.window.right);
        let v = v.clamp(self.window.top, self.window.bottom);
        let right = self.window.right;
        for col in h..right {
            let cell = self.cell(col + 1, v);
            self.set_cell(col, v, cell);
        }
        let blank = self.blank();
        self.set_cell(right, v, blank);
    }

    // --- rectangles ---

    /// Copy out a rectangle of cells, row-major.
    pub fn get_rect(&self, top: u16, bottom: u16, left: u16, right: u16) -> Vec<PackedCell> {
        let mut out = Vec::with_capacity(
            (bottom - top + 1) as usize * (right - left + 1) as usize,
        );
        for v in top..=bottom {
            for h in left..=right {
                out.push(self.cell(h, v));
            }
        }
        out
    }

    /// Paste a rectangle of cells copied by [`get_rect`].
    ///
    /// [`get_rect`]: ShadowState::get_rect
    pub fn put_rect(&mut self, top: u16, bottom: u16, left: u16, right: u16, cells: &[PackedCell]) {
        let mut it = cells.iter();
        for v in top..=bottom {
            for h in left..=right {
                if let Some(&cell) = it.next() {
                    self.set_cell(h, v, cell);
                }
            }
        }
    }

    // --- double-size rows ---

    pub fn set_dbl(&mut self, flag: u8, on: bool) {
        if on {
            self.dbl[self.v as usize] |= flag;
        } else {
            self.dbl[self.v as usize] &= !flag;
        }
    }

    pub fn dbl_flags(&self, v: u16) -> u8 {
        self.dbl[v as usize]
    }
}
