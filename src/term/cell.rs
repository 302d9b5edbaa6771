//! Packed cell layout.
//!
//! Every screen cell is one `u64`: the character byte in the low 8 bits,
//! display attribute flags in bits 16..22, and foreground/background
//! color fields whose position and width depend on the color mode.
//! Keeping the layout identical on both ends is what makes the shadow
//! stores comparable byte for byte.

use bitflags::bitflags;

bitflags! {
    /// Display attribute flags, stored shifted into bits 16..22.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Attrs: u64 {
        const UNDERLINE = 0x0001_0000;
        const BLINK     = 0x0002_0000;
        const BOLD      = 0x0004_0000;
        const DIM       = 0x0008_0000;
        const REVERSE   = 0x0010_0000;
        const GRAPHIC   = 0x0020_0000;
    }
}

/// Mask covering all attribute flag bits.
pub const ATTR_MASK: u64 = 0x003F_0000;
/// Shift from flag bits down to a single byte (snapshot encoding).
pub const ATTR_SHIFT: u32 = 16;

pub const BLACK: u8 = 0;
pub const WHITE: u8 = 7;

/// Color field layout selector, negotiated at session start.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ColorMode {
    /// 16 colors in 4-bit fields at bits 8 and 12; palette in the
    /// historical order black, blue, green, cyan, red, magenta,
    /// yellow, white.
    #[default]
    Legacy,
    /// 256 colors in 8-bit fields at bits 32 and 40; palette in ANSI
    /// order black, red, green, yellow, blue, magenta, cyan, white.
    Ansi256,
}

const LEGACY_PALETTE: [&str; 8] = [
    "black", "blue", "green", "cyan", "red", "magenta", "yellow", "white",
];
const ANSI_PALETTE: [&str; 8] = [
    "black", "red", "green", "yellow", "blue", "magenta", "cyan", "white",
];

impl ColorMode {
    pub fn fg_shift(self) -> u32 {
        match self {
            ColorMode::Legacy => 8,
            ColorMode::Ansi256 => 32,
        }
    }

    pub fn bg_shift(self) -> u32 {
        match self {
            ColorMode::Legacy => 12,
            ColorMode::Ansi256 => 40,
        }
    }

    pub fn color_mask(self) -> u64 {
        match self {
            ColorMode::Legacy => 0x0F,
            ColorMode::Ansi256 => 0xFF,
        }
    }

    pub fn max_color(self) -> u8 {
        match self {
            ColorMode::Legacy => 15,
            ColorMode::Ansi256 => 255,
        }
    }

    /// Bytes a cell occupies in the snapshot stream.
    pub fn snapshot_cell_width(self) -> usize {
        match self {
            ColorMode::Legacy => 3,
            ColorMode::Ansi256 => 4,
        }
    }

    /// Element tag for a base foreground color, `<black/>`..`<white/>`.
    pub fn color_tag(self, color: u8) -> Option<&'static str> {
        let palette = match self {
            ColorMode::Legacy => &LEGACY_PALETTE,
            ColorMode::Ansi256 => &ANSI_PALETTE,
        };
        palette.get(color as usize).copied()
    }

    /// Palette index for a base color tag (without any `bg` prefix).
    pub fn color_index(self, tag: &str) -> Option<u8> {
        let palette = match self {
            ColorMode::Legacy => &LEGACY_PALETTE,
            ColorMode::Ansi256 => &ANSI_PALETTE,
        };
        palette.iter().position(|&name| name == tag).map(|i| i as u8)
    }

    pub fn fg(self, word: u64) -> u8 {
        ((word >> self.fg_shift()) & self.color_mask()) as u8
    }

    pub fn bg(self, word: u64) -> u8 {
        ((word >> self.bg_shift()) & self.color_mask()) as u8
    }

    pub fn with_fg(self, word: u64, color: u8) -> u64 {
        (word & !(self.color_mask() << self.fg_shift()))
            | ((color as u64 & self.color_mask()) << self.fg_shift())
    }

    pub fn with_bg(self, word: u64, color: u8) -> u64 {
        (word & !(self.color_mask() << self.bg_shift()))
            | ((color as u64 & self.color_mask()) << self.bg_shift())
    }

    /// White on black, no flags. The attribute word a session starts with.
    pub fn default_attr(self) -> u64 {
        self.with_fg(self.with_bg(0, BLACK), WHITE)
    }
}

/// One screen cell: character byte plus attribute/color bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PackedCell(pub u64);

impl PackedCell {
    pub fn new(ch: u8, attr: u64) -> Self {
        Self((attr & !0xFF) | ch as u64)
    }

    /// Blank cell carrying the colors of `attr` but no flags.
    pub fn blank(attr: u64) -> Self {
        let colors = attr & !(ATTR_MASK | 0xFF);
        Self(colors | b' ' as u64)
    }

    pub fn ch(self) -> u8 {
        (self.0 & 0xFF) as u8
    }

    /// Attribute word: everything but the character byte.
    pub fn attr(self) -> u64 {
        self.0 & !0xFF
    }

    pub fn flags(self) -> Attrs {
        Attrs::from_bits_truncate(self.0 & ATTR_MASK)
    }

    pub fn fg(self, mode: ColorMode) -> u8 {
        mode.fg(self.0)
    }

    pub fn bg(self, mode: ColorMode) -> u8 {
        mode.bg(self.0)
    }
}

/// Graphic symbol tags, indexed by the symbol value stored in a
/// graphic cell's character byte.
pub const GRAPHIC_TAGS: [&str; 15] = [
    "hln", "vln", "crs", "ulc", "urc", "llc", "lrc", "rtk", "dtk", "ltk", "utk", "upa", "rta",
    "dna", "lfa",
];

pub fn graphic_index(tag: &str) -> Option<u8> {
    GRAPHIC_TAGS.iter().position(|&t| t == tag).map(|i| i as u8)
}

/// Unicode rendering of a graphic symbol for the local display.
pub fn graphic_char(sym: u8) -> char {
    const CHARS: [char; 15] = [
        '─', '│', '┼', '┌', '┐', '└', '┘', '├', '┬', '┤', '┴', '↑', '→', '↓', '←',
    ];
    CHARS.get(sym as usize).copied().unwrap_or(' ')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_fields_by_mode() {
        for mode in [ColorMode::Legacy, ColorMode::Ansi256] {
            let attr = mode.with_fg(mode.with_bg(0, 3), 6);
            assert_eq!(mode.fg(attr), 6);
            assert_eq!(mode.bg(attr), 3);
            // color fields never touch the char or flag bits
            assert_eq!(attr & 0xFF, 0);
            assert_eq!(attr & ATTR_MASK, 0);
        }
        // 256-color values only fit in ansi mode
        let attr = ColorMode::Ansi256.with_fg(0, 200);
        assert_eq!(ColorMode::Ansi256.fg(attr), 200);
    }

    #[test]
    fn test_palette_order_differs() {
        assert_eq!(ColorMode::Legacy.color_tag(1), Some("blue"));
        assert_eq!(ColorMode::Ansi256.color_tag(1), Some("red"));
        assert_eq!(ColorMode::Legacy.color_index("red"), Some(4));
        assert_eq!(ColorMode::Ansi256.color_index("red"), Some(1));
        // white and black agree in both orders
        for mode in [ColorMode::Legacy, ColorMode::Ansi256] {
            assert_eq!(mode.color_index("black"), Some(BLACK));
            assert_eq!(mode.color_index("white"), Some(WHITE));
        }
    }

    #[test]
    fn test_blank_keeps_colors_drops_flags() {
        let mode = ColorMode::Legacy;
        let attr = mode.with_fg(0, 4) | Attrs::REVERSE.bits() | Attrs::BOLD.bits();
        let blank = PackedCell::blank(attr);
        assert_eq!(blank.ch(), b' ');
        assert_eq!(blank.fg(mode), 4);
        assert!(blank.flags().is_empty());
    }
}
