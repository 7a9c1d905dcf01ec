//! ANSI escape sequence parsing for log ingestion.
//!
//! Converts one logical line of text (no embedded newlines — the stream
//! line reader has already split those out) into a sequence of styled
//! [`TextSegment`]s. This is a small table-driven scanner, not a full
//! terminal emulator: reset/bold/dim/italic/underline/inverse/strikethrough
//! plus indexed 16-color and truecolor SGR parameters are recognized;
//! everything else is dropped without corrupting segmentation.

use serde::{Deserialize, Serialize};

/// Bitmask of text attributes a segment may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Attributes(u8);

impl Attributes {
    pub const BOLD: Attributes = Attributes(1 << 0);
    pub const DIM: Attributes = Attributes(1 << 1);
    pub const ITALIC: Attributes = Attributes(1 << 2);
    pub const UNDERLINE: Attributes = Attributes(1 << 3);
    pub const INVERSE: Attributes = Attributes(1 << 4);
    pub const STRIKETHROUGH: Attributes = Attributes(1 << 5);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Attributes) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Attributes) {
        self.0 |= other.0;
    }
}

/// One run of text sharing a single style.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextSegment {
    pub text: String,
    pub color: Option<String>,
    pub bg_color: Option<String>,
    pub color_index: Option<u8>,
    pub bg_color_index: Option<u8>,
    pub attributes: Attributes,
}

impl TextSegment {
    fn new(text: String, state: &AnsiState) -> Self {
        Self {
            text,
            color: state.color.clone(),
            bg_color: state.bg_color.clone(),
            color_index: state.color_index,
            bg_color_index: state.bg_color_index,
            attributes: state.attributes,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct AnsiState {
    color: Option<String>,
    bg_color: Option<String>,
    color_index: Option<u8>,
    bg_color_index: Option<u8>,
    attributes: Attributes,
}

impl AnsiState {
    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Parses one logical line into a sequence of styled segments.
pub fn segment_line(line: &str) -> Vec<TextSegment> {
    let mut segments = Vec::new();
    let mut buffer = String::new();
    let mut state = AnsiState::default();
    let mut chars = line.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '\x1b' {
            if matches!(chars.peek(), Some('[')) {
                chars.next();
                let mut params = String::new();
                let mut final_byte = None;
                while let Some(&c) = chars.peek() {
                    if ('@'..='~').contains(&c) {
                        final_byte = Some(c);
                        chars.next();
                        break;
                    }
                    params.push(c);
                    chars.next();
                }
                if final_byte == Some('m') {
                    flush(&mut segments, &mut buffer, &state);
                    apply_sgr(&mut state, &params);
                }
                // Any other CSI final byte (cursor moves, erase, etc.) is
                // simply consumed; it carries no segment-relevant style.
                continue;
            }
            // Unrecognized escape introducer (OSC, single-char escapes, ...):
            // drop just the ESC byte so raw control bytes never leak into
            // segment text.
            continue;
        }
        buffer.push(ch);
    }
    flush(&mut segments, &mut buffer, &state);
    segments
}

fn flush(segments: &mut Vec<TextSegment>, buffer: &mut String, state: &AnsiState) {
    if buffer.is_empty() {
        return;
    }
    segments.push(TextSegment::new(std::mem::take(buffer), state));
}

fn apply_sgr(state: &mut AnsiState, params: &str) {
    let values = parse_params(params);
    let mut i = 0;
    while i < values.len() {
        match values[i] {
            0 => state.reset(),
            1 => state.attributes.insert(Attributes::BOLD),
            2 => state.attributes.insert(Attributes::DIM),
            3 => state.attributes.insert(Attributes::ITALIC),
            4 => state.attributes.insert(Attributes::UNDERLINE),
            7 => state.attributes.insert(Attributes::INVERSE),
            9 => state.attributes.insert(Attributes::STRIKETHROUGH),
            30..=37 => {
                state.color_index = Some((values[i] - 30) as u8);
                state.color = None;
            }
            90..=97 => {
                state.color_index = Some((values[i] - 90 + 8) as u8);
                state.color = None;
            }
            40..=47 => {
                state.bg_color_index = Some((values[i] - 40) as u8);
                state.bg_color = None;
            }
            100..=107 => {
                state.bg_color_index = Some((values[i] - 100 + 8) as u8);
                state.bg_color = None;
            }
            39 => {
                state.color_index = None;
                state.color = None;
            }
            49 => {
                state.bg_color_index = None;
                state.bg_color = None;
            }
            38 | 48 => {
                let is_fg = values[i] == 38;
                if let Some((advance, hex, index)) = parse_extended_color(&values[i + 1..]) {
                    if is_fg {
                        state.color = hex;
                        state.color_index = index;
                    } else {
                        state.bg_color = hex;
                        state.bg_color_index = index;
                    }
                    i += advance;
                }
            }
            _ => {}
        }
        i += 1;
    }
}

fn parse_params(params: &str) -> Vec<i32> {
    if params.is_empty() {
        return vec![0];
    }
    let mut values = Vec::new();
    for part in params.split(';') {
        if part.is_empty() {
            values.push(0);
        } else if let Ok(value) = part.parse::<i32>() {
            values.push(value);
        }
    }
    if values.is_empty() {
        values.push(0);
    }
    values
}

/// Parses the tail of a `38;...`/`48;...` SGR sequence.
///
/// Returns how many extra parameters were consumed, plus the resulting
/// color expressed as a hex string (truecolor) or a palette index.
fn parse_extended_color(values: &[i32]) -> Option<(usize, Option<String>, Option<u8>)> {
    match values.first()? {
        5 => {
            let index = u8::try_from(*values.get(1)?).ok()?;
            Some((2, None, Some(index)))
        }
        2 => {
            let r = u8::try_from(*values.get(1)?).ok()?;
            let g = u8::try_from(*values.get(2)?).ok()?;
            let b = u8::try_from(*values.get(3)?).ok()?;
            Some((4, Some(format!("#{r:02x}{g:02x}{b:02x}")), None))
        }
        _ => None,
    }
}
