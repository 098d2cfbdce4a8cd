//! Character classification tables and the parsers built on them.
//!
//! A cage's C library classifies characters through a table that lives in
//! the cage's own memory and is reached through its thread-local block.  The
//! table has 384 `u16` entries so that any `c` in `-128..=255` indexes it as
//! `table[c + 128]`.  Bits follow the glibc order.
//!
//! ## Authors
//!
//! The Veracruz Development Team.
//!
//! ## Licensing and copyright notice
//!
//! See the `LICENSE.md` file in the Veracruz root directory for
//! information on licensing and copyright.

use crate::error::{RuntimeError, RuntimeResult};

/// Number of entries in a classification table.
pub const CTYPE_TABLE_ENTRIES: u32 = 384;
/// Size of a classification table in guest memory.
pub const CTYPE_TABLE_SIZE: u32 = CTYPE_TABLE_ENTRIES * 2;

/// The classification bits of one character.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CharClass(pub u16);

impl CharClass {
    pub const UPPER: u16 = 1 << 0;
    pub const LOWER: u16 = 1 << 1;
    pub const ALPHA: u16 = 1 << 2;
    pub const DIGIT: u16 = 1 << 3;
    pub const XDIGIT: u16 = 1 << 4;
    pub const SPACE: u16 = 1 << 5;
    pub const PRINT: u16 = 1 << 6;
    pub const GRAPH: u16 = 1 << 7;
    pub const BLANK: u16 = 1 << 8;
    pub const CNTRL: u16 = 1 << 9;
    pub const PUNCT: u16 = 1 << 10;
    pub const ALNUM: u16 = 1 << 11;

    #[inline]
    fn has(self, bit: u16) -> bool {
        self.0 & bit != 0
    }

    pub fn is_upper(self) -> bool {
        self.has(Self::UPPER)
    }

    pub fn is_lower(self) -> bool {
        self.has(Self::LOWER)
    }

    pub fn is_alpha(self) -> bool {
        self.has(Self::ALPHA)
    }

    pub fn is_digit(self) -> bool {
        self.has(Self::DIGIT)
    }

    pub fn is_xdigit(self) -> bool {
        self.has(Self::XDIGIT)
    }

    pub fn is_space(self) -> bool {
        self.has(Self::SPACE)
    }

    pub fn is_alnum(self) -> bool {
        self.has(Self::ALNUM)
    }

    pub fn is_punct(self) -> bool {
        self.has(Self::PUNCT)
    }
}

fn classify_ascii(c: u8) -> u16 {
    let mut bits = 0;
    if c.is_ascii_uppercase() {
        bits |= CharClass::UPPER;
    }
    if c.is_ascii_lowercase() {
        bits |= CharClass::LOWER;
    }
    if c.is_ascii_alphabetic() {
        bits |= CharClass::ALPHA;
    }
    if c.is_ascii_digit() {
        bits |= CharClass::DIGIT;
    }
    if c.is_ascii_hexdigit() {
        bits |= CharClass::XDIGIT;
    }
    // NOTE: the C locale counts \v as a space, unlike `is_ascii_whitespace`.
    if c.is_ascii_whitespace() || c == 0x0b {
        bits |= CharClass::SPACE;
    }
    if (0x20..0x7f).contains(&c) {
        bits |= CharClass::PRINT;
    }
    if c.is_ascii_graphic() {
        bits |= CharClass::GRAPH;
    }
    if c == b' ' || c == b'\t' {
        bits |= CharClass::BLANK;
    }
    if c.is_ascii_control() {
        bits |= CharClass::CNTRL;
    }
    if c.is_ascii_punctuation() {
        bits |= CharClass::PUNCT;
    }
    if c.is_ascii_alphanumeric() {
        bits |= CharClass::ALNUM;
    }
    bits
}

lazy_static! {
    /// The "C" locale table.  Entries outside ASCII are unclassified.
    pub static ref C_LOCALE_TABLE: Vec<u16> = (-128i32..256)
        .map(|c| if (0..128).contains(&c) { classify_ascii(c as u8) } else { 0 })
        .collect();
}

////////////////////////////////////////////////////////////////////////////////
// Numeric parsing.
////////////////////////////////////////////////////////////////////////////////

/// The result of a `strtol`-style parse.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Parsed<T> {
    /// The converted value, clamped on overflow.
    pub value: T,
    /// Number of bytes consumed; zero when no digits were found.
    pub consumed: usize,
    /// Whether the value overflowed and was clamped (`ERANGE`).
    pub overflow: bool,
}

/// Parses an unsigned magnitude with C `strtol` conventions: leading
/// whitespace, an optional sign, and a `0x`/`0` prefix when `base` is 0 or 16.
/// `classify` supplies the cage's classification of each byte.
fn parse_magnitude<F>(
    bytes: &[u8],
    base: u32,
    classify: F,
) -> RuntimeResult<(bool, u128, usize, bool)>
where
    F: Fn(u8) -> RuntimeResult<CharClass>,
{
    if base == 1 || base > 36 {
        return Err(RuntimeError::InvalidArgument);
    }
    let mut i = 0;
    while i < bytes.len() && classify(bytes[i])?.is_space() {
        i += 1;
    }
    let mut negative = false;
    if i < bytes.len() && (bytes[i] == b'+' || bytes[i] == b'-') {
        negative = bytes[i] == b'-';
        i += 1;
    }
    let mut base = base;
    let has_hex_prefix = bytes.get(i) == Some(&b'0')
        && matches!(bytes.get(i + 1), Some(b'x') | Some(b'X'))
        && match bytes.get(i + 2) {
            Some(c) => classify(*c)?.is_xdigit(),
            None => false,
        };
    if (base == 0 || base == 16) && has_hex_prefix {
        base = 16;
        i += 2;
    } else if base == 0 {
        base = if bytes.get(i) == Some(&b'0') { 8 } else { 10 };
    }

    let start = i;
    let mut value: u128 = 0;
    let mut overflow = false;
    while i < bytes.len() {
        let c = bytes[i];
        let class = classify(c)?;
        let digit = if class.is_digit() {
            c.wrapping_sub(b'0') as u32
        } else if class.is_alpha() {
            let lower = if class.is_upper() { c | 0x20 } else { c };
            lower.wrapping_sub(b'a') as u32 + 10
        } else {
            break;
        };
        if digit >= base {
            break;
        }
        value = match value
            .checked_mul(base as u128)
            .and_then(|v| v.checked_add(digit as u128))
        {
            Some(v) if v <= u64::MAX as u128 + 1 => v,
            _ => {
                overflow = true;
                u64::MAX as u128 + 1
            }
        };
        i += 1;
    }
    if i == start {
        return Ok((false, 0, 0, false));
    }
    Ok((negative, value, i, overflow))
}

/// `strtol` over `bytes`.
pub fn strtol<F>(bytes: &[u8], base: u32, classify: F) -> RuntimeResult<Parsed<i64>>
where
    F: Fn(u8) -> RuntimeResult<CharClass>,
{
    let (negative, magnitude, consumed, mut overflow) = parse_magnitude(bytes, base, classify)?;
    let value = if negative {
        if magnitude > i64::MAX as u128 + 1 {
            overflow = true;
            i64::MIN
        } else {
            (magnitude as i128).wrapping_neg() as i64
        }
    } else if magnitude > i64::MAX as u128 {
        overflow = true;
        i64::MAX
    } else {
        magnitude as i64
    };
    Ok(Parsed {
        value,
        consumed,
        overflow,
    })
}

/// `strtoul` over `bytes`.  A negative input wraps, as in C.
pub fn strtoul<F>(bytes: &[u8], base: u32, classify: F) -> RuntimeResult<Parsed<u64>>
where
    F: Fn(u8) -> RuntimeResult<CharClass>,
{
    let (negative, magnitude, consumed, mut overflow) = parse_magnitude(bytes, base, classify)?;
    let value = if magnitude > u64::MAX as u128 {
        overflow = true;
        u64::MAX
    } else if negative {
        (magnitude as u64).wrapping_neg()
    } else {
        magnitude as u64
    };
    Ok(Parsed {
        value,
        consumed,
        overflow,
    })
}
