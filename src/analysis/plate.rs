//! License plate text normalization
//!
//! Converts noisy recognizer output into the canonical `XXX-X-XXX` shape used
//! for driver lookups. Reads from small plate crops are often short or carry
//! stray symbols, so malformed input is coerced into shape instead of being
//! rejected.

/// Number of payload characters in a canonical plate (without separators)
pub const PLATE_LEN: usize = 7;

/// Filler used when a read is shorter than [`PLATE_LEN`].
///
/// Force-padding trades precision for recall: a truncated read still produces
/// a lookup key, at the risk of matching the wrong driver.
pub const PLATE_PAD_CHAR: char = '0';

/// Separator between plate groups
pub const PLATE_SEPARATOR: char = '-';

/// Normalize raw OCR text into the canonical plate format.
///
/// Returns `None` for empty input. Any other input produces a string of the
/// form `AAA-D-AAA`:
///
/// 1. keep ASCII letters and digits, uppercase
/// 2. collapse `O0` into `O`, then `0O` into `0`
/// 3. an `O` at index 2 becomes `0`
/// 4. if the last three characters are all letters, each becomes `0`
/// 5. right-pad with `0` to seven characters
/// 6. split into 3-1-3 groups (extra characters are dropped)
pub fn normalize_plate(text: &str) -> Option<String> {
    if text.is_empty() {
        return None;
    }

    let mut cleaned: String = text
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_uppercase())
        .collect();

    // Common O/0 confusions
    cleaned = cleaned.replace("O0", "O");
    cleaned = cleaned.replace("0O", "0");

    let mut chars: Vec<char> = cleaned.chars().collect();

    if chars.len() >= 3 && chars[2] == 'O' {
        chars[2] = '0';
    }

    // The numeric suffix is never all letters
    let len = chars.len();
    if len >= 6 && chars[len - 3..].iter().all(char::is_ascii_alphabetic) {
        for c in &mut chars[len - 3..] {
            *c = '0';
        }
    }

    while chars.len() < PLATE_LEN {
        chars.push(PLATE_PAD_CHAR);
    }

    let head: String = chars[0..3].iter().collect();
    let tail: String = chars[4..PLATE_LEN].iter().collect();
    Some(format!(
        "{head}{sep}{mid}{sep}{tail}",
        mid = chars[3],
        sep = PLATE_SEPARATOR
    ))
}

/// Normalize an optional read; `None` stays `None`
pub fn normalize_plate_opt(text: Option<&str>) -> Option<String> {
    text.and_then(normalize_plate)
}

/// Check whether a string already has the canonical `XXX-X-XXX` layout
pub fn is_canonical(plate: &str) -> bool {
    let chars: Vec<char> = plate.chars().collect();
    chars.len() == PLATE_LEN + 2
        && chars[3] == PLATE_SEPARATOR
        && chars[5] == PLATE_SEPARATOR
        && chars
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != 3 && *i != 5)
            .all(|(_, c)| c.is_ascii_uppercase() || c.is_ascii_digit())
}
