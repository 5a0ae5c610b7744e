//! File name handling for received files.
//!
//! Advertised names come from the network and are treated as untrusted. The
//! sanitized form is a single path component: no separators, no control
//! characters, no leading dots.

use crate::MAX_NAME_LEN;

/// Characters rejected by at least one common file system
const RESERVED: &[char] = &['<', '>', ':', '"', '|', '?', '*'];

/// Reduce an advertised name to a safe file name
///
/// Only the last path component survives. Returns an empty string when
/// nothing usable is left; callers pick a generated name in that case.
pub fn sanitize_file_name(raw: &str) -> String {
    let last = raw.rsplit(['/', '\\']).next().unwrap_or_default();

    let cleaned: String = last
        .chars()
        .filter(|c| !c.is_control() && !RESERVED.contains(c))
        .collect();
    let cleaned = cleaned
        .trim_start_matches(|c: char| c == '.' || c.is_whitespace())
        .trim_end();

    truncate(cleaned, MAX_NAME_LEN).trim_end().to_string()
}

fn truncate(name: &str, max: usize) -> &str {
    if name.len() <= max {
        return name;
    }
    let mut end = max;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// `attempt`-th candidate for `name`: `photo.jpg`, `photo (1).jpg`, ...
pub fn candidate_name(name: &str, attempt: u32) -> String {
    if attempt == 0 {
        return name.to_string();
    }
    match name.rfind('.') {
        Some(dot) if dot > 0 => format!("{} ({attempt}){}", &name[..dot], &name[dot..]),
        _ => format!("{name} ({attempt})"),
    }
}
