//! The `key:value,…` textual map grammar.
//!
//! Used by the file header, chunk descriptors (`chunk.<id>` meta entries),
//! tree metadata (`map.<id>` entries), and the builder's string form. Keys
//! run up to the first `:`; values are quoted with `"` and backslash escapes
//! only when they contain a comma or a quote, so the common case stays
//! human-readable:
//!
//! ```text
//! H:3,blockSize:4096,format:1,creationTime:1706000000
//! name:"a,b",createVersion:7
//! ```

use std::collections::BTreeMap;

use crate::FormatError;

/// Appends one `key:value` entry to `buf`, separating with a comma if the
/// buffer is non-empty and quoting the value when needed.
pub fn append_map(buf: &mut String, key: &str, value: &str) {
    if !buf.is_empty() {
        buf.push(',');
    }
    buf.push_str(key);
    buf.push(':');
    if value.contains(',') || value.contains('"') {
        buf.push('"');
        for c in value.chars() {
            if c == '"' || c == '\\' {
                buf.push('\\');
            }
            buf.push(c);
        }
        buf.push('"');
    } else {
        buf.push_str(value);
    }
}

/// Serializes a whole map, entries in key order.
#[must_use]
pub fn format_map(map: &BTreeMap<String, String>) -> String {
    let mut buf = String::new();
    for (k, v) in map {
        append_map(&mut buf, k, v);
    }
    buf
}

/// Parses a map string produced by [`append_map`]/[`format_map`].
pub fn parse_map(s: &str) -> Result<BTreeMap<String, String>, FormatError> {
    let mut map = BTreeMap::new();
    let chars: Vec<char> = s.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let key_start = i;
        while i < chars.len() && chars[i] != ':' {
            i += 1;
        }
        if i == chars.len() {
            return Err(FormatError::BadMap(key_start));
        }
        let key: String = chars[key_start..i].iter().collect();
        i += 1;
        let mut value = String::new();
        while i < chars.len() {
            let c = chars[i];
            i += 1;
            if c == ',' {
                break;
            } else if c == '"' {
                loop {
                    let Some(&q) = chars.get(i) else {
                        return Err(FormatError::BadMap(i));
                    };
                    i += 1;
                    if q == '\\' {
                        let Some(&escaped) = chars.get(i) else {
                            return Err(FormatError::BadMap(i));
                        };
                        i += 1;
                        value.push(escaped);
                    } else if q == '"' {
                        break;
                    } else {
                        value.push(q);
                    }
                }
            } else {
                value.push(c);
            }
        }
        map.insert(key, value);
    }
    Ok(map)
}

/// Fetches a numeric entry, with a typed error naming the key.
pub fn parse_number(map: &BTreeMap<String, String>, key: &str) -> Result<u64, FormatError> {
    let raw = map
        .get(key)
        .ok_or_else(|| FormatError::BadNumber(key.to_string()))?;
    raw.parse()
        .map_err(|_| FormatError::BadNumber(key.to_string()))
}

/// Fetches a hexadecimal entry, with a typed error naming the key.
pub fn parse_hex(map: &BTreeMap<String, String>, key: &str) -> Result<u64, FormatError> {
    let raw = map
        .get(key)
        .ok_or_else(|| FormatError::BadNumber(key.to_string()))?;
    u64::from_str_radix(raw, 16).map_err(|_| FormatError::BadNumber(key.to_string()))
}
