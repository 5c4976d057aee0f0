// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Parsing the initial size requested for a new disk.

use crate::Error;

const MIB: f64 = (1u64 << 20) as f64;
const GIB: f64 = (1u64 << 30) as f64;

/// Parses a size such as `1073741824`, `512m` or `1.5g` into bytes.
///
/// Bare digits are bytes, `m` and `g` are binary multiples, and fractional
/// results are rounded down.
pub fn parse_size(size: &str) -> Result<u64, Error> {
    let invalid = || Error::InvalidSize(size.to_string());
    let s = size.trim();
    if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
        return s.parse().map_err(|_| invalid());
    }

    let (number, multiplier) = match s.char_indices().last() {
        Some((i, 'm' | 'M')) => (&s[..i], MIB),
        Some((i, 'g' | 'G')) => (&s[..i], GIB),
        _ => return Err(invalid()),
    };
    let well_formed = !number.is_empty()
        && number.bytes().all(|b| b.is_ascii_digit() || b == b'.')
        && number.bytes().filter(|&b| b == b'.').count() <= 1
        && number.bytes().any(|b| b.is_ascii_digit());
    if !well_formed {
        return Err(invalid());
    }
    let value: f64 = number.parse().map_err(|_| invalid())?;
    let bytes = (value * multiplier).floor();
    if !bytes.is_finite() || bytes > u64::MAX as f64 {
        return Err(invalid());
    }
    Ok(bytes as u64)
}
