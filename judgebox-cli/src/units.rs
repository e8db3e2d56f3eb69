//! Size-string parsing: "123", "16m", "0.5g", "1kb" and friends.

use anyhow::{bail, Context, Result};

/// Parse a byte count with an optional k/m/g/t/p suffix (powers of 1024)
/// and an optional trailing `b`. With a suffix the mantissa may be
/// fractional, so "0.5m" works; without one it must be a whole number.
pub fn parse_bytes(input: &str) -> Result<u64> {
    let s = input.trim();
    if s.is_empty() {
        bail!("empty size");
    }
    let bytes = s.as_bytes();
    let mut end = s.len();
    if end > 1 && (bytes[end - 1] == b'b' || bytes[end - 1] == b'B') {
        end -= 1;
    }
    let mut factor: u64 = 1;
    if end > 1 {
        let shift = match bytes[end - 1].to_ascii_lowercase() {
            b'k' => 1,
            b'm' => 2,
            b'g' => 3,
            b't' => 4,
            b'p' => 5,
            _ => 0,
        };
        if shift > 0 {
            factor = 1u64 << (10 * shift);
            end -= 1;
        }
    }
    let mantissa = &s[..end];
    if factor == 1 {
        mantissa
            .parse::<u64>()
            .with_context(|| format!("bad size {input:?}"))
    } else {
        let value: f64 = mantissa
            .parse()
            .with_context(|| format!("bad size {input:?}"))?;
        if value < 0.0 {
            bail!("negative size {input:?}");
        }
        Ok((value * factor as f64) as u64)
    }
}
