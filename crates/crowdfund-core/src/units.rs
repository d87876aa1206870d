//! Conversion between octas (the ledger's integer unit) and APT (display).
//!
//! raw → display is exact up to 2^53 octas; display → raw truncates toward
//! zero, so `to_raw(to_display(n)) <= n` always holds in that range.

use crate::error::ClientError;

pub type Octas = u64;

pub const DECIMALS: u32 = 8;
pub const OCTAS_PER_APT: u64 = 100_000_000; // 1 APT = 1e8 octas

/// Smallest goal accepted when creating a campaign (0.01 APT).
pub const MIN_GOAL: Octas = OCTAS_PER_APT / 100;

pub fn to_display(raw: Octas) -> f64 {
    raw as f64 / OCTAS_PER_APT as f64
}

/// Truncating conversion: the smallest octa count whose display value is
/// exactly `display`, otherwise the largest one below it. Negative, zero,
/// NaN and infinite inputs give 0; values beyond `u64::MAX` octas saturate.
pub fn to_raw(display: f64) -> Octas {
    if !display.is_finite() || display <= 0.0 {
        return 0;
    }
    let scaled = (display * OCTAS_PER_APT as f64).trunc();
    if scaled >= u64::MAX as f64 {
        return u64::MAX;
    }
    let mut raw = scaled as u64;
    // the product is rounded; settle on the largest count not above `display`
    while raw > 0 && to_display(raw) > display {
        raw -= 1;
    }
    while raw < u64::MAX && to_display(raw + 1) <= display {
        raw += 1;
    }
    // neighbouring counts can share one f64; report the smallest of them
    if to_display(raw) == display {
        while raw > 0 && to_display(raw - 1) == display {
            raw -= 1;
        }
    }
    raw
}

/// Exact decimal parsing (`"1.5"` → 150_000_000), no float involved.
/// Rejects signs, exponents and more than eight fractional digits.
pub fn parse_display(input: &str) -> Result<Octas, ClientError> {
    let s = input.trim();
    let invalid = || ClientError::InvalidInput(format!("not an APT amount: {input:?}"));
    if s.is_empty() {
        return Err(invalid());
    }
    let (whole, frac) = match s.split_once('.') {
        Some((w, f)) => (w, f),
        None => (s, ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return Err(invalid());
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    if frac.len() > DECIMALS as usize {
        return Err(ClientError::InvalidInput(format!(
            "{input:?} has more than {DECIMALS} decimal places"
        )));
    }
    let whole: u64 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| invalid())?
    };
    let mut frac_raw: u64 = 0;
    for (idx, digit) in frac.bytes().enumerate() {
        frac_raw += u64::from(digit - b'0') * 10u64.pow(DECIMALS - 1 - idx as u32);
    }
    whole
        .checked_mul(OCTAS_PER_APT)
        .and_then(|w| w.checked_add(frac_raw))
        .ok_or_else(|| ClientError::InvalidInput(format!("{input:?} overflows the octa range")))
}

/// Two-decimal rendering, rounding half up: `1_234_567_890` → `"12.35"`.
pub fn format_display(raw: Octas) -> String {
    let cents = (raw as u128 + 500_000) / 1_000_000;
    format!("{}.{:02}", cents / 100, cents % 100)
}
