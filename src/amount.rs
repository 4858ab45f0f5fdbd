//! Human amount parsing and token unit formatting

use crate::error::{Result, SessionError};
use ethers::types::U256;
use ethers::utils::{format_units, parse_units, ParseUnits};

const MAX_DIGITS: usize = 77;

/// Parse a human-entered amount into base units.
///
/// Accepts plain decimals only (`"10"`, `"0.5"`). Empty input, signs,
/// exponents, zero, and more fractional digits than `decimals` are rejected.
pub fn parse_amount(input: &str, decimals: u8) -> Result<U256> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(SessionError::invalid_amount(input, "amount is empty"));
    }

    let (whole, fraction) = match trimmed.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (trimmed, ""),
    };
    let all_digits = |s: &str| s.chars().all(|c| c.is_ascii_digit());
    if (whole.is_empty() && fraction.is_empty()) || !all_digits(whole) || !all_digits(fraction) {
        return Err(SessionError::invalid_amount(input, "not a positive decimal number"));
    }
    if fraction.len() > decimals as usize {
        return Err(SessionError::invalid_amount(
            input,
            format!("more than {} decimal places", decimals),
        ));
    }

    // U256 holds every 77-digit number; anything longer may not fit once scaled
    let significant = whole.trim_start_matches('0').len();
    if decimals as usize > MAX_DIGITS || significant + decimals as usize > MAX_DIGITS {
        return Err(SessionError::invalid_amount(input, "amount is too large"));
    }

    let normalized = format!(
        "{}.{}",
        if whole.is_empty() { "0" } else { whole },
        if fraction.is_empty() { "0" } else { fraction }
    );
    let value = match parse_units(normalized, decimals as u32) {
        Ok(ParseUnits::U256(value)) => value,
        Ok(ParseUnits::I256(_)) => {
            return Err(SessionError::invalid_amount(input, "amount is negative"))
        }
        Err(e) => return Err(SessionError::invalid_amount(input, e.to_string())),
    };

    if value.is_zero() {
        return Err(SessionError::invalid_amount(input, "amount must be positive"));
    }
    Ok(value)
}

/// `formatUnits` with trailing zeros trimmed: 10e18 at 18 decimals is `"10"`
pub fn format_amount(value: U256, decimals: u8) -> String {
    let formatted = match format_units(value, decimals as u32) {
        Ok(s) => s,
        Err(_) => return value.to_string(),
    };
    if formatted.contains('.') {
        formatted.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        formatted
    }
}

/// Round half-up to `places` fractional digits. Values too close to
/// `U256::MAX` to round are truncated instead.
pub fn format_fixed(value: U256, decimals: u8, places: u8) -> String {
    let (decimals, places) = (decimals as usize, places as usize);
    if decimals > MAX_DIGITS || places > MAX_DIGITS {
        return format_amount(value, decimals as u8);
    }
    let scaled = if decimals >= places {
        let divisor = U256::exp10(decimals - places);
        match value.checked_add(divisor / 2) {
            Some(rounded) => rounded / divisor,
            None => value / divisor,
        }
    } else {
        match value.checked_mul(U256::exp10(places - decimals)) {
            Some(scaled) => scaled,
            None => return format_amount(value, decimals as u8),
        }
    };

    if places == 0 {
        return scaled.to_string();
    }
    let unit = U256::exp10(places);
    format!(
        "{}.{:0>width$}",
        scaled / unit,
        (scaled % unit).to_string(),
        width = places
    )
}
