//! Room naming for per-symbol broadcast groups.
//!
//! Clients join one room per subscribed ticker; room names are
//! `symbol:<TICKER>` with the ticker in canonical upper-case form.

/// Prefix for per-symbol rooms.
pub const ROOM_PREFIX: &str = "symbol:";

/// Normalize a raw ticker from a client payload.
///
/// Trims, upper-cases, and rejects empty or non-ticker input.
pub fn normalize_ticker(raw: &str) -> Result<String, String> {
    let ticker = raw.trim().to_uppercase();
    if ticker.is_empty() {
        return Err("empty ticker".to_string());
    }
    if !ticker
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
    {
        return Err(format!("invalid ticker '{raw}'"));
    }
    Ok(ticker)
}

/// Room name for a canonical ticker.
pub fn room_for_ticker(ticker: &str) -> String {
    format!("{ROOM_PREFIX}{ticker}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tickers_are_upper_cased_and_trimmed() {
        assert_eq!(normalize_ticker(" aapl ").unwrap(), "AAPL");
        assert_eq!(normalize_ticker("BRK.B").unwrap(), "BRK.B");
    }

    #[test]
    fn bad_tickers_are_rejected() {
        assert!(normalize_ticker("").is_err());
        assert!(normalize_ticker("   ").is_err());
        assert!(normalize_ticker("AA PL").is_err());
        assert!(normalize_ticker("sym:AAPL").is_err());
    }

    #[test]
    fn room_names_carry_the_prefix() {
        assert_eq!(room_for_ticker("AAPL"), "symbol:AAPL");
    }
}
