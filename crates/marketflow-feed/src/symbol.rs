//! Exchange symbol normalization.
//!
//! Binance concatenates base and quote (`BTCUSDT`); the canonical form is
//! slash-separated (`BTC/USDT`). The splitter prefers known quote suffixes
//! and falls back to a 3-letter split on ambiguity.

use crate::error::{FeedError, FeedResult};

/// Known quote assets, tried in order. `USDT` precedes `USD` so that
/// `BTCUSDT` never splits as `BTCUS/DT`.
const QUOTE_SUFFIXES: [&str; 7] = ["USDT", "USDC", "BUSD", "BTC", "ETH", "BNB", "USD"];

/// Split a concatenated exchange symbol into `BASE/QUOTE`.
pub fn split_symbol(raw: &str) -> FeedResult<String> {
    let upper = raw.to_uppercase();

    for quote in QUOTE_SUFFIXES {
        if let Some(base) = upper.strip_suffix(quote) {
            if !base.is_empty() {
                return Ok(format!("{base}/{quote}"));
            }
        }
    }

    // Ambiguous quote: assume a 3-letter quote asset. A bare quote asset
    // has no base and cannot split.
    if upper.len() > 3 && !QUOTE_SUFFIXES.contains(&upper.as_str()) {
        let (base, quote) = upper.split_at(upper.len() - 3);
        return Ok(format!("{base}/{quote}"));
    }

    Err(FeedError::Validation {
        field: "symbol".to_string(),
        reason: format!("cannot split symbol: {raw}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_quotes() {
        assert_eq!(split_symbol("BTCUSDT").unwrap(), "BTC/USDT");
        assert_eq!(split_symbol("ETHBTC").unwrap(), "ETH/BTC");
        assert_eq!(split_symbol("ADABNB").unwrap(), "ADA/BNB");
        assert_eq!(split_symbol("SOLUSDC").unwrap(), "SOL/USDC");
        assert_eq!(split_symbol("DOGEBUSD").unwrap(), "DOGE/BUSD");
        assert_eq!(split_symbol("BTCUSD").unwrap(), "BTC/USD");
    }

    #[test]
    fn test_lowercase_input() {
        assert_eq!(split_symbol("btcusdt").unwrap(), "BTC/USDT");
    }

    #[test]
    fn test_numeric_prefix() {
        assert_eq!(split_symbol("1000PEPEUSDT").unwrap(), "1000PEPE/USDT");
    }

    #[test]
    fn test_three_letter_fallback() {
        assert_eq!(split_symbol("ATOMEUR").unwrap(), "ATOM/EUR");
    }

    #[test]
    fn test_unsplittable() {
        assert!(split_symbol("BTC").is_err());
        // A bare quote asset has no base.
        assert!(split_symbol("USDT").is_err());
    }
}
