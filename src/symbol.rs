use anyhow::bail;
use itertools::Itertools;

use crate::market::{self, MarketCode};

/// A DR-list record resolved to the scanner's symbol space.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedSymbol {
    /// Scanner symbol, e.g. `NASDAQ:AAPL` or `HKEX:700`.
    pub symbol: String,
    pub market: MarketCode,
}

/// Resolve a DR record to `(scanner_symbol, market_code)`.
///
/// Ticker precedence, first match wins:
///  1. a `(TOKEN)` suffix on the underlying name,
///  2. the DR symbol with an exactly-two-digit suffix stripped
///     (the local listing convention appends a two-digit series number),
///  3. the raw underlying, uppercased.
///
/// HK underlyings must coerce to decimal digits (leading zeros stripped);
/// TWSE and SSE underlyings must be digits-only. Records that fail these
/// checks are rejected so the caller can skip the ticker.
pub fn resolve(
    underlying: &str,
    underlying_name: &str,
    underlying_exchange: &str,
    dr_symbol: &str,
) -> anyhow::Result<ResolvedSymbol> {
    let ticker = underlying.trim().to_uppercase();
    let name = underlying_name.trim();
    let dr = dr_symbol.trim().to_uppercase();
    let exchange = underlying_exchange
        .split_whitespace()
        .join(" ")
        .to_uppercase();

    let real = real_ticker(&ticker, name, &dr);
    if real.is_empty() {
        bail!("empty ticker after normalization (underlying={underlying:?}, dr={dr_symbol:?})");
    }

    let market = market::market_from_exchange(underlying_exchange);
    let symbol = scanner_symbol(&real, &exchange)?;
    Ok(ResolvedSymbol { symbol, market })
}

fn real_ticker(ticker: &str, name: &str, dr: &str) -> String {
    if let Some(token) = parenthesized_token(name) {
        return token.to_string();
    }
    if trailing_digit_run(dr) == 2 {
        let stripped = &dr[..dr.len() - 2];
        if stripped.len() >= 2 {
            return stripped.to_string();
        }
        if dr.len() >= 2 {
            return dr.to_string();
        }
    }
    ticker.to_string()
}

/// `"Apple Inc. (AAPL)"` -> `Some("AAPL")`. The token must look like a
/// ticker: uppercase alphanumerics plus `.`, `-`, `_`.
fn parenthesized_token(name: &str) -> Option<&str> {
    let rest = name.trim_end().strip_suffix(')')?;
    let open = rest.rfind('(')?;
    let token = &rest[open + 1..];
    let valid = !token.is_empty()
        && token
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || matches!(b, b'.' | b'-' | b'_'));
    valid.then_some(token)
}

fn trailing_digit_run(s: &str) -> usize {
    s.bytes().rev().take_while(|b| b.is_ascii_digit()).count()
}

fn scanner_symbol(ticker: &str, exchange: &str) -> anyhow::Result<String> {
    let has = |keys: &[&str]| keys.iter().any(|k| exchange.contains(k));

    if has(&["MILAN", "MIL"]) {
        return Ok(format!("MIL:{ticker}"));
    }
    if has(&["COPENHAGEN", "OMX"]) {
        return Ok(format!("OMXCOP:{}", ticker.replace('-', "_")));
    }
    if has(&["EURONEXT", "PARIS", "AMSTERDAM", "BRUSSELS", "FRANCE", "NETHERLANDS"]) {
        return Ok(format!("EURONEXT:{ticker}"));
    }
    if has(&["SHANGHAI", "SSE"]) {
        return Ok(format!("SSE:{}", digits_only(ticker, "SSE")?));
    }
    if has(&["SHENZHEN", "SZSE"]) {
        return Ok(format!("SZSE:{ticker}"));
    }
    if has(&["HONG", "HK", "HKEX"]) {
        return Ok(format!("HKEX:{}", hk_numeric(ticker)?));
    }
    if has(&["VIET", "HOCHIMINH", "HOSE", "HNX"]) {
        return Ok(format!("HOSE:{ticker}"));
    }
    if has(&["TOKYO", "JAPAN", "TSE", "JP"]) {
        return Ok(format!("TSE:{ticker}"));
    }
    if has(&["SINGAPORE", "SGX", "SG"]) {
        return Ok(format!("SGX:{ticker}"));
    }
    if has(&["TAIWAN", "TWSE", "TW"]) {
        return Ok(format!("TWSE:{}", digits_only(ticker, "TWSE")?));
    }
    if exchange.contains("NASDAQ") {
        return Ok(format!("NASDAQ:{ticker}"));
    }
    if has(&["NEW YORK", "NYSE", "NY"]) {
        if has(&["ARCHIPELAGO", "ARCA", "AMEX"]) {
            return Ok(format!("AMEX:{ticker}"));
        }
        return Ok(format!("NYSE:{ticker}"));
    }
    // No exchange hint: an all-digit ticker is almost certainly Hong Kong.
    if ticker.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(format!("HKEX:{}", hk_numeric(ticker)?));
    }
    Ok(format!("NASDAQ:{ticker}"))
}

/// HK board lots are numeric with no leading zeros on the scanner side.
fn hk_numeric(ticker: &str) -> anyhow::Result<&str> {
    let digits = digits_only(ticker, "HKEX")?;
    let stripped = digits.trim_start_matches('0');
    if stripped.is_empty() {
        bail!("HKEX ticker {ticker:?} is all zeros");
    }
    Ok(stripped)
}

fn digits_only<'a>(ticker: &'a str, venue: &str) -> anyhow::Result<&'a str> {
    if ticker.is_empty() || !ticker.bytes().all(|b| b.is_ascii_digit()) {
        bail!("{venue} ticker must be numeric, got {ticker:?}");
    }
    Ok(ticker)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn nasdaq_record_uses_parenthesized_ticker() {
        let r = resolve(
            "AAPL",
            "Apple Inc. (AAPL)",
            "The Nasdaq Stock Market",
            "AAPL80",
        )
        .unwrap();
        assert_eq!(r.symbol, "NASDAQ:AAPL");
        assert_eq!(r.market, MarketCode::Us);
    }

    #[test]
    fn hk_record_keeps_numeric_underlying() {
        let r = resolve(
            "700",
            "Tencent Holdings",
            "The Stock Exchange of Hong Kong Limited",
            "0700",
        )
        .unwrap();
        // "0700" ends in a four-digit run, not exactly two, so the raw
        // underlying wins over digit-suffix stripping.
        assert_eq!(r.symbol, "HKEX:700");
        assert_eq!(r.market, MarketCode::Hk);
    }

    #[test]
    fn hk_leading_zeros_are_stripped() {
        let r = resolve(
            "0005",
            "HSBC Holdings",
            "Hong Kong Exchanges and Clearing",
            "HSBC80",
        );
        // dr "HSBC80" ends in exactly two digits -> "HSBC"; but the HK
        // venue requires digits, so this record is rejected.
        assert!(r.is_err());

        let r = resolve("0005", "HSBC Holdings", "HKEX", "").unwrap();
        assert_eq!(r.symbol, "HKEX:5");
    }

    #[test]
    fn two_digit_suffix_is_stripped() {
        let r = resolve("", "Microsoft Corp", "NASDAQ", "MSFT19").unwrap();
        assert_eq!(r.symbol, "NASDAQ:MSFT");
    }

    #[test]
    fn short_dr_symbol_is_kept_as_is() {
        // Stripping "80" would leave a single char, so the DR symbol is
        // used unchanged.
        let r = resolve("", "", "NYSE", "X80").unwrap();
        assert_eq!(r.symbol, "NYSE:X80");
    }

    #[test]
    fn copenhagen_swaps_dash_for_underscore() {
        let r = resolve("MAERSK-B", "A.P. Moller Maersk", "Nasdaq Copenhagen A/S", "").unwrap();
        assert_eq!(r.symbol, "OMXCOP:MAERSK_B");
        assert_eq!(r.market, MarketCode::Dk);
    }

    #[test]
    fn archipelago_maps_to_amex_prefix() {
        let r = resolve("SPY", "", "New York Stock Exchange Archipelago", "").unwrap();
        assert_eq!(r.symbol, "AMEX:SPY");
        assert_eq!(r.market, MarketCode::Us);
    }

    #[test]
    fn all_digit_ticker_without_exchange_goes_to_hkex() {
        let r = resolve("9988", "Alibaba Group", "", "").unwrap();
        assert_eq!(r.symbol, "HKEX:9988");
        // Market mapping has no hint -> production default.
        assert_eq!(r.market, MarketCode::Us);
    }

    #[test]
    fn taiwan_requires_numeric_ticker() {
        assert!(resolve("TSMC", "", "Taiwan Stock Exchange", "").is_err());
        let r = resolve("2330", "", "Taiwan Stock Exchange", "").unwrap();
        assert_eq!(r.symbol, "TWSE:2330");
        assert_eq!(r.market, MarketCode::Tw);
    }

    #[test]
    fn euronext_prefers_name_token() {
        let r = resolve("ASML", "ASML Holding N.V. (ASML)", "Euronext Amsterdam", "ASML80").unwrap();
        assert_eq!(r.symbol, "EURONEXT:ASML");
        assert_eq!(r.market, MarketCode::Nl);
    }
}
