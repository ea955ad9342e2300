use chrono::{Datelike, Days, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Utc};
use chrono_tz::Asia::Bangkok;

/// High-level market a DR's underlying trades on. Everything downstream
/// (close schedule, snapshot grouping) keys off this code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MarketCode {
    Us,
    Dk,
    Nl,
    Fr,
    It,
    Hk,
    Jp,
    Sg,
    Tw,
    Cn,
    Vn,
}

pub const ALL_MARKETS: [MarketCode; 11] = [
    MarketCode::Us,
    MarketCode::Dk,
    MarketCode::Nl,
    MarketCode::Fr,
    MarketCode::It,
    MarketCode::Hk,
    MarketCode::Jp,
    MarketCode::Sg,
    MarketCode::Tw,
    MarketCode::Cn,
    MarketCode::Vn,
];

impl MarketCode {
    pub fn as_str(self) -> &'static str {
        match self {
            MarketCode::Us => "US",
            MarketCode::Dk => "DK",
            MarketCode::Nl => "NL",
            MarketCode::Fr => "FR",
            MarketCode::It => "IT",
            MarketCode::Hk => "HK",
            MarketCode::Jp => "JP",
            MarketCode::Sg => "SG",
            MarketCode::Tw => "TW",
            MarketCode::Cn => "CN",
            MarketCode::Vn => "VN",
        }
    }
}

impl std::fmt::Display for MarketCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map the DR API's free-form `underlyingExchange` description to a market
/// code. Full exchange names are checked before abbreviations so that e.g.
/// "New York Stock Exchange Archipelago" never falls into a shorter match.
/// Unmatched descriptions default to US, the bulk of the DR universe.
pub fn market_from_exchange(exchange: &str) -> MarketCode {
    let ex = exchange.trim();
    if ex.is_empty() {
        return MarketCode::Us;
    }
    let lower = ex.to_lowercase();
    let has = |needle: &str| lower.contains(needle);

    // Full-name forms, mirrored from the dashboard's own mapping.
    if has("euronext amsterdam") {
        return MarketCode::Nl;
    }
    if has("euronext milan") {
        return MarketCode::It;
    }
    if has("euronext paris") {
        return MarketCode::Fr;
    }
    if has("nasdaq copenhagen") {
        return MarketCode::Dk;
    }
    if has("ho chi minh") || has("hochiminh") || has("hanoi") || has("hnx") {
        return MarketCode::Vn;
    }
    if has("shanghai") || has("shenzhen") {
        return MarketCode::Cn;
    }
    if has("singapore exchange") || has("sgx") {
        return MarketCode::Sg;
    }
    if has("taiwan stock exchange") {
        return MarketCode::Tw;
    }
    if has("stock exchange of hong kong") || has("hkex") {
        return MarketCode::Hk;
    }
    if has("tokyo stock exchange") {
        return MarketCode::Jp;
    }
    if has("nasdaq global select market")
        || has("nasdaq stock market")
        || has("new york stock exchange archipelago")
        || has("new york stock exchange")
        || has("nyse")
        || has("nasdaq")
    {
        return MarketCode::Us;
    }

    // Abbreviated fallbacks for records that never spell the full name.
    let upper = ex.to_uppercase();
    let any = |keys: &[&str]| keys.iter().any(|k| upper.contains(k));

    if any(&["COPENHAGEN", "DENMARK", "OMXCOP", "DK"]) {
        return MarketCode::Dk;
    }
    if any(&["AMSTERDAM", "NETHERLANDS"]) {
        return MarketCode::Nl;
    }
    if any(&["PARIS", "FRANCE"]) {
        return MarketCode::Fr;
    }
    if any(&["MILAN", "ITALY", "BORSA ITALIANA"]) {
        return MarketCode::It;
    }
    if any(&["VIET", "VIETNAM", "HOCHIMINH", "HOSE", "HNX", "VN"]) {
        return MarketCode::Vn;
    }
    if any(&["SHANGHAI", "SSE", "SZSE", "SHENZHEN", "CHINA", "CN"]) {
        return MarketCode::Cn;
    }
    if any(&["SINGAPORE", "SGX", "SG"]) {
        return MarketCode::Sg;
    }
    if any(&["TAIWAN", "TWSE", "TW"]) {
        return MarketCode::Tw;
    }
    if any(&["HONG", "HKEX", "HONG KONG", "HK"]) {
        return MarketCode::Hk;
    }
    if any(&["TOKYO", "JAPAN", "TSE", "JP"]) {
        return MarketCode::Jp;
    }
    if any(&["NASDAQ", "NYSE", "NEW YORK", "AMEX", "ARCHIPELAGO", "ARCA"]) {
        return MarketCode::Us;
    }

    MarketCode::Us
}

// ── Close schedule ───────────────────────────────────────────────────────────

/// Market close expressed in Bangkok wall-clock time. Asian markets keep a
/// single time year-round; US/EU closes shift with US daylight saving.
#[derive(Clone, Copy, Debug)]
pub struct CloseTimes {
    pub winter: NaiveTime,
    pub summer: NaiveTime,
}

fn t(hour: u32, min: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, min, 0).unwrap()
}

pub fn close_times(market: MarketCode) -> CloseTimes {
    match market {
        MarketCode::Us => CloseTimes { winter: t(4, 0), summer: t(3, 0) },
        MarketCode::Dk => CloseTimes { winter: t(23, 0), summer: t(22, 0) },
        MarketCode::Nl | MarketCode::Fr | MarketCode::It => {
            CloseTimes { winter: t(23, 30), summer: t(22, 30) }
        }
        MarketCode::Hk => CloseTimes { winter: t(15, 0), summer: t(15, 0) },
        MarketCode::Jp => CloseTimes { winter: t(13, 0), summer: t(13, 0) },
        MarketCode::Sg => CloseTimes { winter: t(16, 0), summer: t(16, 0) },
        MarketCode::Tw => CloseTimes { winter: t(12, 30), summer: t(12, 30) },
        MarketCode::Cn => CloseTimes { winter: t(14, 0), summer: t(14, 0) },
        MarketCode::Vn => CloseTimes { winter: t(15, 0), summer: t(15, 0) },
    }
}

fn first_sunday(year: i32, month: u32) -> NaiveDate {
    let first = NaiveDate::from_ymd_opt(year, month, 1).unwrap();
    let offset = (7 - first.weekday().num_days_from_sunday()) % 7;
    first + Days::new(u64::from(offset))
}

/// US DST schedule evaluated against a Bangkok-local reference time:
/// summer runs from the second Sunday of March (00:00 Bangkok) to the
/// first Sunday of November (00:00 Bangkok).
pub fn is_summer_time(reference: NaiveDateTime) -> bool {
    match reference.month() {
        12 | 1 | 2 => false,
        4..=10 => true,
        3 => {
            let second_sunday = first_sunday(reference.year(), 3) + Days::new(7);
            reference >= second_sunday.and_time(NaiveTime::MIN)
        }
        11 => {
            let flip = first_sunday(reference.year(), 11);
            reference < flip.and_time(NaiveTime::MIN)
        }
        _ => unreachable!("month out of range"),
    }
}

/// Close time in effect for the given reference instant.
pub fn close_time_at(market: MarketCode, reference: NaiveDateTime) -> NaiveTime {
    let times = close_times(market);
    if is_summer_time(reference) {
        times.summer
    } else {
        times.winter
    }
}

/// Next close instant for the market, in Bangkok local time: today's close
/// if it has not passed yet, otherwise the same wall-clock time tomorrow.
pub fn next_close(market: MarketCode, now: NaiveDateTime) -> NaiveDateTime {
    let close_time = close_time_at(market, now);
    let today = now.date().and_time(close_time);
    if today > now {
        today
    } else {
        today + Days::new(1)
    }
}

// ── Bangkok clock helpers ────────────────────────────────────────────────────

/// Current wall-clock time in Asia/Bangkok, tz-naive. All persisted
/// timestamps use this; the stored strings carry no zone designator.
pub fn now_bangkok() -> NaiveDateTime {
    Utc::now().with_timezone(&Bangkok).naive_local()
}

/// ISO-8601 rendering with microseconds, matching the stored format.
pub fn format_ts(ts: NaiveDateTime) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

pub fn date_str(ts: NaiveDateTime) -> String {
    ts.format("%Y-%m-%d").to_string()
}

/// Seconds until `target`, clamped at zero.
pub fn seconds_until(now: NaiveDateTime, target: NaiveDateTime) -> u64 {
    let delta = target - now;
    if delta <= TimeDelta::zero() {
        0
    } else {
        delta.num_seconds().max(0) as u64
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::NaiveDate;

    fn dt(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    #[test]
    fn exchange_mapping_full_names_win() {
        assert_eq!(market_from_exchange("The Nasdaq Stock Market"), MarketCode::Us);
        assert_eq!(
            market_from_exchange("New York Stock Exchange Archipelago"),
            MarketCode::Us
        );
        assert_eq!(
            market_from_exchange("The Stock Exchange of Hong Kong Limited"),
            MarketCode::Hk
        );
        assert_eq!(market_from_exchange("Euronext Amsterdam"), MarketCode::Nl);
        assert_eq!(market_from_exchange("Euronext Milan"), MarketCode::It);
        assert_eq!(market_from_exchange("Euronext Paris"), MarketCode::Fr);
        assert_eq!(market_from_exchange("Nasdaq Copenhagen A/S"), MarketCode::Dk);
        assert_eq!(market_from_exchange("Tokyo Stock Exchange"), MarketCode::Jp);
        assert_eq!(market_from_exchange("Taiwan Stock Exchange"), MarketCode::Tw);
        assert_eq!(market_from_exchange("Ho Chi Minh Stock Exchange"), MarketCode::Vn);
        assert_eq!(market_from_exchange("Shanghai Stock Exchange"), MarketCode::Cn);
        assert_eq!(market_from_exchange("Singapore Exchange"), MarketCode::Sg);
    }

    #[test]
    fn exchange_mapping_defaults_to_us() {
        assert_eq!(market_from_exchange(""), MarketCode::Us);
        assert_eq!(market_from_exchange("Bolsa de Madrid"), MarketCode::Us);
    }

    #[test]
    fn dst_boundaries_2024() {
        // Second Sunday of March 2024 is the 10th.
        assert!(!is_summer_time(dt(2024, 3, 9, 23, 59)));
        assert!(is_summer_time(dt(2024, 3, 10, 0, 0)));
        // First Sunday of November 2024 is the 3rd.
        assert!(is_summer_time(dt(2024, 11, 2, 23, 59)));
        assert!(!is_summer_time(dt(2024, 11, 3, 0, 0)));
        // Plain-month shortcuts.
        assert!(is_summer_time(dt(2024, 7, 1, 12, 0)));
        assert!(!is_summer_time(dt(2024, 12, 25, 12, 0)));
        assert!(!is_summer_time(dt(2024, 1, 15, 12, 0)));
    }

    #[test]
    fn us_close_flips_with_dst() {
        // At 2024-03-10 00:00 Bangkok the US close is already on summer
        // time, so the next close is today at 03:00.
        assert_eq!(
            next_close(MarketCode::Us, dt(2024, 3, 10, 0, 0)),
            dt(2024, 3, 10, 3, 0)
        );
        // The day before, winter time still applies: next close 04:00.
        assert_eq!(
            next_close(MarketCode::Us, dt(2024, 3, 9, 0, 0)),
            dt(2024, 3, 9, 4, 0)
        );
        // Back to winter on 2024-11-03.
        assert_eq!(
            next_close(MarketCode::Us, dt(2024, 11, 3, 0, 0)),
            dt(2024, 11, 3, 4, 0)
        );
    }

    #[test]
    fn next_close_rolls_to_tomorrow_after_close() {
        assert_eq!(
            next_close(MarketCode::Hk, dt(2024, 6, 3, 16, 0)),
            dt(2024, 6, 4, 15, 0)
        );
        assert_eq!(
            next_close(MarketCode::Hk, dt(2024, 6, 3, 14, 59)),
            dt(2024, 6, 3, 15, 0)
        );
    }

}
