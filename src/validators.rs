//! Input validation for historical data requests

use chrono::{DateTime, TimeZone, Utc};
use std::time::Duration;

use crate::error::{Result, TvError};
use crate::ohlcv::Bar;

const MAX_NAME_LEN: usize = 20;

fn is_valid_name(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= MAX_NAME_LEN
        && s.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
}

/// Validate a symbol, normalized to upper case.
///
/// With `allow_formatted`, `EXCHANGE:SYMBOL` is accepted and both parts are
/// checked.
pub fn validate_symbol(symbol: &str, allow_formatted: bool) -> Result<String> {
    let symbol = symbol.trim().to_uppercase();
    if symbol.is_empty() {
        return Err(TvError::validation("symbol", &symbol, "must be a non-empty string"));
    }

    if allow_formatted && symbol.contains(':') {
        let parts: Vec<&str> = symbol.split(':').collect();
        if parts.len() != 2 {
            return Err(TvError::validation(
                "symbol",
                &symbol,
                "formatted symbol must be EXCHANGE:SYMBOL (e.g. BINANCE:BTCUSDT)",
            ));
        }
        if !is_valid_name(parts[0]) {
            return Err(TvError::validation(
                "symbol",
                &symbol,
                format!("exchange '{}' must be alphanumeric, 1-20 characters", parts[0]),
            ));
        }
        if !is_valid_name(parts[1]) {
            return Err(TvError::validation(
                "symbol",
                &symbol,
                format!("symbol '{}' must be alphanumeric, 1-20 characters", parts[1]),
            ));
        }
        return Ok(symbol);
    }

    if !is_valid_name(&symbol) {
        return Err(TvError::validation(
            "symbol",
            &symbol,
            "must be alphanumeric, 1-20 characters",
        ));
    }
    Ok(symbol)
}

pub fn validate_exchange(exchange: &str) -> Result<String> {
    let exchange = exchange.trim().to_uppercase();
    if !is_valid_name(&exchange) {
        return Err(TvError::validation(
            "exchange",
            &exchange,
            "must be alphanumeric, 1-20 characters",
        ));
    }
    Ok(exchange)
}

pub fn validate_n_bars(n_bars: u32, max_bars: u32) -> Result<u32> {
    if n_bars == 0 || n_bars > max_bars {
        return Err(TvError::validation(
            "n_bars",
            n_bars,
            format!("must be between 1 and {}", max_bars),
        ));
    }
    Ok(n_bars)
}

/// Convert a timeout in seconds to `Option<Duration>`; `-1` means wait forever
pub fn validate_timeout(seconds: f64) -> Result<Option<Duration>> {
    if seconds == -1.0 {
        return Ok(None);
    }
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(TvError::validation(
            "timeout",
            seconds,
            "must be -1 (no timeout) or a non-negative number of seconds",
        ));
    }
    Ok(Some(Duration::from_secs_f64(seconds)))
}

/// Both dates or neither; ordered, not in the future, not before 2000
pub fn validate_date_range(
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
    let (start, end) = match (start, end) {
        (None, None) => return Ok(None),
        (Some(start), Some(end)) => (start, end),
        (start, end) => {
            return Err(TvError::validation(
                "date_range",
                format!("start={:?}, end={:?}", start, end),
                "start and end must be provided together",
            ))
        }
    };

    if start >= end {
        return Err(TvError::validation(
            "date_range",
            format!("start={}, end={}", start, end),
            "start must be before end",
        ));
    }

    let now = Utc::now();
    if start > now {
        return Err(TvError::validation("start", start, "cannot be in the future"));
    }
    if end > now {
        return Err(TvError::validation("end", end, "cannot be in the future"));
    }

    let min_date = Utc
        .with_ymd_and_hms(2000, 1, 1, 0, 0, 0)
        .single()
        .ok_or_else(|| TvError::Internal("invalid minimum date".into()))?;
    if start < min_date {
        return Err(TvError::validation("start", start, "must be after 2000-01-01"));
    }

    Ok(Some((start, end)))
}

/// Username and password must be provided together
pub fn validate_credentials(username: Option<&str>, password: Option<&str>) -> Result<()> {
    let has_user = username.is_some_and(|u| !u.trim().is_empty());
    let has_pass = password.is_some_and(|p| !p.is_empty());
    if has_user != has_pass {
        return Err(TvError::validation(
            "credentials",
            if has_user { "username only" } else { "password only" },
            "username and password must be provided together",
        ));
    }
    Ok(())
}

/// Sanity-check one bar's OHLC relationships
pub fn validate_ohlc(bar: &Bar) -> Result<()> {
    let values = [bar.open, bar.high, bar.low, bar.close, bar.volume];
    if values.iter().any(|v| !v.is_finite()) {
        return Err(TvError::validation("bar", bar.datetime, "values must be finite"));
    }
    if bar.high < bar.open.max(bar.close) {
        return Err(TvError::validation("bar", bar.datetime, "high below open/close"));
    }
    if bar.low > bar.open.min(bar.close) {
        return Err(TvError::validation("bar", bar.datetime, "low above open/close"));
    }
    if bar.volume < 0.0 {
        return Err(TvError::validation("bar", bar.datetime, "negative volume"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_symbol() {
        assert_eq!(validate_symbol(" btcusdt ", true).unwrap(), "BTCUSDT");
        assert_eq!(validate_symbol("binance:btcusdt", true).unwrap(), "BINANCE:BTCUSDT");
        assert!(validate_symbol("BINANCE:BTC:USDT", true).is_err());
        assert!(validate_symbol("BINANCE:BTCUSDT", false).is_err());
        assert!(validate_symbol("", true).is_err());
        assert!(validate_symbol("BTC-USD", true).is_err());
        assert!(validate_symbol(&"A".repeat(21), true).is_err());
    }

    #[test]
    fn test_exchange_and_bars() {
        assert_eq!(validate_exchange("nse").unwrap(), "NSE");
        assert!(validate_exchange("N S E").is_err());
        assert_eq!(validate_n_bars(5000, 5000).unwrap(), 5000);
        assert!(validate_n_bars(0, 5000).is_err());
        assert!(validate_n_bars(5001, 5000).is_err());
    }

    #[test]
    fn test_timeout() {
        assert_eq!(validate_timeout(-1.0).unwrap(), None);
        assert_eq!(validate_timeout(0.5).unwrap(), Some(Duration::from_millis(500)));
        assert!(validate_timeout(-2.0).is_err());
        assert!(validate_timeout(f64::NAN).is_err());
    }

    #[test]
    fn test_date_range() {
        let now = Utc::now();
        let start = now - ChronoDuration::days(10);
        assert_eq!(validate_date_range(None, None).unwrap(), None);
        assert!(validate_date_range(Some(start), None).is_err());
        assert!(validate_date_range(Some(now - ChronoDuration::days(1)), Some(start)).is_err());
        assert!(validate_date_range(Some(start), Some(now + ChronoDuration::days(1))).is_err());
        let old = Utc.with_ymd_and_hms(1999, 6, 1, 0, 0, 0).unwrap();
        assert!(validate_date_range(Some(old), Some(start)).is_err());
        assert!(validate_date_range(Some(start), Some(now - ChronoDuration::days(1))).is_ok());
    }

    #[test]
    fn test_credentials_and_ohlc() {
        assert!(validate_credentials(None, None).is_ok());
        assert!(validate_credentials(Some("user"), Some("pass")).is_ok());
        assert!(validate_credentials(Some("user"), None).is_err());

        let mut bar = Bar {
            datetime: Utc::now(),
            open: 10.0,
            high: 12.0,
            low: 9.0,
            close: 11.0,
            volume: 100.0,
        };
        assert!(validate_ohlc(&bar).is_ok());
        bar.high = 10.5;
        assert!(validate_ohlc(&bar).is_err());
    }
}
