//! OHLC candle types.

use serde_json::Value;

/// One OHLC candle.
///
/// The exchange serves klines as positional JSON arrays; prices stay strings
/// until the consumer parses them.
#[derive(Debug, Clone)]
pub struct Kline {
    pub open_time: i64,
    pub open: String,
    pub high: String,
    pub low: String,
    pub close: String,
    pub volume: String,
    pub close_time: i64,
}

impl Kline {
    /// Build from one row of the raw kline array response.
    ///
    /// Row layout: [openTime, open, high, low, close, volume, closeTime, ...].
    pub fn from_row(row: &[Value]) -> Option<Self> {
        if row.len() < 7 {
            return None;
        }
        Some(Kline {
            open_time: row[0].as_i64()?,
            open: row[1].as_str()?.to_string(),
            high: row[2].as_str()?.to_string(),
            low: row[3].as_str()?.to_string(),
            close: row[4].as_str()?.to_string(),
            volume: row[5].as_str()?.to_string(),
            close_time: row[6].as_i64()?,
        })
    }

    pub fn open_f64(&self) -> f64 {
        self.open.parse().unwrap_or(0.0)
    }

    pub fn high_f64(&self) -> f64 {
        self.high.parse().unwrap_or(0.0)
    }

    pub fn low_f64(&self) -> f64 {
        self.low.parse().unwrap_or(0.0)
    }

    pub fn close_f64(&self) -> f64 {
        self.close.parse().unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_raw_row() {
        let row = vec![
            json!(1700000000000i64),
            json!("80000.0"),
            json!("80100.0"),
            json!("79900.0"),
            json!("80050.0"),
            json!("12.5"),
            json!(1700000059999i64),
        ];
        let k = Kline::from_row(&row).unwrap();
        assert_eq!(k.open_time, 1700000000000);
        assert!((k.high_f64() - 80100.0).abs() < f64::EPSILON);
        assert!((k.close_f64() - 80050.0).abs() < f64::EPSILON);
    }

    #[test]
    fn rejects_short_row() {
        let row = vec![json!(1), json!("1")];
        assert!(Kline::from_row(&row).is_none());
    }
}
