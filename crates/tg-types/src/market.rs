use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identifies a priced instrument in the time-series store
/// (e.g. `BRENT`, `WTI-2026-12`, `GASOIL-SG`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstrumentKey(String);

impl InstrumentKey {
    pub fn new(key: &str) -> Self {
        Self(key.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstrumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for InstrumentKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// How a day's price move is applied to a position's reference price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReturnBasis {
    /// Fractional return `p_d / p_{d-1} - 1`, scaled by the reference price.
    #[default]
    Relative,
    /// Absolute move `p_d - p_{d-1}` in price units (e.g. $/bbl).
    Absolute,
}

/// Daily settlement price for an instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub date: NaiveDate,
    pub price: Decimal,
}

impl PricePoint {
    pub fn new(date: NaiveDate, price: Decimal) -> Self {
        Self { date, price }
    }
}

/// Historical daily prices for one instrument, kept sorted by date with one
/// point per trading day.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceSeries {
    points: Vec<PricePoint>,
}

impl PriceSeries {
    pub fn new(mut points: Vec<PricePoint>) -> Self {
        points.sort_by_key(|p| p.date);
        points.dedup_by_key(|p| p.date);
        Self { points }
    }

    /// Build a series from consecutive trading days starting at `start`.
    /// Weekends are skipped so the dates line up with exchange calendars.
    pub fn from_daily_closes(start: NaiveDate, closes: &[Decimal]) -> Self {
        let mut points = Vec::with_capacity(closes.len());
        let mut date = start;
        for close in closes {
            while is_weekend(date) {
                date = date.succ_opt().unwrap_or(date);
            }
            points.push(PricePoint::new(date, *close));
            date = date.succ_opt().unwrap_or(date);
        }
        Self { points }
    }

    pub fn points(&self) -> &[PricePoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn last_price(&self) -> Option<Decimal> {
        self.points.last().map(|p| p.price)
    }

    /// Day-over-day moves keyed by the later date. Relative moves off a zero
    /// price are skipped.
    pub fn daily_moves(&self, basis: ReturnBasis) -> BTreeMap<NaiveDate, Decimal> {
        self.points
            .windows(2)
            .filter_map(|w| {
                let (prev, cur) = (&w[0], &w[1]);
                match basis {
                    ReturnBasis::Absolute => Some((cur.date, cur.price - prev.price)),
                    ReturnBasis::Relative if prev.price.is_zero() => None,
                    ReturnBasis::Relative => {
                        Some((cur.date, (cur.price - prev.price) / prev.price))
                    }
                }
            })
            .collect()
    }
}

fn is_weekend(date: NaiveDate) -> bool {
    use chrono::{Datelike, Weekday};
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_series_sorted_and_deduplicated() {
        let series = PriceSeries::new(vec![
            PricePoint::new(day(2026, 3, 4), dec!(82)),
            PricePoint::new(day(2026, 3, 2), dec!(80)),
            PricePoint::new(day(2026, 3, 2), dec!(99)),
        ]);
        assert_eq!(series.len(), 2);
        assert_eq!(series.points()[0].date, day(2026, 3, 2));
        assert_eq!(series.last_price(), Some(dec!(82)));
    }

    #[test]
    fn test_daily_closes_skip_weekends() {
        // 2026-03-06 is a Friday
        let series = PriceSeries::from_daily_closes(day(2026, 3, 6), &[dec!(1), dec!(2)]);
        assert_eq!(series.points()[1].date, day(2026, 3, 9));
    }

    #[test]
    fn test_absolute_and_relative_moves() {
        let series =
            PriceSeries::from_daily_closes(day(2026, 3, 2), &[dec!(80), dec!(84), dec!(63)]);

        let absolute = series.daily_moves(ReturnBasis::Absolute);
        assert_eq!(absolute.values().copied().collect::<Vec<_>>(), vec![dec!(4), dec!(-21)]);

        let relative = series.daily_moves(ReturnBasis::Relative);
        assert_eq!(
            relative.values().copied().collect::<Vec<_>>(),
            vec![dec!(0.05), dec!(-0.25)]
        );
    }

    #[test]
    fn test_single_point_has_no_moves() {
        let series = PriceSeries::from_daily_closes(day(2026, 3, 2), &[dec!(80)]);
        assert!(series.daily_moves(ReturnBasis::Relative).is_empty());
    }

    #[test]
    fn test_instrument_display() {
        assert_eq!(InstrumentKey::new("BRENT").to_string(), "BRENT");
    }
}
