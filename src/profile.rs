//! Volume-by-price profile and the level calculations derived from it.
//!
//! Point of Control takes the highest-volume bin with ties resolved to the
//! lower price. The 70 % value area grows outward from the POC over adjacent
//! occupied bins, preferring the upper neighbour when both sides tie, which
//! matches the reference chart overlay.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::collections::BTreeMap;

/// Fraction of total volume the value area must cover.
pub const VALUE_AREA_FRACTION: Decimal = dec!(0.7);

/// Mapping of binned price to accumulated base-asset volume for one session.
#[derive(Debug, Clone, Default)]
pub struct VolumeProfile {
    bins: BTreeMap<Decimal, Decimal>,
    total: Decimal,
}

/// Contiguous price range around the POC covering the value-area fraction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ValueArea {
    pub vah: Decimal,
    pub val: Decimal,
    pub volume: Decimal,
}

/// Levels derived from one closed (or closing) session day.
#[derive(Debug, Clone, Serialize)]
pub struct DayLevels {
    pub pdh: Decimal,
    pub pdl: Decimal,
    pub poc: Decimal,
    pub vah: Decimal,
    pub val: Decimal,
    pub vwap: Option<Decimal>,
}

impl VolumeProfile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `qty` to the bin at `binned_price`; returns the bin's new volume.
    pub fn add(&mut self, binned_price: Decimal, qty: Decimal) -> Decimal {
        let bin = self.bins.entry(binned_price).or_insert(Decimal::ZERO);
        *bin += qty;
        self.total += qty;
        *bin
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bins.len()
    }

    pub fn total_volume(&self) -> Decimal {
        self.total
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Decimal, &Decimal)> {
        self.bins.iter()
    }

    /// Point of Control: the highest-volume bin, ties to the lower price.
    pub fn poc(&self) -> Option<(Decimal, Decimal)> {
        let mut best: Option<(Decimal, Decimal)> = None;
        for (&price, &vol) in &self.bins {
            match best {
                // Ascending iteration, so strictly-greater keeps the lowest
                // price among equal-volume bins.
                Some((_, best_vol)) if vol <= best_vol => {}
                _ => best = Some((price, vol)),
            }
        }
        best
    }

    /// Top `n` bins by volume, ties broken by ascending price.
    pub fn top_bins(&self, n: usize) -> Vec<(Decimal, Decimal)> {
        let mut ranked: Vec<(Decimal, Decimal)> =
            self.bins.iter().map(|(&p, &v)| (p, v)).collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked.truncate(n);
        ranked
    }

    /// Grow a contiguous value area from the POC until it covers
    /// [`VALUE_AREA_FRACTION`] of total volume.
    pub fn value_area(&self) -> Option<ValueArea> {
        if self.total <= Decimal::ZERO {
            return None;
        }
        let bins: Vec<(Decimal, Decimal)> = self.bins.iter().map(|(&p, &v)| (p, v)).collect();
        let (poc_price, _) = self.poc()?;
        let poc_idx = bins.iter().position(|&(p, _)| p == poc_price)?;

        let target = self.total * VALUE_AREA_FRACTION;
        let mut low = poc_idx;
        let mut high = poc_idx;
        let mut covered = bins[poc_idx].1;

        while covered < target {
            let above = (high + 1 < bins.len()).then(|| bins[high + 1].1);
            let below = (low > 0).then(|| bins[low - 1].1);
            match (above, below) {
                (Some(up), Some(down)) => {
                    // Upper side wins ties.
                    if up >= down {
                        high += 1;
                        covered += up;
                    } else {
                        low -= 1;
                        covered += down;
                    }
                }
                (Some(up), None) => {
                    high += 1;
                    covered += up;
                }
                (None, Some(down)) => {
                    low -= 1;
                    covered += down;
                }
                (None, None) => break,
            }
        }

        Some(ValueArea {
            vah: bins[high].0,
            val: bins[low].0,
            volume: covered,
        })
    }

    /// Derive previous-day style levels from this profile.
    ///
    /// `day_high` / `day_low` come from raw (un-binned) prices when known;
    /// otherwise the extreme bins stand in.
    pub fn day_levels(
        &self,
        day_high: Option<Decimal>,
        day_low: Option<Decimal>,
        vwap: Option<Decimal>,
    ) -> Option<DayLevels> {
        let (poc, _) = self.poc()?;
        let area = self.value_area()?;
        let pdh = day_high.or_else(|| self.bins.keys().next_back().copied())?;
        let pdl = day_low.or_else(|| self.bins.keys().next().copied())?;
        Some(DayLevels {
            pdh,
            pdl,
            poc,
            vah: area.vah,
            val: area.val,
            vwap,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(bins: &[(Decimal, Decimal)]) -> VolumeProfile {
        let mut p = VolumeProfile::new();
        for &(price, vol) in bins {
            p.add(price, vol);
        }
        p
    }

    #[test]
    fn poc_prefers_lower_price_on_tie() {
        let p = profile(&[
            (dec!(100.0), dec!(5)),
            (dec!(100.1), dec!(5)),
            (dec!(100.2), dec!(1)),
        ]);
        assert_eq!(p.poc(), Some((dec!(100.0), dec!(5))));
    }

    #[test]
    fn profile_total_matches_bin_sum() {
        let p = profile(&[
            (dec!(99.9), dec!(2.5)),
            (dec!(100.0), dec!(1.25)),
            (dec!(99.9), dec!(0.75)),
        ]);
        let sum: Decimal = p.iter().map(|(_, v)| *v).sum();
        assert_eq!(sum, p.total_volume());
        assert_eq!(p.total_volume(), dec!(4.5));
    }

    #[test]
    fn value_area_covers_seventy_percent_and_contains_poc() {
        let p = profile(&[
            (dec!(99.8), dec!(1)),
            (dec!(99.9), dec!(2)),
            (dec!(100.0), dec!(10)),
            (dec!(100.1), dec!(3)),
            (dec!(100.2), dec!(1)),
        ]);
        let area = p.value_area().unwrap();
        assert!(area.volume >= p.total_volume() * VALUE_AREA_FRACTION);
        let (poc, _) = p.poc().unwrap();
        assert!(area.val <= poc && poc <= area.vah);
    }

    #[test]
    fn value_area_prefers_upper_neighbour_on_tie() {
        // Neighbours of the POC tie at 3. Taking the upper one first reaches
        // 13 of 16 (>= 70 %), so the lower neighbour stays out.
        let p = profile(&[
            (dec!(99.9), dec!(3)),
            (dec!(100.0), dec!(10)),
            (dec!(100.1), dec!(3)),
        ]);
        let area = p.value_area().unwrap();
        assert_eq!(area.vah, dec!(100.1));
        assert_eq!(area.val, dec!(100.0));
    }

    #[test]
    fn value_area_is_contiguous_range() {
        let p = profile(&[
            (dec!(1.0), dec!(50)),
            (dec!(1.1), dec!(1)),
            (dec!(1.2), dec!(40)),
            (dec!(1.3), dec!(30)),
        ]);
        let area = p.value_area().unwrap();
        // Expansion walks through the thin 1.1 bin rather than jumping it.
        assert_eq!(area.val, dec!(1.0));
        assert!(area.vah >= dec!(1.2));
    }

    #[test]
    fn single_bin_profile() {
        let p = profile(&[(dec!(100.0), dec!(4))]);
        let area = p.value_area().unwrap();
        assert_eq!(area.vah, dec!(100.0));
        assert_eq!(area.val, dec!(100.0));
        assert_eq!(area.volume, dec!(4));
    }

    #[test]
    fn day_levels_prefer_raw_extremes() {
        let p = profile(&[(dec!(100.0), dec!(4)), (dec!(100.1), dec!(1))]);
        let levels = p
            .day_levels(Some(dec!(100.17)), Some(dec!(99.96)), Some(dec!(100.02)))
            .unwrap();
        assert_eq!(levels.pdh, dec!(100.17));
        assert_eq!(levels.pdl, dec!(99.96));
        assert_eq!(levels.poc, dec!(100.0));
        assert_eq!(levels.vwap, Some(dec!(100.02)));
    }

    #[test]
    fn empty_profile_has_no_levels() {
        let p = VolumeProfile::new();
        assert!(p.poc().is_none());
        assert!(p.value_area().is_none());
        assert!(p.day_levels(None, None, None).is_none());
    }
}
