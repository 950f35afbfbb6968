//! Tick-aligned price quantization.
//!
//! Every price bin in the engine (live path, backfill path, previous-day
//! reconstruction) goes through [`quantize`]. Reconciliation with external
//! chart tools depends on all paths binning identically, so the math is pure
//! decimal floor-division; binary floating point would drift (101.505 with a
//! 0.1 tick must yield exactly 101.5, never 101.4).

use rust_decimal::Decimal;

use crate::error::{EngineError, Result};

/// Smallest tick the engine accepts; anything below this is a config bug.
const MIN_TICK: Decimal = Decimal::from_parts(1, 0, 0, false, 12); // 1e-12

/// Snap `price` down to the nearest multiple of `tick`.
pub fn quantize(price: Decimal, tick: Decimal) -> Result<Decimal> {
    if tick <= Decimal::ZERO {
        return Err(EngineError::InvalidTick(format!(
            "tick must be positive, got {tick}"
        )));
    }
    if tick < MIN_TICK {
        return Err(EngineError::InvalidTick(format!(
            "tick {tick} below minimum {MIN_TICK}"
        )));
    }
    Ok((price / tick).floor() * tick)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn snaps_down_to_tick() {
        assert_eq!(quantize(dec!(101.505), dec!(0.1)).unwrap(), dec!(101.5));
        assert_eq!(quantize(dec!(101.509), dec!(0.1)).unwrap(), dec!(101.5));
        assert_eq!(quantize(dec!(101.501), dec!(0.01)).unwrap(), dec!(101.50));
        assert_eq!(quantize(dec!(0.05), dec!(0.1)).unwrap(), dec!(0.0));
    }

    #[test]
    fn idempotent_on_already_binned_prices() {
        let tick = dec!(0.1);
        for raw in [dec!(101.505), dec!(99.99), dec!(0.13)] {
            let once = quantize(raw, tick).unwrap();
            let twice = quantize(once, tick).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn exact_multiples_map_to_themselves() {
        let tick = dec!(0.25);
        for k in 0i64..40 {
            let price = Decimal::from(k) * tick;
            assert_eq!(quantize(price, tick).unwrap(), price);
        }
    }

    #[test]
    fn rejects_bad_ticks() {
        assert!(quantize(dec!(100), Decimal::ZERO).is_err());
        assert!(quantize(dec!(100), dec!(-0.1)).is_err());
        assert!(quantize(dec!(100), Decimal::from_parts(1, 0, 0, false, 13)).is_err());
    }
}
