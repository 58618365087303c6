//! Exchange-legal price/quantity normalization.
//!
//! Pure, deterministic functions: the idempotent order-id derivation in the
//! tick engine hashes normalized values, so the same inputs must always
//! produce the same outputs.

use crate::error::{Error, Result};

/// Tolerance for float step division (0.3 / 0.1 is not exactly 3.0).
const STEP_EPSILON: f64 = 1e-9;

/// Round `price` to the nearest multiple of `tick_size`, half-up.
///
/// Errors on non-positive `tick_size`.
pub fn normalize_price(price: f64, tick_size: f64) -> Result<f64> {
    if !(tick_size > 0.0) {
        return Err(Error::InvalidFilter(format!(
            "tick size must be positive, got {tick_size}"
        )));
    }
    let steps = (price / tick_size + 0.5 + STEP_EPSILON).floor();
    Ok(steps * tick_size)
}

/// Round `qty` **down** to a multiple of `lot_size` — never exceed the
/// available balance. Non-positive `qty` normalizes to 0.
///
/// Errors on non-positive `lot_size`.
pub fn normalize_quantity(qty: f64, lot_size: f64) -> Result<f64> {
    if !(lot_size > 0.0) {
        return Err(Error::InvalidFilter(format!(
            "lot size must be positive, got {lot_size}"
        )));
    }
    if qty <= 0.0 {
        return Ok(0.0);
    }
    let steps = (qty / lot_size + STEP_EPSILON).floor();
    Ok(steps * lot_size)
}

/// Whether `price × qty` meets the exchange's minimum notional. No
/// auto-correction; callers decide whether to skip or bump.
pub fn validate_min_notional(price: f64, qty: f64, min_notional: f64) -> bool {
    price * qty >= min_notional
}

/// Round a quote-denominated value to 2 decimals, half away from zero.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Round a base-asset quantity to 8 decimals, half away from zero.
pub fn round8(value: f64) -> f64 {
    (value * 1e8).round() / 1e8
}

/// Round a percentage to 1 decimal.
pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn price_rounds_half_up() {
        assert!(close(normalize_price(100.05, 0.1).unwrap(), 100.1));
        assert!(close(normalize_price(100.04, 0.1).unwrap(), 100.0));
        assert!(close(normalize_price(64123.372, 0.01).unwrap(), 64123.37));
        assert!(close(normalize_price(64123.378, 0.01).unwrap(), 64123.38));
    }

    #[test]
    fn price_exact_multiple_unchanged() {
        assert!((normalize_price(0.3, 0.1).unwrap() - 0.3).abs() < 1e-12);
        assert_eq!(normalize_price(250.0, 0.5).unwrap(), 250.0);
    }

    #[test]
    fn price_idempotent() {
        for (p, t) in [(100.037, 0.01), (0.123456, 0.0001), (7.0, 0.5)] {
            let once = normalize_price(p, t).unwrap();
            let twice = normalize_price(once, t).unwrap();
            assert!((once - twice).abs() < 1e-12, "{p} @ {t}: {once} vs {twice}");
        }
    }

    #[test]
    fn quantity_rounds_down() {
        assert!(close(normalize_quantity(0.0157, 0.001).unwrap(), 0.015));
        assert!(close(normalize_quantity(1.999, 1.0).unwrap(), 1.0));
    }

    #[test]
    fn quantity_never_exceeds_input() {
        for (q, l) in [(0.3, 0.1), (0.0157, 0.001), (5.0, 0.25), (1e-5, 1e-6)] {
            let n = normalize_quantity(q, l).unwrap();
            assert!(n <= q + 1e-12, "{q} @ {l} -> {n}");
        }
    }

    #[test]
    fn quantity_float_step_does_not_drop_a_lot() {
        // 0.3 / 0.1 = 2.9999999999999996 without the epsilon guard.
        assert!((normalize_quantity(0.3, 0.1).unwrap() - 0.3).abs() < 1e-12);
    }

    #[test]
    fn non_positive_quantity_is_zero() {
        assert_eq!(normalize_quantity(0.0, 0.1).unwrap(), 0.0);
        assert_eq!(normalize_quantity(-1.5, 0.1).unwrap(), 0.0);
    }

    #[test]
    fn bad_filters_error() {
        assert!(normalize_price(100.0, 0.0).is_err());
        assert!(normalize_price(100.0, -0.1).is_err());
        assert!(normalize_quantity(1.0, 0.0).is_err());
    }

    #[test]
    fn min_notional_boundary() {
        assert!(validate_min_notional(10.0, 1.0, 10.0));
        assert!(!validate_min_notional(10.0, 0.99, 10.0));
    }

    #[test]
    fn rounding_helpers() {
        assert!(close(round2(10.006), 10.01));
        assert!(close(round2(10.004), 10.0));
        assert!(close(round8(0.123456782), 0.12345678));
        assert!(close(round1(33.36), 33.4));
    }
}
