use serde::{Deserialize, Serialize};

/// Per-venue taker fee model.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum FeeModel {
    /// Fee charged as a rate on notional (fee = rate * cost).
    Proportional(f64),
    /// Flat fee per contract regardless of price.
    PerUnit(f64),
}

impl FeeModel {
    /// Fee for one contract bought at `price`.
    pub fn fee_per_unit(&self, price: f64) -> f64 {
        match self {
            FeeModel::Proportional(rate) => rate * price,
            FeeModel::PerUnit(flat) => *flat,
        }
    }

    /// Fee for `size` contracts bought at `price` each.
    pub fn fee(&self, price: f64, size: f64) -> f64 {
        self.fee_per_unit(price) * size
    }
}

/// Fee models for both venues. Kalshi charges a proportional taker rate,
/// Polymarket a flat per-unit fee; both stay configurable.
#[derive(Clone, Copy, Debug)]
pub struct FeeSchedule {
    pub kalshi: FeeModel,
    pub poly: FeeModel,
}

impl FeeSchedule {
    pub fn new(kalshi_rate: f64, poly_per_unit: f64) -> Self {
        Self {
            kalshi: FeeModel::Proportional(kalshi_rate),
            poly: FeeModel::PerUnit(poly_per_unit),
        }
    }

    pub fn for_venue(&self, venue: crate::market::Venue) -> FeeModel {
        match venue {
            crate::market::Venue::Kalshi => self.kalshi,
            crate::market::Venue::Polymarket => self.poly,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proportional_scales_with_price() {
        let fee = FeeModel::Proportional(0.01);
        assert!((fee.fee_per_unit(0.55) - 0.0055).abs() < 1e-12);
        assert!((fee.fee(0.55, 10.0) - 0.055).abs() < 1e-12);
    }

    #[test]
    fn per_unit_ignores_price() {
        let fee = FeeModel::PerUnit(0.001);
        assert_eq!(fee.fee_per_unit(0.36), 0.001);
        assert_eq!(fee.fee_per_unit(0.99), 0.001);
        assert!((fee.fee(0.36, 5.0) - 0.005).abs() < 1e-12);
    }
}
