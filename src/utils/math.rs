/// Why a trade could not be sized.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SizingError {
    /// Even one contract does not fit the per-trade budget.
    BudgetTooSmall,
    /// The venue's minimum-notional floor pushes the trade past the budget.
    MinNotionalConflict,
}

/// Contracts affordable for a two-leg trade.
///
/// Budget is `max_risk_per_trade * bankroll`, covering both legs. The size is
/// floored to whole contracts, then bumped if the Polymarket leg would fall
/// under the venue's dollar-notional floor; if that bump breaks the budget,
/// the trade is refused rather than resized past the risk cap.
pub fn contracts_for_budget(
    bankroll: f64,
    max_risk_per_trade: f64,
    total_price: f64,
    poly_price: f64,
    poly_min_notional: f64,
) -> Result<f64, SizingError> {
    if total_price <= 0.0 || bankroll <= 0.0 {
        return Err(SizingError::BudgetTooSmall);
    }

    let budget = bankroll * max_risk_per_trade;
    let mut size = (budget / total_price).floor();

    if poly_price > 0.0 && size * poly_price < poly_min_notional {
        size = (poly_min_notional / poly_price).ceil();
        if size * total_price > budget {
            return Err(SizingError::MinNotionalConflict);
        }
    }

    if size < 1.0 {
        return Err(SizingError::BudgetTooSmall);
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_within_budget() {
        // $100 bankroll at 10% risk and $0.91 per pair: 10 contracts.
        let size = contracts_for_budget(100.0, 0.10, 0.91, 0.55, 1.0).unwrap();
        assert_eq!(size, 10.0);
    }

    #[test]
    fn small_account_min_notional_conflict() {
        // Bankroll 10.99 at 10% risk gives a 1.099 budget; at 1.15 per pair
        // zero contracts fit, and the $1 Polymarket floor forces a size whose
        // cost exceeds the budget. The trade must be refused.
        let err = contracts_for_budget(10.99, 0.10, 1.15, 0.55, 1.0).unwrap_err();
        assert_eq!(err, SizingError::MinNotionalConflict);
    }

    #[test]
    fn sized_trade_clears_min_notional() {
        // 5 contracts at 0.30 on the Polymarket leg is $1.50 notional, so the
        // floored size stands without a bump.
        let size = contracts_for_budget(50.0, 0.10, 0.85, 0.30, 1.0).unwrap();
        assert_eq!(size, 5.0);
    }

    #[test]
    fn degenerate_inputs_refused() {
        assert!(contracts_for_budget(0.0, 0.10, 0.9, 0.5, 1.0).is_err());
        assert!(contracts_for_budget(100.0, 0.10, 0.0, 0.5, 1.0).is_err());
    }
}
