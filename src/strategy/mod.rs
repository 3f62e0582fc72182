pub mod detector;
pub mod fees;

pub use detector::{ArbStrategy, ArbitrageDetector, Evaluation, Opportunity, OpportunityLeg, Verdict};
pub use fees::{FeeModel, FeeSchedule};

use crate::market::PriceLevel;

/// Fresh top-of-book for all four outcome books of a matched pair, the
/// detector's only market-data input. Prices are best asks in [0, 1].
#[derive(Clone, Copy, Debug)]
pub struct PairQuote {
    pub kalshi_yes: PriceLevel,
    pub kalshi_no: PriceLevel,
    pub poly_yes: PriceLevel,
    pub poly_no: PriceLevel,
}

impl PairQuote {
    /// Every leg price a strategy could buy, for band filtering.
    pub fn prices(&self) -> [f64; 4] {
        [
            self.kalshi_yes.price,
            self.kalshi_no.price,
            self.poly_yes.price,
            self.poly_no.price,
        ]
    }
}
