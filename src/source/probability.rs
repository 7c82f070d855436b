use crate::config::NEUTRAL_PROBABILITY;

use super::PriceData;

/// Which branch of the derivation policy produced a probability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbabilitySource {
    /// Price of the outcome labelled "yes".
    YesToken,
    /// No "yes" label; first outcome's price.
    FirstToken,
    /// First value of the unlabelled outcome-price list.
    OutcomePriceList,
    /// Nothing usable; neutral default.
    Neutral,
}

impl ProbabilitySource {
    pub fn is_degraded(&self) -> bool {
        matches!(self, ProbabilitySource::Neutral)
    }
}

impl std::fmt::Display for ProbabilitySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProbabilitySource::YesToken => "yes_token",
            ProbabilitySource::FirstToken => "first_token",
            ProbabilitySource::OutcomePriceList => "outcome_price_list",
            ProbabilitySource::Neutral => "neutral",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DerivedProbability {
    pub value: f64,
    pub source: ProbabilitySource,
}

/// Convert an upstream price to a probability in [0, 1].
/// Values above 1 are percentage-scale and get divided by 100.
pub fn price_to_probability(raw: f64) -> Option<f64> {
    if !raw.is_finite() {
        return None;
    }
    let scaled = if raw > 1.0 { raw / 100.0 } else { raw };
    Some(scaled.clamp(0.0, 1.0))
}

/// Apply the derivation policy in order; never fails.
pub fn derive_probability(prices: &PriceData) -> DerivedProbability {
    if let Some(value) = prices
        .tokens
        .iter()
        .find(|t| t.outcome.trim().eq_ignore_ascii_case("yes"))
        .and_then(|t| price_to_probability(t.price))
    {
        return DerivedProbability { value, source: ProbabilitySource::YesToken };
    }

    if let Some(value) = prices.tokens.first().and_then(|t| price_to_probability(t.price)) {
        return DerivedProbability { value, source: ProbabilitySource::FirstToken };
    }

    if let Some(value) = prices.outcome_prices.first().and_then(|&p| price_to_probability(p)) {
        return DerivedProbability { value, source: ProbabilitySource::OutcomePriceList };
    }

    DerivedProbability { value: NEUTRAL_PROBABILITY, source: ProbabilitySource::Neutral }
}
