//! Per-model token pricing (USD per token).

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Rates applied when a model is not in the table. Priced like a
/// mid-tier model so unknown models are never under-reported.
const DEFAULT_RATES: (Decimal, Decimal) = (dec!(0.000003), dec!(0.000015));

/// Model-name prefixes and their `(input, output)` per-token rates.
/// Longer prefixes must precede shorter ones sharing a stem.
const RATES: &[(&str, Decimal, Decimal)] = &[
    ("claude-3-5-haiku", dec!(0.0000008), dec!(0.000004)),
    ("claude-haiku-4", dec!(0.000001), dec!(0.000005)),
    ("claude-3-haiku", dec!(0.00000025), dec!(0.00000125)),
    ("claude-sonnet-4", dec!(0.000003), dec!(0.000015)),
    ("claude-3-7-sonnet", dec!(0.000003), dec!(0.000015)),
    ("claude-3-5-sonnet", dec!(0.000003), dec!(0.000015)),
    ("claude-opus-4", dec!(0.000015), dec!(0.000075)),
    ("gpt-4o-mini", dec!(0.00000015), dec!(0.0000006)),
    ("gpt-4o", dec!(0.0000025), dec!(0.00001)),
    ("gpt-4.1-mini", dec!(0.0000004), dec!(0.0000016)),
    ("gpt-4.1-nano", dec!(0.0000001), dec!(0.0000004)),
    ("gpt-4.1", dec!(0.000002), dec!(0.000008)),
];

/// Look up `(input, output)` per-token cost for a model.
pub fn model_cost(model: &str) -> (Decimal, Decimal) {
    RATES
        .iter()
        .find(|(prefix, _, _)| model.starts_with(prefix))
        .map(|(_, input, output)| (*input, *output))
        .unwrap_or(DEFAULT_RATES)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mini_is_not_shadowed_by_base_model() {
        assert_eq!(model_cost("gpt-4o-mini-2024-07-18").0, dec!(0.00000015));
        assert_eq!(model_cost("gpt-4o-2024-08-06").0, dec!(0.0000025));
    }

    #[test]
    fn unknown_model_uses_default() {
        assert_eq!(model_cost("some-local-model"), DEFAULT_RATES);
    }
}
