//! List prices for the models the default tier ladder uses.
//!
//! Prices are nanodollars (1e-9 USD) per token. Dated snapshots such as
//! `anthropic/claude-3-5-haiku-20241022` are priced like their base id.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenPrice {
    pub input: i64,
    pub output: i64,
}

impl TokenPrice {
    const fn per_token(input: i64, output: i64) -> Self {
        Self { input, output }
    }

    pub fn cost(&self, input_tokens: u32, output_tokens: u32) -> i64 {
        i64::from(input_tokens) * self.input + i64::from(output_tokens) * self.output
    }
}

// USD per 1M tokens, input / output:
// claude-3-5-haiku 0.80 / 4.00, claude-3-5-sonnet 3.00 / 15.00,
// claude-opus-4.5 5.00 / 25.00, gpt-4o-mini 0.15 / 0.60, gpt-5-mini 0.25 / 2.00
const PRICES: &[(&str, TokenPrice)] = &[
    ("anthropic/claude-3-5-haiku", TokenPrice::per_token(800, 4_000)),
    ("anthropic/claude-3-5-sonnet", TokenPrice::per_token(3_000, 15_000)),
    ("anthropic/claude-opus-4.5", TokenPrice::per_token(5_000, 25_000)),
    ("openai/gpt-4o-mini", TokenPrice::per_token(150, 600)),
    ("openai/gpt-5-mini", TokenPrice::per_token(250, 2_000)),
];

/// Used for models missing from the table.
const FALLBACK: TokenPrice = TokenPrice::per_token(1_000, 5_000);

pub fn price_for(model: &str) -> Option<TokenPrice> {
    let base = strip_date_suffix(model);
    PRICES
        .iter()
        .find(|(id, _)| *id == base)
        .map(|(_, price)| *price)
}

/// Estimated cost of one completion; unknown models use a mid-range price.
pub fn chat_cost(model: &str, input_tokens: u32, output_tokens: u32) -> i64 {
    price_for(model)
        .unwrap_or(FALLBACK)
        .cost(input_tokens, output_tokens)
}

fn strip_date_suffix(model: &str) -> &str {
    match model.rsplit_once('-') {
        Some((base, tail)) if tail.len() == 8 && tail.bytes().all(|b| b.is_ascii_digit()) => base,
        _ => model,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dated_snapshots_price_like_their_base_model() {
        assert_eq!(
            price_for("anthropic/claude-3-5-haiku-20241022"),
            price_for("anthropic/claude-3-5-haiku")
        );
        // 1000 * 800 + 1000 * 4000
        assert_eq!(chat_cost("anthropic/claude-3-5-haiku", 1_000, 1_000), 4_800_000);
    }

    #[test]
    fn unknown_models_use_the_fallback_price() {
        assert!(price_for("someone/new-model").is_none());
        assert_eq!(chat_cost("someone/new-model", 1_000, 0), 1_000_000);
        assert!(price_for("anthropic/claude-opus-4.5").is_some());
    }
}
