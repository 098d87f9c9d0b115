use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::message::{CacheTokens, TokenTotals};

/// The model a turn ran against, with its pricing table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    #[serde(rename = "providerID")]
    pub provider_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<ModelCost>,
}

/// Prices in dollars per million tokens.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelCost {
    pub input: f64,
    pub output: f64,
    #[serde(default, rename = "cacheRead")]
    pub cache_read: f64,
    #[serde(default, rename = "cacheWrite")]
    pub cache_write: f64,
    /// Distinct tier once the combined input + cache-read count passes 200K.
    #[serde(skip_serializing_if = "Option::is_none", rename = "over200K")]
    pub over_200k: Option<Box<ModelCost>>,
}

/// Raw per-turn usage as reported by the provider. Values arrive as floats
/// and may be NaN or infinite; the calculator clamps them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RawUsage {
    #[serde(rename = "inputTokens")]
    pub input_tokens: f64,
    #[serde(rename = "outputTokens")]
    pub output_tokens: f64,
    #[serde(default, rename = "reasoningTokens")]
    pub reasoning_tokens: f64,
    #[serde(default, rename = "cachedInputTokens")]
    pub cached_input_tokens: f64,
}

/// Provider-specific usage metadata. Each provider nests its cache-write
/// count differently; unknown providers fall back to a raw map.
#[derive(Clone, Debug, PartialEq)]
pub enum ProviderMetadata {
    Anthropic { cache_creation_input_tokens: f64 },
    Bedrock { cache_write_input_tokens: f64 },
    Other(BTreeMap<String, serde_json::Value>),
}

impl ProviderMetadata {
    /// Providers whose reported input count already excludes cached tokens.
    fn input_excludes_cached(&self) -> bool {
        matches!(self, Self::Anthropic { .. } | Self::Bedrock { .. })
    }

    fn cache_write_tokens(&self) -> f64 {
        match self {
            Self::Anthropic { cache_creation_input_tokens } => *cache_creation_input_tokens,
            Self::Bedrock { cache_write_input_tokens } => *cache_write_input_tokens,
            Self::Other(_) => 0.0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct UsageBreakdown {
    /// Dollars for the turn.
    pub cost: f64,
    pub tokens: TokenTotals,
}

const OVER_200K_THRESHOLD: u64 = 200_000;
const PICO_PER_DOLLAR: f64 = 1e12;

/// Normalize raw provider usage into billable token counts and a cost.
/// Never fails: non-finite or negative inputs are clamped to zero.
pub fn usage(model: &Model, raw: &RawUsage, metadata: Option<&ProviderMetadata>) -> UsageBreakdown {
    let cached = clamp(raw.cached_input_tokens);
    let input_excludes_cached = metadata.is_some_and(ProviderMetadata::input_excludes_cached);
    let input = if input_excludes_cached {
        clamp(raw.input_tokens)
    } else {
        clamp(raw.input_tokens).saturating_sub(cached)
    };

    let tokens = TokenTotals {
        input,
        output: clamp(raw.output_tokens),
        reasoning: clamp(raw.reasoning_tokens),
        cache: CacheTokens {
            read: cached,
            write: clamp(metadata.map_or(0.0, ProviderMetadata::cache_write_tokens)),
        },
    };

    let cost = match &model.cost {
        Some(table) => {
            let tier = match &table.over_200k {
                Some(over) if tokens.input + tokens.cache.read > OVER_200K_THRESHOLD => over,
                _ => table,
            };
            // Accumulate in integer picodollars so repeated turns never
            // drift; a single float conversion happens at the end.
            let pico = line(tokens.input, tier.input)
                + line(tokens.output, tier.output)
                + line(tokens.cache.read, tier.cache_read)
                + line(tokens.cache.write, tier.cache_write)
                + line(tokens.reasoning, tier.output);
            pico as f64 / PICO_PER_DOLLAR
        }
        None => 0.0,
    };

    UsageBreakdown { cost, tokens }
}

/// Picodollars for `tokens` at `price` dollars per million tokens.
fn line(tokens: u64, price_per_million: f64) -> u128 {
    if !price_per_million.is_finite() || price_per_million <= 0.0 {
        return 0;
    }
    // dollars/1M-tokens -> picodollars/token is a factor of 1e6.
    let pico_per_token = (price_per_million * 1e6).round() as u128;
    tokens as u128 * pico_per_token
}

fn clamp(value: f64) -> u64 {
    if value.is_finite() && value > 0.0 {
        value as u64
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(cost: Option<ModelCost>) -> Model {
        Model { id: "claude-sonnet-4-5".into(), provider_id: "anthropic".into(), cost }
    }

    #[test]
    fn subtracts_cache_reads_for_cache_exclusive_providers() {
        // $3/M input, $15/M output; 1000 raw input with 200 cached on a
        // provider whose input count includes cached tokens.
        let m = model(Some(ModelCost { input: 3.0, output: 15.0, ..Default::default() }));
        let raw = RawUsage {
            input_tokens: 1000.0,
            output_tokens: 500.0,
            cached_input_tokens: 200.0,
            ..Default::default()
        };
        let result = usage(&m, &raw, None);
        assert_eq!(result.tokens.input, 800);
        assert_eq!(result.tokens.cache.read, 200);
        assert!((result.cost - 0.0099).abs() < 1e-12, "got {}", result.cost);
    }

    #[test]
    fn keeps_raw_input_for_cache_inclusive_providers() {
        let m = model(Some(ModelCost { input: 3.0, output: 15.0, ..Default::default() }));
        let raw = RawUsage {
            input_tokens: 1000.0,
            output_tokens: 0.0,
            cached_input_tokens: 200.0,
            ..Default::default()
        };
        let meta = ProviderMetadata::Anthropic { cache_creation_input_tokens: 0.0 };
        let result = usage(&m, &raw, Some(&meta));
        assert_eq!(result.tokens.input, 1000);
        assert_eq!(result.tokens.cache.read, 200);
    }

    #[test]
    fn reads_cache_write_from_provider_metadata() {
        let m = model(None);
        let raw = RawUsage::default();

        let anthropic = ProviderMetadata::Anthropic { cache_creation_input_tokens: 345.0 };
        assert_eq!(usage(&m, &raw, Some(&anthropic)).tokens.cache.write, 345);

        let bedrock = ProviderMetadata::Bedrock { cache_write_input_tokens: 77.0 };
        assert_eq!(usage(&m, &raw, Some(&bedrock)).tokens.cache.write, 77);

        let other = ProviderMetadata::Other(BTreeMap::new());
        assert_eq!(usage(&m, &raw, Some(&other)).tokens.cache.write, 0);
    }

    #[test]
    fn clamps_non_finite_values() {
        let m = model(Some(ModelCost { input: 3.0, output: 15.0, ..Default::default() }));
        let raw = RawUsage {
            input_tokens: f64::NAN,
            output_tokens: f64::INFINITY,
            reasoning_tokens: -5.0,
            cached_input_tokens: f64::NEG_INFINITY,
        };
        let result = usage(&m, &raw, None);
        assert_eq!(result.tokens, TokenTotals::default());
        assert_eq!(result.cost, 0.0);
    }

    #[test]
    fn reasoning_billed_at_output_rate() {
        let m = model(Some(ModelCost { input: 0.0, output: 10.0, ..Default::default() }));
        let raw = RawUsage { reasoning_tokens: 1_000_000.0, ..Default::default() };
        let result = usage(&m, &raw, None);
        assert!((result.cost - 10.0).abs() < 1e-9);
    }

    #[test]
    fn over_200k_tier_selected_by_combined_input() {
        let m = model(Some(ModelCost {
            input: 3.0,
            output: 15.0,
            over_200k: Some(Box::new(ModelCost { input: 6.0, output: 22.5, ..Default::default() })),
            ..Default::default()
        }));

        // 150K billable input + 100K cache reads crosses the threshold.
        let raw = RawUsage {
            input_tokens: 150_000.0,
            cached_input_tokens: 100_000.0,
            ..Default::default()
        };
        let meta = ProviderMetadata::Anthropic { cache_creation_input_tokens: 0.0 };
        let over = usage(&m, &raw, Some(&meta));
        assert!((over.cost - 150_000.0 * 6.0 / 1e6).abs() < 1e-9, "got {}", over.cost);

        // Under the threshold the standard tier applies.
        let raw = RawUsage { input_tokens: 150_000.0, ..Default::default() };
        let under = usage(&m, &raw, Some(&meta));
        assert!((under.cost - 150_000.0 * 3.0 / 1e6).abs() < 1e-9, "got {}", under.cost);
    }

    #[test]
    fn missing_pricing_costs_nothing() {
        let raw = RawUsage { input_tokens: 5000.0, output_tokens: 100.0, ..Default::default() };
        let result = usage(&model(None), &raw, None);
        assert_eq!(result.cost, 0.0);
        assert_eq!(result.tokens.input, 5000);
    }

    #[test]
    fn accumulation_does_not_drift() {
        // 0.1 + 0.2-style drift: a price with a repeating binary fraction,
        // summed many times, must stay exact to the picodollar.
        let m = model(Some(ModelCost { input: 0.3, output: 0.0, ..Default::default() }));
        let raw = RawUsage { input_tokens: 1000.0, ..Default::default() };
        let mut total = 0.0;
        for _ in 0..10_000 {
            total += usage(&m, &raw, None).cost;
        }
        // 10_000 turns * 1000 tokens * $0.3/M = $3 exactly.
        assert!((total - 3.0).abs() < 1e-6, "got {total}");
    }
}
