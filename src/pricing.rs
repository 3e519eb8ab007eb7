//! Cost computer (C2).
//!
//! Derives a request's cost from a provider's configured pricing and the
//! token counts observed for the attempt. Mirrors the five-rule cascade used
//! by the source aggregation layer, generalized from per-thousand to the
//! per-million-token pricing this gateway's providers are configured with.

use crate::db::Provider;

#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
}

/// Rules, in order:
/// 1. input+output prices and prompt+completion tokens known → split calc.
/// 2. input+output prices known but only total tokens known → mean-price × total.
/// 3. unified price and prompt+completion known → unified × (prompt+completion).
/// 4. unified price and total known → unified × total.
/// 5. otherwise → absent.
pub fn compute_cost(provider: &Provider, usage: &TokenUsage) -> Option<f64> {
    const PER_MILLION: f64 = 1_000_000.0;

    if let (Some(input_price), Some(output_price)) =
        (provider.input_price_per_million, provider.output_price_per_million)
    {
        if let (Some(prompt), Some(completion)) = (usage.prompt_tokens, usage.completion_tokens) {
            return Some((prompt as f64 / PER_MILLION) * input_price + (completion as f64 / PER_MILLION) * output_price);
        }
        if let Some(total) = usage.total_tokens {
            let mean_price = (input_price + output_price) / 2.0;
            return Some((total as f64 / PER_MILLION) * mean_price);
        }
    }

    if let Some(unified) = provider.unified_price_per_million {
        if let (Some(prompt), Some(completion)) = (usage.prompt_tokens, usage.completion_tokens) {
            return Some(((prompt + completion) as f64 / PER_MILLION) * unified);
        }
        if let Some(total) = usage.total_tokens {
            return Some((total as f64 / PER_MILLION) * unified);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(unified: Option<f64>, input: Option<f64>, output: Option<f64>) -> Provider {
        Provider {
            id: 1,
            name: "p".into(),
            endpoint: "https://example.com".into(),
            api_key: "k".into(),
            upstream_model: "m".into(),
            unified_price_per_million: unified,
            input_price_per_million: input,
            output_price_per_million: output,
            billing_mode: "per-token".into(),
            is_active: true,
            total_calls: 0,
            successful_calls: 0,
        }
    }

    #[test]
    fn split_prices_with_full_breakdown() {
        let p = provider(None, Some(1.0), Some(2.0));
        let usage = TokenUsage { prompt_tokens: Some(1_000_000), completion_tokens: Some(500_000), total_tokens: None };
        assert_eq!(compute_cost(&p, &usage), Some(1.0 + 1.0));
    }

    #[test]
    fn split_prices_fall_back_to_mean_on_total_only() {
        let p = provider(None, Some(1.0), Some(3.0));
        let usage = TokenUsage { prompt_tokens: None, completion_tokens: None, total_tokens: Some(1_000_000) };
        assert_eq!(compute_cost(&p, &usage), Some(2.0));
    }

    #[test]
    fn unified_price_with_prompt_and_completion() {
        let p = provider(Some(4.0), None, None);
        let usage = TokenUsage { prompt_tokens: Some(500_000), completion_tokens: Some(500_000), total_tokens: None };
        assert_eq!(compute_cost(&p, &usage), Some(4.0));
    }

    #[test]
    fn unified_price_with_total_only() {
        let p = provider(Some(2.0), None, None);
        let usage = TokenUsage { prompt_tokens: None, completion_tokens: None, total_tokens: Some(1_000_000) };
        assert_eq!(compute_cost(&p, &usage), Some(2.0));
    }

    #[test]
    fn no_pricing_or_tokens_known_yields_absent() {
        let p = provider(None, None, None);
        let usage = TokenUsage::default();
        assert_eq!(compute_cost(&p, &usage), None);
    }

    #[test]
    fn split_prices_present_but_no_tokens_known_falls_through_to_unified_path() {
        let p = provider(Some(3.0), Some(1.0), Some(2.0));
        let usage = TokenUsage::default();
        assert_eq!(compute_cost(&p, &usage), None);
    }
}
