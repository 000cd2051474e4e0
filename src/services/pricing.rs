//! Static per-thousand-token price tables.
//!
//! Prices are USD per 1000 tokens, keyed by model. Lookups try the exact
//! model name first and then the longest matching family prefix, so dated
//! snapshots like `gpt-4-0613` price as their family. Azure deployments
//! reuse the OpenAI table keyed by the underlying model.

use once_cell::sync::Lazy;
use std::collections::HashMap;

use crate::core::database::ProviderKind;

/// USD per 1000 tokens for one model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPrice {
    pub prompt_per_1k: f64,
    pub completion_per_1k: f64,
}

static OPENAI_PER_1K: Lazy<HashMap<&'static str, ModelPrice>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert(
        "gpt-4",
        ModelPrice {
            prompt_per_1k: 0.03,
            completion_per_1k: 0.06,
        },
    );
    m.insert(
        "gpt-4-32k",
        ModelPrice {
            prompt_per_1k: 0.06,
            completion_per_1k: 0.12,
        },
    );
    m.insert(
        "gpt-4-turbo",
        ModelPrice {
            prompt_per_1k: 0.01,
            completion_per_1k: 0.03,
        },
    );
    m.insert(
        "gpt-4o",
        ModelPrice {
            prompt_per_1k: 0.0025,
            completion_per_1k: 0.01,
        },
    );
    m.insert(
        "gpt-4o-mini",
        ModelPrice {
            prompt_per_1k: 0.00015,
            completion_per_1k: 0.0006,
        },
    );
    m.insert(
        "gpt-3.5-turbo",
        ModelPrice {
            prompt_per_1k: 0.0005,
            completion_per_1k: 0.0015,
        },
    );
    m.insert(
        "gpt-3.5-turbo-16k",
        ModelPrice {
            prompt_per_1k: 0.003,
            completion_per_1k: 0.004,
        },
    );
    m.insert(
        "text-embedding-ada-002",
        ModelPrice {
            prompt_per_1k: 0.0001,
            completion_per_1k: 0.0,
        },
    );
    m.insert(
        "text-embedding-3-small",
        ModelPrice {
            prompt_per_1k: 0.00002,
            completion_per_1k: 0.0,
        },
    );
    m.insert(
        "text-embedding-3-large",
        ModelPrice {
            prompt_per_1k: 0.00013,
            completion_per_1k: 0.0,
        },
    );
    m
});

static ANTHROPIC_PER_1K: Lazy<HashMap<&'static str, ModelPrice>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert(
        "claude-3-opus",
        ModelPrice {
            prompt_per_1k: 0.015,
            completion_per_1k: 0.075,
        },
    );
    m.insert(
        "claude-3-sonnet",
        ModelPrice {
            prompt_per_1k: 0.003,
            completion_per_1k: 0.015,
        },
    );
    m.insert(
        "claude-3-haiku",
        ModelPrice {
            prompt_per_1k: 0.00025,
            completion_per_1k: 0.00125,
        },
    );
    m.insert(
        "claude-2.1",
        ModelPrice {
            prompt_per_1k: 0.008,
            completion_per_1k: 0.024,
        },
    );
    m.insert(
        "claude-instant-1.2",
        ModelPrice {
            prompt_per_1k: 0.0008,
            completion_per_1k: 0.0024,
        },
    );
    m
});

fn table_for(provider: &ProviderKind) -> Option<&'static HashMap<&'static str, ModelPrice>> {
    match provider {
        ProviderKind::OpenAi | ProviderKind::Azure => Some(&OPENAI_PER_1K),
        ProviderKind::Anthropic => Some(&ANTHROPIC_PER_1K),
        // Custom providers have no published table; cost stays unknown.
        ProviderKind::Custom(_) => None,
    }
}

/// Price for `(provider, model)`, exact name first, then the longest
/// family prefix.
pub fn price_for(provider: &ProviderKind, model: &str) -> Option<ModelPrice> {
    let table = table_for(provider)?;
    if let Some(price) = table.get(model) {
        return Some(*price);
    }

    table
        .iter()
        .filter(|(family, _)| model.starts_with(*family))
        .max_by_key(|(family, _)| family.len())
        .map(|(_, price)| *price)
}

/// Round a USD amount to micro-USD. Spend accumulates as integers to avoid
/// floating-point drift.
pub fn usd_to_micro(cost_usd: f64) -> i64 {
    (cost_usd * 1_000_000.0).round() as i64
}

/// Total cost in micro-USD for one priced request.
pub fn cost_micro_usd(price: ModelPrice, prompt_tokens: i64, completion_tokens: i64) -> i64 {
    let cost_usd = (prompt_tokens as f64 / 1000.0) * price.prompt_per_1k
        + (completion_tokens as f64 / 1000.0) * price.completion_per_1k;
    usd_to_micro(cost_usd)
}

/// Cheapest prompt-side price across `models`, in micro-USD for
/// `prompt_tokens` tokens. Used by spend admission as the minimum plausible
/// cost of a request. Models without a price contribute nothing (they
/// cannot lower-bound spend).
pub fn cheapest_prompt_cost_micro_usd(
    provider: &ProviderKind,
    models: &[String],
    prompt_tokens: i64,
) -> Option<i64> {
    models
        .iter()
        .filter_map(|model| price_for(provider, model))
        .map(|price| usd_to_micro((prompt_tokens as f64 / 1000.0) * price.prompt_per_1k))
        .min()
}
