//! Property tests for the arithmetic the limits and accounting depend on.

use llm_gateway::core::database::ProviderKind;
use llm_gateway::services::pricing::{cost_micro_usd, price_for, usd_to_micro};
use llm_gateway::services::response_cache::fingerprint;
use llm_gateway::services::validator::window_bucket;
use proptest::prelude::*;

proptest! {
    #[test]
    fn window_bucket_contains_its_instant(now in 0i64..4_000_000_000, window in 1u64..100_000) {
        let bucket = window_bucket(now, window);
        let start = bucket * window as i64;
        let end = start + window as i64;
        prop_assert!(start <= now);
        prop_assert!(now < end);
    }

    #[test]
    fn window_bucket_monotonic(now in 0i64..4_000_000_000, delta in 0i64..1_000_000, window in 1u64..100_000) {
        prop_assert!(window_bucket(now, window) <= window_bucket(now + delta, window));
    }

    #[test]
    fn same_window_same_bucket(now in 0i64..4_000_000_000, window in 1u64..100_000) {
        let bucket = window_bucket(now, window);
        let window_start = bucket * window as i64;
        // Every instant inside the window maps to the same bucket.
        prop_assert_eq!(window_bucket(window_start, window), bucket);
        prop_assert_eq!(window_bucket(window_start + window as i64 - 1, window), bucket);
    }

    #[test]
    fn cost_is_non_negative_and_monotonic(prompt in 0i64..1_000_000, completion in 0i64..1_000_000) {
        let price = price_for(&ProviderKind::OpenAi, "gpt-4").unwrap();
        let cost = cost_micro_usd(price, prompt, completion);
        prop_assert!(cost >= 0);
        // More tokens never cost less.
        prop_assert!(cost_micro_usd(price, prompt + 1000, completion) >= cost);
        prop_assert!(cost_micro_usd(price, prompt, completion + 1000) >= cost);
    }

    #[test]
    fn usd_to_micro_rounds_to_nearest(usd in 0.0f64..1000.0) {
        let micro = usd_to_micro(usd);
        prop_assert!((micro as f64 - usd * 1_000_000.0).abs() <= 0.5 + f64::EPSILON * 1e12);
    }

    #[test]
    fn fingerprint_is_deterministic(
        path in "/[a-z]{1,16}",
        model in "[a-z0-9-]{1,24}",
        content in ".{0,64}",
    ) {
        let body = serde_json::json!({"model": model, "messages": [{"role": "user", "content": content}]});
        let a = fingerprint(&path, &body, &model, "");
        let b = fingerprint(&path, &body, &model, "");
        prop_assert_eq!(&a, &b);
        // Any component change produces a different key.
        let other = fingerprint(&path, &body, &model, "base64");
        prop_assert_ne!(&a, &other);
    }

    #[test]
    fn provider_kind_roundtrip(name in "[a-z][a-z0-9_-]{0,16}") {
        let raw = format!("custom:{}", name);
        let kind: ProviderKind = raw.parse().unwrap();
        prop_assert_eq!(kind.to_string(), raw);
    }
}

#[test]
fn known_bucket_values() {
    assert_eq!(window_bucket(0, 60), 0);
    assert_eq!(window_bucket(119, 60), 1);
    assert_eq!(window_bucket(120, 60), 2);
}
