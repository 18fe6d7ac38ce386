//! Property tests for the rolling latency window and success rate.

use std::{collections::VecDeque, time::Duration};

use murmur_core::{FailureCategory, MetricsConfig, RealtimeMetrics};
use proptest::prelude::*;

fn category() -> impl Strategy<Value = FailureCategory> {
    prop_oneof![
        Just(FailureCategory::Typing),
        Just(FailureCategory::ReadReceipt),
        Just(FailureCategory::Reconnection),
        Just(FailureCategory::Persistence),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: the average equals the mean of the newest `capacity` samples
    #[test]
    fn prop_average_tracks_newest_samples(
        capacity in 1usize..16,
        samples in prop::collection::vec(0u64..10_000, 0..64),
    ) {
        let metrics = RealtimeMetrics::new(&MetricsConfig { latency_window: capacity });
        let mut model: VecDeque<u64> = VecDeque::new();

        for sample in &samples {
            metrics.record_latency(Duration::from_millis(*sample));
            model.push_back(*sample);
            if model.len() > capacity {
                model.pop_front();
            }

            let expected = if model.is_empty() {
                Duration::ZERO
            } else {
                Duration::from_millis(model.iter().sum()) / model.len() as u32
            };
            prop_assert_eq!(metrics.average_latency(), expected);
        }

        prop_assert_eq!(metrics.snapshot().latency_samples, model.len());
    }

    /// Property: success rate stays within [0, 1] and matches the counters
    #[test]
    fn prop_success_rate_bounded(
        sent in 0u64..100,
        failures in prop::collection::vec(category(), 0..100),
    ) {
        let metrics = RealtimeMetrics::default();
        for _ in 0..sent {
            metrics.record_typing_event_sent(None);
        }
        for category in &failures {
            metrics.record_failed_event(*category);
        }

        let snapshot = metrics.snapshot();
        let rate = snapshot.success_rate();
        prop_assert!((0.0..=1.0).contains(&rate));
        prop_assert_eq!(snapshot.failed_events(), failures.len() as u64);
        prop_assert_eq!(snapshot.total_events_processed, sent + failures.len() as u64);

        if sent + failures.len() as u64 > 0 {
            let expected = sent as f64 / (sent + failures.len() as u64) as f64;
            prop_assert!((rate - expected).abs() < 1e-9);
        }
    }
}

#[test]
fn hundred_and_first_sample_evicts_the_oldest() {
    let metrics = RealtimeMetrics::default();
    metrics.record_latency(Duration::from_millis(1_000));
    for _ in 0..99 {
        metrics.record_latency(Duration::from_millis(10));
    }
    assert_eq!(metrics.snapshot().latency_samples, 100);
    assert_eq!(metrics.average_latency(), Duration::from_micros(19_900));

    metrics.record_latency(Duration::from_millis(10));

    assert_eq!(metrics.snapshot().latency_samples, 100);
    assert_eq!(metrics.average_latency(), Duration::from_millis(10));
}
