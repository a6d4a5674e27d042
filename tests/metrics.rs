use std::sync::Arc;
use std::thread;

use vantage::metrics::{DynamicRange, MetricOverrides};
use vantage::{Config, Error, Runtime, TagSet};

fn runtime() -> Runtime {
    Runtime::new(Config::empty()).expect("an empty configuration always builds")
}

#[test]
fn counter_accumulates_and_resets_across_periods() {
    let runtime = runtime();
    let requests = runtime.metrics().counter("requests").unwrap();
    assert_eq!(requests.settings().unit, None);

    let cell = requests.without_tags();
    cell.increment_by(5);
    cell.increment_by(3);
    cell.increment_by(2);

    let snapshot = runtime.metrics().snapshot(true);
    let metric = snapshot
        .counters
        .iter()
        .find(|m| m.name == "requests")
        .unwrap();
    assert_eq!(metric.instruments[0].value, 10);

    let next = runtime.metrics().snapshot(true);
    let metric = next.counters.iter().find(|m| m.name == "requests").unwrap();
    assert_eq!(metric.instruments[0].value, 0);
}

#[test]
fn settings_conflicts_warn_and_kind_conflicts_fail() {
    let runtime = runtime();
    let original = runtime
        .metrics()
        .histogram_with(
            "lat",
            MetricOverrides::default().dynamic_range(DynamicRange::new(1, 1_000_000_000, 2)),
        )
        .unwrap();

    // Re-registering under another kind is a fatal configuration error.
    match runtime.metrics().counter("lat") {
        Err(Error::MetricKindMismatch {
            existing,
            requested,
            ..
        }) => {
            assert_eq!(existing, "histogram");
            assert_eq!(requested, "counter");
        }
        _ => panic!("a kind conflict must fail"),
    }

    // Re-registering with different optional settings succeeds and keeps the
    // original settings.
    let again = runtime
        .metrics()
        .histogram_with(
            "lat",
            MetricOverrides::default().dynamic_range(DynamicRange::new(1, 1_000_000, 3)),
        )
        .unwrap();
    assert_eq!(
        again.settings().dynamic_range,
        DynamicRange::new(1, 1_000_000_000, 2)
    );
    drop(original);
}

#[test]
fn concurrent_recordings_are_never_lost() {
    let runtime = runtime();
    let counter = runtime.metrics().counter("hits").unwrap();

    let threads: Vec<_> = (0..8)
        .map(|_| {
            let cell = counter.without_tags();
            thread::spawn(move || {
                for _ in 0..25_000 {
                    cell.increment_by(2);
                }
            })
        })
        .collect();
    for handle in threads {
        handle.join().unwrap();
    }

    let snapshot = runtime.metrics().snapshot(true);
    assert_eq!(snapshot.counters[0].instruments[0].value, 8 * 25_000 * 2);
}

#[test]
fn histogram_distributions_support_percentiles() {
    let runtime = runtime();
    let latency = runtime
        .metrics()
        .histogram_with(
            "request.latency",
            MetricOverrides::default()
                .unit("ns")
                .dynamic_range(DynamicRange::new(1, 10_000_000, 2)),
        )
        .unwrap();

    let cell = latency.with_tags(TagSet::of("endpoint", "/users"));
    for value in 1..=1_000u64 {
        cell.record(value * 100);
    }

    let snapshot = runtime.metrics().snapshot(false);
    let metric = &snapshot.histograms[0];
    let distribution = &metric.instruments[0].value;
    assert_eq!(distribution.count, 1_000);
    let p50 = distribution.percentile(50.0);
    assert!((p50 as f64 - 50_000.0).abs() / 50_000.0 < 0.02, "p50 was {p50}");
}

#[test]
fn range_sampler_reports_distribution_and_last_value() {
    let runtime = runtime();
    let in_flight = runtime.metrics().range_sampler("requests.in-flight").unwrap();
    let cell = in_flight.without_tags();

    cell.increment_by(4);
    cell.sample();
    cell.decrement();
    cell.sample();

    let snapshot = runtime.metrics().snapshot(true);
    let metric = &snapshot.range_samplers[0];
    let value = &metric.instruments[0].value;
    assert_eq!(value.distribution.count, 2);
    assert_eq!(value.distribution.max, 4);
    assert_eq!(value.last, 3);
}

#[test]
fn auto_update_callbacks_run_on_the_configured_interval() {
    let config = Config::from_yaml(
        r#"
vantage:
  metric:
    factory:
      custom-settings:
        "pool.size":
          auto-update-interval: 20ms
"#,
    )
    .unwrap();
    let runtime = Runtime::new(config).unwrap();
    let pool_size = runtime.metrics().gauge("pool.size").unwrap();

    let updates = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let seen = updates.clone();
    let handle = pool_size.auto_update(move |gauge| {
        gauge.set(42.0);
        seen.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    });

    thread::sleep(std::time::Duration::from_millis(300));
    handle.cancel();
    assert!(updates.load(std::sync::atomic::Ordering::Relaxed) >= 2);
    assert_eq!(pool_size.without_tags().value(), 42.0);
}
