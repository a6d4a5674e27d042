use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use vantage::{Config, Runtime};

/// Reconfiguration must be safe under load: measurement and span paths keep
/// succeeding concurrently, and no update to a metric cell whose settings
/// did not change is lost.
#[test]
fn recordings_survive_concurrent_reconfiguration() {
    let runtime = Arc::new(Runtime::new(Config::empty()).unwrap());
    let counter = runtime.metrics().counter("requests").unwrap();
    let stop = Arc::new(AtomicBool::new(false));

    let recorders: Vec<_> = (0..4)
        .map(|_| {
            let cell = counter.without_tags();
            let stop = stop.clone();
            thread::spawn(move || {
                let mut recorded = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    cell.increment();
                    recorded += 1;
                }
                recorded
            })
        })
        .collect();

    let spanners: Vec<_> = (0..2)
        .map(|_| {
            let runtime = runtime.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let mut finished = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    let tracer = runtime.tracer();
                    tracer.span_builder("reload-op").start(tracer).finish();
                    finished += 1;
                }
                finished
            })
        })
        .collect();

    for round in 0..20 {
        let sampler = if round % 2 == 0 { "always" } else { "never" };
        let config = Config::from_yaml(&format!(
            r#"
vantage:
  trace:
    sampler: {sampler}
  metric:
    tick-interval: {}s
"#,
            10 + round
        ))
        .unwrap();
        runtime.reconfigure(config).unwrap();
        thread::sleep(std::time::Duration::from_millis(5));
    }
    stop.store(true, Ordering::Relaxed);

    let recorded: u64 = recorders.into_iter().map(|t| t.join().unwrap()).sum();
    let finished: u64 = spanners.into_iter().map(|t| t.join().unwrap()).sum();
    assert!(finished > 0);

    // Every increment made it into the cell despite the reconfigurations.
    let snapshot = runtime.metrics().snapshot(true);
    let metric = snapshot
        .counters
        .iter()
        .find(|m| m.name == "requests")
        .unwrap();
    assert_eq!(metric.instruments[0].value, recorded);
}

#[test]
fn reconfigure_updates_listeners_and_settings() {
    let runtime = Runtime::new(Config::empty()).unwrap();
    let notified = Arc::new(AtomicBool::new(false));
    let seen = notified.clone();
    runtime.config_hub().on_reconfigure(move |config| {
        if config.string("vantage.environment.service").as_deref() == Some("billing") {
            seen.store(true, Ordering::Relaxed);
        }
    });

    runtime
        .reconfigure(
            Config::from_yaml(
                r#"
vantage:
  environment:
    service: billing
"#,
            )
            .unwrap(),
        )
        .unwrap();

    assert!(notified.load(Ordering::Relaxed));
    assert_eq!(runtime.environment().service, "billing");
}
