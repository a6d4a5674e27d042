//! The runtime composing every collaborator.
//!
//! A [`Runtime`] owns the configuration hub, clock, schedulers, extension
//! registry, metric registry, tracer and propagation channels. There is no
//! global singleton in the core: host programs build one `Runtime` and hand
//! it (or the specific collaborators) to instrumented code.
//!
//! Configuration lives under the `vantage` root namespace;
//! [`Runtime::reconfigure`] validates the new tree first and only then
//! applies it across all subsystems, while measurement and span paths keep
//! running against the previous snapshots.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::clock::Clock;
use crate::config::{Config, ConfigHub};
use crate::error::Result;
use crate::extension::ExtensionRegistry;
use crate::metrics::{FactorySettings, MetricRegistry, RegistrySettings};
use crate::propagation::Propagation;
use crate::scheduler::{Scheduler, ThreadPoolScheduler};
use crate::tag::{TagSet, TagValue};
use crate::trace::{TraceSettings, Tracer};

/// Identity of the host process, from `environment.*`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Environment {
    /// Logical service name.
    pub service: String,
    /// Host name.
    pub host: String,
    /// Instance name, unique per running process of a service.
    pub instance: String,
    /// Tags attached to everything this process emits.
    pub tags: TagSet,
}

impl Environment {
    /// Reads `environment.*` from a root-scoped configuration tree.
    pub fn from_config(config: &Config) -> Environment {
        let service = config
            .string("environment.service")
            .unwrap_or_else(|| "unknown-service".to_owned());
        let host = config
            .string("environment.host")
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "localhost".to_owned());
        let instance = config
            .string("environment.instance")
            .unwrap_or_else(|| format!("{service}@{host}"));
        let tags = TagSet::from_pairs(config.keys("environment.tags").into_iter().filter_map(
            |key| {
                config
                    .string(&format!("environment.tags.\"{key}\""))
                    .map(|value| (key, TagValue::String(value)))
            },
        ));
        Environment {
            service,
            host,
            instance,
            tags,
        }
    }
}

/// Owns and wires the whole observability runtime.
pub struct Runtime {
    hub: ConfigHub,
    clock: Clock,
    scheduler: Arc<dyn Scheduler>,
    extensions: Arc<ExtensionRegistry>,
    metrics: Arc<MetricRegistry>,
    tracer: Tracer,
    propagation: Arc<Propagation>,
    environment: ArcSwap<Environment>,
}

impl Runtime {
    /// Builds a runtime from a configuration tree, with the built-in
    /// extensions.
    pub fn new(config: Config) -> Result<Runtime> {
        Runtime::with_extensions(config, ExtensionRegistry::with_builtins())
    }

    /// Builds a runtime with a caller-populated extension registry, so
    /// custom samplers, schemes, hooks and propagation entries are
    /// resolvable during the initial configuration.
    pub fn with_extensions(config: Config, extensions: ExtensionRegistry) -> Result<Runtime> {
        let root = config.section("vantage");
        let extensions = Arc::new(extensions);
        let clock = Clock::new();

        let trace_settings = TraceSettings::from_config(&root, &extensions)?;
        let factory_settings = FactorySettings::from_config(&root);
        let registry_settings = RegistrySettings::from_config(&root);

        let scheduler_pool_size = root
            .i64("scheduler-pool-size")
            .map(|size| size.max(1) as usize)
            .unwrap_or(2);
        let scheduler: Arc<dyn Scheduler> =
            Arc::new(ThreadPoolScheduler::new(scheduler_pool_size));
        let refresh_scheduler: Arc<dyn Scheduler> = Arc::new(ThreadPoolScheduler::new(
            registry_settings.refresh_scheduler_pool_size,
        ));

        let metrics = Arc::new(MetricRegistry::new(
            clock.clone(),
            refresh_scheduler,
            factory_settings,
            registry_settings,
        ));
        let tracer = Tracer::new(clock.clone(), scheduler.clone(), &metrics, trace_settings);
        let propagation = Arc::new(Propagation::from_config(&root, &extensions)?);
        let environment = ArcSwap::from_pointee(Environment::from_config(&root));

        Ok(Runtime {
            hub: ConfigHub::new(config),
            clock,
            scheduler,
            extensions,
            metrics,
            tracer,
            propagation,
            environment,
        })
    }

    /// Validates `config` and applies it across the tracer, the metric
    /// registry and the propagation channels. On error nothing is applied.
    /// Hot paths never block on this call.
    pub fn reconfigure(&self, config: Config) -> Result<()> {
        let root = config.section("vantage");

        let trace_settings = TraceSettings::from_config(&root, &self.extensions)?;
        let factory_settings = FactorySettings::from_config(&root);
        let registry_settings = RegistrySettings::from_config(&root);
        self.propagation.reconfigure(&root, &self.extensions)?;

        self.tracer.reconfigure(trace_settings);
        self.metrics.reconfigure(factory_settings, registry_settings);
        self.environment.store(Arc::new(Environment::from_config(&root)));
        self.hub.reconfigure(config);
        Ok(())
    }

    /// The tracer.
    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    /// The metric registry.
    pub fn metrics(&self) -> &MetricRegistry {
        &self.metrics
    }

    /// The propagation channels.
    pub fn propagation(&self) -> &Propagation {
        &self.propagation
    }

    /// The current environment snapshot.
    pub fn environment(&self) -> Arc<Environment> {
        self.environment.load_full()
    }

    /// The extension registry.
    pub fn extensions(&self) -> &ExtensionRegistry {
        &self.extensions
    }

    /// The configuration hub; register listeners here to observe
    /// reconfigurations.
    pub fn config_hub(&self) -> &ConfigHub {
        &self.hub
    }

    /// The runtime clock.
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// The shared scheduler for periodic work.
    pub fn scheduler(&self) -> Arc<dyn Scheduler> {
        self.scheduler.clone()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("environment", &self.environment.load().service)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_defaults_are_filled_in() {
        let environment = Environment::from_config(&Config::empty());
        assert_eq!(environment.service, "unknown-service");
        assert!(!environment.host.is_empty());
        assert_eq!(
            environment.instance,
            format!("{}@{}", environment.service, environment.host)
        );
        assert!(environment.tags.is_empty());
    }

    #[test]
    fn environment_reads_service_host_and_tags() {
        let config = Config::from_yaml(
            r#"
environment:
  service: billing
  host: node-7
  tags:
    team: payments
    region: eu-west-1
"#,
        )
        .unwrap();
        let environment = Environment::from_config(&config);
        assert_eq!(environment.service, "billing");
        assert_eq!(environment.host, "node-7");
        assert_eq!(environment.instance, "billing@node-7");
        assert_eq!(environment.tags.get_string("team"), Some("payments"));
        assert_eq!(environment.tags.get_string("region"), Some("eu-west-1"));
    }

    #[test]
    fn a_runtime_builds_from_an_empty_tree() {
        let runtime = Runtime::new(Config::empty()).unwrap();
        assert!(runtime.propagation().http("default").is_some());
        assert_eq!(runtime.environment().service, "unknown-service");
    }

    #[test]
    fn reconfigure_applies_to_every_subsystem() {
        let runtime = Runtime::new(Config::empty()).unwrap();
        let config = Config::from_yaml(
            r#"
vantage:
  environment:
    service: billing
  trace:
    sampler: always
    reporter-queue-size: 32
  metric:
    tick-interval: 15s
"#,
        )
        .unwrap();
        runtime.reconfigure(config).unwrap();

        assert_eq!(runtime.environment().service, "billing");
        assert_eq!(runtime.tracer().status().capacity, 32);
        assert_eq!(
            runtime.metrics().settings().tick_interval,
            std::time::Duration::from_secs(15)
        );
    }

    #[test]
    fn an_invalid_reconfigure_applies_nothing() {
        let runtime = Runtime::new(Config::empty()).unwrap();
        let capacity_before = runtime.tracer().status().capacity;

        let broken = Config::from_yaml(
            r#"
vantage:
  trace:
    reporter-queue-size: 64
  propagation:
    http:
      internal: {}
"#,
        )
        .unwrap();
        assert!(runtime.reconfigure(broken).is_err());
        assert_eq!(runtime.tracer().status().capacity, capacity_before);
    }
}
