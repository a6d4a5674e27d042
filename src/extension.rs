//! Named extension points.
//!
//! Configuration refers to samplers, identifier schemes, propagation entries
//! and span hooks by name. Instead of loading classes reflectively, the
//! runtime resolves names through this registry of factories; host programs
//! register their own implementations before (re)configuring. Unknown names
//! surface as [`Error::Instantiation`] and degrade per the documented
//! fallback of each call site. Built-in names are preregistered.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::propagation::{B3Entry, B3SingleEntry, BinaryEntry, HttpEntry, SpanBinaryEntry, TagsBinaryEntry};
use crate::trace::{IdentifierScheme, PreFinishHook, PreStartHook, SamplerRef};

type SamplerFactory = Arc<dyn Fn(&Config) -> Result<SamplerRef> + Send + Sync>;
type SchemeFactory = Arc<dyn Fn() -> IdentifierScheme + Send + Sync>;
type HttpEntryFactory = Arc<dyn Fn() -> Arc<dyn HttpEntry> + Send + Sync>;
type BinaryEntryFactory = Arc<dyn Fn() -> Arc<dyn BinaryEntry> + Send + Sync>;
type PreStartHookFactory = Arc<dyn Fn() -> Arc<dyn PreStartHook> + Send + Sync>;
type PreFinishHookFactory = Arc<dyn Fn() -> Arc<dyn PreFinishHook> + Send + Sync>;

#[derive(Default)]
struct Registered {
    samplers: HashMap<String, SamplerFactory>,
    identifier_schemes: HashMap<String, SchemeFactory>,
    http_entries: HashMap<String, HttpEntryFactory>,
    binary_entries: HashMap<String, BinaryEntryFactory>,
    pre_start_hooks: HashMap<String, PreStartHookFactory>,
    pre_finish_hooks: HashMap<String, PreFinishHookFactory>,
}

/// Registry of `name → factory` bindings for every user-nameable extension
/// point.
pub struct ExtensionRegistry {
    inner: RwLock<Registered>,
}

impl ExtensionRegistry {
    /// Creates a registry with the built-in extensions preregistered:
    /// identifier schemes `single` and `double`, HTTP propagation entries
    /// `b3` and `b3-single`, binary propagation entries `trace-span` and
    /// `tags`.
    pub fn with_builtins() -> ExtensionRegistry {
        let registry = ExtensionRegistry {
            inner: RwLock::new(Registered::default()),
        };
        registry.register_identifier_scheme("single", IdentifierScheme::single);
        registry.register_identifier_scheme("double", IdentifierScheme::double);
        registry.register_http_entry("b3", || Arc::new(B3Entry::default()));
        registry.register_http_entry("b3-single", || Arc::new(B3SingleEntry::default()));
        registry.register_binary_entry("trace-span", || Arc::new(SpanBinaryEntry::default()));
        registry.register_binary_entry("tags", || Arc::new(TagsBinaryEntry::default()));
        registry
    }

    /// Registers a sampler factory under `name`. The factory receives the
    /// root-scoped configuration tree.
    pub fn register_sampler(
        &self,
        name: impl Into<String>,
        factory: impl Fn(&Config) -> Result<SamplerRef> + Send + Sync + 'static,
    ) {
        self.write().samplers.insert(name.into(), Arc::new(factory));
    }

    /// Resolves a sampler by name.
    pub fn sampler(&self, name: &str, config: &Config) -> Result<SamplerRef> {
        let factory = self
            .read()
            .samplers
            .get(name)
            .cloned()
            .ok_or_else(|| unknown("sampler", name))?;
        factory(config)
    }

    /// Registers an identifier scheme factory under `name`.
    pub fn register_identifier_scheme(
        &self,
        name: impl Into<String>,
        factory: impl Fn() -> IdentifierScheme + Send + Sync + 'static,
    ) {
        self.write()
            .identifier_schemes
            .insert(name.into(), Arc::new(factory));
    }

    /// Resolves an identifier scheme by name.
    pub fn identifier_scheme(&self, name: &str) -> Result<IdentifierScheme> {
        let factory = self
            .read()
            .identifier_schemes
            .get(name)
            .cloned()
            .ok_or_else(|| unknown("identifier scheme", name))?;
        Ok(factory())
    }

    /// Registers an HTTP propagation entry factory under `name`.
    pub fn register_http_entry(
        &self,
        name: impl Into<String>,
        factory: impl Fn() -> Arc<dyn HttpEntry> + Send + Sync + 'static,
    ) {
        self.write()
            .http_entries
            .insert(name.into(), Arc::new(factory));
    }

    /// Resolves an HTTP propagation entry by name.
    pub fn http_entry(&self, name: &str) -> Result<Arc<dyn HttpEntry>> {
        let factory = self
            .read()
            .http_entries
            .get(name)
            .cloned()
            .ok_or_else(|| unknown("http propagation entry", name))?;
        Ok(factory())
    }

    /// Registers a binary propagation entry factory under `name`.
    pub fn register_binary_entry(
        &self,
        name: impl Into<String>,
        factory: impl Fn() -> Arc<dyn BinaryEntry> + Send + Sync + 'static,
    ) {
        self.write()
            .binary_entries
            .insert(name.into(), Arc::new(factory));
    }

    /// Resolves a binary propagation entry by name.
    pub fn binary_entry(&self, name: &str) -> Result<Arc<dyn BinaryEntry>> {
        let factory = self
            .read()
            .binary_entries
            .get(name)
            .cloned()
            .ok_or_else(|| unknown("binary propagation entry", name))?;
        Ok(factory())
    }

    /// Registers a pre-start hook factory under `name`.
    pub fn register_pre_start_hook(
        &self,
        name: impl Into<String>,
        factory: impl Fn() -> Arc<dyn PreStartHook> + Send + Sync + 'static,
    ) {
        self.write()
            .pre_start_hooks
            .insert(name.into(), Arc::new(factory));
    }

    /// Resolves a pre-start hook by name.
    pub fn pre_start_hook(&self, name: &str) -> Result<Arc<dyn PreStartHook>> {
        let factory = self
            .read()
            .pre_start_hooks
            .get(name)
            .cloned()
            .ok_or_else(|| unknown("pre-start hook", name))?;
        Ok(factory())
    }

    /// Registers a pre-finish hook factory under `name`.
    pub fn register_pre_finish_hook(
        &self,
        name: impl Into<String>,
        factory: impl Fn() -> Arc<dyn PreFinishHook> + Send + Sync + 'static,
    ) {
        self.write()
            .pre_finish_hooks
            .insert(name.into(), Arc::new(factory));
    }

    /// Resolves a pre-finish hook by name.
    pub fn pre_finish_hook(&self, name: &str) -> Result<Arc<dyn PreFinishHook>> {
        let factory = self
            .read()
            .pre_finish_hooks
            .get(name)
            .cloned()
            .ok_or_else(|| unknown("pre-finish hook", name))?;
        Ok(factory())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Registered> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Registered> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ExtensionRegistry {
    fn default() -> Self {
        ExtensionRegistry::with_builtins()
    }
}

impl std::fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionRegistry").finish_non_exhaustive()
    }
}

fn unknown(kind: &'static str, name: &str) -> Error {
    Error::Instantiation {
        kind,
        name: name.to_owned(),
        reason: "no factory registered under this name".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{ConstantSampler, Sampler, SamplingDecision, SpanBuilder};

    #[test]
    fn builtins_are_preregistered() {
        let registry = ExtensionRegistry::with_builtins();
        assert!(registry.identifier_scheme("single").is_ok());
        assert!(registry.identifier_scheme("double").is_ok());
        assert!(registry.http_entry("b3").is_ok());
        assert!(registry.http_entry("b3-single").is_ok());
        assert!(registry.binary_entry("trace-span").is_ok());
        assert!(registry.binary_entry("tags").is_ok());
    }

    #[test]
    fn unknown_names_fail_with_the_offending_name() {
        let registry = ExtensionRegistry::with_builtins();
        let error = registry
            .sampler("com.example.Missing", &Config::empty())
            .err()
            .expect("unknown sampler names must fail");
        match error {
            Error::Instantiation { name, .. } => assert_eq!(name, "com.example.Missing"),
            other => panic!("expected an instantiation failure, got {other}"),
        }
    }

    #[test]
    fn registered_factories_resolve() {
        let registry = ExtensionRegistry::with_builtins();
        registry.register_sampler("tenth", |_config| {
            Ok(Arc::new(ConstantSampler::always()) as SamplerRef)
        });
        let sampler = registry.sampler("tenth", &Config::empty()).unwrap();
        assert_eq!(
            sampler.decide(&SpanBuilder::from_name("op")),
            SamplingDecision::Sample
        );
    }
}
