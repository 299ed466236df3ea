//! Explicit resolver registry keyed by scheme.
//!
//! Each client factory owns its own registry, so independent clients in one
//! process never share registrations.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{BuildError, RegistryError};
use crate::resolver::{Resolver, ResolverBuilder, StateSink};
use crate::target::Target;

/// Maps resolver schemes to builders.
#[derive(Default)]
pub struct Registry {
    builders: RwLock<HashMap<String, Arc<dyn ResolverBuilder>>>,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `builder` for `scheme`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::AlreadyRegistered`] if the scheme is taken.
    pub fn register(
        &self,
        scheme: impl Into<String>,
        builder: Arc<dyn ResolverBuilder>,
    ) -> Result<(), RegistryError> {
        let scheme = scheme.into();
        let mut builders = self.builders.write().unwrap_or_else(PoisonError::into_inner);

        if builders.contains_key(&scheme) {
            return Err(RegistryError::AlreadyRegistered(scheme));
        }

        tracing::debug!("registered resolver scheme `{scheme}`");
        builders.insert(scheme, builder);
        Ok(())
    }

    /// Returns the builder for `scheme`, registering one made by `make` if absent.
    pub fn register_if_absent<F>(&self, scheme: &str, make: F) -> Arc<dyn ResolverBuilder>
    where
        F: FnOnce() -> Arc<dyn ResolverBuilder>,
    {
        let mut builders = self.builders.write().unwrap_or_else(PoisonError::into_inner);

        Arc::clone(builders.entry(scheme.to_string()).or_insert_with(|| {
            tracing::debug!("registered resolver scheme `{scheme}`");
            make()
        }))
    }

    /// Returns the builder registered for `scheme`.
    #[must_use]
    pub fn get(&self, scheme: &str) -> Option<Arc<dyn ResolverBuilder>> {
        self.builders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(scheme)
            .cloned()
    }

    /// Whether a builder is registered for `scheme`.
    #[must_use]
    pub fn contains(&self, scheme: &str) -> bool {
        self.builders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(scheme)
    }

    /// Builds a resolver for a `scheme:///service.environment:port` dial URI.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError`] if the URI is malformed, no builder is
    /// registered for its scheme, or the builder fails.
    pub async fn build(&self, uri: &str, sink: Box<dyn StateSink>) -> Result<Resolver, BuildError> {
        let target = Target::from_uri(uri)?;
        let builder = self
            .get(target.scheme())
            .ok_or_else(|| BuildError::UnknownScheme(target.scheme().to_string()))?;

        builder.build(target, sink).await
    }
}
