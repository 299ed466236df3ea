//! Parsing of resolver targets from dial addresses.

use std::fmt;

use crate::error::TargetError;

/// Identifies the service a resolver tracks.
///
/// A target is derived from an address of the form `service.environment:port`,
/// where the environment doubles as the Kubernetes namespace. Every resolved
/// member is reached on the same `port`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Target {
    scheme: String,
    namespace: String,
    service: String,
    port: u16,
}

impl Target {
    /// Creates a target from its parts.
    #[must_use]
    pub fn new(
        scheme: impl Into<String>,
        namespace: impl Into<String>,
        service: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            scheme: scheme.into(),
            namespace: namespace.into(),
            service: service.into(),
            port,
        }
    }

    /// Parses a bare `service.environment:port` address for the given scheme.
    ///
    /// Only the first two segments of the host are significant, so
    /// `orders.production.svc.cluster.local:8080` resolves service `orders`
    /// in namespace `production`.
    ///
    /// # Errors
    ///
    /// Returns [`TargetError`] if the port is missing or invalid, or the host
    /// has fewer than two segments.
    pub fn from_address(scheme: &str, address: &str) -> Result<Self, TargetError> {
        let (host, port) = address
            .split_once(':')
            .ok_or_else(|| TargetError::MissingPort(address.to_string()))?;

        let port = port
            .parse::<u16>()
            .map_err(|_| TargetError::InvalidPort(address.to_string()))?;

        let mut segments = host.split('.').filter(|s| !s.is_empty());
        let (Some(service), Some(namespace)) = (segments.next(), segments.next()) else {
            return Err(TargetError::MissingEnvironment(address.to_string()));
        };

        Ok(Self::new(scheme, namespace, service, port))
    }

    /// Parses a `scheme:///service.environment:port` dial URI.
    ///
    /// # Errors
    ///
    /// Returns [`TargetError`] if the scheme separator is missing or the
    /// address part is malformed.
    pub fn from_uri(uri: &str) -> Result<Self, TargetError> {
        let (scheme, rest) = uri
            .split_once("://")
            .filter(|(scheme, _)| !scheme.is_empty())
            .ok_or_else(|| TargetError::MissingScheme(uri.to_string()))?;

        Self::from_address(scheme, rest.trim_start_matches('/'))
    }

    /// The resolver scheme this target was dialed with.
    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// The namespace (environment) the service runs in.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The service name.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// The port every member is reached on.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The literal `:port` suffix appended to member IPs.
    #[must_use]
    pub fn port_suffix(&self) -> String {
        format!(":{}", self.port)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}{}", self.namespace, self.service, self.port_suffix())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_address_splits_service_and_environment() {
        let target = Target::from_address("k8s", "orders.production:8080").unwrap();

        assert_eq!(target.scheme(), "k8s");
        assert_eq!(target.service(), "orders");
        assert_eq!(target.namespace(), "production");
        assert_eq!(target.port(), 8080);
        assert_eq!(target.port_suffix(), ":8080");
    }

    #[test]
    fn from_address_ignores_trailing_segments() {
        let target = Target::from_address("k8s", "orders.daily.svc.cluster.local:9090").unwrap();

        assert_eq!(target.service(), "orders");
        assert_eq!(target.namespace(), "daily");
        assert_eq!(target.port(), 9090);
    }

    #[test]
    fn from_address_requires_port() {
        assert_eq!(
            Target::from_address("k8s", "orders.production"),
            Err(TargetError::MissingPort("orders.production".to_string()))
        );
    }

    #[test]
    fn from_address_rejects_bad_port() {
        assert_eq!(
            Target::from_address("k8s", "orders.production:http"),
            Err(TargetError::InvalidPort("orders.production:http".to_string()))
        );

        assert!(matches!(
            Target::from_address("k8s", "orders.production:70000"),
            Err(TargetError::InvalidPort(_))
        ));
    }

    #[test]
    fn from_address_requires_environment() {
        assert_eq!(
            Target::from_address("k8s", "localhost:8080"),
            Err(TargetError::MissingEnvironment("localhost:8080".to_string()))
        );
    }

    #[test]
    fn from_uri_strips_scheme_and_slashes() {
        let target = Target::from_uri("k8s:///orders.production:8080").unwrap();

        assert_eq!(target, Target::new("k8s", "production", "orders", 8080));
    }

    #[test]
    fn from_uri_requires_scheme() {
        assert!(matches!(
            Target::from_uri("orders.production:8080"),
            Err(TargetError::MissingScheme(_))
        ));

        assert!(matches!(
            Target::from_uri(":///orders.production:8080"),
            Err(TargetError::MissingScheme(_))
        ));
    }

    #[test]
    fn display_names_namespace_service_and_port() {
        let target = Target::new("k8s", "production", "orders", 8080);
        assert_eq!(target.to_string(), "production/orders:8080");
    }
}
