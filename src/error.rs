//! Error types for the resolver.

use thiserror::Error;

/// Failure to obtain an authenticated handle to the membership API.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Neither in-cluster nor kubeconfig credentials could be loaded.
    #[error("no usable Kubernetes credentials: {0}")]
    Credentials(String),

    /// Credentials were found but the client could not be constructed.
    #[error("failed to create Kubernetes client")]
    Client(#[source] kube::Error),
}

/// Failure of a list or watch call against a connected membership API.
#[derive(Debug, Error)]
pub enum QueryError {
    /// The request failed in transport or was rejected by the API server.
    #[error("membership API request failed")]
    Api(#[from] kube::Error),

    /// The API server reported an error inside an open watch stream.
    #[error("membership API reported an error: {0}")]
    Status(String),

    /// The watch resumed from a version the server no longer keeps.
    #[error("resource version expired: {0}")]
    Expired(String),

    /// A single change event could not be decoded.
    #[error("malformed membership event: {0}")]
    Decode(String),
}

/// A dial address that cannot be interpreted as a resolver target.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TargetError {
    /// The address has no `scheme://` prefix.
    #[error("`{0}` has no scheme")]
    MissingScheme(String),

    /// The address has no `:port` suffix.
    #[error("`{0}` has no port")]
    MissingPort(String),

    /// The text after `:` is not a valid port number.
    #[error("`{0}` has an invalid port")]
    InvalidPort(String),

    /// The host part is not of the form `service.environment`.
    #[error("`{0}` is not of the form `service.environment:port`")]
    MissingEnvironment(String),
}

/// Failure to build a resolver for a target.
#[derive(Debug, Error)]
pub enum BuildError {
    /// No builder is registered for the target's scheme.
    #[error("no resolver registered for scheme `{0}`")]
    UnknownScheme(String),

    /// The target could not be parsed.
    #[error("invalid resolver target")]
    Target(#[from] TargetError),

    /// The membership API could not be reached.
    #[error("cannot connect to membership API")]
    Connect(#[from] ConnectError),
}

/// Failure to register a resolver builder.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// A builder is already registered under this scheme.
    #[error("scheme `{0}` is already registered")]
    AlreadyRegistered(String),
}

/// Failure to produce a client channel for an address.
#[derive(Debug, Error)]
pub enum DialError {
    /// The address is not a valid endpoint URI.
    #[error("invalid endpoint address")]
    Endpoint(#[from] tonic::transport::Error),

    /// Dynamic resolution was required but the resolver could not be built.
    #[error("failed to build resolver")]
    Resolver(#[from] BuildError),
}

/// The connection-state sink no longer accepts updates.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("connection-state sink closed")]
pub struct SinkClosed;
