/// K8s API objects (the user-facing custom resources)
pub mod api;

/// CEL cost-expression checks
pub mod cel;

/// Dependency lookups between routes, backends, policies and secrets
pub mod deps;

/// Processor-configuration document builder
pub mod document;

/// Host-gateway extension object kinds consumed as opaque dependencies
pub mod extension;

/// External-processor Deployment and Service materializer
pub mod extproc;

/// Generated HTTPRoute materializer
pub mod httproute;

/// OIDC token provider and process-wide token cache
pub mod oidc;

/// K8s reconciliation logic
pub mod reconcilers;

/// Credential rotation for backend security policies
pub mod rotators;

/// Admission-grade validation of the custom resources
pub mod validation;

use thiserror::Error;

/// Label value identifying every object this controller manages.
pub const MANAGED_BY_LABEL_VALUE: &str = "envoy-ai-gateway";

/// Per-namespace singleton filter rewriting the upstream hostname to the
/// selected backend's.
pub const HOST_REWRITE_FILTER_NAME: &str = "ai-eg-host-rewrite";

/// Pod annotation carrying the UUID of the most recently emitted document.
pub const EXTPROC_UUID_ANNOTATION: &str = "aigateway.envoyproxy.io/extproc-config-uuid";

/// gRPC port the processor service listens on.
pub const EXTPROC_GRPC_PORT: i32 = 1063;

/// Optional HTTP proxy for STS traffic.
pub const STS_PROXY_ENV: &str = "AI_GATEWAY_STS_PROXY_URL";

/// Name shared by the generated ConfigMap, Deployment, Service and extension
/// policy of a route.
pub fn extproc_name(route_name: &str) -> String {
    format!("ai-eg-route-extproc-{route_name}")
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kube error: {0}")]
    Kube(#[from] kube::Error),
    #[error("Missing field in object reference")]
    MissingField,
    #[error("AIServiceBackend {namespace}/{name} referenced by a rule does not exist")]
    BackendNotFound { namespace: String, name: String },
    #[error(
        "BackendSecurityPolicy {namespace}/{name} referenced by backend {backend} does not exist"
    )]
    SecurityPolicyNotFound {
        namespace: String,
        name: String,
        backend: String,
    },
    #[error("BackendSecurityPolicy {name}: populated branch does not match its type")]
    MalformedSecurityPolicy { name: String },
    #[error("invalid {kind}: {report}")]
    Validation { kind: &'static str, report: String },
    #[error("CEL expression {expression:?} rejected: {message}")]
    Cel { expression: String, message: String },
    #[error("OIDC error: {0}")]
    Oidc(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("STS error: {0}")]
    Sts(String),
    #[error("secret {namespace}/{name} is missing key {key:?}")]
    SecretKey {
        namespace: String,
        name: String,
        key: &'static str,
    },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_yaml_ng::Error),
    #[error("invalid expiration annotation: {0}")]
    ExpirationFormat(#[from] chrono::ParseError),
    #[error("one or more dependent route syncs failed: {0:?}")]
    Fanout(Vec<Error>),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
