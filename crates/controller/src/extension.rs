//! Host-gateway extension kinds this controller emits but does not own the
//! schema of. Only the fields we write are modeled.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::api::GatewayTargetReference;

/// Attaches an external processor to the target gateways.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "gateway.envoyproxy.io",
    version = "v1alpha1",
    kind = "EnvoyExtensionPolicy",
    plural = "envoyextensionpolicies",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct EnvoyExtensionPolicySpec {
    pub target_refs: Vec<GatewayTargetReference>,
    pub ext_proc: Vec<ExtProc>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExtProc {
    pub backend_refs: Vec<ExtProcBackendRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_mode: Option<ExtProcProcessingMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ExtProcMetadata>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExtProcBackendRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExtProcProcessingMode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<ProcessingModeOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ProcessingModeOptions>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingModeOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<BodyProcessingMode>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum BodyProcessingMode {
    Buffered,
    Streamed,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExtProcMetadata {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub writable_namespaces: Vec<String>,
}

/// Extension filter referenced from generated HTTPRoute rules; rewrites the
/// upstream hostname to the selected backend's.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "gateway.envoyproxy.io",
    version = "v1alpha1",
    kind = "HTTPRouteFilter",
    plural = "httproutefilters",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct HTTPRouteFilterSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_rewrite: Option<HttpUrlRewriteFilter>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HttpUrlRewriteFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<HttpHostnameModifier>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HttpHostnameModifier {
    #[serde(rename = "type")]
    pub modifier_type: HostnameModifierType,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum HostnameModifierType {
    Header,
    Backend,
}
