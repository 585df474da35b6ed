use filterconfig::{ApiSchemaName, LlmRequestCost, VersionedApiSchema};
use garde::Validate;
use k8s_openapi::api::core::v1::ResourceRequirements;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::cel;

pub const API_GROUP: &str = "aigateway.envoyproxy.io";

/// Routes LLM traffic on a host gateway: picks backends per rule, attaches
/// the external processor and captures request costs.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Validate, JsonSchema)]
#[kube(
    group = "aigateway.envoyproxy.io",
    version = "v1alpha1",
    kind = "AIGatewayRoute",
    plural = "aigatewayroutes",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct AIGatewayRouteSpec {
    /// Gateways the generated HTTPRoute attaches to.
    #[garde(length(min = 1, max = 128), dive)]
    pub target_refs: Vec<GatewayTargetReference>,
    /// Input API schema clients speak.
    #[garde(custom(is_supported_input_schema))]
    pub schema: VersionedApiSchema,
    #[garde(length(min = 1, max = 128), dive)]
    pub rules: Vec<AIGatewayRouteRule>,
    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_config: Option<AIGatewayFilterConfig>,
    #[garde(length(max = 36), custom(costs_are_well_formed))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_request_costs: Option<Vec<LlmRequestCost>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GatewayTargetReference {
    #[garde(custom(is_gateway_group))]
    #[serde(default = "default_gateway_group")]
    pub group: String,
    #[garde(custom(is_gateway_kind))]
    #[serde(default = "default_gateway_kind")]
    pub kind: String,
    #[garde(length(min = 1))]
    pub name: String,
}

fn default_gateway_group() -> String {
    "gateway.networking.k8s.io".to_string()
}

fn default_gateway_kind() -> String {
    "Gateway".to_string()
}

#[derive(Deserialize, Serialize, Clone, Debug, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AIGatewayRouteRule {
    #[garde(length(min = 1, max = 128), dive)]
    pub backend_refs: Vec<AIGatewayRouteRuleBackendRef>,
    #[garde(length(max = 16), dive)]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matches: Vec<AIGatewayRouteRuleMatch>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AIGatewayRouteRuleBackendRef {
    /// AIServiceBackend in the route's namespace.
    #[garde(length(min = 1))]
    pub name: String,
    #[garde(range(min = 0))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<i32>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AIGatewayRouteRuleMatch {
    #[garde(dive)]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<HttpHeaderMatch>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HttpHeaderMatch {
    #[garde(custom(header_match_is_exact))]
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub match_type: Option<HeaderMatchType>,
    #[garde(length(min = 1))]
    pub name: String,
    #[garde(skip)]
    pub value: String,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum HeaderMatchType {
    Exact,
    RegularExpression,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AIGatewayFilterConfig {
    #[serde(rename = "type", default)]
    pub filter_type: AIGatewayFilterConfigType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_process: Option<AIGatewayFilterConfigExternalProcess>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum AIGatewayFilterConfigType {
    #[default]
    ExternalProcess,
}

/// Runtime knobs for the processor Deployment. Unset fields leave whatever
/// the live Deployment already has.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AIGatewayFilterConfigExternalProcess {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

/// An upstream LLM service reachable through the host gateway.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Validate, JsonSchema)]
#[kube(
    group = "aigateway.envoyproxy.io",
    version = "v1alpha1",
    kind = "AIServiceBackend",
    plural = "aiservicebackends",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct AIServiceBackendSpec {
    /// Output API schema the upstream speaks. The schema enum is the
    /// whitelist; anything that deserializes is accepted.
    #[garde(skip)]
    pub schema: VersionedApiSchema,
    /// Host-gateway backend traffic is forwarded to.
    #[garde(dive)]
    pub backend_ref: HostGatewayBackendRef,
    #[garde(dive)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_security_policy_ref: Option<LocalObjectReference>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HostGatewayBackendRef {
    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[garde(length(min = 1))]
    pub name: String,
    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, Validate, JsonSchema)]
pub struct LocalObjectReference {
    #[garde(length(min = 1))]
    pub name: String,
}

/// Upstream authentication for one or more AIServiceBackends. Exactly one
/// auth branch is populated, discriminated by `type`.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Validate, JsonSchema)]
#[kube(
    group = "aigateway.envoyproxy.io",
    version = "v1alpha1",
    kind = "BackendSecurityPolicy",
    plural = "backendsecuritypolicies",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct BackendSecurityPolicySpec {
    #[garde(skip)]
    #[serde(rename = "type")]
    pub policy_type: BackendSecurityPolicyType,
    #[garde(dive)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<BackendSecurityPolicyApiKey>,
    #[garde(dive)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws_credentials: Option<BackendSecurityPolicyAwsCredentials>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum BackendSecurityPolicyType {
    APIKey,
    AWSCredentials,
}

#[derive(Deserialize, Serialize, Clone, Debug, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackendSecurityPolicyApiKey {
    /// Secret with the key under `apiKey`.
    #[garde(dive)]
    pub secret_ref: SecretObjectReference,
}

#[derive(Deserialize, Serialize, Clone, Debug, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackendSecurityPolicyAwsCredentials {
    #[garde(length(min = 1))]
    pub region: String,
    #[garde(dive)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_file: Option<AwsCredentialsFileRef>,
    #[garde(dive)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oidc_exchange_token: Option<AwsOidcExchangeToken>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AwsCredentialsFileRef {
    /// Secret with an AWS credentials file under `credentials`.
    #[garde(dive)]
    pub secret_ref: SecretObjectReference,
    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AwsOidcExchangeToken {
    #[garde(dive)]
    pub oidc: Oidc,
    #[garde(length(min = 1))]
    pub aws_role_arn: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Oidc {
    #[garde(dive)]
    pub provider: OidcProvider,
    #[garde(length(min = 1))]
    #[serde(rename = "clientID")]
    pub client_id: String,
    /// Secret with the client secret under `client-secret`. The namespace
    /// must be explicit.
    #[garde(dive)]
    pub client_secret: SecretObjectReference,
    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OidcProvider {
    #[garde(length(min = 1))]
    pub issuer: String,
    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, Validate, JsonSchema)]
pub struct SecretObjectReference {
    #[garde(length(min = 1))]
    pub name: String,
    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

fn is_supported_input_schema(schema: &VersionedApiSchema, _: &()) -> garde::Result {
    if schema.name != ApiSchemaName::OpenAI {
        return Err(garde::Error::new(format!(
            "input schema must be OpenAI, got {}",
            schema.name
        )));
    }
    Ok(())
}

fn is_gateway_group(group: &String, _: &()) -> garde::Result {
    if group != "gateway.networking.k8s.io" {
        return Err(garde::Error::new(format!(
            "target reference group must be gateway.networking.k8s.io, got {group:?}"
        )));
    }
    Ok(())
}

fn is_gateway_kind(kind: &String, _: &()) -> garde::Result {
    if kind != "Gateway" {
        return Err(garde::Error::new(format!(
            "target reference kind must be Gateway, got {kind:?}"
        )));
    }
    Ok(())
}

fn header_match_is_exact(match_type: &HeaderMatchType, _: &()) -> garde::Result {
    if *match_type == HeaderMatchType::RegularExpression {
        return Err(garde::Error::new(
            "RegularExpression header matches are not supported",
        ));
    }
    Ok(())
}

fn costs_are_well_formed(costs: &Vec<LlmRequestCost>, _: &()) -> garde::Result {
    for cost in costs {
        match cost.cost_type {
            filterconfig::LlmRequestCostType::Cel => {
                let Some(expression) = cost.cel_expression.as_deref() else {
                    return Err(garde::Error::new(format!(
                        "cost {:?} has type CEL but no celExpression",
                        cost.metadata_key
                    )));
                };
                cel::validate_cost_expression(expression)
                    .map_err(|e| garde::Error::new(e.to_string()))?;
            }
            _ => {
                if cost.cel_expression.is_some() {
                    return Err(garde::Error::new(format!(
                        "cost {:?} carries a celExpression but is not of type CEL",
                        cost.metadata_key
                    )));
                }
            }
        }
    }
    Ok(())
}
