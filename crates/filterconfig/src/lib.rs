//! Configuration document consumed by the external processor.
//!
//! The controller serializes one [`Config`] per AI gateway route into a
//! ConfigMap; the processor deserializes it from its mounted volume. Both
//! sides agree on the field layout and the well-known constants below, so
//! this crate is the only place either of them is defined.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Header carrying the model name extracted from the request body.
pub const MODEL_NAME_HEADER_KEY: &str = "x-ai-eg-model";

/// Header the processor populates with the chosen backend; the generated
/// HTTPRoute rules match on it.
pub const SELECTED_BACKEND_HEADER_KEY: &str = "x-ai-eg-selected-backend";

/// Dynamic-metadata namespace the processor writes token costs into.
pub const METADATA_NAMESPACE: &str = "io.envoy.ai_gateway";

/// Key under which the document is stored in the generated ConfigMap.
pub const CONFIG_MAP_KEY: &str = "extproc-config.yaml";

/// Directory the ConfigMap is projected into inside the processor pod.
pub const CONFIG_MOUNT_PATH: &str = "/etc/ai-gateway/extproc";

/// Full path of the document inside the processor pod.
pub const CONFIG_FILE_PATH: &str = "/etc/ai-gateway/extproc/extproc-config.yaml";

/// Root directory for projected credential secrets.
pub const BACKEND_SECURITY_MOUNT_ROOT: &str = "/etc/backend_security_policy";

/// File name of an API key inside its credential volume.
pub const API_KEY_FILE: &str = "apiKey";

/// File name of an AWS credentials file inside its credential volume.
pub const AWS_CREDENTIALS_FILE: &str = "credentials";

/// Volume name for the credential secret of backend reference `backend_index`
/// of rule `rule_index`. The deployment materializer and the document builder
/// must derive identical names or the processor reads from the wrong path.
pub fn backend_security_volume_name(
    rule_index: usize,
    backend_index: usize,
    policy_name: &str,
) -> String {
    format!("rule{rule_index}-backref{backend_index}-{policy_name}")
}

/// Mount path of a credential volume inside the processor pod.
pub fn backend_security_mount_path(volume_name: &str) -> String {
    format!("{BACKEND_SECURITY_MOUNT_ROOT}/{volume_name}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Regenerated on every emission; threaded into the processor pods'
    /// annotations to force a prompt volume refresh.
    pub uuid: String,
    /// Input API schema of the route.
    pub schema: VersionedApiSchema,
    pub model_name_header_key: String,
    pub selected_backend_header_key: String,
    pub metadata_namespace: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<RouteRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub llm_request_costs: Vec<LlmRequestCost>,
}

impl Config {
    /// Document written into the ConfigMap before the first full reconcile so
    /// the processor deployment can start.
    pub fn bootstrap() -> Self {
        Self {
            uuid: String::new(),
            schema: VersionedApiSchema {
                name: ApiSchemaName::OpenAI,
                version: None,
            },
            model_name_header_key: MODEL_NAME_HEADER_KEY.to_string(),
            selected_backend_header_key: SELECTED_BACKEND_HEADER_KEY.to_string(),
            metadata_namespace: METADATA_NAMESPACE.to_string(),
            rules: vec![],
            llm_request_costs: vec![],
        }
    }
}

/// An API schema name plus an optional provider-specific version string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct VersionedApiSchema {
    pub name: ApiSchemaName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ApiSchemaName {
    OpenAI,
    AWSBedrock,
}

impl std::fmt::Display for ApiSchemaName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiSchemaName::OpenAI => f.write_str("OpenAI"),
            ApiSchemaName::AWSBedrock => f.write_str("AWSBedrock"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RouteRule {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<HeaderMatch>,
    pub backends: Vec<RuleBackend>,
}

/// Exact-match header condition evaluated by the processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct HeaderMatch {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RuleBackend {
    /// `{backend-name}.{route-namespace}`, the value the processor writes
    /// into the selected-backend header.
    pub name: String,
    #[serde(default = "default_weight")]
    pub weight: i32,
    /// Output API schema of the backend.
    pub schema: VersionedApiSchema,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<BackendAuth>,
}

fn default_weight() -> i32 {
    1
}

/// Upstream authentication material, addressed by file path inside the
/// processor pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackendAuth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<ApiKeyAuth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws_auth: Option<AwsAuth>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyAuth {
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AwsAuth {
    pub credential_file_name: String,
    pub region: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LlmRequestCost {
    /// Key the cost is published under in the metadata namespace.
    pub metadata_key: String,
    #[serde(rename = "type")]
    pub cost_type: LlmRequestCostType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cel_expression: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum LlmRequestCostType {
    InputToken,
    OutputToken,
    TotalToken,
    #[serde(rename = "CEL")]
    Cel,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        Config {
            uuid: "3a2b7a6e-0000-4000-8000-000000000000".to_string(),
            schema: VersionedApiSchema {
                name: ApiSchemaName::OpenAI,
                version: Some("v1".to_string()),
            },
            model_name_header_key: MODEL_NAME_HEADER_KEY.to_string(),
            selected_backend_header_key: SELECTED_BACKEND_HEADER_KEY.to_string(),
            metadata_namespace: METADATA_NAMESPACE.to_string(),
            rules: vec![RouteRule {
                headers: vec![HeaderMatch {
                    name: MODEL_NAME_HEADER_KEY.to_string(),
                    value: "gpt-4o".to_string(),
                }],
                backends: vec![
                    RuleBackend {
                        name: "apple.ns1".to_string(),
                        weight: 1,
                        schema: VersionedApiSchema {
                            name: ApiSchemaName::OpenAI,
                            version: None,
                        },
                        auth: Some(BackendAuth {
                            api_key: Some(ApiKeyAuth {
                                filename: "/etc/backend_security_policy/rule0-backref0-key/apiKey"
                                    .to_string(),
                            }),
                            aws_auth: None,
                        }),
                    },
                    RuleBackend {
                        name: "orange.ns1".to_string(),
                        weight: 2,
                        schema: VersionedApiSchema {
                            name: ApiSchemaName::AWSBedrock,
                            version: None,
                        },
                        auth: Some(BackendAuth {
                            api_key: None,
                            aws_auth: Some(AwsAuth {
                                credential_file_name:
                                    "/etc/backend_security_policy/rule0-backref1-aws/credentials"
                                        .to_string(),
                                region: "us-east-1".to_string(),
                            }),
                        }),
                    },
                ],
            }],
            llm_request_costs: vec![LlmRequestCost {
                metadata_key: "cel".to_string(),
                cost_type: LlmRequestCostType::Cel,
                cel_expression: Some("input_tokens * output_tokens".to_string()),
            }],
        }
    }

    #[test]
    fn round_trip_is_byte_identical() {
        let doc = sample();
        let yaml = serde_yaml_ng::to_string(&doc).unwrap();
        let parsed: Config = serde_yaml_ng::from_str(&yaml).unwrap();
        assert_eq!(parsed, doc);
        assert_eq!(serde_yaml_ng::to_string(&parsed).unwrap(), yaml);
    }

    #[test]
    fn serialized_field_names_match_the_wire_contract() {
        let yaml = serde_yaml_ng::to_string(&sample()).unwrap();
        for field in [
            "uuid:",
            "modelNameHeaderKey: x-ai-eg-model",
            "selectedBackendHeaderKey: x-ai-eg-selected-backend",
            "metadataNamespace: io.envoy.ai_gateway",
            "llmRequestCosts:",
            "metadataKey: cel",
            "type: CEL",
            "celExpression: input_tokens * output_tokens",
            "apiKey:",
            "awsAuth:",
            "credentialFileName:",
            "name: apple.ns1",
        ] {
            assert!(yaml.contains(field), "missing {field:?} in:\n{yaml}");
        }
    }

    #[test]
    fn weight_defaults_to_one_when_omitted() {
        let backend: RuleBackend = serde_yaml_ng::from_str(
            "name: apple.ns1\nschema:\n  name: OpenAI\n",
        )
        .unwrap();
        assert_eq!(backend.weight, 1);
    }

    #[test]
    fn bootstrap_document_has_no_rules() {
        let doc = Config::bootstrap();
        assert!(doc.rules.is_empty());
        assert!(doc.uuid.is_empty());
        let yaml = serde_yaml_ng::to_string(&doc).unwrap();
        assert!(yaml.contains("name: OpenAI"));
    }

    #[test]
    fn volume_names_are_addressable_by_rule_and_backend_index() {
        assert_eq!(
            backend_security_volume_name(0, 1, "aws-oidc"),
            "rule0-backref1-aws-oidc"
        );
        assert_eq!(
            backend_security_mount_path("rule0-backref1-aws-oidc"),
            "/etc/backend_security_policy/rule0-backref1-aws-oidc"
        );
    }
}
