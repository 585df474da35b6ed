use filterconfig::{
    ApiKeyAuth, AwsAuth, BackendAuth, Config, HeaderMatch, LlmRequestCostType, RouteRule,
    RuleBackend,
};
use uuid::Uuid;

use crate::{
    Error, Result,
    api::{AIGatewayRoute, BackendSecurityPolicy},
    cel,
    deps::ResolvedBackend,
};

/// Translates one route plus its resolved backends into the document the
/// processor consumes. Pure apart from the freshly minted UUID; two builds
/// from the same inputs differ only in that field.
pub fn build_processor_config(
    route: &AIGatewayRoute,
    resolved: &[Vec<ResolvedBackend>],
) -> Result<Config> {
    let namespace = route.metadata.namespace.as_deref().unwrap();

    let mut rules = Vec::with_capacity(route.spec.rules.len());
    for (rule_index, (rule, rule_backends)) in route.spec.rules.iter().zip(resolved).enumerate() {
        // One header condition per match entry; only the first header matcher
        // of each entry participates at this layer.
        let headers = rule
            .matches
            .iter()
            .filter_map(|route_match| route_match.headers.first())
            .map(|header| HeaderMatch {
                name: header.name.clone(),
                value: header.value.clone(),
            })
            .collect();

        let mut backends = Vec::with_capacity(rule.backend_refs.len());
        for (backend_index, (backend_ref, resolved_backend)) in
            rule.backend_refs.iter().zip(rule_backends).enumerate()
        {
            let auth = resolved_backend
                .policy
                .as_ref()
                .map(|policy| backend_auth(rule_index, backend_index, policy))
                .transpose()?;

            backends.push(RuleBackend {
                name: format!("{}.{namespace}", backend_ref.name),
                weight: backend_ref.weight.unwrap_or(1),
                schema: resolved_backend.backend.spec.schema.clone(),
                auth,
            });
        }

        rules.push(RouteRule { headers, backends });
    }

    let llm_request_costs = route.spec.llm_request_costs.clone().unwrap_or_default();
    for cost in &llm_request_costs {
        if cost.cost_type == LlmRequestCostType::Cel {
            let expression = cost.cel_expression.as_deref().ok_or_else(|| Error::Cel {
                expression: String::new(),
                message: format!("cost {:?} has type CEL but no expression", cost.metadata_key),
            })?;
            cel::validate_cost_expression(expression)?;
        }
    }

    Ok(Config {
        uuid: Uuid::new_v4().to_string(),
        schema: route.spec.schema.clone(),
        model_name_header_key: filterconfig::MODEL_NAME_HEADER_KEY.to_string(),
        selected_backend_header_key: filterconfig::SELECTED_BACKEND_HEADER_KEY.to_string(),
        metadata_namespace: filterconfig::METADATA_NAMESPACE.to_string(),
        rules,
        llm_request_costs,
    })
}

/// File-path-addressed auth material for one backend reference, derived from
/// its security policy's populated branch.
fn backend_auth(
    rule_index: usize,
    backend_index: usize,
    policy: &BackendSecurityPolicy,
) -> Result<BackendAuth> {
    let policy_name = policy.metadata.name.as_deref().unwrap();
    let volume = filterconfig::backend_security_volume_name(rule_index, backend_index, policy_name);
    let mount = filterconfig::backend_security_mount_path(&volume);

    match (&policy.spec.api_key, &policy.spec.aws_credentials) {
        (Some(_), None) => Ok(BackendAuth {
            api_key: Some(ApiKeyAuth {
                filename: format!("{mount}/{}", filterconfig::API_KEY_FILE),
            }),
            aws_auth: None,
        }),
        (None, Some(aws))
            if aws.credentials_file.is_some() || aws.oidc_exchange_token.is_some() =>
        {
            Ok(BackendAuth {
                api_key: None,
                aws_auth: Some(AwsAuth {
                    credential_file_name: format!(
                        "{mount}/{}",
                        filterconfig::AWS_CREDENTIALS_FILE
                    ),
                    region: aws.region.clone(),
                }),
            })
        }
        _ => Err(Error::MalformedSecurityPolicy {
            name: policy_name.to_string(),
        }),
    }
}
