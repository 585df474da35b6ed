//! Cross-resource dependency tracking. A change on a leaf object (backend,
//! security policy, credential secret) must re-converge every route that
//! transitively references it; these lookups are the indices the leaf
//! reconcilers fan out through.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client, api::ListParams};

use crate::{
    Error, Result,
    api::{AIGatewayRoute, AIServiceBackend, BackendSecurityPolicy},
    rotators,
};

/// One backend reference of one rule, resolved to its objects.
#[derive(Debug, Clone)]
pub struct ResolvedBackend {
    pub backend: AIServiceBackend,
    pub policy: Option<BackendSecurityPolicy>,
}

/// Fetches every backend referenced by the route's rules, and each backend's
/// security policy, all from the route's namespace. A dangling reference
/// fails the whole resolution; callers must not emit partial state.
pub async fn resolve_route_backends(
    client: &Client,
    route: &AIGatewayRoute,
) -> Result<Vec<Vec<ResolvedBackend>>> {
    let namespace = route.metadata.namespace.as_deref().unwrap();
    let backends = Api::<AIServiceBackend>::namespaced(client.clone(), namespace);
    let policies = Api::<BackendSecurityPolicy>::namespaced(client.clone(), namespace);

    let mut resolved = Vec::with_capacity(route.spec.rules.len());
    for rule in &route.spec.rules {
        let mut rule_backends = Vec::with_capacity(rule.backend_refs.len());
        for backend_ref in &rule.backend_refs {
            let backend = backends.get_opt(&backend_ref.name).await?.ok_or_else(|| {
                Error::BackendNotFound {
                    namespace: namespace.to_string(),
                    name: backend_ref.name.clone(),
                }
            })?;

            let policy = match &backend.spec.backend_security_policy_ref {
                Some(policy_ref) => Some(policies.get_opt(&policy_ref.name).await?.ok_or_else(
                    || Error::SecurityPolicyNotFound {
                        namespace: namespace.to_string(),
                        name: policy_ref.name.clone(),
                        backend: backend_ref.name.clone(),
                    },
                )?),
                None => None,
            };

            rule_backends.push(ResolvedBackend { backend, policy });
        }
        resolved.push(rule_backends);
    }
    Ok(resolved)
}

/// Routes whose rules reference the named backend. References are always
/// same-namespace, so callers list routes from the backend's namespace.
pub fn routes_referencing_backend<'a>(
    routes: &'a [AIGatewayRoute],
    backend_name: &str,
) -> Vec<&'a AIGatewayRoute> {
    routes
        .iter()
        .filter(|route| {
            route
                .spec
                .rules
                .iter()
                .flat_map(|rule| &rule.backend_refs)
                .any(|backend_ref| backend_ref.name == backend_name)
        })
        .collect()
}

/// Backends referencing the named security policy.
pub fn backends_referencing_policy<'a>(
    backends: &'a [AIServiceBackend],
    policy_name: &str,
) -> Vec<&'a AIServiceBackend> {
    backends
        .iter()
        .filter(|backend| {
            backend
                .spec
                .backend_security_policy_ref
                .as_ref()
                .is_some_and(|policy_ref| policy_ref.name == policy_name)
        })
        .collect()
}

/// Security policies that read credential material from the given secret:
/// an API-key reference, a static AWS credentials-file reference, or the
/// policy's own rotator-managed secret.
pub fn policies_referencing_secret<'a>(
    policies: &'a [BackendSecurityPolicy],
    secret_name: &str,
    secret_namespace: &str,
) -> Vec<&'a BackendSecurityPolicy> {
    policies
        .iter()
        .filter(|policy| {
            let policy_namespace = policy.metadata.namespace.as_deref().unwrap_or_default();
            let ref_matches = |secret_ref: &crate::api::SecretObjectReference| {
                secret_ref.name == secret_name
                    && secret_ref.namespace.as_deref().unwrap_or(policy_namespace)
                        == secret_namespace
            };

            if let Some(api_key) = &policy.spec.api_key {
                if ref_matches(&api_key.secret_ref) {
                    return true;
                }
            }
            if let Some(aws) = &policy.spec.aws_credentials {
                if let Some(file) = &aws.credentials_file {
                    if ref_matches(&file.secret_ref) {
                        return true;
                    }
                }
                if aws.oidc_exchange_token.is_some() {
                    let policy_name = policy.metadata.name.as_deref().unwrap_or_default();
                    if rotators::bsp_secret_name(policy_name) == secret_name
                        && policy_namespace == secret_namespace
                    {
                        return true;
                    }
                }
            }
            false
        })
        .collect()
}

pub async fn dependent_routes_for_backend(
    client: &Client,
    backend: &AIServiceBackend,
) -> Result<Vec<AIGatewayRoute>> {
    let namespace = backend.metadata.namespace.as_deref().unwrap();
    let backend_name = backend.metadata.name.as_deref().unwrap();
    let routes = Api::<AIGatewayRoute>::namespaced(client.clone(), namespace)
        .list(&ListParams::default())
        .await?;
    Ok(routes_referencing_backend(&routes.items, backend_name)
        .into_iter()
        .cloned()
        .collect())
}

pub async fn dependent_routes_for_policy(
    client: &Client,
    policy: &BackendSecurityPolicy,
) -> Result<Vec<AIGatewayRoute>> {
    let namespace = policy.metadata.namespace.as_deref().unwrap();
    let policy_name = policy.metadata.name.as_deref().unwrap();

    let backends = Api::<AIServiceBackend>::namespaced(client.clone(), namespace)
        .list(&ListParams::default())
        .await?;
    let routes = Api::<AIGatewayRoute>::namespaced(client.clone(), namespace)
        .list(&ListParams::default())
        .await?;

    let mut dependents = BTreeMap::new();
    for backend in backends_referencing_policy(&backends.items, policy_name) {
        let backend_name = backend.metadata.name.as_deref().unwrap();
        for route in routes_referencing_backend(&routes.items, backend_name) {
            let route_name = route.metadata.name.as_deref().unwrap();
            dependents.insert(route_name.to_string(), route.clone());
        }
    }
    Ok(dependents.into_values().collect())
}

pub async fn dependent_routes_for_secret(
    client: &Client,
    secret: &Secret,
) -> Result<Vec<AIGatewayRoute>> {
    let secret_namespace = secret.metadata.namespace.as_deref().unwrap();
    let secret_name = secret.metadata.name.as_deref().unwrap();

    let policies = Api::<BackendSecurityPolicy>::all(client.clone())
        .list(&ListParams::default())
        .await?;

    let mut dependents = BTreeMap::new();
    for policy in policies_referencing_secret(&policies.items, secret_name, secret_namespace) {
        for route in dependent_routes_for_policy(client, policy).await? {
            let key = (
                route.metadata.namespace.clone().unwrap_or_default(),
                route.metadata.name.clone().unwrap_or_default(),
            );
            dependents.insert(key, route);
        }
    }
    Ok(dependents.into_values().collect())
}
