use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kcr_gateway_networking_k8s_io::v1::httproutes::{
    HTTPRoute, HTTPRouteParentRefs, HTTPRouteRules, HTTPRouteRulesBackendRefs,
    HTTPRouteRulesFilters, HTTPRouteRulesFiltersExtensionRef, HTTPRouteRulesFiltersType,
    HTTPRouteRulesMatches, HTTPRouteRulesMatchesHeaders, HTTPRouteRulesMatchesHeadersType,
    HTTPRouteRulesMatchesPath, HTTPRouteRulesMatchesPathType, HTTPRouteSpec,
};
use kube::{
    Api, Client,
    api::{ObjectMeta, PostParams},
};

use crate::{
    HOST_REWRITE_FILTER_NAME, Result,
    api::AIGatewayRoute,
    deps::ResolvedBackend,
    extension::{
        HTTPRouteFilter, HTTPRouteFilterSpec, HostnameModifierType, HttpHostnameModifier,
        HttpUrlRewriteFilter,
    },
};

/// Projects a route's backend set into the generated HTTPRoute: one rule per
/// distinct backend in first-encounter order, keyed by the selected-backend
/// header, plus a trailing `/` default rule to the first backend. Every rule
/// carries the namespace-standard hostname-rewrite filter; the data plane
/// fills in the header this route matches on.
pub fn build_http_route(
    route: &AIGatewayRoute,
    resolved: &[Vec<ResolvedBackend>],
    owner: OwnerReference,
) -> HTTPRoute {
    let namespace = route.metadata.namespace.as_deref().unwrap();
    let route_name = route.metadata.name.as_deref().unwrap();

    let mut deduped: Vec<(&str, &ResolvedBackend)> = Vec::new();
    for (rule, rule_backends) in route.spec.rules.iter().zip(resolved) {
        for (backend_ref, resolved_backend) in rule.backend_refs.iter().zip(rule_backends) {
            if !deduped.iter().any(|(name, _)| *name == backend_ref.name) {
                deduped.push((&backend_ref.name, resolved_backend));
            }
        }
    }

    let mut rules: Vec<HTTPRouteRules> = deduped
        .iter()
        .map(|(backend_name, resolved_backend)| HTTPRouteRules {
            matches: Some(vec![HTTPRouteRulesMatches {
                headers: Some(vec![HTTPRouteRulesMatchesHeaders {
                    name: filterconfig::SELECTED_BACKEND_HEADER_KEY.to_string(),
                    r#type: Some(HTTPRouteRulesMatchesHeadersType::Exact),
                    value: format!("{backend_name}.{namespace}"),
                }]),
                ..Default::default()
            }]),
            filters: Some(vec![host_rewrite_filter_ref()]),
            backend_refs: Some(vec![host_gateway_backend_ref(resolved_backend)]),
            ..Default::default()
        })
        .collect();

    // Catch-all so traffic the processor never labeled still has a home.
    if let Some((_, first)) = deduped.first() {
        rules.push(HTTPRouteRules {
            matches: Some(vec![HTTPRouteRulesMatches {
                path: Some(HTTPRouteRulesMatchesPath {
                    r#type: Some(HTTPRouteRulesMatchesPathType::PathPrefix),
                    value: Some("/".to_string()),
                }),
                ..Default::default()
            }]),
            filters: Some(vec![host_rewrite_filter_ref()]),
            backend_refs: Some(vec![host_gateway_backend_ref(first)]),
            ..Default::default()
        });
    }

    HTTPRoute {
        metadata: ObjectMeta {
            name: Some(route_name.to_string()),
            namespace: Some(namespace.to_string()),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: HTTPRouteSpec {
            parent_refs: Some(
                route
                    .spec
                    .target_refs
                    .iter()
                    .map(|target| HTTPRouteParentRefs {
                        group: Some(target.group.clone()),
                        kind: Some(target.kind.clone()),
                        name: target.name.clone(),
                        namespace: Some(namespace.to_string()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            rules: Some(rules),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn host_rewrite_filter_ref() -> HTTPRouteRulesFilters {
    HTTPRouteRulesFilters {
        r#type: HTTPRouteRulesFiltersType::ExtensionRef,
        extension_ref: Some(HTTPRouteRulesFiltersExtensionRef {
            group: "gateway.envoyproxy.io".to_string(),
            kind: "HTTPRouteFilter".to_string(),
            name: HOST_REWRITE_FILTER_NAME.to_string(),
        }),
        request_header_modifier: None,
        request_mirror: None,
        request_redirect: None,
        response_header_modifier: None,
        url_rewrite: None,
    }
}

fn host_gateway_backend_ref(resolved: &ResolvedBackend) -> HTTPRouteRulesBackendRefs {
    let backend_ref = &resolved.backend.spec.backend_ref;
    HTTPRouteRulesBackendRefs {
        group: backend_ref.group.clone(),
        kind: backend_ref.kind.clone(),
        name: backend_ref.name.clone(),
        port: backend_ref.port,
        ..Default::default()
    }
}

/// Per-namespace singleton rewriting the upstream hostname to the chosen
/// backend's own.
pub fn host_rewrite_filter(namespace: &str) -> HTTPRouteFilter {
    let mut filter = HTTPRouteFilter::new(
        HOST_REWRITE_FILTER_NAME,
        HTTPRouteFilterSpec {
            url_rewrite: Some(HttpUrlRewriteFilter {
                hostname: Some(HttpHostnameModifier {
                    modifier_type: HostnameModifierType::Backend,
                }),
            }),
        },
    );
    filter.metadata.namespace = Some(namespace.to_string());
    filter
}

/// Create-if-missing; the filter carries no per-route state so it is never
/// updated afterwards.
pub async fn ensure_host_rewrite_filter(client: &Client, namespace: &str) -> Result<()> {
    let filters = Api::<HTTPRouteFilter>::namespaced(client.clone(), namespace);
    if filters.get_opt(HOST_REWRITE_FILTER_NAME).await?.is_none() {
        filters
            .create(&PostParams::default(), &host_rewrite_filter(namespace))
            .await?;
    }
    Ok(())
}
