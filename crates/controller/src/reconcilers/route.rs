use std::{sync::Arc, time::Duration};

use futures::Stream;
use k8s_openapi::{
    api::{
        apps::v1::Deployment,
        core::v1::{ConfigMap, Service},
    },
    apimachinery::pkg::apis::meta::v1::OwnerReference,
};
use kcr_gateway_networking_k8s_io::v1::httproutes::HTTPRoute;
use kube::{
    Api, Client, Resource,
    api::{ObjectMeta, Patch, PatchParams, PostParams},
    runtime::{
        Controller,
        controller::{Action, Error as ControllerError},
        reflector::ObjectRef,
        watcher,
    },
};
use tracing::{Level, instrument};

use crate::{
    EXTPROC_GRPC_PORT, Error, Result,
    api::AIGatewayRoute,
    deps, document, extproc,
    extension::{
        BodyProcessingMode, EnvoyExtensionPolicy, EnvoyExtensionPolicySpec, ExtProc,
        ExtProcBackendRef, ExtProcMetadata, ExtProcProcessingMode, ProcessingModeOptions,
    },
    extproc_name, httproute,
    reconcilers::{ReconcilerCtx, owner_ref_from_object_ref},
    validation,
};

const MANAGER_NAME: &str = "ai-eg-route-controller";

pub fn control_loop(
    client: Client,
    context: Arc<ReconcilerCtx>,
) -> impl Stream<
    Item = Result<(ObjectRef<AIGatewayRoute>, Action), ControllerError<Error, watcher::Error>>,
> {
    let routes = Api::<AIGatewayRoute>::all(client.clone());
    let configmaps = Api::<ConfigMap>::all(client.clone());
    let deployments = Api::<Deployment>::all(client.clone());
    let services = Api::<Service>::all(client.clone());
    let httproutes = Api::<HTTPRoute>::all(client.clone());
    let extension_policies = Api::<EnvoyExtensionPolicy>::all(client.clone());

    Controller::new(routes, watcher::Config::default())
        .owns(configmaps, watcher::Config::default())
        .owns(deployments, watcher::Config::default())
        .owns(services, watcher::Config::default())
        .owns(httproutes, watcher::Config::default())
        .owns(extension_policies, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
}

#[instrument(level = Level::DEBUG, skip(context))]
async fn reconcile(route: Arc<AIGatewayRoute>, context: Arc<ReconcilerCtx>) -> Result<Action> {
    tracing::info!("Reconciling...");

    if route.metadata.deletion_timestamp.is_some() {
        // Generated objects are owner-referenced; garbage collection does the
        // cleanup.
        tracing::info!("Route is being deleted, nothing to tear down");
        return Ok(Action::await_change());
    }

    sync_ai_gateway_route(&context, &route).await?;
    Ok(Action::requeue(Duration::from_secs(300)))
}

/// Converges everything a route owns. Shared with the leaf reconcilers so a
/// backend, policy or secret event drives the exact same emission path.
pub async fn sync_ai_gateway_route(context: &ReconcilerCtx, route: &AIGatewayRoute) -> Result<()> {
    validation::validate_ai_gateway_route(route)?;

    let namespace = route.metadata.namespace.as_deref().unwrap();
    let route_name = route.metadata.name.as_deref().unwrap();
    let name = extproc_name(route_name);
    let owner = owner_ref_from_object_ref(&route.object_ref(&()))?;
    let pp = PatchParams::apply(MANAGER_NAME);

    httproute::ensure_host_rewrite_filter(&context.client, namespace).await?;

    // Pre-create the ConfigMap with a bootstrap document so the processor
    // deployment can come up before the first full emission.
    let configmaps = Api::<ConfigMap>::namespaced(context.client.clone(), namespace);
    if configmaps.get_opt(&name).await?.is_none() {
        let bootstrap = config_map(route, &filterconfig::Config::bootstrap(), owner.clone())?;
        configmaps.create(&PostParams::default(), &bootstrap).await?;
    }

    ensure_extension_policy(context, route, owner.clone(), &pp).await?;

    let resolved = deps::resolve_route_backends(&context.client, route).await?;

    let processor_config = document::build_processor_config(route, &resolved)?;
    let uuid = processor_config.uuid.clone();
    configmaps
        .patch(
            &name,
            &pp,
            &Patch::Apply(config_map(route, &processor_config, owner.clone())?),
        )
        .await?;

    let generated = httproute::build_http_route(route, &resolved, owner.clone());
    Api::<HTTPRoute>::namespaced(context.client.clone(), namespace)
        .patch(route_name, &pp, &Patch::Apply(generated))
        .await?;

    extproc::reconcile_extproc(
        &context.client,
        MANAGER_NAME,
        route,
        &resolved,
        &context.extproc_image,
        &context.extproc_log_level,
        owner,
    )
    .await?;

    extproc::annotate_extproc_pods(&context.client, MANAGER_NAME, namespace, &name, &uuid).await?;

    Ok(())
}

fn config_map(
    route: &AIGatewayRoute,
    document: &filterconfig::Config,
    owner: OwnerReference,
) -> Result<ConfigMap> {
    let namespace = route.metadata.namespace.as_deref().unwrap();
    let name = extproc_name(route.metadata.name.as_deref().unwrap());
    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace.to_string()),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        data: Some(
            [(
                filterconfig::CONFIG_MAP_KEY.to_string(),
                serde_yaml_ng::to_string(document)?,
            )]
            .into(),
        ),
        ..Default::default()
    })
}

/// Wires the processor service into the route's gateways: buffered request
/// and response bodies over gRPC, with the token-cost metadata namespace
/// writable.
fn extension_policy(route: &AIGatewayRoute, owner: OwnerReference) -> EnvoyExtensionPolicy {
    let namespace = route.metadata.namespace.as_deref().unwrap();
    let name = extproc_name(route.metadata.name.as_deref().unwrap());

    let mut policy = EnvoyExtensionPolicy::new(
        &name,
        EnvoyExtensionPolicySpec {
            target_refs: route.spec.target_refs.clone(),
            ext_proc: vec![ExtProc {
                backend_refs: vec![ExtProcBackendRef {
                    name: name.clone(),
                    port: Some(EXTPROC_GRPC_PORT),
                }],
                processing_mode: Some(ExtProcProcessingMode {
                    request: Some(ProcessingModeOptions {
                        body: Some(BodyProcessingMode::Buffered),
                    }),
                    response: Some(ProcessingModeOptions {
                        body: Some(BodyProcessingMode::Buffered),
                    }),
                }),
                metadata: Some(ExtProcMetadata {
                    writable_namespaces: vec![filterconfig::METADATA_NAMESPACE.to_string()],
                }),
            }],
        },
    );
    policy.metadata.namespace = Some(namespace.to_string());
    policy.metadata.owner_references = Some(vec![owner]);
    policy
}

async fn ensure_extension_policy(
    context: &ReconcilerCtx,
    route: &AIGatewayRoute,
    owner: OwnerReference,
    pp: &PatchParams,
) -> Result<()> {
    let namespace = route.metadata.namespace.as_deref().unwrap();
    let name = extproc_name(route.metadata.name.as_deref().unwrap());

    Api::<EnvoyExtensionPolicy>::namespaced(context.client.clone(), namespace)
        .patch(&name, pp, &Patch::Apply(extension_policy(route, owner)))
        .await?;
    Ok(())
}

fn error_policy(
    _object: Arc<AIGatewayRoute>,
    _error: &Error,
    _context: Arc<ReconcilerCtx>,
) -> Action {
    Action::requeue(Duration::from_secs(10))
}

#[cfg(test)]
mod tests {
    use filterconfig::{ApiSchemaName, VersionedApiSchema};

    use super::*;
    use crate::api::{
        AIGatewayRouteRule, AIGatewayRouteRuleBackendRef, AIGatewayRouteSpec,
        GatewayTargetReference,
    };

    fn owner() -> OwnerReference {
        OwnerReference {
            api_version: "aigateway.envoyproxy.io/v1alpha1".to_string(),
            kind: "AIGatewayRoute".to_string(),
            name: "route1".to_string(),
            uid: "uid-1".to_string(),
            ..Default::default()
        }
    }

    fn route() -> AIGatewayRoute {
        let mut route = AIGatewayRoute::new(
            "route1",
            AIGatewayRouteSpec {
                target_refs: vec![GatewayTargetReference {
                    group: "gateway.networking.k8s.io".to_string(),
                    kind: "Gateway".to_string(),
                    name: "eg".to_string(),
                }],
                schema: VersionedApiSchema {
                    name: ApiSchemaName::OpenAI,
                    version: None,
                },
                rules: vec![AIGatewayRouteRule {
                    backend_refs: vec![AIGatewayRouteRuleBackendRef {
                        name: "apple".to_string(),
                        weight: None,
                    }],
                    matches: vec![],
                }],
                filter_config: None,
                llm_request_costs: None,
            },
        );
        route.metadata.namespace = Some("ns1".to_string());
        route
    }

    #[test]
    fn config_map_holds_the_document_under_the_well_known_key() {
        let document = filterconfig::Config::bootstrap();
        let config_map = config_map(&route(), &document, owner()).unwrap();

        assert_eq!(
            config_map.metadata.name.as_deref(),
            Some("ai-eg-route-extproc-route1")
        );
        let data = config_map.data.as_ref().unwrap();
        let raw = data.get("extproc-config.yaml").unwrap();
        let parsed: filterconfig::Config = serde_yaml_ng::from_str(raw).unwrap();
        assert_eq!(parsed, document);
    }

    #[test]
    fn extension_policy_buffers_bodies_into_the_processor_service() {
        let policy = extension_policy(&route(), owner());

        assert_eq!(policy.spec.target_refs[0].name, "eg");
        let ext_proc = &policy.spec.ext_proc[0];
        assert_eq!(ext_proc.backend_refs[0].name, "ai-eg-route-extproc-route1");
        assert_eq!(ext_proc.backend_refs[0].port, Some(1063));

        let mode = ext_proc.processing_mode.as_ref().unwrap();
        assert_eq!(
            mode.request.as_ref().unwrap().body,
            Some(BodyProcessingMode::Buffered)
        );
        assert_eq!(
            mode.response.as_ref().unwrap().body,
            Some(BodyProcessingMode::Buffered)
        );
        assert_eq!(
            ext_proc.metadata.as_ref().unwrap().writable_namespaces,
            vec!["io.envoy.ai_gateway".to_string()]
        );
    }
}
