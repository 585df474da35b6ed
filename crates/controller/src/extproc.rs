use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{
            Container, ContainerPort, Pod, PodSpec, PodTemplateSpec, SecretVolumeSource, Service,
            ServicePort, ServiceSpec, Volume, VolumeMount,
        },
    },
    apimachinery::pkg::{
        apis::meta::v1::{LabelSelector, OwnerReference},
        util::intstr::IntOrString,
    },
};
use kube::{
    Api, Client,
    api::{ListParams, ObjectMeta, Patch, PatchParams, PostParams},
};
use serde_json::json;

use crate::{
    EXTPROC_GRPC_PORT, EXTPROC_UUID_ANNOTATION, MANAGED_BY_LABEL_VALUE, Result,
    api::AIGatewayRoute, deps::ResolvedBackend, rotators,
};

const CONFIG_VOLUME_NAME: &str = "config";

pub fn extproc_labels(name: &str) -> BTreeMap<String, String> {
    [
        ("app".to_string(), name.to_string()),
        (
            "app.kubernetes.io/managed-by".to_string(),
            MANAGED_BY_LABEL_VALUE.to_string(),
        ),
    ]
    .into()
}

/// Credential volumes in `(rule, backendRef)` order: one per backend
/// reference whose backend carries a security policy. Returns
/// `(volume-name, secret-name)` pairs; the secret is the policy's referenced
/// secret, or the rotator-managed one for OIDC exchange.
pub fn credential_volumes(resolved: &[Vec<ResolvedBackend>]) -> Vec<(String, String)> {
    let mut volumes = Vec::new();
    for (rule_index, rule_backends) in resolved.iter().enumerate() {
        for (backend_index, resolved_backend) in rule_backends.iter().enumerate() {
            let Some(policy) = &resolved_backend.policy else {
                continue;
            };
            let policy_name = policy.metadata.name.as_deref().unwrap();
            let secret_name = if let Some(api_key) = &policy.spec.api_key {
                api_key.secret_ref.name.clone()
            } else if let Some(aws) = &policy.spec.aws_credentials {
                match &aws.credentials_file {
                    Some(file) => file.secret_ref.name.clone(),
                    None => rotators::bsp_secret_name(policy_name),
                }
            } else {
                continue;
            };
            volumes.push((
                filterconfig::backend_security_volume_name(rule_index, backend_index, policy_name),
                secret_name,
            ));
        }
    }
    volumes
}

/// The full desired Deployment. The volume and mount lists are rebuilt from
/// scratch on every call: the config volume first, credential volumes after,
/// so stale mounts from earlier generations cannot survive.
pub fn build_extproc_deployment(
    route: &AIGatewayRoute,
    resolved: &[Vec<ResolvedBackend>],
    existing: Option<&Deployment>,
    image: &str,
    log_level: &str,
    owner: OwnerReference,
) -> Deployment {
    let namespace = route.metadata.namespace.as_deref().unwrap();
    let name = crate::extproc_name(route.metadata.name.as_deref().unwrap());
    let labels = extproc_labels(&name);

    let external_process = route
        .spec
        .filter_config
        .as_ref()
        .and_then(|filter_config| filter_config.external_process.as_ref());

    let replicas = external_process
        .and_then(|ep| ep.replicas)
        .or_else(|| existing.and_then(|d| d.spec.as_ref()).and_then(|s| s.replicas));
    let resources = external_process
        .and_then(|ep| ep.resources.clone())
        .or_else(|| existing_container_resources(existing));

    let mut volumes = vec![Volume {
        name: CONFIG_VOLUME_NAME.to_string(),
        config_map: Some(k8s_openapi::api::core::v1::ConfigMapVolumeSource {
            name: name.clone(),
            ..Default::default()
        }),
        ..Default::default()
    }];
    let mut volume_mounts = vec![VolumeMount {
        name: CONFIG_VOLUME_NAME.to_string(),
        mount_path: filterconfig::CONFIG_MOUNT_PATH.to_string(),
        read_only: Some(true),
        ..Default::default()
    }];
    for (volume_name, secret_name) in credential_volumes(resolved) {
        volume_mounts.push(VolumeMount {
            name: volume_name.clone(),
            mount_path: filterconfig::backend_security_mount_path(&volume_name),
            read_only: Some(true),
            ..Default::default()
        });
        volumes.push(Volume {
            name: volume_name,
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret_name),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    Deployment {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas,
            selector: LabelSelector {
                match_labels: Some([("app".to_string(), name.clone())].into()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "ai-gateway-extproc".to_string(),
                        image: Some(image.to_string()),
                        args: Some(vec![
                            "-configPath".to_string(),
                            filterconfig::CONFIG_FILE_PATH.to_string(),
                            "-logLevel".to_string(),
                            log_level.to_string(),
                        ]),
                        ports: Some(vec![ContainerPort {
                            container_port: EXTPROC_GRPC_PORT,
                            name: Some("grpc".to_string()),
                            ..Default::default()
                        }]),
                        resources,
                        volume_mounts: Some(volume_mounts),
                        ..Default::default()
                    }],
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn existing_container_resources(
    existing: Option<&Deployment>,
) -> Option<k8s_openapi::api::core::v1::ResourceRequirements> {
    existing?
        .spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .first()?
        .resources
        .clone()
}

/// Headless Service resolving to the processor pods for the extension
/// policy's gRPC cluster.
pub fn build_extproc_service(route: &AIGatewayRoute, owner: OwnerReference) -> Service {
    let namespace = route.metadata.namespace.as_deref().unwrap();
    let name = crate::extproc_name(route.metadata.name.as_deref().unwrap());

    Service {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(extproc_labels(&name)),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some([("app".to_string(), name)].into()),
            ports: Some(vec![ServicePort {
                name: Some("grpc".to_string()),
                port: EXTPROC_GRPC_PORT,
                target_port: Some(IntOrString::Int(EXTPROC_GRPC_PORT)),
                app_protocol: Some("grpc".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Applies the Deployment (full desired state every pass) and creates the
/// Service if missing. The Service is never updated.
pub async fn reconcile_extproc(
    client: &Client,
    manager: &str,
    route: &AIGatewayRoute,
    resolved: &[Vec<ResolvedBackend>],
    image: &str,
    log_level: &str,
    owner: OwnerReference,
) -> Result<()> {
    let namespace = route.metadata.namespace.as_deref().unwrap();
    let name = crate::extproc_name(route.metadata.name.as_deref().unwrap());

    let deployments = Api::<Deployment>::namespaced(client.clone(), namespace);
    let existing = deployments.get_opt(&name).await?;
    let desired = build_extproc_deployment(
        route,
        resolved,
        existing.as_ref(),
        image,
        log_level,
        owner.clone(),
    );
    deployments
        .patch(&name, &PatchParams::apply(manager), &Patch::Apply(desired))
        .await?;

    let services = Api::<Service>::namespaced(client.clone(), namespace);
    if services.get_opt(&name).await?.is_none() {
        services
            .create(&PostParams::default(), &build_extproc_service(route, owner))
            .await?;
    }

    Ok(())
}

/// Stamps the document UUID onto every processor pod. The volume projector
/// can lag behind ConfigMap updates; a metadata change forces the kubelet to
/// refresh the projection promptly.
pub async fn annotate_extproc_pods(
    client: &Client,
    manager: &str,
    namespace: &str,
    deployment_name: &str,
    uuid: &str,
) -> Result<()> {
    let pods = Api::<Pod>::namespaced(client.clone(), namespace);
    let selected = pods
        .list(&ListParams::default().labels(&format!("app={deployment_name}")))
        .await?;

    let pp = PatchParams::apply(manager);
    for pod in selected {
        let pod_name = pod.metadata.name.as_deref().unwrap();
        pods.patch_metadata(
            pod_name,
            &pp,
            &Patch::Merge(json!({
                "metadata": {
                    "annotations": {
                        EXTPROC_UUID_ANNOTATION: uuid,
                    }
                }
            })),
        )
        .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use filterconfig::{ApiSchemaName, VersionedApiSchema};
    use k8s_openapi::{
        api::core::v1::ResourceRequirements, apimachinery::pkg::api::resource::Quantity,
    };

    use super::*;
    use crate::api::{
        AIGatewayFilterConfig, AIGatewayFilterConfigExternalProcess, AIGatewayFilterConfigType,
        AIGatewayRouteRule, AIGatewayRouteRuleBackendRef, AIGatewayRouteSpec, AIServiceBackend,
        AIServiceBackendSpec, BackendSecurityPolicy, BackendSecurityPolicyApiKey,
        BackendSecurityPolicyAwsCredentials, BackendSecurityPolicySpec,
        BackendSecurityPolicyType, GatewayTargetReference, HostGatewayBackendRef,
        SecretObjectReference,
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

    fn route(backends: &[&str]) -> AIGatewayRoute {
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
                    backend_refs: backends
                        .iter()
                        .map(|name| AIGatewayRouteRuleBackendRef {
                            name: name.to_string(),
                            weight: None,
                        })
                        .collect(),
                    matches: vec![],
                }],
                filter_config: None,
                llm_request_costs: None,
            },
        );
        route.metadata.namespace = Some("ns1".to_string());
        route
    }

    fn resolved(name: &str, policy: Option<BackendSecurityPolicy>) -> ResolvedBackend {
        ResolvedBackend {
            backend: AIServiceBackend::new(
                name,
                AIServiceBackendSpec {
                    schema: VersionedApiSchema {
                        name: ApiSchemaName::OpenAI,
                        version: None,
                    },
                    backend_ref: HostGatewayBackendRef {
                        group: None,
                        kind: None,
                        name: format!("{name}-svc"),
                        port: None,
                    },
                    backend_security_policy_ref: None,
                },
            ),
            policy,
        }
    }

    fn api_key_policy(name: &str, secret: &str) -> BackendSecurityPolicy {
        let mut policy = BackendSecurityPolicy::new(
            name,
            BackendSecurityPolicySpec {
                policy_type: BackendSecurityPolicyType::APIKey,
                api_key: Some(BackendSecurityPolicyApiKey {
                    secret_ref: SecretObjectReference {
                        name: secret.to_string(),
                        namespace: None,
                    },
                }),
                aws_credentials: None,
            },
        );
        policy.metadata.namespace = Some("ns1".to_string());
        policy
    }

    fn oidc_policy(name: &str) -> BackendSecurityPolicy {
        let mut policy = api_key_policy(name, "unused");
        policy.spec = BackendSecurityPolicySpec {
            policy_type: BackendSecurityPolicyType::AWSCredentials,
            api_key: None,
            aws_credentials: Some(BackendSecurityPolicyAwsCredentials {
                region: "us-east-1".to_string(),
                credentials_file: None,
                oidc_exchange_token: Some(crate::api::AwsOidcExchangeToken {
                    oidc: crate::api::Oidc {
                        provider: crate::api::OidcProvider {
                            issuer: "https://issuer.example.com".to_string(),
                            token_endpoint: None,
                        },
                        client_id: "client".to_string(),
                        client_secret: SecretObjectReference {
                            name: "oidc-client".to_string(),
                            namespace: Some("ns1".to_string()),
                        },
                        scopes: vec![],
                    },
                    aws_role_arn: "arn:aws:iam::123456789012:role/x".to_string(),
                }),
            }),
        };
        policy
    }

    #[test]
    fn config_volume_always_comes_first() {
        let route = route(&["apple"]);
        let resolved_backends = vec![vec![resolved("apple", Some(api_key_policy("p", "s")))]];
        let deployment =
            build_extproc_deployment(&route, &resolved_backends, None, "img", "info", owner());

        let pod_spec = deployment.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        let volumes = pod_spec.volumes.as_ref().unwrap();
        assert_eq!(volumes[0].name, "config");
        assert_eq!(
            volumes[0].config_map.as_ref().unwrap().name,
            "ai-eg-route-extproc-route1"
        );
        let mounts = pod_spec.containers[0].volume_mounts.as_ref().unwrap();
        assert_eq!(mounts[0].mount_path, "/etc/ai-gateway/extproc");
    }

    #[test]
    fn credential_volume_per_secured_backend_ref() {
        let route = route(&["apple", "orange"]);
        let resolved_backends = vec![vec![
            resolved("apple", Some(api_key_policy("apple-policy", "apple-key"))),
            resolved("orange", None),
        ]];
        let deployment =
            build_extproc_deployment(&route, &resolved_backends, None, "img", "info", owner());

        let pod_spec = deployment.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        let volumes = pod_spec.volumes.as_ref().unwrap();
        assert_eq!(volumes.len(), 2);
        assert_eq!(volumes[1].name, "rule0-backref0-apple-policy");
        assert_eq!(
            volumes[1].secret.as_ref().unwrap().secret_name.as_deref(),
            Some("apple-key")
        );

        let mounts = pod_spec.containers[0].volume_mounts.as_ref().unwrap();
        assert_eq!(mounts.len(), 2);
        assert_eq!(
            mounts[1].mount_path,
            "/etc/backend_security_policy/rule0-backref0-apple-policy"
        );
        assert_eq!(mounts[1].read_only, Some(true));
    }

    #[test]
    fn volumes_enumerate_rule_and_backend_indices() {
        let volumes = credential_volumes(&[
            vec![
                resolved("apple", Some(api_key_policy("p1", "s1"))),
                resolved("orange", None),
            ],
            vec![resolved("banana", Some(api_key_policy("p2", "s2")))],
        ]);
        assert_eq!(
            volumes,
            vec![
                ("rule0-backref0-p1".to_string(), "s1".to_string()),
                ("rule1-backref0-p2".to_string(), "s2".to_string()),
            ]
        );
    }

    #[test]
    fn oidc_policies_mount_the_rotator_managed_secret() {
        let volumes = credential_volumes(&[vec![resolved("apple", Some(oidc_policy("oidc-p")))]]);
        assert_eq!(
            volumes,
            vec![(
                "rule0-backref0-oidc-p".to_string(),
                "ai-eg-bsp-oidc-p".to_string()
            )]
        );
    }

    #[test]
    fn replicas_project_from_the_filter_config() {
        let mut route = route(&["apple"]);
        route.spec.filter_config = Some(AIGatewayFilterConfig {
            filter_type: AIGatewayFilterConfigType::ExternalProcess,
            external_process: Some(AIGatewayFilterConfigExternalProcess {
                replicas: Some(3),
                resources: None,
            }),
        });
        let resolved_backends = vec![vec![resolved("apple", None)]];

        let mut existing = build_extproc_deployment(
            &route,
            &resolved_backends,
            None,
            "img",
            "info",
            owner(),
        );
        existing.spec.as_mut().unwrap().replicas = Some(5);

        let deployment = build_extproc_deployment(
            &route,
            &resolved_backends,
            Some(&existing),
            "img",
            "info",
            owner(),
        );
        assert_eq!(deployment.spec.as_ref().unwrap().replicas, Some(3));

        let container = &deployment.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0];
        assert_eq!(container.image.as_deref(), Some("img"));
        assert_eq!(
            container.args.as_ref().unwrap(),
            &vec![
                "-configPath".to_string(),
                "/etc/ai-gateway/extproc/extproc-config.yaml".to_string(),
                "-logLevel".to_string(),
                "info".to_string(),
            ]
        );
    }

    #[test]
    fn unset_replicas_keep_the_live_value() {
        let route = route(&["apple"]);
        let resolved_backends = vec![vec![resolved("apple", None)]];

        let mut existing =
            build_extproc_deployment(&route, &resolved_backends, None, "img", "info", owner());
        existing.spec.as_mut().unwrap().replicas = Some(4);

        let deployment = build_extproc_deployment(
            &route,
            &resolved_backends,
            Some(&existing),
            "img",
            "info",
            owner(),
        );
        assert_eq!(deployment.spec.as_ref().unwrap().replicas, Some(4));
    }

    #[test]
    fn unset_resources_keep_the_live_value() {
        let route = route(&["apple"]);
        let resolved_backends = vec![vec![resolved("apple", None)]];

        let mut existing =
            build_extproc_deployment(&route, &resolved_backends, None, "img", "info", owner());
        let requests: std::collections::BTreeMap<String, Quantity> =
            [("cpu".to_string(), Quantity("100m".to_string()))].into();
        existing
            .spec
            .as_mut()
            .unwrap()
            .template
            .spec
            .as_mut()
            .unwrap()
            .containers[0]
            .resources = Some(ResourceRequirements {
            requests: Some(requests.clone()),
            ..Default::default()
        });

        let deployment = build_extproc_deployment(
            &route,
            &resolved_backends,
            Some(&existing),
            "img",
            "info",
            owner(),
        );
        let resources = deployment.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers
            [0]
        .resources
        .as_ref()
        .unwrap();
        assert_eq!(resources.requests.as_ref(), Some(&requests));
    }

    #[test]
    fn service_is_headless_grpc_on_1063() {
        let service = build_extproc_service(&route(&["apple"]), owner());
        let spec = service.spec.as_ref().unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
        let port = &spec.ports.as_ref().unwrap()[0];
        assert_eq!(port.port, 1063);
        assert_eq!(port.app_protocol.as_deref(), Some("grpc"));
        assert_eq!(
            service.metadata.name.as_deref(),
            Some("ai-eg-route-extproc-route1")
        );
    }
}
