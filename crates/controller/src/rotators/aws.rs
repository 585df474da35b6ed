use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region, retry::RetryConfig};
use chrono::{DateTime, Duration, TimeZone, Utc};
use k8s_openapi::api::core::v1::Secret;
use kube::{
    Api, Client, Resource,
    api::{ObjectMeta, Patch, PatchParams},
};

use super::{
    EXPIRATION_TIME_ANNOTATION, PRE_ROTATION_WINDOW_SECS, Rotator, bsp_secret_name,
};
use crate::{
    Error, Result, STS_PROXY_ENV, api::BackendSecurityPolicy,
    reconcilers::owner_ref_from_object_ref,
};

const ROTATOR_MANAGER: &str = "ai-eg-credential-rotator";

#[derive(Debug, Clone)]
pub struct StsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub expiration: DateTime<Utc>,
}

/// Seam over the one STS operation the rotator needs, so tests can inject a
/// canned exchange.
#[async_trait]
pub trait StsOperations: Send + Sync {
    async fn assume_role_with_web_identity(
        &self,
        role_arn: &str,
        session_name: &str,
        web_identity_token: &str,
    ) -> Result<StsCredentials>;
}

pub struct StsClient {
    inner: aws_sdk_sts::Client,
}

impl StsClient {
    pub async fn new(region: &str) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .retry_config(RetryConfig::adaptive());
        if let Ok(proxy_url) = std::env::var(STS_PROXY_ENV) {
            loader = loader.endpoint_url(proxy_url);
        }
        let config = loader.load().await;
        Self {
            inner: aws_sdk_sts::Client::new(&config),
        }
    }
}

#[async_trait]
impl StsOperations for StsClient {
    async fn assume_role_with_web_identity(
        &self,
        role_arn: &str,
        session_name: &str,
        web_identity_token: &str,
    ) -> Result<StsCredentials> {
        let output = self
            .inner
            .assume_role_with_web_identity()
            .role_arn(role_arn)
            .role_session_name(session_name)
            .web_identity_token(web_identity_token)
            .send()
            .await
            .map_err(|e| Error::Sts(e.to_string()))?;

        let credentials = output
            .credentials()
            .ok_or_else(|| Error::Sts("response carried no credentials".to_string()))?;
        let expiration = Utc
            .timestamp_opt(credentials.expiration().secs(), 0)
            .single()
            .ok_or_else(|| Error::Sts("credential expiration is out of range".to_string()))?;

        Ok(StsCredentials {
            access_key_id: credentials.access_key_id().to_string(),
            secret_access_key: credentials.secret_access_key().to_string(),
            session_token: credentials.session_token().to_string(),
            expiration,
        })
    }
}

pub fn session_name(policy_name: &str) -> String {
    format!("ai-gateway-{policy_name}")
}

/// AWS credentials file under the `default` profile, byte-for-byte what the
/// processor's SDK reads from the mounted secret.
pub fn render_credentials_file(credentials: &StsCredentials, region: &str) -> String {
    format!(
        "[default]\naws_access_key_id = {}\naws_secret_access_key = {}\naws_session_token = {}\nregion = {}\n",
        credentials.access_key_id,
        credentials.secret_access_key,
        credentials.session_token,
        region,
    )
}

/// Pre-rotation instant recorded on a managed secret; `None` for a secret
/// that was never rotated (no annotation).
pub fn pre_rotation_time_from_secret(secret: &Secret) -> Result<Option<DateTime<Utc>>> {
    let Some(annotation) = secret
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(EXPIRATION_TIME_ANNOTATION))
    else {
        return Ok(None);
    };
    let expiration = DateTime::parse_from_rfc3339(annotation)?.with_timezone(&Utc);
    Ok(Some(
        expiration - Duration::seconds(PRE_ROTATION_WINDOW_SECS),
    ))
}

/// The managed secret carrying the rendered credentials file, its expiry
/// annotation, and an owner reference back to the policy.
pub fn build_rotated_secret(
    policy: &BackendSecurityPolicy,
    credentials: &StsCredentials,
    region: &str,
) -> Result<Secret> {
    let policy_name = policy.metadata.name.as_deref().unwrap();
    let namespace = policy.metadata.namespace.as_deref().unwrap();
    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(bsp_secret_name(policy_name)),
            namespace: Some(namespace.to_string()),
            annotations: Some(
                [(
                    EXPIRATION_TIME_ANNOTATION.to_string(),
                    credentials.expiration.to_rfc3339(),
                )]
                .into(),
            ),
            owner_references: Some(vec![owner_ref_from_object_ref(&policy.object_ref(&()))?]),
            ..Default::default()
        },
        string_data: Some(
            [(
                filterconfig::AWS_CREDENTIALS_FILE.to_string(),
                render_credentials_file(credentials, region),
            )]
            .into(),
        ),
        ..Default::default()
    })
}

/// Exchanges an OIDC access token for AWS credentials and maintains the
/// policy's managed secret.
pub struct AwsOidcRotator<S: StsOperations> {
    client: Client,
    sts: S,
    policy: BackendSecurityPolicy,
    region: String,
    role_arn: String,
}

/// Region and role ARN of a policy's OIDC-exchange branch; errors on any
/// other policy shape.
fn oidc_exchange_parameters(policy: &BackendSecurityPolicy) -> Result<(String, String)> {
    policy
        .spec
        .aws_credentials
        .as_ref()
        .and_then(|aws| {
            let exchange = aws.oidc_exchange_token.as_ref()?;
            Some((aws.region.clone(), exchange.aws_role_arn.clone()))
        })
        .ok_or_else(|| Error::MalformedSecurityPolicy {
            name: policy.metadata.name.as_deref().unwrap_or_default().to_string(),
        })
}

impl<S: StsOperations> AwsOidcRotator<S> {
    pub fn new(client: Client, sts: S, policy: BackendSecurityPolicy) -> Result<Self> {
        let (region, role_arn) = oidc_exchange_parameters(&policy)?;
        Ok(Self {
            client,
            sts,
            policy,
            region,
            role_arn,
        })
    }

    fn secret_api(&self) -> Api<Secret> {
        let namespace = self.policy.metadata.namespace.as_deref().unwrap();
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl<S: StsOperations> Rotator for AwsOidcRotator<S> {
    async fn get_pre_rotation_time(&self) -> Result<Option<DateTime<Utc>>> {
        let policy_name = self.policy.metadata.name.as_deref().unwrap();
        match self.secret_api().get_opt(&bsp_secret_name(policy_name)).await? {
            Some(secret) => pre_rotation_time_from_secret(&secret),
            None => Ok(None),
        }
    }

    async fn rotate(&self, access_token: &str) -> Result<DateTime<Utc>> {
        let policy_name = self.policy.metadata.name.as_deref().unwrap();
        let credentials = self
            .sts
            .assume_role_with_web_identity(
                &self.role_arn,
                &session_name(policy_name),
                access_token,
            )
            .await?;

        let secret = build_rotated_secret(&self.policy, &credentials, &self.region)?;
        self.secret_api()
            .patch(
                &bsp_secret_name(policy_name),
                &PatchParams::apply(ROTATOR_MANAGER),
                &Patch::Apply(secret),
            )
            .await?;

        Ok(credentials.expiration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{
        AwsOidcExchangeToken, BackendSecurityPolicyAwsCredentials, BackendSecurityPolicySpec,
        BackendSecurityPolicyType, Oidc, OidcProvider, SecretObjectReference,
    };

    fn credentials(expiration: DateTime<Utc>) -> StsCredentials {
        StsCredentials {
            access_key_id: "AKIDEXAMPLE".to_string(),
            secret_access_key: "secret".to_string(),
            session_token: "token".to_string(),
            expiration,
        }
    }

    fn oidc_policy(name: &str) -> BackendSecurityPolicy {
        let mut policy = BackendSecurityPolicy::new(
            name,
            BackendSecurityPolicySpec {
                policy_type: BackendSecurityPolicyType::AWSCredentials,
                api_key: None,
                aws_credentials: Some(BackendSecurityPolicyAwsCredentials {
                    region: "us-east-1".to_string(),
                    credentials_file: None,
                    oidc_exchange_token: Some(AwsOidcExchangeToken {
                        oidc: Oidc {
                            provider: OidcProvider {
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
                        aws_role_arn: "arn:aws:iam::123456789012:role/ai-gateway".to_string(),
                    }),
                }),
            },
        );
        policy.metadata.namespace = Some("ns1".to_string());
        policy.metadata.uid = Some("uid-1".to_string());
        policy
    }

    #[test]
    fn credentials_file_uses_the_default_profile() {
        let rendered = render_credentials_file(&credentials(Utc::now()), "us-east-1");
        assert_eq!(
            rendered,
            "[default]\n\
             aws_access_key_id = AKIDEXAMPLE\n\
             aws_secret_access_key = secret\n\
             aws_session_token = token\n\
             region = us-east-1\n"
        );
    }

    #[test]
    fn session_names_embed_the_policy_name() {
        assert_eq!(session_name("apple-policy"), "ai-gateway-apple-policy");
    }

    #[test]
    fn pre_rotation_time_is_expiry_minus_the_window() {
        let expiration = Utc::now() + Duration::hours(1);
        let mut secret = Secret::default();
        secret.metadata.annotations = Some(
            [(
                EXPIRATION_TIME_ANNOTATION.to_string(),
                expiration.to_rfc3339(),
            )]
            .into(),
        );

        let pre_rotation = pre_rotation_time_from_secret(&secret).unwrap().unwrap();
        assert_eq!(
            pre_rotation.timestamp(),
            (expiration - Duration::seconds(PRE_ROTATION_WINDOW_SECS)).timestamp()
        );
        assert!(!super::super::pre_rotation_time_elapsed(Some(pre_rotation)));
    }

    #[test]
    fn unannotated_secret_counts_as_never_rotated() {
        assert_eq!(
            pre_rotation_time_from_secret(&Secret::default()).unwrap(),
            None
        );
    }

    #[test]
    fn malformed_expiry_annotation_is_an_error() {
        let mut secret = Secret::default();
        secret.metadata.annotations = Some(
            [(EXPIRATION_TIME_ANNOTATION.to_string(), "yesterday".to_string())].into(),
        );
        pre_rotation_time_from_secret(&secret).unwrap_err();
    }

    #[test]
    fn rotated_secret_carries_payload_expiry_and_owner() {
        let expiration = Utc::now() + Duration::hours(1);
        let policy = oidc_policy("apple-policy");
        let secret = build_rotated_secret(&policy, &credentials(expiration), "us-east-1").unwrap();

        assert_eq!(
            secret.metadata.name.as_deref(),
            Some("ai-eg-bsp-apple-policy")
        );
        let annotation = secret
            .metadata
            .annotations
            .as_ref()
            .unwrap()
            .get(EXPIRATION_TIME_ANNOTATION)
            .unwrap();
        assert_eq!(
            DateTime::parse_from_rfc3339(annotation).unwrap().timestamp(),
            expiration.timestamp()
        );

        let payload = secret
            .string_data
            .as_ref()
            .unwrap()
            .get("credentials")
            .unwrap();
        assert!(payload.starts_with("[default]\naws_access_key_id = AKIDEXAMPLE\n"));

        let owners = secret.metadata.owner_references.as_ref().unwrap();
        assert_eq!(owners[0].kind, "BackendSecurityPolicy");
        assert_eq!(owners[0].name, "apple-policy");
    }

    #[test]
    fn oidc_exchange_parameters_require_the_oidc_branch() {
        let policy = oidc_policy("apple-policy");
        let (region, role_arn) = oidc_exchange_parameters(&policy).unwrap();
        assert_eq!(region, "us-east-1");
        assert_eq!(role_arn, "arn:aws:iam::123456789012:role/ai-gateway");

        let mut static_file = policy;
        static_file
            .spec
            .aws_credentials
            .as_mut()
            .unwrap()
            .oidc_exchange_token = None;
        let err = oidc_exchange_parameters(&static_file).unwrap_err();
        assert!(matches!(err, Error::MalformedSecurityPolicy { .. }));
    }
}
