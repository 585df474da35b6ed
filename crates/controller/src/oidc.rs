use std::{collections::HashMap, sync::RwLock, time::Duration as StdDuration};

use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use serde::Deserialize;

use crate::{Error, Result, api::Oidc, rotators::PRE_ROTATION_WINDOW_SECS};

/// Key under which the client secret lives in its Secret.
pub const CLIENT_SECRET_KEY: &str = "client-secret";

const HTTP_TIMEOUT: StdDuration = StdDuration::from_secs(60);

#[derive(Debug, Clone)]
pub struct Token {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct ProviderMetadata {
    #[serde(default)]
    issuer: String,
    #[serde(default)]
    token_endpoint: String,
    #[serde(default)]
    scopes_supported: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TokenEndpointResponse {
    access_token: String,
    #[serde(default)]
    expires_in: i64,
}

/// Client-credentials token source for one OIDC provider.
pub struct TokenProvider {
    http: reqwest::Client,
    kube: Client,
}

impl TokenProvider {
    pub fn new(kube: Client) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self { http, kube })
    }

    /// Fetches a token for the given OIDC config. When an issuer is set, its
    /// metadata document is discovered first and any advertised scopes are
    /// merged into `oidc.scopes`, so repeat callers observe the widened set.
    pub async fn fetch_token(&self, oidc: &mut Oidc) -> Result<Token> {
        let mut token_endpoint = oidc.provider.token_endpoint.clone();

        if !oidc.provider.issuer.is_empty() {
            let metadata = self.discover(&oidc.provider.issuer).await?;
            if metadata.issuer.is_empty() || metadata.token_endpoint.is_empty() {
                return Err(Error::Oidc(format!(
                    "discovery document of {} is missing issuer or token_endpoint",
                    oidc.provider.issuer
                )));
            }
            merge_scopes(&mut oidc.scopes, &metadata.scopes_supported);
            if token_endpoint.is_none() {
                token_endpoint = Some(metadata.token_endpoint);
            }
        }

        let endpoint = token_endpoint
            .ok_or_else(|| Error::Oidc("no token endpoint configured or discovered".to_string()))?;
        let client_secret = self.client_secret(oidc).await?;

        let mut form = vec![
            ("grant_type", "client_credentials".to_string()),
            ("client_id", oidc.client_id.clone()),
            ("client_secret", client_secret),
        ];
        if !oidc.scopes.is_empty() {
            form.push(("scope", oidc.scopes.join(" ")));
        }

        let response: TokenEndpointResponse = self
            .http
            .post(&endpoint)
            .form(&form)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(Token {
            access_token: response.access_token,
            expires_at: Utc::now() + Duration::seconds(response.expires_in),
        })
    }

    async fn discover(&self, issuer: &str) -> Result<ProviderMetadata> {
        let url = format!(
            "{}/.well-known/openid-configuration",
            issuer.trim_end_matches('/')
        );
        Ok(self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    async fn client_secret(&self, oidc: &Oidc) -> Result<String> {
        let namespace = oidc.client_secret.namespace.as_deref().ok_or_else(|| {
            Error::Oidc(format!(
                "client secret reference {:?} must carry an explicit namespace",
                oidc.client_secret.name
            ))
        })?;

        let secret = Api::<Secret>::namespaced(self.kube.clone(), namespace)
            .get(&oidc.client_secret.name)
            .await?;
        let value = secret
            .data
            .as_ref()
            .and_then(|data| data.get(CLIENT_SECRET_KEY))
            .ok_or_else(|| Error::SecretKey {
                namespace: namespace.to_string(),
                name: oidc.client_secret.name.clone(),
                key: CLIENT_SECRET_KEY,
            })?;
        String::from_utf8(value.0.clone()).map_err(|_| Error::SecretKey {
            namespace: namespace.to_string(),
            name: oidc.client_secret.name.clone(),
            key: CLIENT_SECRET_KEY,
        })
    }
}

fn merge_scopes(requested: &mut Vec<String>, discovered: &[String]) {
    for scope in discovered {
        if !requested.contains(scope) {
            requested.push(scope.clone());
        }
    }
}

/// A token's remaining lifetime is considered spent once it enters the
/// pre-rotation buffer.
fn within_pre_rotation_buffer(expires_at: DateTime<Utc>) -> bool {
    expires_at - Duration::seconds(PRE_ROTATION_WINDOW_SECS) <= Utc::now()
}

#[derive(Clone)]
struct CachedToken {
    token: Token,
    // Kept so scope merges from discovery survive across fetches.
    oidc: Oidc,
}

/// Process-wide token cache keyed by `{policy}.{namespace}`.
#[derive(Default)]
pub struct TokenCache {
    entries: RwLock<HashMap<String, CachedToken>>,
}

impl TokenCache {
    pub fn cache_key(policy_name: &str, policy_namespace: &str) -> String {
        format!("{policy_name}.{policy_namespace}")
    }

    /// Returns the cached token unless it is inside the pre-rotation buffer,
    /// in which case a fresh one is fetched (with the previously merged
    /// scope set) and cached. The lock is never held across the fetch.
    pub async fn get_or_fetch(
        &self,
        provider: &TokenProvider,
        key: &str,
        oidc: &Oidc,
    ) -> Result<Token> {
        let cached_oidc = {
            let entries = self.entries.read().unwrap();
            match entries.get(key) {
                Some(entry) if !within_pre_rotation_buffer(entry.token.expires_at) => {
                    return Ok(entry.token.clone());
                }
                Some(entry) => Some(entry.oidc.clone()),
                None => None,
            }
        };

        let mut oidc = cached_oidc.unwrap_or_else(|| oidc.clone());
        let token = provider.fetch_token(&mut oidc).await?;
        self.entries.write().unwrap().insert(
            key.to_string(),
            CachedToken {
                token: token.clone(),
                oidc,
            },
        );
        Ok(token)
    }
}
