use k8s_openapi::{
    api::core::v1::ObjectReference, apimachinery::pkg::apis::meta::v1::OwnerReference,
};
use kube::Client;

use super::{Error, Result};
use crate::{
    api::AIGatewayRoute,
    oidc::{TokenCache, TokenProvider},
};

pub mod backend;
pub mod route;
pub mod secret;
pub mod security_policy;

/// Shared by all four control loops; the leaves only need it to drive the
/// route sync.
pub struct ReconcilerCtx {
    pub client: Client,
    /// Image the managed processor deployments run.
    pub extproc_image: String,
    /// Log level passed to the managed processors.
    pub extproc_log_level: String,
    pub token_provider: TokenProvider,
    pub token_cache: TokenCache,
}

impl ReconcilerCtx {
    pub fn new(client: Client, extproc_image: String, extproc_log_level: String) -> Result<Self> {
        let token_provider = TokenProvider::new(client.clone())?;
        Ok(Self {
            client,
            extproc_image,
            extproc_log_level,
            token_provider,
            token_cache: TokenCache::default(),
        })
    }
}

/// Re-converges every dependent route, continuing past individual failures;
/// the collected errors are joined so the framework still retries the leaf.
pub(crate) async fn sync_dependent_routes(
    context: &ReconcilerCtx,
    routes: Vec<AIGatewayRoute>,
) -> Result<()> {
    let mut errors = Vec::new();
    for dependent in routes {
        if let Err(error) = route::sync_ai_gateway_route(context, &dependent).await {
            tracing::error!(
                "Failed to sync dependent route {:?}: {:?}",
                dependent.metadata.name,
                error
            );
            errors.push(error);
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::Fanout(errors))
    }
}

pub(crate) fn owner_ref_from_object_ref(object_ref: &ObjectReference) -> Result<OwnerReference> {
    Ok(OwnerReference {
        api_version: object_ref
            .api_version
            .clone()
            .ok_or_else(|| Error::MissingField)?,
        kind: object_ref.kind.clone().ok_or_else(|| Error::MissingField)?,
        name: object_ref.name.clone().ok_or_else(|| Error::MissingField)?,
        uid: object_ref.uid.clone().ok_or_else(|| Error::MissingField)?,
        ..Default::default()
    })
}
