use std::{sync::Arc, time::Duration};

use chrono::{Duration as ChronoDuration, Utc};
use futures::Stream;
use kube::{
    Api, Client,
    runtime::{
        Controller,
        controller::{Action, Error as ControllerError},
        reflector::ObjectRef,
        watcher,
    },
};
use tracing::{Level, instrument};

use crate::{
    Error, Result,
    api::{AwsOidcExchangeToken, BackendSecurityPolicy},
    deps,
    oidc::TokenCache,
    reconcilers::{ReconcilerCtx, sync_dependent_routes},
    rotators::{
        PRE_ROTATION_WINDOW_SECS, Rotator,
        aws::{AwsOidcRotator, StsClient},
    },
    validation,
};

pub fn control_loop(
    client: Client,
    context: Arc<ReconcilerCtx>,
) -> impl Stream<
    Item = Result<
        (ObjectRef<BackendSecurityPolicy>, Action),
        ControllerError<Error, watcher::Error>,
    >,
> {
    let policies = Api::<BackendSecurityPolicy>::all(client);

    Controller::new(policies, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
}

/// Drives credential rotation for OIDC-exchange policies, then fans the
/// change out through the referencing backends to their routes.
#[instrument(level = Level::DEBUG, skip(context))]
async fn reconcile(
    policy: Arc<BackendSecurityPolicy>,
    context: Arc<ReconcilerCtx>,
) -> Result<Action> {
    tracing::info!("Reconciling...");
    validation::validate_backend_security_policy(&policy)?;

    let mut action = Action::await_change();
    let exchange = policy
        .spec
        .aws_credentials
        .as_ref()
        .and_then(|aws| aws.oidc_exchange_token.as_ref());
    if let Some(exchange) = exchange {
        let requeue_after = rotate_if_due(&context, &policy, exchange).await?;
        action = Action::requeue(requeue_after);
    }

    let dependents = deps::dependent_routes_for_policy(&context.client, &policy).await?;
    sync_dependent_routes(&context, dependents).await?;

    Ok(action)
}

/// Rotates the managed credential secret when its pre-rotation instant has
/// passed. Returns how long until the next rotation is due.
async fn rotate_if_due(
    context: &ReconcilerCtx,
    policy: &Arc<BackendSecurityPolicy>,
    exchange: &AwsOidcExchangeToken,
) -> Result<Duration> {
    let policy_name = policy.metadata.name.as_deref().unwrap();
    let policy_namespace = policy.metadata.namespace.as_deref().unwrap();
    let region = policy
        .spec
        .aws_credentials
        .as_ref()
        .map(|aws| aws.region.as_str())
        .unwrap_or_default();

    let sts = StsClient::new(region).await;
    let rotator = AwsOidcRotator::new(context.client.clone(), sts, (**policy).clone())?;

    let pre_rotation_time = rotator.get_pre_rotation_time().await?;
    if !rotator.is_expired(pre_rotation_time) {
        return Ok(duration_until(pre_rotation_time.unwrap()));
    }

    let cache_key = TokenCache::cache_key(policy_name, policy_namespace);
    let token = context
        .token_cache
        .get_or_fetch(&context.token_provider, &cache_key, &exchange.oidc)
        .await?;

    let expiration = rotator.rotate(&token.access_token).await?;
    tracing::info!(
        "Rotated credentials for {policy_namespace}/{policy_name}, valid until {expiration}"
    );
    Ok(duration_until(
        expiration - ChronoDuration::seconds(PRE_ROTATION_WINDOW_SECS),
    ))
}

fn duration_until(instant: chrono::DateTime<Utc>) -> Duration {
    (instant - Utc::now()).to_std().unwrap_or_default()
}

/// Rotation failures retry on a one-minute cadence; the data plane keeps
/// using the previous credential secret until a rotation succeeds.
fn error_policy(
    _object: Arc<BackendSecurityPolicy>,
    _error: &Error,
    _context: Arc<ReconcilerCtx>,
) -> Action {
    Action::requeue(Duration::from_secs(60))
}
