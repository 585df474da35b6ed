use std::{sync::Arc, time::Duration};

use futures::Stream;
use k8s_openapi::api::core::v1::Secret;
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
    Error, Result, deps,
    reconcilers::{ReconcilerCtx, sync_dependent_routes},
};

pub fn control_loop(
    client: Client,
    context: Arc<ReconcilerCtx>,
) -> impl Stream<Item = Result<(ObjectRef<Secret>, Action), ControllerError<Error, watcher::Error>>>
{
    let secrets = Api::<Secret>::all(client);

    Controller::new(secrets, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
}

/// Credential material changed; routes whose policies read from this secret
/// must re-emit so the processor picks up the new mounts.
#[instrument(level = Level::DEBUG, skip(context, secret))]
async fn reconcile(secret: Arc<Secret>, context: Arc<ReconcilerCtx>) -> Result<Action> {
    let dependents = deps::dependent_routes_for_secret(&context.client, &secret).await?;
    if !dependents.is_empty() {
        tracing::info!(
            "Secret {:?} feeds {} route(s), re-syncing",
            secret.metadata.name,
            dependents.len()
        );
        sync_dependent_routes(&context, dependents).await?;
    }

    Ok(Action::await_change())
}

fn error_policy(_object: Arc<Secret>, _error: &Error, _context: Arc<ReconcilerCtx>) -> Action {
    Action::requeue(Duration::from_secs(10))
}
