use std::{sync::Arc, time::Duration};

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
    api::AIServiceBackend,
    deps,
    reconcilers::{ReconcilerCtx, sync_dependent_routes},
    validation,
};

pub fn control_loop(
    client: Client,
    context: Arc<ReconcilerCtx>,
) -> impl Stream<
    Item = Result<(ObjectRef<AIServiceBackend>, Action), ControllerError<Error, watcher::Error>>,
> {
    let backends = Api::<AIServiceBackend>::all(client);

    Controller::new(backends, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
}

/// A backend emits nothing itself; its changes propagate into every route
/// that references it.
#[instrument(level = Level::DEBUG, skip(context))]
async fn reconcile(
    backend: Arc<AIServiceBackend>,
    context: Arc<ReconcilerCtx>,
) -> Result<Action> {
    tracing::info!("Reconciling...");
    validation::validate_ai_service_backend(&backend)?;

    let dependents = deps::dependent_routes_for_backend(&context.client, &backend).await?;
    sync_dependent_routes(&context, dependents).await?;

    Ok(Action::await_change())
}

fn error_policy(
    _object: Arc<AIServiceBackend>,
    _error: &Error,
    _context: Arc<ReconcilerCtx>,
) -> Action {
    Action::requeue(Duration::from_secs(10))
}
