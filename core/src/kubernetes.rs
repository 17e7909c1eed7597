//! Peer-readiness watcher against the Kubernetes API.
//!
//! [`watch_pod`] follows one pod by name and feeds every event it sees to
//! a [`PodEventHandler`]. The watch protocol is list-then-watch: the
//! initial list supplies the resource version the watch stream must start
//! from (the API server refuses a watch without a version still present
//! in its event history) and its items are dispatched as synthetic
//! `Added` events so state that was already current is observed at least
//! once. Both requests carry a `metadata.name` field selector, since the
//! watch API filters by selector rather than by name.

use crate::error::{CoreError, Result};
use crate::event::Trace;
use crate::shutdown::Shutdown;
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, WatchEvent, WatchParams};
use kube::Client;
use std::sync::Arc;

/// Handler invoked for each pod event delivered by [`watch_pod`].
///
/// `Error` events never reach the handler; they are recorded as
/// recoverable and skipped. A `Deleted` event is dispatched and then
/// terminates the watcher.
#[async_trait]
pub trait PodEventHandler: Send + Sync {
    async fn handle(&self, trace: &Trace, event: &WatchEvent<Pod>);
}

/// Watch a pod and call `handler` for each event.
///
/// Client construction against the ambient credentials happens before
/// this function returns, so a misconfigured environment fails
/// synchronously. The watch itself runs on its own task and terminates
/// on cancellation of `shutdown`, on pod deletion, or on a fatal client
/// error; in every case it cancels `shutdown` so callers blocked on it
/// unblock.
pub async fn watch_pod(
    namespace: &str,
    pod_name: &str,
    handler: Arc<dyn PodEventHandler>,
    shutdown: Shutdown,
    trace: Trace,
) -> Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|err| CoreError::from(err).context("failed to configure kubernetes client"))?;
    let pods: Api<Pod> = Api::namespaced(client, namespace);

    let pod_name = pod_name.to_string();
    tokio::spawn(async move {
        // cancel on exit so the caller can block on the shutdown handle
        let _done = shutdown.guard();
        if let Err(err) = run_watch(&pods, &pod_name, handler, &shutdown, &trace).await {
            trace.add_event(format!("Pod Watch({pod_name}): terminal error: {err}"));
        }
        trace.add_event(format!("Pod Watch({pod_name}): done"));
    });

    Ok(())
}

async fn run_watch(
    pods: &Api<Pod>,
    pod_name: &str,
    handler: Arc<dyn PodEventHandler>,
    shutdown: &Shutdown,
    trace: &Trace,
) -> Result<()> {
    let selector = format!("metadata.name={pod_name}");

    loop {
        if shutdown.is_cancelled() {
            return Ok(());
        }

        let list = pods
            .list(&ListParams::default().fields(&selector))
            .await
            .map_err(|err| CoreError::from(err).context("failed to list pod"))?;
        let version = list.metadata.resource_version.clone().unwrap_or_default();
        for pod in list.items {
            handler.handle(trace, &WatchEvent::Added(pod)).await;
        }

        let stream = pods
            .watch(&WatchParams::default().fields(&selector), &version)
            .await
            .map_err(|err| CoreError::from(err).context("failed to watch pod"))?;
        let mut stream = stream.boxed();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                item = stream.try_next() => match item {
                    Ok(Some(WatchEvent::Error(status))) => {
                        trace.add_event(format!(
                            "Pod Watch({pod_name}): recoverable error: {status:?}"
                        ));
                    }
                    Ok(Some(WatchEvent::Bookmark(_))) => {}
                    Ok(Some(event)) => {
                        let deleted = matches!(event, WatchEvent::Deleted(_));
                        handler.handle(trace, &event).await;
                        if deleted {
                            trace.add_event(format!("Pod Watch({pod_name}): pod deleted"));
                            return Ok(());
                        }
                    }
                    // stream exhausted or broken: resync from a fresh list
                    Ok(None) => break,
                    Err(err) => {
                        trace.add_event(format!("Pod Watch({pod_name}): stream error: {err}"));
                        break;
                    }
                },
            }
        }
    }
}

/// Names of the containers whose readiness probe currently passes.
pub fn ready_containers(pod: &Pod) -> std::collections::HashSet<&str> {
    pod.status
        .iter()
        .flat_map(|status| status.container_statuses.iter().flatten())
        .filter(|container| container.ready)
        .map(|container| container.name.as_str())
        .collect()
}
