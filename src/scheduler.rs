use crate::{
    engine::{
        Engine,
        PassOutcome,
    },
    resources::RoutingResource,
};
use futures::StreamExt as _;
use k8s_openapi::api::networking::v1::Ingress;
use kube::{
    runtime::{
        watcher,
        WatchStreamExt as _,
    },
    Api,
};
use std::sync::Arc;

/// Starts passes on demand. Cheap to clone and safe to call from request handlers.
#[derive(Clone)]
pub struct Trigger {
    engine: Arc<Engine>,
}

impl Trigger {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Starts a pass in the background and returns immediately. The request is dropped if a pass is
    /// already running.
    pub fn fire(&self) {
        let engine = self.engine.clone();
        tokio::spawn(async move {
            run_logged(&engine).await;
        });
    }
}

async fn run_logged(engine: &Engine) -> Option<PassOutcome> {
    match engine.reconcile_pass().await {
        Ok(outcome) => Some(outcome),
        Err(err) => {
            error!("reconciliation pass aborted: {err}");
            None
        }
    }
}

/// Runs passes forever, sleeping `sync_interval` after each one finishes.
pub async fn run_periodic(engine: Arc<Engine>) {
    let interval = engine.config().sync_interval;
    info!(?interval, "sync loop started");

    loop {
        if let Some(PassOutcome::Completed(report)) = run_logged(&engine).await {
            trace!(?report, "pass report");
        }
        tokio::time::sleep(interval).await;
    }
}

/// Fires `trigger` whenever an opted-in Ingress is created, changed or deleted.
pub async fn watch_ingresses(client: kube::Client, trigger: Trigger) {
    let mut events = watcher(Api::<Ingress>::all(client), watcher::Config::default())
        .default_backoff()
        .boxed();

    while let Some(event) = events.next().await {
        match event {
            Ok(watcher::Event::Apply(ingress)) | Ok(watcher::Event::Delete(ingress)) => {
                if should_trigger(&ingress) {
                    debug!(
                        name = ?ingress.metadata.name,
                        namespace = ?ingress.metadata.namespace,
                        "opted-in Ingress changed"
                    );
                    trigger.fire();
                }
            }
            // The initial listing is covered by the periodic pass.
            Ok(_) => {}
            Err(err) => warn!("Ingress watch error: {err}"),
        }
    }

    warn!("Ingress watch ended");
}

fn should_trigger(ingress: &Ingress) -> bool {
    RoutingResource::from(ingress).is_opted_in()
}
