#[macro_use]
extern crate tracing;

use clap::Parser;
use eyre::Result;
use k8s_openapi::api::networking::v1::Ingress;
use kube::Api;
use kube_bt_sync::{
    config::Config,
    engine::{
        Engine,
        PassOutcome,
    },
    health,
    panel::{
        sites,
        BaotaClient,
    },
    resources::{
        self,
        IngressStore,
        RoutingResource,
        RoutingStore as _,
    },
    scheduler::{
        self,
        Trigger,
    },
};
use std::{
    io::Read as _,
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

#[derive(Parser)]
#[command(version, about)]
enum Args {
    /// Keep opted-in Ingresses and panel sites in sync until interrupted.
    Controller(Config),
    /// Run a single reconciliation pass and print the resulting status.
    SyncOnce(Config),
    /// Print the sites known to the panel.
    ListSites(Config),
    /// Check panel access, DDNS reachability and cluster add-ons.
    Check(ArgsCheck),
    /// Create or update an Ingress from a YAML manifest, then run a reconciliation pass.
    ApplyRoute(ArgsApplyRoute),
    /// Delete an opted-in Ingress, optionally together with its panel sites.
    DeleteRoute(ArgsDeleteRoute),
}

#[derive(Parser)]
struct ArgsCheck {
    #[command(flatten)]
    config: Config,

    #[clap(
        long,
        env = "NAMESERVER_FOR_DDNS_CHECK",
        help = "Nameserver and port used to resolve the DDNS host",
        default_value = "1.1.1.1:53"
    )]
    nameserver: SocketAddr,

    #[clap(
        long,
        env = "PROBE_TIMEOUT",
        help = "Timeout of the TCP probe against the DDNS host",
        default_value = "2s",
        value_parser = humantime::parse_duration
    )]
    probe_timeout: Duration,
}

#[derive(Parser)]
struct ArgsApplyRoute {
    #[command(flatten)]
    config: Config,

    #[clap(help = "Ingress manifest, or - to read it from stdin")]
    manifest: PathBuf,
}

#[derive(Parser)]
struct ArgsDeleteRoute {
    #[command(flatten)]
    config: Config,

    #[clap(short, long, default_value = "default")]
    namespace: String,

    #[clap(help = "Ingress name")]
    name: String,

    #[clap(long, help = "Also delete the panel sites of every host of the Ingress")]
    delete_panel_site: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install().expect("color_eyre init");
    tracing_subscriber::fmt::init();

    match Args::parse() {
        Args::Controller(config) => {
            run_controller(config).await?;
        }
        Args::SyncOnce(config) => {
            sync_once(config).await?;
        }
        Args::ListSites(config) => {
            let panel = BaotaClient::new(&config.baota_url, &config.baota_api_key)?;
            for site in sites::list_sites(&panel).await? {
                let id = site.id.map(|id| id.to_string()).unwrap_or_default();
                println!("{:<6} {:<40} ssl={}", id, site.name, site.has_ssl());
            }
        }
        Args::Check(ArgsCheck {
            config,
            nameserver,
            probe_timeout,
        }) => {
            let client = kube::Client::try_default().await?;
            let panel = BaotaClient::new(&config.baota_url, &config.baota_api_key)?;
            let report = health::check(&config, &panel, &client, nameserver, probe_timeout).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Args::ApplyRoute(args) => {
            apply_route(args).await?;
        }
        Args::DeleteRoute(args) => {
            delete_route(args).await?;
        }
    }

    Ok(())
}

fn build_engine(config: Config, client: kube::Client) -> Result<Engine> {
    let panel = Arc::new(BaotaClient::new(&config.baota_url, &config.baota_api_key)?);
    let cluster = Arc::new(IngressStore::new(client));
    Ok(Engine::new(config, panel, cluster))
}

async fn run_controller(config: Config) -> Result<()> {
    let client = kube::Client::try_default().await?;
    let engine = Arc::new(build_engine(config, client.clone())?);
    let trigger = Trigger::new(engine.clone());

    info!("Starting controller");

    tokio::select! {
        _ = scheduler::run_periodic(engine) => {}
        _ = scheduler::watch_ingresses(client, trigger) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Controller stopped");

    Ok(())
}

async fn sync_once(config: Config) -> Result<()> {
    let client = kube::Client::try_default().await?;
    run_and_print(build_engine(config, client)?).await
}

async fn run_and_print(engine: Engine) -> Result<()> {
    if let PassOutcome::Completed(report) = engine.reconcile_pass().await? {
        info!(
            applied = ?report.applied,
            failed = ?report.failed,
            reverse_deleted = ?report.reverse_deleted,
            "pass {} done",
            report.pass
        );
    }

    let rows = engine.status_rows().await?;
    println!("{}", serde_json::to_string_pretty(&rows)?);

    Ok(())
}

async fn delete_route(
    ArgsDeleteRoute {
        config,
        namespace,
        name,
        delete_panel_site,
    }: ArgsDeleteRoute,
) -> Result<()> {
    let client = kube::Client::try_default().await?;
    let ingress = Api::<Ingress>::namespaced(client.clone(), &namespace)
        .get(&name)
        .await?;
    let resource = RoutingResource::from(&ingress).ensure_managed()?;

    if delete_panel_site {
        let panel = BaotaClient::new(&config.baota_url, &config.baota_api_key)?;
        for host in resource.target_hosts() {
            match sites::delete_site(&panel, host).await {
                Ok(true) => info!("deleted panel site {host:?}"),
                Ok(false) => warn!("panel has no site {host:?}"),
                Err(err) => error!("unable to delete panel site {host:?}: {err}"),
            }
        }
    }

    IngressStore::new(client).delete(&namespace, &name).await?;
    info!("deleted Ingress {namespace}/{name}");

    Ok(())
}

async fn apply_route(ArgsApplyRoute { config, manifest }: ArgsApplyRoute) -> Result<()> {
    let yaml = if manifest.as_os_str() == "-" {
        let mut yaml = String::new();
        std::io::stdin().read_to_string(&mut yaml)?;
        yaml
    } else {
        std::fs::read_to_string(&manifest)?
    };
    let ingress = resources::parse_manifest(&yaml)?;

    let client = kube::Client::try_default().await?;
    let applied = IngressStore::new(client.clone()).apply(ingress).await?;
    let resource = RoutingResource::from(&applied);
    info!("applied Ingress {}/{}", resource.namespace, resource.name);

    if !resource.is_opted_in() {
        warn!("Ingress {}/{} is not opted in, it will not be synchronized", resource.namespace, resource.name);
    }

    run_and_print(build_engine(config, client)?).await
}
