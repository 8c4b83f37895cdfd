//! Environment self-check: can we talk to the panel, does the DDNS host resolve and accept
//! connections, and are the usual cluster add-ons installed.

use crate::{
    config::Config,
    dns::lookup,
    panel::{
        sites,
        PanelApi,
    },
};
use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    api::ListParams,
    Api,
};
use serde::Serialize;
use std::{
    net::{
        Ipv4Addr,
        SocketAddr,
    },
    time::Duration,
};
use tokio::{
    net::TcpStream,
    time::timeout,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct PanelProbe {
    pub status: ProbeStatus,
    pub msg: String,
    pub url: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterProbe {
    pub ingress_installed: bool,
    pub metallb_installed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DdnsProbe {
    pub status: ProbeStatus,
    pub msg: String,
    pub host: String,
    pub ips: Vec<Ipv4Addr>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub panel: PanelProbe,
    pub k8s: ClusterProbe,
    pub ddns: DdnsProbe,
}

pub async fn check(
    config: &Config,
    panel: &dyn PanelApi,
    client: &kube::Client,
    nameserver: SocketAddr,
    probe_timeout: Duration,
) -> HealthReport {
    HealthReport {
        panel: check_panel(config, panel).await,
        k8s: check_cluster(client).await,
        ddns: check_ddns(config, nameserver, probe_timeout).await,
    }
}

pub async fn check_panel(config: &Config, panel: &dyn PanelApi) -> PanelProbe {
    let (status, msg) = match sites::system_total(panel).await {
        Ok(_) => (ProbeStatus::Success, "connected".to_string()),
        Err(err) => (ProbeStatus::Error, err.to_string()),
    };
    PanelProbe {
        status,
        msg,
        url: config.baota_url.clone(),
    }
}

pub async fn check_cluster(client: &kube::Client) -> ClusterProbe {
    match Api::<Deployment>::all(client.clone())
        .list(&ListParams::default())
        .await
    {
        Ok(deployments) => {
            let names: Vec<&str> = deployments
                .items
                .iter()
                .filter_map(|deploy| deploy.metadata.name.as_deref())
                .collect();
            ClusterProbe {
                ingress_installed: names.iter().any(|name| name.contains("ingress-nginx")),
                metallb_installed: names.iter().any(|name| name.contains("metallb")),
            }
        }
        Err(err) => {
            warn!("unable to list deployments: {err}");
            ClusterProbe::default()
        }
    }
}

/// Resolves the DDNS host, then opens a TCP connection to it on the default port.
pub async fn check_ddns(config: &Config, nameserver: SocketAddr, probe_timeout: Duration) -> DdnsProbe {
    let host = lookup::bare_host(&config.ddns_host).to_string();
    let probe = |status: ProbeStatus, msg: String, ips: Vec<Ipv4Addr>| DdnsProbe {
        status,
        msg,
        host: config.ddns_host.clone(),
        ips,
    };

    if host.is_empty() {
        return probe(ProbeStatus::Error, "no DDNS host configured".to_string(), vec![]);
    }

    let ips = match lookup::resolve_ipv4(&host, nameserver).await {
        Ok(ips) if ips.is_empty() => {
            return probe(ProbeStatus::Error, format!("{host} has no IPv4 address"), vec![]);
        }
        Ok(ips) => ips,
        Err(err) => {
            return probe(ProbeStatus::Error, format!("unable to resolve {host}: {err}"), vec![]);
        }
    };

    let port = &config.default_port;
    let Ok(port_number) = port.parse::<u16>() else {
        return probe(ProbeStatus::Error, format!("invalid default port {port:?}"), ips);
    };

    match timeout(probe_timeout, TcpStream::connect((host.as_str(), port_number))).await {
        Ok(Ok(_)) => probe(ProbeStatus::Success, format!("TCP port {port} reachable"), ips),
        Ok(Err(err)) => probe(
            ProbeStatus::Warning,
            format!("{host} resolves but TCP port {port} is closed ({err}); check the router port mapping"),
            ips,
        ),
        Err(_) => probe(
            ProbeStatus::Warning,
            format!("{host} resolves but TCP port {port} timed out; check the router port mapping"),
            ips,
        ),
    }
}
