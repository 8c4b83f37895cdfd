//! Read-only view of synchronization status, for whatever renders it (CLI output, dashboards).

use crate::{
    engine::Engine,
    error::Result,
    panel::sites,
    resources::RoutingResource,
    state::STATUS_SYNCED,
};
use serde::Serialize;
use std::collections::HashSet;

/// Appended to a synced status when the Ingress wants TLS but the panel site has no certificate.
pub const SSL_MISSING_SUFFIX: &str = " (⚠️ 宝塔未配置证书)";

/// One row per opted-in Ingress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRow {
    pub namespace: String,
    pub name: String,
    pub domain: String,
    pub scheme: String,
    pub ddns_port: String,
    pub created_at: Option<String>,
    pub status: String,
}

impl Engine {
    /// Human readable status of `domain`: live progress if an action is running, otherwise synced
    /// or queued depending on whether `expected_upstream` was the last upstream applied.
    pub fn status_line(&self, domain: &str, expected_upstream: &str) -> String {
        self.state().status(domain, expected_upstream)
    }

    /// Status rows for every opted-in Ingress. The panel is asked which sites have SSL; if that
    /// fails the TLS warning is simply not shown.
    pub async fn status_rows(&self) -> Result<Vec<StatusRow>> {
        let resources = self.cluster().list().await?;
        let ssl_sites: HashSet<String> = match sites::list_sites(self.panel()).await {
            Ok(sites) => sites
                .into_iter()
                .filter(|site| site.has_ssl())
                .map(|site| site.name)
                .collect(),
            Err(err) => {
                debug!("unable to read panel ssl state: {err}");
                HashSet::new()
            }
        };
        Ok(self.rows_for(&resources, &ssl_sites))
    }

    fn rows_for(&self, resources: &[RoutingResource], ssl_sites: &HashSet<String>) -> Vec<StatusRow> {
        let config = self.config();
        resources
            .iter()
            .filter(|resource| resource.is_opted_in())
            .map(|resource| {
                let ddns_port = match resource.port_override() {
                    Some(port) if !port.is_empty() => port.to_string(),
                    _ => config.default_port.clone(),
                };
                let domain = resource
                    .target_hosts()
                    .next()
                    .unwrap_or("N/A")
                    .to_string();

                let mut status = self.status_line(&domain, &config.upstream_for(Some(ddns_port.as_str())));
                if resource.tls && status == STATUS_SYNCED && !ssl_sites.contains(&domain) {
                    status.push_str(SSL_MISSING_SUFFIX);
                }

                StatusRow {
                    namespace: resource.namespace.clone(),
                    name: resource.name.clone(),
                    scheme: if resource.tls { "https" } else { "http" }.to_string(),
                    domain,
                    ddns_port,
                    created_at: resource.created_at.clone(),
                    status,
                }
            })
            .collect()
    }
}
