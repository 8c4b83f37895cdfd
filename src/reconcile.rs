use crate::{
    config::Timings,
    engine::Engine,
    error::{
        Error,
        Result,
    },
    panel::{
        sites::{
            self,
            Verdict,
            MANAGED_PROXY_NAME,
        },
        PanelApi,
    },
    resources::{
        RoutingResource,
        Target,
    },
    state::SyncState,
};
use std::collections::HashSet;
use tokio::time::sleep;

pub const PROGRESS_CREATING_SITE: &str = "⏳ [1/2] 正在调用 API 创建站点...";
pub const PROGRESS_DEBOUNCE: &str = "⏳ 防抖缓冲中 (防止 Nginx 假死)...";
pub const PROGRESS_INJECTING_PROXY: &str = "⏳ [2/2] 正在注入后端反向代理规则...";
pub const PROGRESS_REQUEST_FAILED: &str = "❌ 反代请求发送失败";
pub const PROGRESS_REJECTED: &str = "❌ 宝塔 API 拒绝请求";
pub const PROGRESS_COOLDOWN: &str = "⏳ 触发面板平滑重载 (冷却 3s)...";
pub const PROGRESS_REVERSE_DELETE: &str = "⏳ 宝塔端缺失，正在反向清理 K8s...";

/// What a single pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PassReport {
    pub pass: u64,
    pub deep_check: bool,
    /// Whether the panel site listing of a deep check could be trusted.
    pub panel_fetch_ok: bool,
    pub targets: Vec<Target>,
    pub applied: Vec<String>,
    pub failed: Vec<String>,
    /// Domains whose Ingress was deleted because the panel no longer has the site.
    pub reverse_deleted: Vec<String>,
    pub pruned: Vec<String>,
}

/// Deep checks run on the first pass and on every `every`-th pass after that.
pub fn is_deep_check(pass: u64, every: u64) -> bool {
    pass == 1 || (every > 0 && pass % every == 0)
}

/// One convergence pass. The caller holds the single-flight guard.
#[instrument(level = "debug", skip(engine))]
pub(crate) async fn run_pass(engine: &Engine, pass: u64) -> Result<PassReport> {
    let config = engine.config();
    let state = engine.state();
    let deep_check = is_deep_check(pass, config.deep_check_every);

    let mut report = PassReport {
        pass,
        deep_check,
        ..Default::default()
    };

    // Only a listing that was fetched and parsed may drive deletions.
    let panel_sites: Option<HashSet<String>> = if deep_check {
        match sites::list_sites(engine.panel()).await {
            Ok(sites) => Some(sites.into_iter().map(|site| site.name).collect()),
            Err(err) => {
                warn!("not propagating panel deletions this pass: {err}");
                None
            }
        }
    } else {
        None
    };
    report.panel_fetch_ok = panel_sites.is_some();

    let resources = engine.cluster().list().await.map_err(|err| match err {
        Error::Kube(err) => Error::ClusterList(err),
        err => err,
    })?;

    let mut current_domains = HashSet::new();

    for resource in resources.iter().filter(|resource| resource.is_opted_in()) {
        let upstream = config.upstream_for(resource.port_override());

        for host in resource.target_hosts() {
            if let Some(panel_sites) = &panel_sites {
                if state.is_synced(host) && !panel_sites.contains(host) {
                    match reverse_delete(engine, resource, host).await {
                        Ok(()) => report.reverse_deleted.push(host.to_string()),
                        // Still synced, so the next deep check retries the deletion.
                        Err(_) => {
                            current_domains.insert(host.to_string());
                        }
                    }
                    continue;
                }
            }

            if !current_domains.insert(host.to_string()) {
                warn!(
                    "host {host:?} of Ingress {}/{} is already claimed by another Ingress, ignoring",
                    resource.namespace, resource.name
                );
                continue;
            }

            report.targets.push(Target {
                domain: host.to_string(),
                upstream: upstream.clone(),
            });
        }
    }

    for target in &report.targets {
        if state.synced_upstream(&target.domain).as_deref() == Some(target.upstream.as_str()) {
            continue;
        }

        match ensure_site_and_proxy(engine.panel(), state, engine.timings(), target).await {
            Ok(()) => {
                info!(domain = %target.domain, upstream = %target.upstream, "synchronized");
                state.mark_synced(&target.domain, &target.upstream);
                report.applied.push(target.domain.clone());
            }
            Err(err) => {
                error!(domain = %target.domain, "failed to synchronize: {err}");
                state.clear_synced(&target.domain);
                report.failed.push(target.domain.clone());
            }
        }

        state.clear_progress(&target.domain);
    }

    report.pruned = state.prune_synced(&current_domains);
    if !report.pruned.is_empty() {
        debug!(pruned = ?report.pruned, "dropped domains that are no longer desired");
    }

    info!(
        pass,
        deep_check,
        targets = report.targets.len(),
        applied = report.applied.len(),
        failed = report.failed.len(),
        reverse_deleted = report.reverse_deleted.len(),
        "reconciliation pass finished"
    );

    Ok(report)
}

/// The panel no longer has a site we created, so the Ingress that asked for it is removed too.
///
/// The synced entry is only dropped once the Ingress is gone; otherwise the host would turn into
/// a fresh target and the site would be recreated.
async fn reverse_delete(engine: &Engine, resource: &RoutingResource, host: &str) -> Result<()> {
    let state = engine.state();
    let (ns, name) = (&resource.namespace, &resource.name);

    info!("site {host:?} disappeared from the panel, deleting Ingress {ns}/{name}");
    state.set_progress(host, PROGRESS_REVERSE_DELETE);

    let result = engine.cluster().delete(ns, name).await;
    match &result {
        Ok(()) => state.clear_synced(host),
        Err(err) => warn!("unable to delete Ingress {ns}/{name}, will retry on the next deep check: {err}"),
    }

    state.clear_progress(host);
    result
}

/// Makes sure the panel has a site for `target.domain` whose managed proxy points at
/// `target.upstream`, publishing progress as it goes.
///
/// Progress is left in place on return; clearing it is up to the caller.
pub async fn ensure_site_and_proxy(
    panel: &dyn PanelApi,
    state: &SyncState,
    timings: &Timings,
    target: &Target,
) -> Result<()> {
    let domain = target.domain.as_str();

    state.set_progress(domain, PROGRESS_CREATING_SITE);
    // An existing site is fine, so the answer is not inspected.
    if let Err(err) = sites::add_site(panel, domain).await {
        debug!(?domain, "AddSite request failed: {err}");
    }

    state.set_progress(domain, PROGRESS_DEBOUNCE);
    sleep(timings.debounce).await;

    state.set_progress(domain, PROGRESS_INJECTING_PROXY);
    if let Err(err) = apply_proxy(panel, target).await {
        let progress = match err {
            Error::PanelRejection(_) => PROGRESS_REJECTED,
            _ => PROGRESS_REQUEST_FAILED,
        };
        state.set_progress(domain, progress);
        sleep(timings.failure_linger).await;
        return Err(err);
    }

    state.set_progress(domain, PROGRESS_COOLDOWN);
    sleep(timings.reload_cooldown).await;

    Ok(())
}

async fn apply_proxy(panel: &dyn PanelApi, target: &Target) -> Result<()> {
    match sites::create_proxy(panel, &target.domain, &target.upstream).await? {
        Verdict::Accepted => Ok(()),
        Verdict::AlreadyExists => converge_existing_proxy(panel, target).await,
        Verdict::Rejected(msg) => Err(Error::rejection(msg)),
    }
}

/// A managed proxy already exists. If it can be read back and points elsewhere, rewrite it.
async fn converge_existing_proxy(panel: &dyn PanelApi, target: &Target) -> Result<()> {
    let domain = target.domain.as_str();

    let rules = match sites::proxy_list(panel, domain).await {
        Ok(rules) => rules,
        Err(err) => {
            warn!(?domain, "unable to read back existing proxy, keeping it as is: {err}");
            return Ok(());
        }
    };

    match rules.iter().find(|rule| rule.proxyname == MANAGED_PROXY_NAME) {
        Some(rule) if rule.proxysite != target.upstream => {
            info!(?domain, from = %rule.proxysite, to = %target.upstream, "existing proxy points elsewhere");
            match sites::modify_proxy(panel, domain, &target.upstream).await? {
                Verdict::Rejected(msg) => Err(Error::rejection(msg)),
                Verdict::Accepted | Verdict::AlreadyExists => Ok(()),
            }
        }
        _ => Ok(()),
    }
}
