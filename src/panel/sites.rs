use super::client::{
    Form,
    PanelApi,
};
use crate::error::{
    Error,
    Result,
};
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value;

/// Name of the proxy rule this controller owns on every managed site.
pub const MANAGED_PROXY_NAME: &str = "kube-bt-sync-proxy";

/// Remark attached to sites created by this controller.
pub const SITE_REMARK: &str = "[kube-bt-sync]";

const SITE_ROOT: &str = "/www/wwwroot/";

const EMPTY_SUBFILTER: &str = r#"[{"sub1":"","sub2":""},{"sub1":"","sub2":""},{"sub1":"","sub2":""}]"#;

const ALREADY_EXISTS_MARKERS: &[&str] = &["already exists", "已存在"];
const FAILURE_MARKERS: &[&str] = &["错误", "失败", "error", "failed"];
const AUTH_FAILURE_MARKERS: &[&str] = &["API校验失败", "IP不在白名单"];

/// A site as listed by `/data?action=getData&table=sites`.
#[derive(Debug, Clone, Deserialize)]
pub struct PanelSite {
    #[serde(default)]
    pub id: Option<i64>,
    pub name: String,
    #[serde(default)]
    ssl: Value,
}

impl PanelSite {
    /// The panel reports a positive `ssl` value once a certificate is deployed.
    pub fn has_ssl(&self) -> bool {
        self.ssl.as_f64().is_some_and(|ssl| ssl > 0.0)
    }
}

/// A proxy rule as listed by `/site?action=GetProxyList`.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyRule {
    pub proxyname: String,
    #[serde(default)]
    pub proxysite: String,
}

/// How the panel answered a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    AlreadyExists,
    Rejected(String),
}

/// The panel expects the primary domain wrapped in this structure.
#[derive(Serialize)]
struct WebName<'a> {
    domain: &'a str,
    domainlist: [&'a str; 0],
    count: u32,
}

#[derive(Deserialize)]
struct Reply {
    status: bool,
    #[serde(default)]
    msg: Value,
}

/// Classifies a write response.
///
/// "Already exists" wins over everything else. A `{status, msg}` body is trusted as is; anything
/// else falls back to looking for failure markers in the raw text.
pub fn classify(body: &str) -> Verdict {
    if ALREADY_EXISTS_MARKERS.iter().any(|marker| body.contains(marker)) {
        return Verdict::AlreadyExists;
    }

    if let Ok(reply) = serde_json::from_str::<Reply>(body) {
        return if reply.status {
            Verdict::Accepted
        } else {
            Verdict::Rejected(reply_message(&reply.msg, body))
        };
    }

    if FAILURE_MARKERS.iter().any(|marker| body.contains(marker)) {
        return Verdict::Rejected(body.to_string());
    }

    Verdict::Accepted
}

fn reply_message(msg: &Value, body: &str) -> String {
    match msg {
        Value::String(msg) => msg.clone(),
        Value::Null => body.to_string(),
        other => other.to_string(),
    }
}

fn form<const N: usize>(pairs: [(&str, &str); N]) -> Form {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

/// Lists every site on the panel. Any failure to read a `data` array is reported as
/// [`Error::AmbiguousPanelState`] so callers never act on a partial view.
pub async fn list_sites(panel: &dyn PanelApi) -> Result<Vec<PanelSite>> {
    let body = panel
        .post("/data?action=getData", form([("table", "sites"), ("limit", "1000")]))
        .await
        .map_err(|err| Error::ambiguous(format!("site listing failed: {err}")))?;
    parse_site_listing(&body)
}

/// Looks up a single site by its primary domain.
pub async fn find_site(panel: &dyn PanelApi, domain: &str) -> Result<Option<PanelSite>> {
    let body = panel
        .post("/data?action=getData", form([("table", "sites"), ("search", domain)]))
        .await?;
    let sites = parse_site_listing(&body)?;
    Ok(sites.into_iter().find(|site| site.name == domain))
}

fn parse_site_listing(body: &str) -> Result<Vec<PanelSite>> {
    let value: Value =
        serde_json::from_str(body).map_err(|err| Error::ambiguous(format!("site listing is not json: {err}")))?;
    let Some(items) = value.get("data").and_then(Value::as_array) else {
        return Err(Error::ambiguous("site listing has no data array"));
    };
    Ok(items
        .iter()
        .filter_map(|item| PanelSite::deserialize(item).ok())
        .collect())
}

/// Creates a site for `domain`. The response is returned unparsed: a site that already exists is
/// not a problem for the caller.
pub async fn add_site(panel: &dyn PanelApi, domain: &str) -> Result<String> {
    let webname = serde_json::to_string(&WebName {
        domain,
        domainlist: [],
        count: 0,
    })?;
    let path = format!("{SITE_ROOT}{domain}");

    info!(?domain, "creating panel site");

    panel
        .post(
            "/site?action=AddSite",
            form([
                ("webname", webname.as_str()),
                ("path", path.as_str()),
                ("type_id", "0"),
                ("type", "PHP"),
                ("version", "00"),
                ("port", "80"),
                ("ps", SITE_REMARK),
            ]),
        )
        .await
}

fn proxy_form(domain: &str, upstream: &str) -> Form {
    form([
        ("sitename", domain),
        ("proxyname", MANAGED_PROXY_NAME),
        ("proxydir", "/"),
        ("proxysite", upstream),
        ("todomain", "$host"),
        ("advanced", "0"),
        ("cache", "0"),
        ("cachetime", "1"),
        ("type", "1"),
        ("subfilter", EMPTY_SUBFILTER),
    ])
}

/// Attaches the managed reverse proxy to `domain`.
pub async fn create_proxy(panel: &dyn PanelApi, domain: &str, upstream: &str) -> Result<Verdict> {
    info!(?domain, ?upstream, "creating reverse proxy");
    let body = panel
        .post("/site?action=CreateProxy", proxy_form(domain, upstream))
        .await?;
    Ok(classify(&body))
}

/// Rewrites the managed reverse proxy of `domain` to point at `upstream`.
pub async fn modify_proxy(panel: &dyn PanelApi, domain: &str, upstream: &str) -> Result<Verdict> {
    info!(?domain, ?upstream, "updating reverse proxy");
    let body = panel
        .post("/site?action=ModifyProxy", proxy_form(domain, upstream))
        .await?;
    Ok(classify(&body))
}

/// Reads back the proxy rules configured on `domain`.
pub async fn proxy_list(panel: &dyn PanelApi, domain: &str) -> Result<Vec<ProxyRule>> {
    let body = panel
        .post("/site?action=GetProxyList", form([("sitename", domain)]))
        .await?;
    let items: Vec<Value> = serde_json::from_str(&body)?;
    Ok(items
        .iter()
        .filter_map(|item| ProxyRule::deserialize(item).ok())
        .collect())
}

/// Deletes the site whose primary domain is `domain`. Returns `false` if the panel has no such site.
pub async fn delete_site(panel: &dyn PanelApi, domain: &str) -> Result<bool> {
    let Some(site) = find_site(panel, domain).await? else {
        debug!(?domain, "no panel site to delete");
        return Ok(false);
    };
    let Some(id) = site.id else {
        return Err(Error::ambiguous(format!("panel site {domain:?} has no id")));
    };

    info!(?domain, id, "deleting panel site");

    let id = id.to_string();
    let body = panel
        .post("/site?action=DeleteSite", form([("id", id.as_str()), ("webname", domain)]))
        .await?;

    match classify(&body) {
        Verdict::Rejected(msg) => Err(Error::rejection(msg)),
        Verdict::Accepted | Verdict::AlreadyExists => Ok(true),
    }
}

/// Calls `/system?action=GetSystemTotal` to verify reachability and the API key.
pub async fn system_total(panel: &dyn PanelApi) -> Result<Value> {
    let body = panel.post("/system?action=GetSystemTotal", Form::new()).await?;
    if AUTH_FAILURE_MARKERS.iter().any(|marker| body.contains(marker)) {
        return Err(Error::rejection("API key rejected or caller IP not whitelisted"));
    }
    Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::panel::client::MockPanelApi;

    #[test]
    fn classify_already_exists_beats_failure_markers() {
        assert_eq!(
            classify(r#"{"status": false, "msg": "proxy already exists"}"#),
            Verdict::AlreadyExists
        );
        assert_eq!(
            classify(r#"{"status": false, "msg": "指定反向代理名称或代理文件夹已存在"}"#),
            Verdict::AlreadyExists
        );
    }

    #[test]
    fn classify_structured_reply() {
        assert_eq!(classify(r#"{"status": true, "msg": "添加成功"}"#), Verdict::Accepted);
        assert_eq!(
            classify(r#"{"status": false, "msg": "目标URL格式不正确"}"#),
            Verdict::Rejected("目标URL格式不正确".to_string())
        );
    }

    #[test]
    fn classify_falls_back_to_markers() {
        assert!(matches!(classify("<html>内部错误</html>"), Verdict::Rejected(_)));
        assert!(matches!(classify("操作失败"), Verdict::Rejected(_)));
        assert!(matches!(classify("unexpected error"), Verdict::Rejected(_)));
        assert_eq!(classify("ok"), Verdict::Accepted);
        assert_eq!(classify(""), Verdict::Accepted);
    }

    #[test]
    fn site_listing_is_lenient_per_item() {
        let sites = parse_site_listing(
            r#"{"data": [{"id": 1, "name": "a.example.com", "ssl": 1}, {"id": 2}, {"id": 3, "name": "b.example.com", "ssl": -1}], "page": ""}"#,
        )
        .unwrap();

        assert_eq!(sites.len(), 2);
        assert_eq!(sites[0].name, "a.example.com");
        assert!(sites[0].has_ssl());
        assert!(!sites[1].has_ssl());
    }

    #[test]
    fn site_listing_without_data_is_ambiguous() {
        assert!(matches!(
            parse_site_listing(r#"{"status": false, "msg": "API校验失败"}"#),
            Err(Error::AmbiguousPanelState(_))
        ));
        assert!(matches!(parse_site_listing("<html>"), Err(Error::AmbiguousPanelState(_))));
    }

    #[tokio::test]
    async fn add_site_wraps_domain_in_webname() {
        let mut panel = MockPanelApi::new();
        panel
            .expect_post()
            .withf(|path, params| {
                path.ends_with("action=AddSite")
                    && params["webname"] == r#"{"domain":"a.example.com","domainlist":[],"count":0}"#
                    && params["path"] == "/www/wwwroot/a.example.com"
                    && params["ps"] == SITE_REMARK
                    && params["type"] == "PHP"
                    && params["port"] == "80"
            })
            .times(1)
            .returning(|_, _| Ok(r#"{"siteStatus": true}"#.to_string()));

        add_site(&panel, "a.example.com").await.unwrap();
    }

    #[tokio::test]
    async fn create_proxy_sends_managed_rule() {
        let mut panel = MockPanelApi::new();
        panel
            .expect_post()
            .withf(|path, params| {
                path.ends_with("action=CreateProxy")
                    && params["sitename"] == "a.example.com"
                    && params["proxyname"] == MANAGED_PROXY_NAME
                    && params["proxysite"] == "http://home.example.com:38333"
                    && params["todomain"] == "$host"
                    && params["subfilter"] == EMPTY_SUBFILTER
            })
            .times(1)
            .returning(|_, _| Ok(r#"{"status": true, "msg": "ok"}"#.to_string()));

        let verdict = create_proxy(&panel, "a.example.com", "http://home.example.com:38333")
            .await
            .unwrap();
        assert_eq!(verdict, Verdict::Accepted);
    }

    #[tokio::test]
    async fn delete_site_looks_up_id_first() {
        let mut panel = MockPanelApi::new();
        let mut seq = mockall::Sequence::new();
        panel
            .expect_post()
            .withf(|path, params| path.ends_with("action=getData") && params["search"] == "a.example.com")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| {
                Ok(r#"{"data": [{"id": 7, "name": "sub.a.example.com"}, {"id": 9, "name": "a.example.com"}]}"#.to_string())
            });
        panel
            .expect_post()
            .withf(|path, params| {
                path.ends_with("action=DeleteSite")
                    && *params == form([("id", "9"), ("webname", "a.example.com")])
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(r#"{"status": true, "msg": "站点删除成功"}"#.to_string()));

        assert!(delete_site(&panel, "a.example.com").await.unwrap());
    }

    #[tokio::test]
    async fn delete_site_missing_is_noop() {
        let mut panel = MockPanelApi::new();
        panel
            .expect_post()
            .times(1)
            .returning(|_, _| Ok(r#"{"data": []}"#.to_string()));

        assert!(!delete_site(&panel, "a.example.com").await.unwrap());
    }

    #[tokio::test]
    async fn system_total_detects_bad_key() {
        let mut panel = MockPanelApi::new();
        panel
            .expect_post()
            .returning(|_, _| Ok(r#"{"status": false, "msg": "API校验失败"}"#.to_string()));

        assert!(matches!(system_total(&panel).await, Err(Error::PanelRejection(_))));
    }
}
