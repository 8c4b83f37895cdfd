use crate::error::{
    Error,
    Result,
};
use async_trait::async_trait;
use k8s_openapi::api::networking::v1::Ingress;
use kube::{
    api::{
        DeleteParams,
        ListParams,
        PostParams,
    },
    Api,
};
use std::collections::BTreeMap;

/// `"true"` opts an Ingress into synchronization.
pub const SYNC_ANNOTATION: &str = "kube-bt-sync.io/baota-sync";

/// Overrides the upstream port for every host of an Ingress.
pub const PORT_ANNOTATION: &str = "kube-bt-sync.io/ddns-port";

/// The parts of an Ingress the controller cares about.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoutingResource {
    pub namespace: String,
    pub name: String,
    pub annotations: BTreeMap<String, String>,
    /// One entry per rule, in rule order. Rules without a host are kept as empty strings.
    pub hosts: Vec<String>,
    pub tls: bool,
    pub created_at: Option<String>,
}

impl RoutingResource {
    pub fn is_opted_in(&self) -> bool {
        self.annotations.get(SYNC_ANNOTATION).map(String::as_str) == Some("true")
    }

    pub fn port_override(&self) -> Option<&str> {
        self.annotations.get(PORT_ANNOTATION).map(String::as_str)
    }

    /// Hosts that can become targets.
    pub fn target_hosts(&self) -> impl Iterator<Item = &str> {
        self.hosts.iter().map(String::as_str).filter(|host| !host.is_empty())
    }

    /// Fails unless the Ingress opted into synchronization.
    pub fn ensure_managed(self) -> Result<Self> {
        if self.is_opted_in() {
            Ok(self)
        } else {
            Err(Error::NotManaged(format!("{}/{}", self.namespace, self.name)))
        }
    }
}

/// Parses a single Ingress manifest. A missing namespace means `default`.
pub fn parse_manifest(yaml: &str) -> Result<Ingress> {
    let mut ingress: Ingress = serde_yaml::from_str(yaml)?;
    if ingress.metadata.namespace.as_deref().map_or(true, str::is_empty) {
        ingress.metadata.namespace = Some("default".to_string());
    }
    Ok(ingress)
}

impl From<&Ingress> for RoutingResource {
    fn from(ingress: &Ingress) -> Self {
        let spec = ingress.spec.as_ref();
        Self {
            namespace: ingress.metadata.namespace.clone().unwrap_or_else(|| "default".to_string()),
            name: ingress.metadata.name.clone().unwrap_or_default(),
            annotations: ingress.metadata.annotations.clone().unwrap_or_default(),
            hosts: spec
                .and_then(|spec| spec.rules.as_ref())
                .map(|rules| rules.iter().map(|rule| rule.host.clone().unwrap_or_default()).collect())
                .unwrap_or_default(),
            tls: spec
                .and_then(|spec| spec.tls.as_ref())
                .is_some_and(|tls| !tls.is_empty()),
            created_at: ingress
                .metadata
                .creation_timestamp
                .as_ref()
                .map(|time| time.0.format("%Y-%m-%d %H:%M:%S").to_string()),
        }
    }
}

/// A domain the panel should proxy to `upstream`. Rebuilt on every pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    pub domain: String,
    pub upstream: String,
}

/// The cluster side of the synchronization.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RoutingStore: Send + Sync {
    /// All routing resources across all namespaces.
    async fn list(&self) -> Result<Vec<RoutingResource>>;

    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;
}

/// [`RoutingStore`] backed by `networking.k8s.io/v1` Ingresses.
pub struct IngressStore {
    client: kube::Client,
}

impl IngressStore {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RoutingStore for IngressStore {
    async fn list(&self) -> Result<Vec<RoutingResource>> {
        let ingresses = Api::<Ingress>::all(self.client.clone())
            .list(&ListParams::default())
            .await
            .map_err(Error::ClusterList)?;
        Ok(ingresses.items.iter().map(RoutingResource::from).collect())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        info!("deleting Ingress {namespace}/{name}");
        Api::<Ingress>::namespaced(self.client.clone(), namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }
}

impl IngressStore {
    /// Creates `ingress`, or replaces the existing Ingress of the same name.
    pub async fn apply(&self, mut ingress: Ingress) -> Result<Ingress> {
        let namespace = ingress.metadata.namespace.clone().unwrap_or_else(|| "default".to_string());
        let name = ingress.metadata.name.clone().unwrap_or_default();
        let api = Api::<Ingress>::namespaced(self.client.clone(), &namespace);

        let applied = match api.get_opt(&name).await? {
            Some(existing) => {
                info!("updating Ingress {namespace}/{name}");
                ingress.metadata.resource_version = existing.metadata.resource_version;
                api.replace(&name, &PostParams::default(), &ingress).await?
            }
            None => {
                info!("creating Ingress {namespace}/{name}");
                api.create(&PostParams::default(), &ingress).await?
            }
        };
        Ok(applied)
    }
}

#[cfg(test)]
pub(crate) fn opted_in(namespace: &str, name: &str, hosts: &[&str], port: Option<&str>) -> RoutingResource {
    let mut annotations = BTreeMap::from([(SYNC_ANNOTATION.to_string(), "true".to_string())]);
    if let Some(port) = port {
        annotations.insert(PORT_ANNOTATION.to_string(), port.to_string());
    }
    RoutingResource {
        namespace: namespace.to_string(),
        name: name.to_string(),
        annotations,
        hosts: hosts.iter().map(|host| host.to_string()).collect(),
        tls: false,
        created_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::networking::v1::{
        IngressRule,
        IngressSpec,
        IngressTLS,
    };
    use kube::api::ObjectMeta;

    fn ingress(annotations: &[(&str, &str)], hosts: &[Option<&str>], tls: bool) -> Ingress {
        Ingress {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("apps".to_string()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(key, value)| (key.to_string(), value.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: Some(IngressSpec {
                rules: Some(
                    hosts
                        .iter()
                        .map(|host| IngressRule {
                            host: host.map(str::to_string),
                            ..Default::default()
                        })
                        .collect(),
                ),
                tls: tls.then(|| vec![IngressTLS::default()]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn opt_in_requires_literal_true() {
        let resource = RoutingResource::from(&ingress(&[(SYNC_ANNOTATION, "true")], &[], false));
        assert!(resource.is_opted_in());

        let resource = RoutingResource::from(&ingress(&[(SYNC_ANNOTATION, "yes")], &[], false));
        assert!(!resource.is_opted_in());

        let resource = RoutingResource::from(&ingress(&[], &[], false));
        assert!(!resource.is_opted_in());
    }

    #[test]
    fn empty_hosts_are_not_targets() {
        let resource = RoutingResource::from(&ingress(
            &[(SYNC_ANNOTATION, "true")],
            &[Some("a.example.com"), None, Some(""), Some("b.example.com")],
            true,
        ));

        assert_eq!(resource.namespace, "apps");
        assert_eq!(resource.name, "web");
        assert!(resource.tls);
        assert_eq!(resource.hosts.len(), 4);
        assert_eq!(
            resource.target_hosts().collect::<Vec<_>>(),
            vec!["a.example.com", "b.example.com"]
        );
    }

    #[test]
    fn only_opted_in_ingresses_are_managed() {
        let managed = RoutingResource::from(&ingress(&[(SYNC_ANNOTATION, "true")], &[], false));
        assert_eq!(managed.ensure_managed().unwrap().name, "web");

        let plain = RoutingResource::from(&ingress(&[(PORT_ANNOTATION, "41000")], &[], false));
        match plain.ensure_managed() {
            Err(Error::NotManaged(name)) => assert_eq!(name, "apps/web"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn manifest_defaults_namespace() {
        let ingress = parse_manifest(
            r#"
apiVersion: networking.k8s.io/v1
kind: Ingress
metadata:
  name: web
  annotations:
    kube-bt-sync.io/baota-sync: "true"
    kube-bt-sync.io/ddns-port: "41000"
spec:
  rules:
    - host: a.example.com
"#,
        )
        .unwrap();

        let resource = RoutingResource::from(&ingress);
        assert_eq!(resource.namespace, "default");
        assert_eq!(resource.name, "web");
        assert!(resource.is_opted_in());
        assert_eq!(resource.port_override(), Some("41000"));
        assert_eq!(resource.target_hosts().collect::<Vec<_>>(), vec!["a.example.com"]);
    }

    #[test]
    fn manifest_keeps_explicit_namespace() {
        let ingress = parse_manifest(
            "apiVersion: networking.k8s.io/v1\nkind: Ingress\nmetadata:\n  name: web\n  namespace: apps\n",
        )
        .unwrap();
        assert_eq!(ingress.metadata.namespace.as_deref(), Some("apps"));
    }

    #[test]
    fn malformed_manifest_is_rejected() {
        assert!(matches!(parse_manifest("spec: [unterminated"), Err(Error::Manifest(_))));
    }

    #[test]
    fn ingress_without_spec_has_no_hosts() {
        let resource = RoutingResource::from(&Ingress::default());
        assert_eq!(resource.namespace, "default");
        assert!(resource.hosts.is_empty());
        assert!(!resource.tls);
    }
}
