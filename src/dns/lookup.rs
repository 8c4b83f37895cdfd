use eyre::Result;
use rsdns::{
    clients::{
        tokio::Client,
        ClientConfig,
    },
    records::{
        data::A,
        Class,
    },
};
use std::net::{
    Ipv4Addr,
    SocketAddr,
};

/// Reduces a configured DDNS host such as `http://home.example.com:8080` to its bare hostname.
pub fn bare_host(ddns_host: &str) -> &str {
    let host = ddns_host
        .strip_prefix("http://")
        .or_else(|| ddns_host.strip_prefix("https://"))
        .unwrap_or(ddns_host);
    host.split([':', '/']).next().unwrap_or_default()
}

/// IPv4 addresses `qname` resolves to, asked of `nameserver`.
pub async fn resolve_ipv4(qname: &str, nameserver: SocketAddr) -> Result<Vec<Ipv4Addr>> {
    debug!(?qname, %nameserver, "A record lookup...");

    let config = ClientConfig::with_nameserver(nameserver);
    let mut client = Client::new(config).await?;
    let rrset = client.query_rrset::<A>(qname, Class::IN).await?;

    Ok(rrset.rdata.iter().map(|a| a.address).collect())
}
