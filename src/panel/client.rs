use crate::error::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::{
    collections::BTreeMap,
    time::Duration,
};

/// Form fields of a panel request.
pub type Form = BTreeMap<String, String>;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Transport to the panel: a form-encoded POST to `path` that yields the raw response body.
///
/// The HTTP status is not inspected; the panel reports success or failure inside the body.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PanelApi: Send + Sync {
    async fn post(&self, path: &str, params: Form) -> Result<String>;
}

/// Signs and sends requests to a BT panel.
pub struct BaotaClient {
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl BaotaClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        // Panels on a LAN usually run with self-signed certificates.
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            http,
        })
    }
}

#[async_trait]
impl PanelApi for BaotaClient {
    async fn post(&self, path: &str, params: Form) -> Result<String> {
        let url = endpoint(&self.base_url, path);
        let form = signed_form(&self.api_key, Utc::now().timestamp(), params);

        trace!(%url, "panel request");

        let res = self
            .http
            .post(&url)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .form(&form)
            .send()
            .await?;

        let body = res.text().await?;
        trace!(%url, len = body.len(), "panel response");

        Ok(body)
    }
}

/// Joins the panel base URL and an API path (which may carry a query string) with exactly one `/`.
pub fn endpoint(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

/// `md5(request_time ++ md5(api_key))`, both digests as lowercase hex.
pub fn request_token(api_key: &str, request_time: &str) -> String {
    let key_digest = format!("{:x}", md5::compute(api_key.as_bytes()));
    format!("{:x}", md5::compute(format!("{request_time}{key_digest}").as_bytes()))
}

/// Adds `request_time` and `request_token` to `params`. Caller supplied values never replace them.
pub fn signed_form(api_key: &str, now: i64, params: Form) -> Form {
    let request_time = now.to_string();
    let request_token = request_token(api_key, &request_time);

    let mut form: Form = params
        .into_iter()
        .filter(|(key, _)| key != "request_time" && key != "request_token")
        .collect();
    form.insert("request_time".to_string(), request_time);
    form.insert("request_token".to_string(), request_token);
    form
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::{
        io::{
            AsyncReadExt,
            AsyncWriteExt,
        },
        net::TcpListener,
    };

    /// Accepts one connection and answers with the raw request it received.
    async fn echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);

                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let content_length = text[..head_end]
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if request.len() >= head_end + 4 + content_length {
                        break;
                    }
                }
            }

            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                request.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.write_all(&request).await.unwrap();
            socket.shutdown().await.unwrap();
        });

        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn post_sends_signed_form_body() {
        let base_url = echo_server().await;
        let client = BaotaClient::new(base_url, "secret").unwrap();

        let params = Form::from([("table".to_string(), "sites".to_string())]);
        let echoed = client.post("/data?action=getData", params).await.unwrap();

        let (head, body) = echoed.split_once("\r\n\r\n").unwrap();
        let head = head.to_ascii_lowercase();
        assert!(head.starts_with("post /data?action=getdata http/1.1"));
        assert!(head.contains("content-type: application/x-www-form-urlencoded"));

        let fields: BTreeMap<&str, &str> = body
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .collect();
        assert_eq!(fields["table"], "sites");
        assert_eq!(fields["request_token"], request_token("secret", fields["request_time"]));
        assert!(fields["request_time"].parse::<i64>().is_ok());
    }

    #[test]
    fn endpoint_joins_with_single_slash() {
        assert_eq!(
            endpoint("http://panel:8888/", "/site?action=AddSite"),
            "http://panel:8888/site?action=AddSite"
        );
        assert_eq!(
            endpoint("http://panel:8888", "site?action=AddSite"),
            "http://panel:8888/site?action=AddSite"
        );
        assert_eq!(
            endpoint("https://panel:8888//", "/data?action=getData"),
            "https://panel:8888/data?action=getData"
        );
    }

    #[test]
    fn token_is_md5_of_time_and_hashed_key() {
        // md5("") = d41d8cd98f00b204e9800998ecf8427e
        let expected = format!("{:x}", md5::compute("1700000000d41d8cd98f00b204e9800998ecf8427e"));
        assert_eq!(request_token("", "1700000000"), expected);

        let token = request_token("secret", "1700000000");
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(token, request_token("secret", "1700000001"));
    }

    #[test]
    fn signing_fields_cannot_be_overridden() {
        let params = Form::from([
            ("table".to_string(), "sites".to_string()),
            ("request_time".to_string(), "0".to_string()),
            ("request_token".to_string(), "forged".to_string()),
        ]);

        let form = signed_form("secret", 1_700_000_000, params);

        assert_eq!(form["table"], "sites");
        assert_eq!(form["request_time"], "1700000000");
        assert_eq!(form["request_token"], request_token("secret", "1700000000"));
        assert_eq!(form.len(), 3);
    }
}
