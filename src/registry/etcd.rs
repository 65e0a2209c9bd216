//! A registry client speaking the etcd v3 JSON gateway protocol.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::Registry;
use crate::config::Config;

/// The timeout applied to each registry request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// The header used to present an auth token.
const HEADER_AUTHORIZATION: &str = "Authorization";

/// A registry backed by an etcd cluster.
pub struct EtcdRegistry {
    client: reqwest::Client,
    endpoint: String,
    credentials: Option<(String, String)>,
    token: RwLock<Option<String>>,
}

impl EtcdRegistry {
    /// Create a new instance, loading any configured CA bundle.
    pub async fn new(config: &Config) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(REQUEST_TIMEOUT);
        if let Some(path) = &config.registry_ca_cert {
            let pem = tokio::fs::read(path)
                .await
                .with_context(|| format!("error reading registry CA bundle {}", path))?;
            let cert = reqwest::Certificate::from_pem(&pem).context("error parsing registry CA bundle")?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder.build().context("error building registry client")?;
        let credentials = match (&config.registry_username, &config.registry_password) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            _ => None,
        };
        Ok(Self {
            client,
            endpoint: config.registry_endpoint.trim_end_matches('/').to_string(),
            credentials,
            token: RwLock::new(None),
        })
    }

    /// Call the given gateway endpoint, authenticating and retrying once if the token was rejected.
    async fn call<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        if self.credentials.is_some() && self.token.read().await.is_none() {
            self.authenticate().await?;
        }
        match self.send(path, body).await? {
            Some(resp) => Ok(resp),
            None if self.credentials.is_some() => {
                tracing::debug!(path, "registry token rejected, re-authenticating");
                self.authenticate().await?;
                self.send(path, body)
                    .await?
                    .ok_or_else(|| anyhow!("registry rejected credentials for {}", path))
            }
            None => bail!("registry requires authentication for {}", path),
        }
    }

    /// Send a single request, returning `None` if it was rejected as unauthenticated.
    async fn send<Req, Resp>(&self, path: &str, body: &Req) -> Result<Option<Resp>>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let mut req = self.client.post(format!("{}{}", self.endpoint, path)).json(body);
        if let Some(token) = self.token.read().await.as_ref() {
            req = req.header(HEADER_AUTHORIZATION, token.as_str());
        }
        let resp = req.send().await.with_context(|| format!("error calling registry {}", path))?;
        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED {
            return Ok(None);
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!("registry returned {} for {}: {}", status, path, text);
        }
        let decoded = resp
            .json::<Resp>()
            .await
            .with_context(|| format!("error decoding registry response for {}", path))?;
        Ok(Some(decoded))
    }

    async fn authenticate(&self) -> Result<()> {
        let (name, password) = match &self.credentials {
            Some(creds) => creds,
            None => return Ok(()),
        };
        let body = AuthenticateRequest { name, password };
        let resp: AuthenticateResponse = self
            .send("/v3/auth/authenticate", &body)
            .await?
            .ok_or_else(|| anyhow!("registry rejected credentials for user {}", name))?;
        *self.token.write().await = Some(resp.token);
        Ok(())
    }
}

#[async_trait]
impl Registry for EtcdRegistry {
    #[tracing::instrument(level = "trace", skip(self, value))]
    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let body = PutRequest { key: encode(key), value: encode(value) };
        let _: serde_json::Value = self.call("/v3/kv/put", &body).await?;
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let body = RangeRequest { key: encode(key), range_end: None };
        let resp: RangeResponse = self.call("/v3/kv/range", &body).await?;
        match resp.kvs.into_iter().next() {
            Some(kv) => Ok(Some(decode(&kv.value)?)),
            None => Ok(None),
        }
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn get_prefix(&self, prefix: &str) -> Result<BTreeMap<String, String>> {
        let body = RangeRequest {
            key: encode(prefix),
            range_end: Some(base64::encode(prefix_range_end(prefix))),
        };
        let resp: RangeResponse = self.call("/v3/kv/range", &body).await?;
        resp.kvs
            .into_iter()
            .map(|kv| Ok((decode(&kv.key)?, decode(&kv.value)?)))
            .collect()
    }

    #[tracing::instrument(level = "trace", skip(self, expected, new))]
    async fn compare_and_swap(&self, key: &str, expected: Option<&str>, new: &str) -> Result<bool> {
        let compare = match expected {
            Some(val) => Compare {
                key: encode(key),
                target: "VALUE",
                result: "EQUAL",
                value: Some(encode(val)),
                create_revision: None,
            },
            None => Compare {
                key: encode(key),
                target: "CREATE",
                result: "EQUAL",
                value: None,
                create_revision: Some("0"),
            },
        };
        let body = TxnRequest {
            compare: vec![compare],
            success: vec![RequestOp {
                request_put: PutRequest { key: encode(key), value: encode(new) },
            }],
        };
        let resp: TxnResponse = self.call("/v3/kv/txn", &body).await?;
        Ok(resp.succeeded)
    }

    #[tracing::instrument(level = "trace", skip(self, value, guard_value))]
    async fn put_guarded(&self, key: &str, value: &str, guard_key: &str, guard_value: &str) -> Result<bool> {
        let body = TxnRequest {
            compare: vec![Compare {
                key: encode(guard_key),
                target: "VALUE",
                result: "EQUAL",
                value: Some(encode(guard_value)),
                create_revision: None,
            }],
            success: vec![RequestOp {
                request_put: PutRequest { key: encode(key), value: encode(value) },
            }],
        };
        let resp: TxnResponse = self.call("/v3/kv/txn", &body).await?;
        Ok(resp.succeeded)
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn delete(&self, key: &str) -> Result<()> {
        let body = RangeRequest { key: encode(key), range_end: None };
        let _: serde_json::Value = self.call("/v3/kv/deleterange", &body).await?;
        Ok(())
    }
}

fn encode(val: &str) -> String {
    base64::encode(val.as_bytes())
}

fn decode(val: &str) -> Result<String> {
    let raw = base64::decode(val).context("error decoding base64 registry data")?;
    String::from_utf8(raw).context("registry data is not valid utf-8")
}

/// Compute the exclusive end of the key range covering every key with the given prefix.
pub(super) fn prefix_range_end(prefix: &str) -> Vec<u8> {
    let mut end = prefix.as_bytes().to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return end;
        }
    }
    // An empty or all-0xff prefix covers the whole keyspace.
    vec![0]
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Gateway Messages //////////////////////////////////////////////////////////////////////////////

#[derive(Serialize)]
struct AuthenticateRequest<'a> {
    name: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct AuthenticateResponse {
    token: String,
}

#[derive(Serialize)]
struct PutRequest {
    key: String,
    value: String,
}

#[derive(Serialize)]
struct RangeRequest {
    key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    range_end: Option<String>,
}

#[derive(Deserialize)]
struct RangeResponse {
    #[serde(default)]
    kvs: Vec<KeyValue>,
}

#[derive(Deserialize)]
struct KeyValue {
    key: String,
    #[serde(default)]
    value: String,
}

#[derive(Serialize)]
struct Compare {
    key: String,
    target: &'static str,
    result: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    create_revision: Option<&'static str>,
}

#[derive(Serialize)]
struct RequestOp {
    request_put: PutRequest,
}

#[derive(Serialize)]
struct TxnRequest {
    compare: Vec<Compare>,
    success: Vec<RequestOp>,
}

#[derive(Deserialize)]
struct TxnResponse {
    /// Omitted by the gateway when false.
    #[serde(default)]
    succeeded: bool,
}
