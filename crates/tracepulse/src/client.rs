use anyhow::Context;
use reqwest::{Method, RequestBuilder, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracepulse_core::config::Config;
use tracepulse_ingest::api::{ErrorEnvelope, TENANT_HEADER};

/// HTTP client for the query server.
#[derive(Clone)]
pub struct QueryClient {
    http: reqwest::Client,
    base: String,
    tenant: Option<String>,
}

impl QueryClient {
    pub fn new(addr: Option<String>, tenant: Option<String>) -> Self {
        let addr = addr
            .or_else(|| std::env::var("TRACEPULSE_QUERY_HTTP_ADDR").ok())
            .unwrap_or_else(|| Config::default().query_http_addr);
        let base = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.trim_end_matches('/').to_string()
        } else {
            format!("http://{addr}")
        };
        let tenant = tenant.or_else(|| std::env::var("TRACEPULSE_TENANT").ok());
        Self {
            http: reqwest::Client::new(),
            base,
            tenant,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    pub fn tenant(&self) -> Option<&str> {
        self.tenant.as_deref()
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.http.request(method, format!("{}{path}", self.base));
        match &self.tenant {
            Some(tenant) => builder.header(TENANT_HEADER, tenant),
            None => builder,
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> anyhow::Result<T> {
        self.get_json::<T, [(&str, &str)]>(path, &[]).await
    }

    pub async fn get_json<T: DeserializeOwned, Q: Serialize + ?Sized>(
        &self,
        path: &str,
        query: &Q,
    ) -> anyhow::Result<T> {
        let response = self
            .request(Method::GET, path)
            .query(query)
            .send()
            .await
            .with_context(|| format!("GET {path}"))?;
        decode(response).await
    }

    pub async fn get_bytes(&self, path: &str) -> anyhow::Result<(Vec<u8>, Option<String>)> {
        let response = self
            .request(Method::GET, path)
            .send()
            .await
            .with_context(|| format!("GET {path}"))?;
        let response = check(response).await?;
        let filename = response
            .headers()
            .get(reqwest::header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split("filename=\"").nth(1))
            .map(|v| v.trim_end_matches('"').to_string());
        let bytes = response.bytes().await.context("read response body")?;
        Ok((bytes.to_vec(), filename))
    }

    pub async fn send_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> anyhow::Result<T> {
        let mut builder = self.request(method.clone(), path);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let response = builder
            .send()
            .await
            .with_context(|| format!("{method} {path}"))?;
        decode(response).await
    }
}

async fn check(response: Response) -> anyhow::Result<Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorEnvelope>(&text) {
        Ok(envelope) => anyhow::bail!(
            "{} ({}): {}",
            envelope.error.kind,
            status,
            envelope.error.message
        ),
        Err(_) => anyhow::bail!("request failed with status {status}: {text}"),
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> anyhow::Result<T> {
    let response = check(response).await?;
    response.json::<T>().await.context("decode response body")
}
