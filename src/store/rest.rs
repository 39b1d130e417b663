/// HTTP-speaking key-value backend.
///
/// Talks to a Redis-compatible REST gateway: every call is a POST of a
/// single command encoded as a JSON array of strings, answered with
/// `{"result": ...}` or `{"error": "..."}`. One command per request; the
/// store never pipelines.
use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::Value;

use super::kv::KvStore;

/// Connection settings for the REST backend.
#[derive(Debug, Clone)]
pub(crate) struct RestKvConfig {
    pub(crate) base_url: String,
    pub(crate) token: Option<String>,
    pub(crate) connect_timeout: Duration,
    pub(crate) total_timeout: Duration,
}

/// Response envelope of the command endpoint.
#[derive(Debug, Deserialize)]
struct CommandResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct RestKvStore {
    client: Client,
    base_url: Url,
    token: Option<String>,
}

impl RestKvStore {
    /// # Errors
    /// Returns an error when the URL does not parse or the HTTP client
    /// cannot be built.
    pub(crate) fn new(config: RestKvConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.total_timeout)
            .build()
            .context("failed to build kv HTTP client")?;

        let base_url = Url::parse(&config.base_url).context("invalid kv base URL")?;

        Ok(Self {
            client,
            base_url,
            token: config.token,
        })
    }

    async fn command(&self, parts: &[String]) -> Result<Value> {
        let name = parts.first().map_or("", String::as_str);

        let mut request = self.client.post(self.base_url.clone()).json(&parts);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("kv command {name} failed"))?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            bail!("kv command {name} returned status {status}: {error_body}");
        }

        let parsed: CommandResponse = response
            .json()
            .await
            .with_context(|| format!("failed to deserialize kv response for {name}"))?;

        if let Some(error) = parsed.error {
            bail!("kv command {name} was rejected: {error}");
        }

        Ok(parsed.result.unwrap_or(Value::Null))
    }
}

#[async_trait]
impl KvStore for RestKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let result = self.command(&cmd(&["GET", key])).await?;
        opt_string_result(result)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut parts = cmd(&["SET", key, value]);
        if let Some(ttl) = ttl {
            parts.push("EX".to_string());
            parts.push(ttl_seconds(ttl));
        }
        self.command(&parts).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.command(&cmd(&["DEL", key])).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        self.command(&cmd(&["EXPIRE", key, &ttl_seconds(ttl)]))
            .await?;
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        let result = self.command(&cmd(&["HGET", key, field])).await?;
        opt_string_result(result)
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.command(&cmd(&["HSET", key, field, value])).await?;
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let result = self.command(&cmd(&["HGETALL", key])).await?;
        let flat = string_array_result(result)?;
        if flat.len() % 2 != 0 {
            bail!("kv returned an odd number of hash entries for {key}");
        }
        let mut map = HashMap::with_capacity(flat.len() / 2);
        let mut entries = flat.into_iter();
        while let (Some(field), Some(value)) = (entries.next(), entries.next()) {
            map.insert(field, value);
        }
        Ok(map)
    }

    async fn list_push(&self, key: &str, values: &[String]) -> Result<u64> {
        let mut parts = cmd(&["RPUSH", key]);
        parts.extend(values.iter().cloned());
        let result = self.command(&parts).await?;
        int_result(&result)
    }

    async fn list_pop(&self, key: &str, count: usize) -> Result<Vec<String>> {
        let result = self
            .command(&cmd(&["LPOP", key, &count.to_string()]))
            .await?;
        string_array_result(result)
    }

    async fn list_len(&self, key: &str) -> Result<u64> {
        let result = self.command(&cmd(&["LLEN", key])).await?;
        int_result(&result)
    }

    async fn set_add(&self, key: &str, members: &[String]) -> Result<u64> {
        let mut parts = cmd(&["SADD", key]);
        parts.extend(members.iter().cloned());
        let result = self.command(&parts).await?;
        int_result(&result)
    }

    async fn set_is_member(&self, key: &str, member: &str) -> Result<bool> {
        let result = self.command(&cmd(&["SISMEMBER", key, member])).await?;
        Ok(int_result(&result)? == 1)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let result = self.command(&cmd(&["SMEMBERS", key])).await?;
        string_array_result(result)
    }

    async fn set_card(&self, key: &str) -> Result<u64> {
        let result = self.command(&cmd(&["SCARD", key])).await?;
        int_result(&result)
    }

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>> {
        let result = self.command(&cmd(&["KEYS", pattern])).await?;
        string_array_result(result)
    }
}

fn cmd(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|part| (*part).to_string()).collect()
}

// The gateway rejects EX 0, so sub-second TTLs round up to one second.
fn ttl_seconds(ttl: Duration) -> String {
    ttl.as_secs().max(1).to_string()
}

fn int_result(value: &Value) -> Result<u64> {
    value
        .as_u64()
        .with_context(|| format!("kv returned a non-integer result: {value}"))
}

fn opt_string_result(value: Value) -> Result<Option<String>> {
    match value {
        Value::Null => Ok(None),
        Value::String(text) => Ok(Some(text)),
        other => bail!("kv returned an unexpected result: {other}"),
    }
}

fn string_array_result(value: Value) -> Result<Vec<String>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(entries) => entries
            .into_iter()
            .map(|entry| match entry {
                Value::String(text) => Ok(text),
                other => bail!("kv returned a non-string array element: {other}"),
            })
            .collect(),
        other => bail!("kv returned an unexpected result: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn test_store(base_url: String) -> RestKvStore {
        RestKvStore::new(RestKvConfig {
            base_url,
            token: Some("kv-secret".to_string()),
            connect_timeout: Duration::from_secs(1),
            total_timeout: Duration::from_secs(2),
        })
        .expect("store should build")
    }

    #[tokio::test]
    async fn get_sends_bearer_token_and_parses_value() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .and(header("authorization", "Bearer kv-secret"))
            .and(body_json(json!(["GET", "digest:job:active"])))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": "abc"})))
            .mount(&server)
            .await;

        let store = test_store(server.uri());
        let value = store.get("digest:job:active").await.expect("get");
        assert_eq!(value.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn get_of_missing_key_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_json(json!(["GET", "missing"])))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": null})))
            .mount(&server)
            .await;

        let store = test_store(server.uri());
        assert_eq!(store.get("missing").await.expect("get"), None);
    }

    #[tokio::test]
    async fn set_with_ttl_appends_expiry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_json(json!(["SET", "k", "v", "EX", "60"])))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": "OK"})))
            .mount(&server)
            .await;

        let store = test_store(server.uri());
        store
            .set("k", "v", Some(Duration::from_secs(60)))
            .await
            .expect("set");
    }

    #[tokio::test]
    async fn list_pop_handles_array_and_null_results() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_json(json!(["LPOP", "queue", "2"])))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"result": ["a", "b"]})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_json(json!(["LPOP", "empty", "2"])))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": null})))
            .mount(&server)
            .await;

        let store = test_store(server.uri());
        assert_eq!(
            store.list_pop("queue", 2).await.expect("pop"),
            vec!["a".to_string(), "b".to_string()]
        );
        assert!(store.list_pop("empty", 2).await.expect("pop").is_empty());
    }

    #[tokio::test]
    async fn hash_get_all_parses_flat_pairs() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_json(json!(["HGETALL", "items"])))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"result": ["f1", "v1", "f2", "v2"]})),
            )
            .mount(&server)
            .await;

        let store = test_store(server.uri());
        let map = store.hash_get_all("items").await.expect("hgetall");
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("f1").map(String::as_str), Some("v1"));
        assert_eq!(map.get("f2").map(String::as_str), Some("v2"));
    }

    #[tokio::test]
    async fn set_is_member_maps_integers_to_bool() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_json(json!(["SISMEMBER", "seen", "yes"])))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": 1})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_json(json!(["SISMEMBER", "seen", "no"])))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": 0})))
            .mount(&server)
            .await;

        let store = test_store(server.uri());
        assert!(store.set_is_member("seen", "yes").await.expect("check"));
        assert!(!store.set_is_member("seen", "no").await.expect("check"));
    }

    #[tokio::test]
    async fn rejected_command_surfaces_the_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"error": "ERR unknown command"})),
            )
            .mount(&server)
            .await;

        let store = test_store(server.uri());
        let error = store.get("k").await.expect_err("should fail");
        assert!(error.to_string().contains("rejected"));
    }

    #[tokio::test]
    async fn http_error_status_surfaces_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
            .mount(&server)
            .await;

        let store = test_store(server.uri());
        let error = store.get("k").await.expect_err("should fail");
        assert!(error.to_string().contains("401"));
    }
}
