use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};
use serde_json::{Value, json};
use tokio::sync::RwLock;
use url::Url;

use super::config::normalize_url;
use super::types::{OdooError, OdooErrorBody, OdooResult};

/// Odoo JSON-RPC client against the `/jsonrpc` endpoint (`common.authenticate`
/// + `object.execute_kw`), authenticated with a per-connection API key used
/// as the execute_kw "password" positional argument.
///
/// Unlike a general-purpose ORM client, this one does not retry network
/// errors on its own: a cycle's worker owns all cross-call retry/backoff
/// decisions, so a single failed call here surfaces immediately. The one
/// exception is session expiry, which is re-authenticated and retried
/// exactly once, transparently.
#[derive(Clone)]
pub struct OdooClient {
    base_url: Url,
    db: String,
    login: String,
    api_key: String,
    http: reqwest::Client,
    uid: Arc<RwLock<Option<i64>>>,
}

impl OdooClient {
    /// `pool_max_idle_per_host` bounds how many idle connections this
    /// client keeps open to its Odoo host — a bulkhead so one connection's
    /// polling task can't monopolize the process's HTTP connection budget
    /// (§5).
    pub fn new(
        url: &str,
        db: &str,
        login: &str,
        api_key: &str,
        timeout: Duration,
        pool_max_idle_per_host: usize,
    ) -> OdooResult<Self> {
        let normalized = normalize_url(url);
        let mut base_url = Url::parse(&normalized)
            .map_err(|e| OdooError::InvalidResponse(format!("invalid Odoo url '{url}': {e}")))?;
        base_url.set_path("");
        base_url.set_query(None);
        base_url.set_fragment(None);

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(pool_max_idle_per_host)
            .build()?;

        Ok(Self {
            base_url,
            db: db.to_string(),
            login: login.to_string(),
            api_key: api_key.to_string(),
            http,
            uid: Arc::new(RwLock::new(None)),
        })
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
        headers.insert(USER_AGENT, HeaderValue::from_static("odoo-order-poller/0.1"));
        headers
    }

    fn jsonrpc_endpoint(&self) -> Url {
        let mut url = self.base_url.clone();
        url.set_path("/jsonrpc");
        url
    }

    fn build_jsonrpc_request(&self, service: &str, method: &str, args: Value) -> Value {
        json!({
            "jsonrpc": "2.0",
            "method": "call",
            "params": {
                "service": service,
                "method": method,
                "args": args
            },
            "id": 1
        })
    }

    async fn jsonrpc_call(&self, service: &str, method: &str, args: Value) -> OdooResult<Value> {
        let url = self.jsonrpc_endpoint();
        let body = self.build_jsonrpc_request(service, method, args);

        let resp = self
            .http
            .post(url)
            .headers(self.headers())
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(OdooError::RateLimited);
        }

        let text = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            let parsed_err: Option<OdooErrorBody> = serde_json::from_str(&text).ok();
            let message = parsed_err
                .as_ref()
                .and_then(|b| b.message.clone())
                .unwrap_or_else(|| text.clone());

            // A bare 401 is session invalidation just as much as a
            // SessionExpiredException error body is — both must hit
            // `execute_kw`'s re-auth-and-retry branch rather than surface
            // as an ordinary API error.
            if status.as_u16() == 401 {
                return Err(OdooError::Auth(message));
            }

            return Err(OdooError::Api {
                status: status.as_u16(),
                message,
                body: parsed_err,
            });
        }

        let v: Value = serde_json::from_str(&text).map_err(|e| {
            OdooError::InvalidResponse(format!("failed to parse JSON-RPC response: {e}. body: {text}"))
        })?;

        if let Some(error) = v.get("error") {
            let body: Option<OdooErrorBody> = error
                .get("data")
                .and_then(|d| serde_json::from_value(d.clone()).ok());
            let message = body
                .as_ref()
                .and_then(|b| b.message.clone())
                .or_else(|| error.get("message").and_then(|m| m.as_str()).map(String::from))
                .unwrap_or_else(|| "unknown JSON-RPC error".to_string());

            if body.as_ref().is_some_and(|b| b.is_session_expired()) {
                return Err(OdooError::Auth(message));
            }

            return Err(OdooError::Api {
                status: 400,
                message,
                body,
            });
        }

        v.get("result")
            .cloned()
            .ok_or_else(|| OdooError::InvalidResponse("JSON-RPC response missing 'result' field".to_string()))
    }

    /// Authenticate and cache the resulting uid. Cheap to call repeatedly:
    /// returns the cached uid without a round-trip once authenticated.
    pub async fn authenticate(&self) -> OdooResult<i64> {
        {
            let cached = self.uid.read().await;
            if let Some(uid) = *cached {
                return Ok(uid);
            }
        }

        let args = json!([self.db, self.login, self.api_key, {}]);
        let result = self.jsonrpc_call("common", "authenticate", args).await?;

        let uid = result
            .as_i64()
            .filter(|uid| *uid != 0)
            .ok_or_else(|| OdooError::Auth(format!("invalid credentials for login '{}'", self.login)))?;

        {
            let mut cached = self.uid.write().await;
            *cached = Some(uid);
        }

        Ok(uid)
    }

    async fn forget_session(&self) {
        let mut cached = self.uid.write().await;
        *cached = None;
    }

    /// Call execute_kw, re-authenticating and retrying exactly once if the
    /// session turns out to have expired underneath the cached uid.
    async fn execute_kw(&self, model: &str, method: &str, args: Value, kwargs: Value) -> OdooResult<Value> {
        let uid = self.authenticate().await?;
        let call_args = json!([self.db, uid, self.api_key, model, method, args, kwargs]);

        match self.jsonrpc_call("object", "execute_kw", call_args.clone()).await {
            Err(OdooError::Auth(_)) => {
                self.forget_session().await;
                let uid = self.authenticate().await?;
                let retried_args = json!([self.db, uid, self.api_key, model, method, args, kwargs]);
                self.jsonrpc_call("object", "execute_kw", retried_args).await
            }
            other => other,
        }
    }

    /// `search_read` omits `limit`/`order` keyword arguments entirely when
    /// unset; Odoo rejects an explicit null for either.
    pub async fn search_read(
        &self,
        model: &str,
        domain: Value,
        fields: &[&str],
        limit: Option<i64>,
        order: Option<&str>,
    ) -> OdooResult<Vec<Value>> {
        let mut kwargs = serde_json::Map::new();
        kwargs.insert("fields".to_string(), json!(fields));
        if let Some(limit) = limit {
            kwargs.insert("limit".to_string(), json!(limit));
        }
        if let Some(order) = order {
            kwargs.insert("order".to_string(), json!(order));
        }

        let result = self
            .execute_kw(model, "search_read", json!([domain]), json!(kwargs))
            .await?;

        serde_json::from_value(result)
            .map_err(|e| OdooError::InvalidResponse(format!("expected array from search_read: {e}")))
    }

    /// Batch-read by id list — never call per-record; always pass the full
    /// id set collected for a cycle.
    pub async fn read(&self, model: &str, ids: &[i64], fields: &[&str]) -> OdooResult<Vec<Value>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let kwargs = json!({ "fields": fields });
        let result = self
            .execute_kw(model, "read", json!([ids]), kwargs)
            .await?;

        serde_json::from_value(result)
            .map_err(|e| OdooError::InvalidResponse(format!("expected array from read: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn make_client(url: &str) -> OdooResult<OdooClient> {
        OdooClient::new(url, "mydb", "admin", "secret-key", Duration::from_secs(5), 4)
    }

    #[test]
    fn test_client_new_success() {
        assert!(make_client("http://localhost:8069").is_ok());
    }

    #[test]
    fn test_client_new_invalid_url() {
        assert!(make_client("not a valid url").is_err());
    }

    #[test]
    fn test_client_normalizes_bare_host() {
        let client = make_client("localhost:8069").unwrap();
        assert_eq!(client.base_url.scheme(), "http");
    }

    #[test]
    fn test_client_strips_path_and_query() {
        let client = make_client("http://localhost:8069/some/path?x=1").unwrap();
        assert_eq!(client.base_url.path(), "/");
        assert!(client.base_url.query().is_none());
    }

    #[test]
    fn test_client_jsonrpc_endpoint() {
        let client = make_client("http://localhost:8069").unwrap();
        assert_eq!(client.jsonrpc_endpoint().path(), "/jsonrpc");
    }

    #[test]
    fn test_client_build_jsonrpc_request() {
        let client = make_client("http://localhost:8069").unwrap();
        let request = client.build_jsonrpc_request("common", "authenticate", json!([]));
        assert_eq!(request["jsonrpc"], "2.0");
        assert_eq!(request["method"], "call");
        assert_eq!(request["params"]["service"], "common");
        assert_eq!(request["params"]["method"], "authenticate");
    }

    #[tokio::test]
    async fn test_authenticate_caches_uid() {
        let client = make_client("http://localhost:8069").unwrap();
        {
            let mut cached = client.uid.write().await;
            *cached = Some(42);
        }
        assert_eq!(client.authenticate().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_forget_session_clears_cache() {
        let client = make_client("http://localhost:8069").unwrap();
        {
            let mut cached = client.uid.write().await;
            *cached = Some(42);
        }
        client.forget_session().await;
        assert!(client.uid.read().await.is_none());
    }

    #[tokio::test]
    async fn test_bare_401_maps_to_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/jsonrpc"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = make_client(&server.uri()).unwrap();
        let err = client.jsonrpc_call("common", "authenticate", json!([])).await.unwrap_err();
        assert!(matches!(err, OdooError::Auth(_)));
    }

    #[tokio::test]
    async fn test_bare_401_on_execute_kw_triggers_reauth_and_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/jsonrpc"))
            .and(body_string_contains("authenticate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": 7})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/jsonrpc"))
            .and(body_string_contains("execute_kw"))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/jsonrpc"))
            .and(body_string_contains("execute_kw"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": []})))
            .priority(2)
            .mount(&server)
            .await;

        let client = make_client(&server.uri()).unwrap();
        let result = client.search_read("sale.order", json!([]), &["id"], None, None).await;
        assert!(result.is_ok(), "a bare 401 should re-authenticate and retry transparently, got {result:?}");
    }
}
