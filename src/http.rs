// ===============================
// src/http.rs (HTTP surface: status updates, webhooks, metrics)
// ===============================
//
// Routes:
//   PATCH|POST /orders/{id}/status   {status, reason?}
//   POST       /webhooks/orders      (x-api-key) external order intake
//   POST       /webhooks/db-sync     (x-api-key) table change relay
//   POST       /push-tokens          {userId, pushToken}
//   GET        /metrics              Prometheus text
//   GET        /health
//
use chrono::Utc;
use hyper::{
    header::{HeaderValue, CONTENT_TYPE},
    service::{make_service_fn, service_fn},
    Body, HeaderMap, Method, Request, Response, Server, StatusCode,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::domain::{NewOrder, OrderPatch, OrderStatus, OrderSyncNotice};
use crate::hub::NotificationHub;
use crate::metrics::encode_metrics;
use crate::store::{bounded, Store, StoreError};

pub struct HttpState {
    pub store: Arc<dyn Store>,
    pub hub: Arc<NotificationHub>,
    /// `x-api-key` expected on webhooks; `None` disables the check.
    pub api_key: Option<String>,
    pub call_timeout: Duration,
}

pub async fn serve(addr: SocketAddr, state: Arc<HttpState>) -> Result<(), hyper::Error> {
    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(route(req, state).await) }
            }))
        }
    });
    let server = Server::try_bind(&addr)?.serve(make_svc);
    info!(%addr, "http listening (/orders, /webhooks, /push-tokens, /metrics, /health)");
    server.await
}

pub async fn route(req: Request<Body>, state: Arc<HttpState>) -> Response<Body> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    match (&method, segments.as_slice()) {
        (&Method::GET, ["health"]) => json_response(StatusCode::OK, json!({ "status": "ok" })),
        (&Method::GET, ["metrics"]) => {
            let mut resp = Response::new(Body::from(encode_metrics()));
            resp.headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; version=0.0.4"));
            resp
        }
        (&Method::PATCH | &Method::POST, ["orders", id, "status"]) => {
            let id = id.to_string();
            update_status(req, &state, &id).await
        }
        (&Method::POST, ["webhooks", "orders"]) => {
            if !authorized(req.headers(), state.api_key.as_deref()) {
                return unauthorized();
            }
            new_order(req, &state).await
        }
        (&Method::POST, ["webhooks", "db-sync"]) => {
            if !authorized(req.headers(), state.api_key.as_deref()) {
                return unauthorized();
            }
            db_sync(req, &state).await
        }
        (&Method::POST, ["push-tokens"]) => register_token(req, &state).await,
        _ => json_response(StatusCode::NOT_FOUND, json!({ "error": "not found" })),
    }
}

fn authorized(headers: &HeaderMap, expected: Option<&str>) -> bool {
    match expected {
        None => true,
        Some(key) => headers.get("x-api-key").and_then(|v| v.to_str().ok()) == Some(key),
    }
}

fn unauthorized() -> Response<Body> {
    json_response(StatusCode::UNAUTHORIZED, json!({ "error": "Unauthorized: Invalid API Key" }))
}

fn json_response(status: StatusCode, body: Value) -> Response<Body> {
    let mut resp = Response::new(Body::from(body.to_string()));
    *resp.status_mut() = status;
    resp.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}

fn store_failure(op: &str, e: StoreError) -> Response<Body> {
    error!(op, error = %e, "store call failed");
    let status = match e {
        StoreError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    json_response(status, json!({ "success": false, "error": e.to_string() }))
}

async fn read_json<T: for<'de> Deserialize<'de>>(req: Request<Body>) -> Result<T, Response<Body>> {
    let bytes = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|e| json_response(StatusCode::BAD_REQUEST, json!({ "error": e.to_string() })))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| json_response(StatusCode::BAD_REQUEST, json!({ "error": format!("invalid body: {e}") })))
}

// ---- order status ----

#[derive(Deserialize)]
struct StatusBody {
    status: String,
    #[serde(default)]
    reason: Option<String>,
}

async fn update_status(req: Request<Body>, state: &HttpState, id: &str) -> Response<Body> {
    let body: StatusBody = match read_json(req).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let status: OrderStatus = match body.status.parse() {
        Ok(s) => s,
        Err(e) => return json_response(StatusCode::BAD_REQUEST, json!({ "success": false, "error": e.to_string() })),
    };

    let current = match bounded(state.call_timeout, "order", state.store.order(id)).await {
        Ok(Some(o)) => o,
        Ok(None) => return json_response(StatusCode::NOT_FOUND, json!({ "success": false, "error": "order not found" })),
        Err(e) => return store_failure("order", e),
    };
    let patch = OrderPatch::transition(&current, status, Utc::now());
    let updated = match bounded(state.call_timeout, "update_order", state.store.update_order(id, &patch)).await {
        Ok(o) => o,
        Err(e) => return store_failure("update_order", e),
    };

    info!(order = %updated.id, from = %current.status, to = %updated.status, "order status updated");
    // push fan-out runs detached
    let _ = state.hub.notify_order_status_change(updated.clone(), body.reason);
    json_response(StatusCode::OK, json!({ "success": true, "data": updated }))
}

// ---- webhooks ----

#[derive(Deserialize)]
struct ExternalOrder {
    #[serde(default)]
    customer: Option<String>,
    amount: f64,
    #[serde(default)]
    store_id: Option<Value>,
    #[serde(default)]
    items: Option<Value>,
}

fn value_key(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

async fn new_order(req: Request<Body>, state: &HttpState) -> Response<Body> {
    let body: ExternalOrder = match read_json(req).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let wanted = body.store_id.as_ref().and_then(value_key);
    let store = match bounded(state.call_timeout, "resolve_store", state.store.resolve_store(wanted.as_deref())).await {
        Ok(Some(s)) => s,
        Ok(None) => {
            return json_response(StatusCode::UNPROCESSABLE_ENTITY, json!({ "success": false, "error": "no store available" }))
        }
        Err(e) => return store_failure("resolve_store", e),
    };

    let draft = NewOrder {
        customer_name: body.customer.unwrap_or_else(|| "Guest".to_string()),
        total_amount: body.amount,
        status: OrderStatus::New,
        store_id: Some(store.id),
        tenant_id: store.organization_id,
        items: body.items.unwrap_or_else(|| json!([])),
    };
    let order = match bounded(state.call_timeout, "insert_order", state.store.insert_order(&draft)).await {
        Ok(o) => o,
        Err(e) => return store_failure("insert_order", e),
    };

    info!(order = %order.id, store = %order.store_id, amount = order.total_amount, "external order received");
    let order_id = order.id.clone();
    let _ = state.hub.notify_new_order(order);
    json_response(StatusCode::OK, json!({ "success": true, "orderId": order_id }))
}

#[derive(Deserialize)]
struct ChangeNotice {
    #[serde(rename = "type")]
    kind: String,
    table: String,
    #[serde(default)]
    record: Value,
}

async fn db_sync(req: Request<Body>, state: &HttpState) -> Response<Body> {
    let notice: ChangeNotice = match read_json(req).await {
        Ok(n) => n,
        Err(resp) => return resp,
    };
    if notice.table == "orders" && notice.kind == "UPDATE" {
        match notice.record.get("store_id").and_then(value_key) {
            Some(store_id) => state.hub.relay_order_sync(
                &store_id,
                OrderSyncNotice {
                    id: notice.record["id"].clone(),
                    status: notice.record["status"].clone(),
                    updated_at: notice.record["updated_at"].clone(),
                },
            ),
            None => warn!("db-sync order update without store_id ignored"),
        }
    }
    let mut resp = Response::new(Body::from("OK"));
    *resp.status_mut() = StatusCode::OK;
    resp
}

// ---- push tokens ----

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenBody {
    user_id: String,
    push_token: String,
}

async fn register_token(req: Request<Body>, state: &HttpState) -> Response<Body> {
    let body: TokenBody = match read_json(req).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    match bounded(
        state.call_timeout,
        "set_push_token",
        state.store.set_push_token(&body.user_id, &body.push_token),
    )
    .await
    {
        Ok(()) => {
            info!(user = %body.user_id, "push token registered");
            json_response(StatusCode::OK, json!({ "success": true }))
        }
        Err(e) => store_failure("set_push_token", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StoreRef;
    use crate::hub::tests::{drain, names};
    use crate::push::LogPush;
    use crate::store::{order_aged, MemoryStore};
    use crate::transport::Transport;

    fn state(store: Arc<MemoryStore>, api_key: Option<&str>) -> Arc<HttpState> {
        let hub = Arc::new(NotificationHub::new(
            Arc::new(Transport::new()),
            store.clone(),
            Arc::new(LogPush::new()),
            Duration::from_millis(200),
        ));
        Arc::new(HttpState {
            store,
            hub,
            api_key: api_key.map(str::to_string),
            call_timeout: Duration::from_millis(200),
        })
    }

    fn request(method: Method, uri: &str, key: Option<&str>, body: Value) -> Request<Body> {
        let mut b = Request::builder().method(method).uri(uri);
        if let Some(k) = key {
            b = b.header("x-api-key", k);
        }
        b.body(Body::from(body.to_string())).unwrap()
    }

    async fn body_json(resp: Response<Body>) -> Value {
        let bytes = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn status_update_stamps_and_broadcasts() {
        let store = Arc::new(MemoryStore::new());
        store.seed_order(order_aged("o-1", "s1", OrderStatus::New, 3));
        let st = state(store.clone(), None);
        let (c, mut rx) = st.hub.transport().connect();
        st.hub.transport().join(c, "s1");

        let resp = route(
            request(Method::PATCH, "/orders/o-1/status", None, json!({ "status": "in_progress", "reason": "accepted" })),
            st.clone(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["data"]["status"], "in_progress");

        let accepted = store.orders_snapshot()[0].accepted_at;
        assert!(accepted.is_some());

        // second transition into the same status keeps the first stamp
        let resp = route(request(Method::POST, "/orders/o-1/status", None, json!({ "status": "in_progress" })), st).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(store.orders_snapshot()[0].accepted_at, accepted);

        let frames = drain(&mut rx);
        assert_eq!(names(&frames).len(), 4);
        assert_eq!(frames[0]["data"]["reason"], "accepted");
    }

    #[tokio::test]
    async fn status_update_rejects_unknown_status_and_order() {
        let store = Arc::new(MemoryStore::new());
        store.seed_order(order_aged("o-1", "s1", OrderStatus::New, 3));
        let st = state(store, None);

        let resp = route(request(Method::PATCH, "/orders/o-1/status", None, json!({ "status": "teleported" })), st.clone()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let resp = route(request(Method::PATCH, "/orders/nope/status", None, json!({ "status": "ready" })), st).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn webhook_requires_key_and_falls_back_to_first_store() {
        let store = Arc::new(MemoryStore::new());
        store.seed_store(StoreRef { id: "s1".into(), organization_id: Some("org".into()) }, None);
        let st = state(store.clone(), Some("secret"));
        let (c, mut rx) = st.hub.transport().connect();
        st.hub.transport().join(c, "s1");
        let payload = json!({ "customer": "Rina", "amount": 42.5, "store_id": 999 });

        let resp = route(request(Method::POST, "/webhooks/orders", Some("wrong"), payload.clone()), st.clone()).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(store.orders_snapshot().is_empty());

        let resp = route(request(Method::POST, "/webhooks/orders", Some("secret"), payload), st).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let orders = store.orders_snapshot();
        assert_eq!(orders[0].store_id, "s1");
        assert_eq!(orders[0].tenant_id.as_deref(), Some("org"));
        assert_eq!(body_json(resp).await["orderId"], orders[0].id.as_str());
        assert_eq!(names(&drain(&mut rx)), vec!["newIncomingOrder"]);
    }

    #[tokio::test]
    async fn db_sync_relays_order_updates_only() {
        let st = state(Arc::new(MemoryStore::new()), None);
        let (_c, mut rx) = st.hub.transport().connect();

        let insert = json!({ "type": "INSERT", "table": "orders", "record": { "id": "o-1", "store_id": "s1" } });
        route(request(Method::POST, "/webhooks/db-sync", None, insert), st.clone()).await;
        assert!(drain(&mut rx).is_empty());

        let update = json!({
            "type": "UPDATE", "table": "orders",
            "record": { "id": "o-1", "store_id": "s1", "status": "ready", "updated_at": "2026-01-01T00:00:00Z" }
        });
        let resp = route(request(Method::POST, "/webhooks/db-sync", None, update), st).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let frames = drain(&mut rx);
        assert_eq!(names(&frames), vec!["orderStatusChanged"]);
        assert_eq!(frames[0]["data"], json!({ "id": "o-1", "status": "ready", "updatedAt": "2026-01-01T00:00:00Z" }));
    }

    #[tokio::test]
    async fn push_token_registration() {
        let store = Arc::new(MemoryStore::new());
        store.seed_user("u1", None);
        let st = state(store.clone(), None);

        let ok = json!({ "userId": "u1", "pushToken": "ExponentPushToken[x]" });
        assert_eq!(route(request(Method::POST, "/push-tokens", None, ok), st.clone()).await.status(), StatusCode::OK);
        assert_eq!(store.push_tokens().await.unwrap(), vec!["ExponentPushToken[x]".to_string()]);

        let ghost = json!({ "userId": "ghost", "pushToken": "ExponentPushToken[y]" });
        assert_eq!(route(request(Method::POST, "/push-tokens", None, ghost), st).await.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn health_metrics_and_unknown_routes() {
        let st = state(Arc::new(MemoryStore::new()), None);
        let health = Request::builder().uri("/health").body(Body::empty()).unwrap();
        assert_eq!(route(health, st.clone()).await.status(), StatusCode::OK);
        let metrics = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        assert_eq!(route(metrics, st.clone()).await.status(), StatusCode::OK);
        let missing = Request::builder().uri("/nope").body(Body::empty()).unwrap();
        assert_eq!(route(missing, st).await.status(), StatusCode::NOT_FOUND);
    }
}
