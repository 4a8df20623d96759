// ===============================
// src/store_rest.rs (hosted PostgREST / Supabase tables)
// ===============================
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{header, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::domain::{
    ActiveOrder, Driver, Issue, IssueType, NewIssue, NewOrder, NewTrip, Order, OrderPatch, StoreRef,
    Trip, TripPatch,
};
use crate::store::{Store, StoreError};

// single-row responses
const OBJECT: &str = "application/vnd.pgrst.object+json";

pub struct RestStore {
    http: reqwest::Client,
    base: Url,
    key: String,
}

impl RestStore {
    pub fn new(project_url: &str, service_key: &str) -> Result<Self, StoreError> {
        let base = Url::parse(&format!("{}/rest/v1/", project_url.trim_end_matches('/')))?;
        Ok(Self { http: reqwest::Client::new(), base, key: service_key.to_string() })
    }

    fn table_url(&self, table: &str, query: &[(&str, String)]) -> Result<Url, StoreError> {
        let mut url = self.base.join(table)?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in query {
                pairs.append_pair(k, v);
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http
            .request(method, url)
            .header("apikey", &self.key)
            .bearer_auth(&self.key)
    }

    async fn read<T: DeserializeOwned>(&self, req: RequestBuilder, what: &str) -> Result<T, StoreError> {
        let resp = req.send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        match status {
            s if s.is_success() => Ok(serde_json::from_str(&body)?),
            StatusCode::CONFLICT => Err(StoreError::Conflict(body)),
            // PostgREST answers 406 when an object response matched no row
            StatusCode::NOT_FOUND | StatusCode::NOT_ACCEPTABLE => Err(StoreError::NotFound(what.to_string())),
            s => Err(StoreError::Status { status: s.as_u16(), body }),
        }
    }

    async fn select<T: DeserializeOwned>(&self, table: &str, query: &[(&str, String)]) -> Result<Vec<T>, StoreError> {
        let url = self.table_url(table, query)?;
        self.read(self.request(Method::GET, url), table).await
    }

    async fn insert_one<B: Serialize + ?Sized, T: DeserializeOwned>(&self, table: &str, body: &B) -> Result<T, StoreError> {
        let url = self.table_url(table, &[])?;
        let req = self
            .request(Method::POST, url)
            .header("Prefer", "return=representation")
            .header(header::ACCEPT, OBJECT)
            .json(body);
        self.read(req, table).await
    }

    async fn update_one<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        table: &str,
        filter: (&str, String),
        body: &B,
    ) -> Result<T, StoreError> {
        let what = format!("{table} {}", filter.1);
        let url = self.table_url(table, &[filter])?;
        let req = self
            .request(Method::PATCH, url)
            .header("Prefer", "return=representation")
            .header(header::ACCEPT, OBJECT)
            .json(body);
        self.read(req, &what).await
    }

    async fn update_many<B: Serialize + ?Sized>(&self, table: &str, filter: (&str, String), body: &B) -> Result<(), StoreError> {
        let url = self.table_url(table, &[filter])?;
        let resp = self.request(Method::PATCH, url).json(body).send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        Err(StoreError::Status { status: status.as_u16(), body: resp.text().await.unwrap_or_default() })
    }
}

fn eq(v: &str) -> String { format!("eq.{v}") }

#[derive(Serialize)]
struct PositionUpdate {
    latitude: f64,
    longitude: f64,
    heading: Option<f64>,
    speed: Option<f64>,
    updated_at: chrono::DateTime<Utc>,
}

#[derive(Deserialize)]
struct TokenRow {
    push_token: Option<String>,
}

#[async_trait]
impl Store for RestStore {
    async fn drivers(&self) -> Result<Vec<Driver>, StoreError> {
        self.select("drivers", &[("select", "*".into())]).await
    }

    async fn update_driver_position(&self, d: &Driver) -> Result<(), StoreError> {
        let body = PositionUpdate {
            latitude: d.latitude,
            longitude: d.longitude,
            heading: d.heading,
            speed: d.speed,
            updated_at: Utc::now(),
        };
        self.update_many("drivers", ("external_id", eq(&d.external_id)), &body).await
    }

    async fn negotiating_trips(&self) -> Result<Vec<Trip>, StoreError> {
        self.select("trips", &[("select", "*".into()), ("status", eq("negotiating"))]).await
    }

    async fn insert_trip(&self, trip: &NewTrip) -> Result<Trip, StoreError> {
        self.insert_one("trips", trip).await
    }

    async fn update_trip(&self, id: &str, patch: &TripPatch) -> Result<Trip, StoreError> {
        self.update_one("trips", ("id", eq(id)), patch).await
    }

    async fn active_orders(&self) -> Result<Vec<ActiveOrder>, StoreError> {
        self.select(
            "orders",
            &[
                ("select", "*,stores(sla_breach_minutes)".into()),
                ("status", "in.(new,in_progress,ready)".into()),
            ],
        )
        .await
    }

    async fn order(&self, id: &str) -> Result<Option<Order>, StoreError> {
        let rows: Vec<Order> = self.select("orders", &[("select", "*".into()), ("id", eq(id))]).await?;
        Ok(rows.into_iter().next())
    }

    async fn update_order(&self, id: &str, patch: &OrderPatch) -> Result<Order, StoreError> {
        self.update_one("orders", ("id", eq(id)), patch).await
    }

    async fn insert_order(&self, order: &NewOrder) -> Result<Order, StoreError> {
        self.insert_one("orders", order).await
    }

    async fn resolve_store(&self, id: Option<&str>) -> Result<Option<StoreRef>, StoreError> {
        if let Some(id) = id {
            let rows: Vec<StoreRef> =
                self.select("stores", &[("select", "id,organization_id".into()), ("id", eq(id))]).await?;
            if let Some(s) = rows.into_iter().next() {
                return Ok(Some(s));
            }
        }
        let rows: Vec<StoreRef> =
            self.select("stores", &[("select", "id,organization_id".into()), ("limit", "1".into())]).await?;
        Ok(rows.into_iter().next())
    }

    async fn open_issue(&self, order_id: &str, kind: IssueType) -> Result<Option<Issue>, StoreError> {
        let rows: Vec<Issue> = self
            .select(
                "issues",
                &[
                    ("select", "*".into()),
                    ("order_id", eq(order_id)),
                    ("type", eq(kind.as_str())),
                    ("status", eq("open")),
                    ("limit", "1".into()),
                ],
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn insert_issue(&self, issue: &NewIssue) -> Result<Issue, StoreError> {
        self.insert_one("issues", issue).await
    }

    async fn push_tokens(&self) -> Result<Vec<String>, StoreError> {
        let rows: Vec<TokenRow> = self
            .select("users", &[("select", "push_token".into()), ("push_token", "not.is.null".into())])
            .await?;
        Ok(rows.into_iter().filter_map(|r| r.push_token).collect())
    }

    async fn set_push_token(&self, user_id: &str, token: &str) -> Result<(), StoreError> {
        let _: serde_json::Value = self
            .update_one("users", ("id", eq(user_id)), &serde_json::json!({ "push_token": token }))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_postgrest_filters() {
        let store = RestStore::new("https://abc.supabase.co/", "k").unwrap();
        let url = store
            .table_url("issues", &[("order_id", eq("o-1")), ("status", "in.(new,ready)".into())])
            .unwrap();
        assert_eq!(url.path(), "/rest/v1/issues");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs[0], ("order_id".to_string(), "eq.o-1".to_string()));
        assert_eq!(pairs[1], ("status".to_string(), "in.(new,ready)".to_string()));
    }

    #[test]
    fn rejects_malformed_project_url() {
        assert!(matches!(RestStore::new("not a url", "k"), Err(StoreError::Url(_))));
    }
}
