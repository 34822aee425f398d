use crate::http::build_client;
use crate::wb::config::{CARDS_PAGE_LIMIT, CONTENT_API, STATISTICS_API, STOCKS_DATE_FROM, SUPPLIERS_API};
use crate::wb::models::{CardsPage, CursorRequest, ProductCard, StockRecord, parse_records};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, header::AUTHORIZATION};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum WbError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Deserialize(String),
}

/// Marketplace endpoints the tariff report depends on.
#[async_trait]
pub trait Marketplace: Send + Sync {
    async fn product_cards(&self, token: &str) -> Result<Vec<ProductCard>, WbError>;

    async fn stocks(&self, token: &str) -> Result<Vec<StockRecord>, WbError>;

    /// `true` when the marketplace accepts the token on a read-only endpoint.
    async fn check_token(&self, token: &str) -> bool;
}

#[derive(Debug, Clone)]
pub struct WbClient {
    http: Client,
    content_root: String,
    statistics_root: String,
    suppliers_root: String,
}

impl WbClient {
    pub fn new() -> Self {
        Self::with_roots(&CONTENT_API, &STATISTICS_API, &SUPPLIERS_API)
    }

    pub fn with_roots(content: &str, statistics: &str, suppliers: &str) -> Self {
        Self {
            http: build_client(),
            content_root: content.trim_end_matches('/').to_string(),
            statistics_root: statistics.trim_end_matches('/').to_string(),
            suppliers_root: suppliers.trim_end_matches('/').to_string(),
        }
    }

    fn authorized(&self, builder: RequestBuilder, token: &str) -> RequestBuilder {
        builder
            .header(AUTHORIZATION, token)
            .header("Accept", "*/*")
    }

    async fn fetch_cards_page(
        &self,
        token: &str,
        cursor: &CursorRequest,
    ) -> Result<CardsPage, WbError> {
        let url = format!("{}/content/v2/get/cards/list", self.content_root);
        let body = json!({
            "settings": {
                "filter": { "withPhoto": -1 },
                "cursor": cursor,
            }
        });
        let response = self
            .authorized(self.http.post(url), token)
            .json(&body)
            .send()
            .await
            .map_err(|err| WbError::Request(err.to_string()))?;
        read_json(response).await
    }
}

impl Default for WbClient {
    fn default() -> Self {
        Self::new()
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, WbError> {
    if !response.status().is_success() {
        return Err(WbError::Request(format!("HTTP {}", response.status())));
    }
    response
        .json::<T>()
        .await
        .map_err(|err| WbError::Deserialize(err.to_string()))
}

#[async_trait]
impl Marketplace for WbClient {
    async fn product_cards(&self, token: &str) -> Result<Vec<ProductCard>, WbError> {
        let mut cursor = CursorRequest::first(CARDS_PAGE_LIMIT);
        let mut raw_cards: Vec<Value> = Vec::new();
        loop {
            let page = match self.fetch_cards_page(token, &cursor).await {
                Ok(page) => page,
                Err(err) if raw_cards.is_empty() => return Err(err),
                Err(err) => {
                    warn!(
                        target = "logistics_watch.wb",
                        error = %err,
                        fetched = raw_cards.len(),
                        "cards pagination interrupted; keeping fetched pages"
                    );
                    break;
                }
            };
            if page.cards.is_empty() {
                break;
            }
            raw_cards.extend(page.cards);
            match page.cursor.as_ref().and_then(|page_cursor| cursor.advance(page_cursor)) {
                Some(next) => cursor = next,
                None => break,
            }
        }
        info!(target = "logistics_watch.wb", cards = raw_cards.len(), "fetched product cards");
        Ok(parse_records("product_card", raw_cards))
    }

    async fn stocks(&self, token: &str) -> Result<Vec<StockRecord>, WbError> {
        let url = format!("{}/api/v1/supplier/stocks", self.statistics_root);
        let response = self
            .authorized(self.http.get(url), token)
            .query(&[("dateFrom", STOCKS_DATE_FROM)])
            .send()
            .await
            .map_err(|err| WbError::Request(err.to_string()))?;
        let raw: Vec<Value> = read_json(response).await?;
        Ok(parse_records("stock", raw))
    }

    async fn check_token(&self, token: &str) -> bool {
        let url = format!("{}/api/v3/offices", self.suppliers_root);
        match self.authorized(self.http.get(url), token).send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                warn!(target = "logistics_watch.wb", status = %response.status(), "token probe rejected");
                false
            }
            Err(err) => {
                warn!(target = "logistics_watch.wb", error = %err, "token probe failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> WbClient {
        WbClient::with_roots(&server.uri(), &server.uri(), &server.uri())
    }

    fn card(nm_id: i64) -> Value {
        json!({ "nmID": nm_id, "vendorCode": format!("VC-{nm_id}"), "dimensions": {"length": 10, "width": 10, "height": 10} })
    }

    #[tokio::test]
    async fn cards_follow_cursor_until_short_page() {
        let server = MockServer::start().await;
        let first_page: Vec<Value> = (1..=1000).map(card).collect();
        Mock::given(method("POST"))
            .and(path("/content/v2/get/cards/list"))
            .and(body_partial_json(json!({"settings": {"cursor": {"nmID": 1000}}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "cards": [card(1001), card(1002)],
                "cursor": {"total": 2, "nmID": 1002, "updatedAt": "2024-01-02T00:00:00Z"}
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/content/v2/get/cards/list"))
            .and(header("Authorization", "token-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "cards": first_page,
                "cursor": {"total": 1000, "nmID": 1000, "updatedAt": "2024-01-01T00:00:00Z"}
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        let cards = client_for(&server)
            .product_cards("token-1")
            .await
            .expect("cards");
        assert_eq!(cards.len(), 1002);
        assert_eq!(cards.last().map(|c| c.nm_id), Some(1002));
    }

    #[tokio::test]
    async fn cards_fail_when_first_page_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/content/v2/get/cards/list"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        let err = client_for(&server)
            .product_cards("bad")
            .await
            .expect_err("should fail");
        assert!(matches!(err, WbError::Request(_)));
    }

    #[tokio::test]
    async fn stocks_request_full_history() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/supplier/stocks"))
            .and(query_param("dateFrom", STOCKS_DATE_FROM))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"nmId": 1, "warehouseName": "Казань", "quantity": 2},
                {"nmId": "broken"}
            ])))
            .mount(&server)
            .await;
        let stocks = client_for(&server).stocks("t").await.expect("stocks");
        assert_eq!(stocks.len(), 1);
        assert_eq!(stocks[0].warehouse_name, "Казань");
    }

    #[tokio::test]
    async fn token_probe_maps_status_to_bool() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/offices"))
            .and(header("Authorization", "good"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v3/offices"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        let client = client_for(&server);
        assert!(client.check_token("good").await);
        assert!(!client.check_token("bad").await);
    }
}
