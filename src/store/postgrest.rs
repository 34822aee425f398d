use super::{
    NewProduct, NewUser, ProductIdentity, ProductRecord, SellerRow, StockRow, Store, StoreError,
    TariffRow, TariffSource, UserRow, now_naive,
};
use crate::http::build_client;
use crate::wb::models::parse_records;
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Client, Response};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use tracing::debug;
use urlencoding::encode;

const PRODUCTS_CONFLICT: &str = "seller_id,nm_id";
const STOCKS_CONFLICT: &str = "seller_id,last_change_date,warehouse_name,product_id";
const USERS_CONFLICT: &str = "user_tg_id";
const TARIFFS_TABLE: &str = "wb_warehouses_tariffs";

#[derive(Debug, Clone, Copy)]
enum Resolution {
    Merge,
    Ignore,
}

impl Resolution {
    fn prefer(self, returning: bool) -> &'static str {
        match (self, returning) {
            (Resolution::Merge, false) => "resolution=merge-duplicates,return=minimal",
            (Resolution::Merge, true) => "resolution=merge-duplicates,return=representation",
            (Resolution::Ignore, false) => "resolution=ignore-duplicates,return=minimal",
            (Resolution::Ignore, true) => "resolution=ignore-duplicates,return=representation",
        }
    }
}

/// Row access over a PostgREST endpoint.
#[derive(Debug, Clone)]
pub struct PostgrestStore {
    base_url: String,
    service_key: String,
    http: Client,
}

impl PostgrestStore {
    pub fn new(base_url: &str, service_key: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key: service_key.to_string(),
            http: build_client(),
        }
    }

    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("POSTGREST_URL").ok()?;
        let service_key = std::env::var("POSTGREST_KEY").ok()?;
        Some(Self::new(&base_url, &service_key))
    }

    /// The tariff table may live in its own database; falls back to the main one.
    pub fn tariffs_from_env() -> Option<Self> {
        match (
            std::env::var("TARIFFS_POSTGREST_URL").ok(),
            std::env::var("TARIFFS_POSTGREST_KEY").ok(),
        ) {
            (Some(url), Some(key)) => Some(Self::new(&url, &key)),
            _ => Self::from_env(),
        }
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    async fn select<T: DeserializeOwned>(
        &self,
        table: &str,
        filter: &str,
    ) -> Result<Vec<T>, StoreError> {
        let url = format!("{}?{}", self.table_url(table), filter);
        debug!(target = "logistics_watch.store", table, filter, "select");
        let response = self
            .http
            .get(url)
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;
        read_rows(response).await
    }

    async fn insert<B: Serialize + ?Sized>(
        &self,
        table: &str,
        on_conflict: &str,
        resolution: Resolution,
        returning: bool,
        body: &B,
    ) -> Result<Response, StoreError> {
        let response = self
            .http
            .post(self.table_url(table))
            .query(&[("on_conflict", on_conflict)])
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
            .header("Prefer", resolution.prefer(returning))
            .json(body)
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;
        ensure_success(response)
    }
}

fn ensure_success(response: Response) -> Result<Response, StoreError> {
    if !response.status().is_success() {
        return Err(StoreError::Request(format!("HTTP {}", response.status())));
    }
    Ok(response)
}

async fn read_rows<T: DeserializeOwned>(response: Response) -> Result<Vec<T>, StoreError> {
    let response = ensure_success(response)?;
    response
        .json()
        .await
        .map_err(|err| StoreError::Deserialize(err.to_string()))
}

#[async_trait]
impl Store for PostgrestStore {
    async fn find_user(&self, user_tg_id: i64) -> Result<Option<UserRow>, StoreError> {
        let mut rows: Vec<UserRow> = self
            .select("users", &format!("user_tg_id=eq.{user_tg_id}&select=*&limit=1"))
            .await?;
        Ok(rows.pop())
    }

    async fn insert_user(&self, user: &NewUser) -> Result<UserRow, StoreError> {
        let body = json!({
            "user_tg_id": user.user_tg_id,
            "username": user.username,
            "first_name": user.first_name,
            "last_name": user.last_name,
            "added_at": now_naive(),
        });
        let response = self
            .insert("users", USERS_CONFLICT, Resolution::Ignore, true, &body)
            .await?;
        let mut rows: Vec<UserRow> = read_rows(response).await?;
        match rows.pop() {
            Some(row) => Ok(row),
            None => self
                .find_user(user.user_tg_id)
                .await?
                .ok_or(StoreError::NotFound("user")),
        }
    }

    async fn find_seller(&self, seller_id: i64) -> Result<Option<SellerRow>, StoreError> {
        let mut rows: Vec<SellerRow> = self
            .select("sellers", &format!("id=eq.{seller_id}&select=*&limit=1"))
            .await?;
        Ok(rows.pop())
    }

    async fn upsert_seller(&self, user_id: i64, api_token: &str) -> Result<SellerRow, StoreError> {
        let existing: Vec<SellerRow> = self
            .select(
                "sellers",
                &format!(
                    "user_id=eq.{user_id}&api_token=eq.{}&select=*&limit=1",
                    encode(api_token)
                ),
            )
            .await?;

        let response = if let Some(seller) = existing.first() {
            let response = self
                .http
                .patch(format!("{}?id=eq.{}", self.table_url("sellers"), seller.id))
                .header("apikey", &self.service_key)
                .bearer_auth(&self.service_key)
                .header("Prefer", "return=representation")
                .json(&json!({ "updated_at": now_naive() }))
                .send()
                .await
                .map_err(|err| StoreError::Request(err.to_string()))?;
            ensure_success(response)?
        } else {
            let body = json!({
                "user_id": user_id,
                "api_token": api_token,
                "added_at": now_naive(),
            });
            self.insert("sellers", "user_id,api_token", Resolution::Merge, true, &body)
                .await?
        };

        let mut rows: Vec<SellerRow> = read_rows(response).await?;
        rows.pop().ok_or(StoreError::NotFound("seller"))
    }

    async fn sellers_for_user(&self, user_tg_id: i64) -> Result<Vec<SellerRow>, StoreError> {
        let Some(user) = self.find_user(user_tg_id).await? else {
            return Ok(Vec::new());
        };
        self.select("sellers", &format!("user_id=eq.{}&select=*", user.id))
            .await
    }

    async fn chat_id_for_seller(&self, seller_id: i64) -> Result<Option<i64>, StoreError> {
        let Some(seller) = self.find_seller(seller_id).await? else {
            return Ok(None);
        };
        let mut rows: Vec<UserRow> = self
            .select("users", &format!("id=eq.{}&select=*&limit=1", seller.user_id))
            .await?;
        Ok(rows.pop().map(|user| user.user_tg_id))
    }

    async fn upsert_products(&self, products: &[NewProduct]) -> Result<(), StoreError> {
        if products.is_empty() {
            return Ok(());
        }
        self.insert(
            "products",
            PRODUCTS_CONFLICT,
            Resolution::Merge,
            false,
            products,
        )
        .await?;
        Ok(())
    }

    async fn product_identities(&self, seller_id: i64) -> Result<Vec<ProductIdentity>, StoreError> {
        self.select(
            "products",
            &format!("seller_id=eq.{seller_id}&select=id,nm_id"),
        )
        .await
    }

    async fn products(&self, seller_id: i64) -> Result<Vec<ProductRecord>, StoreError> {
        self.select(
            "products",
            &format!(
                "seller_id=eq.{seller_id}&select=id,nm_id,vendor_code,title,length,width,height&order=id"
            ),
        )
        .await
    }

    async fn insert_stocks(&self, stocks: &[StockRow]) -> Result<(), StoreError> {
        if stocks.is_empty() {
            return Ok(());
        }
        self.insert(
            "warehouses_stocks",
            STOCKS_CONFLICT,
            Resolution::Ignore,
            false,
            stocks,
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl TariffSource for PostgrestStore {
    async fn tariffs_for(&self, date: NaiveDate) -> Result<Vec<TariffRow>, StoreError> {
        let day = date.format("%Y-%m-%d").to_string();
        let raw: Vec<Value> = self
            .select(
                TARIFFS_TABLE,
                &format!("date=eq.{}&select=*", encode(&day)),
            )
            .await?;
        Ok(parse_records("tariff", raw))
    }
}
