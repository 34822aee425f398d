//! Record store seam.
//!
//! The service reads and upserts rows; it never owns the schema. Every
//! method is atomic on its own so callers need no session handling.

pub mod memory;
pub mod postgrest;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use serde_with::{DisplayFromStr, PickFirst, serde_as, skip_serializing_none};
use thiserror::Error;

pub use memory::MemoryStore;
pub use postgrest::PostgrestStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Deserialize(String),
    #[error("{0} not found")]
    NotFound(&'static str),
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct UserRow {
    pub id: i64,
    pub user_tg_id: i64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub added_at: Option<NaiveDateTime>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct NewUser {
    pub user_tg_id: i64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SellerRow {
    pub id: i64,
    pub user_id: i64,
    pub api_token: String,
    pub added_at: NaiveDateTime,
    #[serde(default)]
    pub updated_at: Option<NaiveDateTime>,
}

impl SellerRow {
    pub fn last_touched(&self) -> NaiveDateTime {
        self.updated_at.unwrap_or(self.added_at)
    }
}

/// Most recently added or refreshed seller.
pub fn latest_seller(sellers: Vec<SellerRow>) -> Option<SellerRow> {
    sellers.into_iter().max_by_key(SellerRow::last_touched)
}

/// Catalog row written on every refresh; conflicts on `seller_nm_id_key`
/// update every non-key column.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NewProduct {
    pub seller_id: i64,
    pub nm_id: i64,
    pub imt_id: Option<i64>,
    pub nm_uuid: Option<String>,
    pub subject_id: Option<i64>,
    pub subject_name: Option<String>,
    pub vendor_code: Option<String>,
    pub brand: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub video: Option<String>,
    pub photos: Value,
    pub length: Option<f64>,
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub characteristics: Value,
    pub sizes: Value,
    pub tags: Value,
    pub created_at: Option<NaiveDateTime>,
    pub updated_at: Option<NaiveDateTime>,
}

/// Product columns the tariff report reads.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ProductRecord {
    pub id: i64,
    pub nm_id: i64,
    #[serde(default)]
    pub vendor_code: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub length: Option<f64>,
    #[serde(default)]
    pub width: Option<f64>,
    #[serde(default)]
    pub height: Option<f64>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct ProductIdentity {
    pub id: i64,
    pub nm_id: i64,
}

/// Stock snapshot row; the change timestamp is part of the key so history
/// accumulates instead of being overwritten.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StockRow {
    pub seller_id: i64,
    pub product_id: i64,
    pub last_change_date: Option<NaiveDateTime>,
    pub warehouse_name: String,
    pub supplier_article: Option<String>,
    pub barcode: Option<String>,
    pub quantity: i64,
    pub in_way_to_client: Option<i64>,
    pub in_way_from_client: Option<i64>,
    pub quantity_full: Option<i64>,
    pub category: Option<String>,
    pub subject: Option<String>,
    pub brand: Option<String>,
    pub tech_size: Option<String>,
    pub price: Option<f64>,
    pub discount: Option<f64>,
    pub is_supply: Option<bool>,
    pub is_realization: Option<bool>,
    pub sc_code: Option<String>,
}

impl StockRow {
    pub fn conflict_key(&self) -> (i64, Option<NaiveDateTime>, &str, i64) {
        (
            self.seller_id,
            self.last_change_date,
            self.warehouse_name.as_str(),
            self.product_id,
        )
    }
}

/// Per-warehouse box delivery tariff for one date.
#[serde_as]
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TariffRow {
    pub warehouse_name: String,
    pub date: NaiveDate,
    #[serde(rename = "box_delivery_base")]
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub base_rate: f64,
    #[serde(rename = "box_delivery_liter")]
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub liter_rate: f64,
    #[serde(rename = "box_delivery_and_storage_expr")]
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub coefficient: f64,
    #[serde(rename = "box_delivery_and_storage_expr_next")]
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub coefficient_next: f64,
    #[serde(
        rename = "box_delivery_and_storage_diff_sign_next",
        default,
        deserialize_with = "change_indicator"
    )]
    pub change_sign: Option<i64>,
}

impl TariffRow {
    pub fn is_changing(&self) -> bool {
        matches!(self.change_sign, Some(sign) if sign != 0)
    }
}

fn change_indicator<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Flag(bool),
        Sign(i64),
    }
    Ok(Option::<Raw>::deserialize(deserializer)?.map(|raw| match raw {
        Raw::Flag(flag) => i64::from(flag),
        Raw::Sign(sign) => sign,
    }))
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn find_user(&self, user_tg_id: i64) -> Result<Option<UserRow>, StoreError>;

    async fn insert_user(&self, user: &NewUser) -> Result<UserRow, StoreError>;

    async fn find_seller(&self, seller_id: i64) -> Result<Option<SellerRow>, StoreError>;

    /// Insert the seller or refresh `updated_at` when (user, token) exists.
    async fn upsert_seller(&self, user_id: i64, api_token: &str) -> Result<SellerRow, StoreError>;

    async fn sellers_for_user(&self, user_tg_id: i64) -> Result<Vec<SellerRow>, StoreError>;

    async fn chat_id_for_seller(&self, seller_id: i64) -> Result<Option<i64>, StoreError>;

    async fn upsert_products(&self, products: &[NewProduct]) -> Result<(), StoreError>;

    async fn product_identities(&self, seller_id: i64) -> Result<Vec<ProductIdentity>, StoreError>;

    async fn products(&self, seller_id: i64) -> Result<Vec<ProductRecord>, StoreError>;

    /// Insert snapshots, skipping rows whose key already exists.
    async fn insert_stocks(&self, stocks: &[StockRow]) -> Result<(), StoreError>;
}

#[async_trait]
pub trait TariffSource: Send + Sync {
    async fn tariffs_for(&self, date: NaiveDate) -> Result<Vec<TariffRow>, StoreError>;
}

pub(crate) fn now_naive() -> NaiveDateTime {
    Utc::now().naive_utc()
}
