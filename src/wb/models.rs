use chrono::NaiveDateTime;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;
use tracing::{error, warn};

const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.fZ",
    "%Y-%m-%dT%H:%M:%SZ",
];

/// Parse the marketplace's timestamp flavours; `None` when none match.
pub fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    let parsed = TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok());
    if parsed.is_none() {
        error!(target = "logistics_watch.wb", value, "failed to parse timestamp");
    }
    parsed
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<NaiveDateTime>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(parse_timestamp))
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct Dimensions {
    pub length: Option<f64>,
    pub width: Option<f64>,
    pub height: Option<f64>,
}

/// One product card from the content API.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductCard {
    #[serde(rename = "nmID")]
    pub nm_id: i64,
    #[serde(rename = "imtID", default)]
    pub imt_id: Option<i64>,
    #[serde(rename = "nmUUID", default)]
    pub nm_uuid: Option<String>,
    #[serde(rename = "subjectID", default)]
    pub subject_id: Option<i64>,
    #[serde(default)]
    pub subject_name: Option<String>,
    #[serde(default)]
    pub vendor_code: Option<String>,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub video: Option<String>,
    #[serde(default)]
    pub photos: Value,
    #[serde(default)]
    pub dimensions: Dimensions,
    #[serde(default)]
    pub characteristics: Value,
    #[serde(default)]
    pub sizes: Value,
    #[serde(default)]
    pub tags: Value,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created_at: Option<NaiveDateTime>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub updated_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CardsPage {
    #[serde(default)]
    pub cards: Vec<Value>,
    #[serde(default)]
    pub cursor: Option<PageCursor>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PageCursor {
    #[serde(default)]
    pub total: i64,
    #[serde(rename = "nmID", default)]
    pub nm_id: Option<i64>,
    #[serde(rename = "updatedAt", default)]
    pub updated_at: Option<String>,
}

/// Cursor sent with the next page request.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CursorRequest {
    pub limit: i64,
    #[serde(rename = "nmID")]
    pub nm_id: Option<i64>,
    #[serde(rename = "updatedAt")]
    pub updated_at: Option<String>,
}

impl CursorRequest {
    pub fn first(limit: i64) -> Self {
        Self {
            limit,
            nm_id: None,
            updated_at: None,
        }
    }

    /// Next cursor, or `None` once the page reported fewer cards than the limit.
    pub fn advance(&self, page: &PageCursor) -> Option<Self> {
        if page.total < self.limit {
            return None;
        }
        Some(Self {
            limit: self.limit,
            nm_id: page.nm_id,
            updated_at: page.updated_at.clone(),
        })
    }
}

/// One warehouse stock line from the statistics API.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockRecord {
    pub nm_id: i64,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub last_change_date: Option<NaiveDateTime>,
    pub warehouse_name: String,
    #[serde(default)]
    pub supplier_article: Option<String>,
    #[serde(default)]
    pub barcode: Option<String>,
    #[serde(default)]
    pub quantity: i64,
    #[serde(default)]
    pub in_way_to_client: Option<i64>,
    #[serde(default)]
    pub in_way_from_client: Option<i64>,
    #[serde(default)]
    pub quantity_full: Option<i64>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub tech_size: Option<String>,
    #[serde(rename = "Price", default)]
    pub price: Option<f64>,
    #[serde(rename = "Discount", default)]
    pub discount: Option<f64>,
    #[serde(default)]
    pub is_supply: Option<bool>,
    #[serde(default)]
    pub is_realization: Option<bool>,
    #[serde(rename = "SCCode", default)]
    pub sc_code: Option<String>,
}

/// Deserialize each element on its own so one bad record does not sink the batch.
pub fn parse_records<T>(kind: &'static str, raw: Vec<Value>) -> Vec<T>
where
    T: for<'de> Deserialize<'de>,
{
    raw.into_iter()
        .filter_map(|value| match serde_json::from_value::<T>(value) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(target = "logistics_watch.wb", kind, error = %err, "dropping malformed record");
                None
            }
        })
        .collect()
}
