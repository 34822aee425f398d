use crate::dispatch::Delivery;
use crate::scheduler::{JobInfo, NotifyAt};
use crate::wb::TokenScope;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(name: &str, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterSellerRequest {
    pub user_tg_id: i64,
    pub api_token: String,
}

#[derive(Debug, Serialize)]
pub struct SellerResponse {
    pub seller_id: i64,
    pub user_id: i64,
    pub expires_at: DateTime<Utc>,
    pub scopes: Vec<TokenScope>,
    pub read_only: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleRequest {
    pub notify_at: NotifyAt,
}

#[derive(Debug, Serialize)]
pub struct NotifyTimesResponse {
    pub times: Vec<NotifyAt>,
    pub utc_offset_hours: i32,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionsResponse {
    pub user_tg_id: i64,
    pub jobs: Vec<JobInfo>,
}

#[derive(Debug, Deserialize)]
pub struct ReportQuery {
    #[serde(default = "deliver_by_default")]
    pub deliver: bool,
}

fn deliver_by_default() -> bool {
    true
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReportResponse {
    Delivered(Delivery),
    Preview(Delivery),
    Skipped,
}
