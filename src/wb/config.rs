use once_cell::sync::Lazy;
use std::env;

pub static CONTENT_API: Lazy<String> = Lazy::new(|| {
    env::var("WB_CONTENT_API").unwrap_or_else(|_| "https://suppliers-api.wildberries.ru".to_string())
});

pub static STATISTICS_API: Lazy<String> = Lazy::new(|| {
    env::var("WB_STATISTICS_API")
        .unwrap_or_else(|_| "https://statistics-api.wildberries.ru".to_string())
});

pub static SUPPLIERS_API: Lazy<String> = Lazy::new(|| {
    env::var("WB_SUPPLIERS_API").unwrap_or_else(|_| "https://suppliers-api.wildberries.ru".to_string())
});

/// Earliest `dateFrom` the statistics API accepts; asks for the full stock list.
pub const STOCKS_DATE_FROM: &str = "2019-06-20";

pub const CARDS_PAGE_LIMIT: i64 = 1000;

pub const PRODUCT_URL_BASE: &str = "https://www.wildberries.ru/catalog";

pub fn product_url(nm_id: i64) -> String {
    format!("{PRODUCT_URL_BASE}/{nm_id}/detail.aspx")
}
