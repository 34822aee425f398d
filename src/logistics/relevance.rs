use crate::logistics::reconcile::{StockPair, StockPairs};
use crate::store::ProductRecord;
use indexmap::IndexMap;
use serde::Serialize;
use std::collections::HashSet;

/// A product whose logistics cost changes at one or more warehouses.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AffectedProduct {
    pub nm_id: i64,
    pub title: Option<String>,
    pub vendor_code: Option<String>,
    pub length: Option<f64>,
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub warehouses: Vec<String>,
}

/// Affected products keyed by `nm_id`, in discovery order.
pub type AffectedProducts = IndexMap<i64, AffectedProduct>;

pub fn relevant_stocks(stocks: &StockPairs, changed: &[String]) -> Vec<StockPair> {
    let changed: HashSet<&str> = changed.iter().map(String::as_str).collect();
    stocks
        .iter()
        .filter(|pair| changed.contains(pair.warehouse.as_str()))
        .cloned()
        .collect()
}

/// Group relevant warehouses under the product holding the stock.
///
/// Pairs whose product id is not in `products` are skipped.
pub fn relevant_products(products: &[ProductRecord], relevant: &[StockPair]) -> AffectedProducts {
    let mut affected = AffectedProducts::new();
    for pair in relevant {
        let Some(product) = products.iter().find(|product| product.id == pair.product_id) else {
            continue;
        };
        affected
            .entry(product.nm_id)
            .or_insert_with(|| AffectedProduct {
                nm_id: product.nm_id,
                title: product.title.clone(),
                vendor_code: product.vendor_code.clone(),
                length: product.length,
                width: product.width,
                height: product.height,
                warehouses: Vec::new(),
            })
            .warehouses
            .push(pair.warehouse.clone());
    }
    affected
}

#[cfg(test)]
pub(crate) fn product(id: i64, nm_id: i64, title: &str, dims: (f64, f64, f64)) -> ProductRecord {
    ProductRecord {
        id,
        nm_id,
        vendor_code: Some(format!("VC-{nm_id}")),
        title: Some(title.to_string()),
        length: Some(dims.0),
        width: Some(dims.1),
        height: Some(dims.2),
    }
}
