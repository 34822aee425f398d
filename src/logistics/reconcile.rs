use crate::store::{ProductIdentity, StockRow, Store, StoreError};
use crate::wb::{Marketplace, models::StockRecord};
use indexmap::IndexSet;
use std::collections::HashMap;
use tracing::{error, info, warn};

/// A product currently holding inventory at a warehouse.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StockPair {
    pub product_id: i64,
    pub warehouse: String,
}

impl StockPair {
    pub fn new(product_id: i64, warehouse: impl Into<String>) -> Self {
        Self {
            product_id,
            warehouse: warehouse.into(),
        }
    }
}

/// Deduplicated pairs in the order they were first seen.
pub type StockPairs = IndexSet<StockPair>;

#[derive(Debug, Default)]
pub struct Reconciliation {
    pub rows: Vec<StockRow>,
    pub pairs: StockPairs,
    pub fetched: usize,
    pub unmatched: usize,
    pub persisted: bool,
}

/// Map fetched stock lines onto persisted product ids.
///
/// Lines referencing an unknown `nmId` are logged and dropped. Every matched
/// line becomes a row to persist; only lines with a positive quantity
/// contribute a pair.
pub fn reconcile(
    seller_id: i64,
    records: Vec<StockRecord>,
    identities: &[ProductIdentity],
) -> Reconciliation {
    let mut product_ids: HashMap<i64, i64> = HashMap::with_capacity(identities.len());
    for identity in identities {
        product_ids.entry(identity.nm_id).or_insert(identity.id);
    }

    let mut out = Reconciliation {
        fetched: records.len(),
        ..Reconciliation::default()
    };
    for record in records {
        let Some(&product_id) = product_ids.get(&record.nm_id) else {
            error!(
                target = "logistics_watch.reconcile",
                seller_id,
                nm_id = record.nm_id,
                "stock references a product missing from the catalog"
            );
            out.unmatched += 1;
            continue;
        };
        if record.quantity > 0 {
            out.pairs
                .insert(StockPair::new(product_id, record.warehouse_name.clone()));
        }
        out.rows.push(stock_row(seller_id, product_id, record));
    }
    out
}

fn stock_row(seller_id: i64, product_id: i64, record: StockRecord) -> StockRow {
    StockRow {
        seller_id,
        product_id,
        last_change_date: record.last_change_date,
        warehouse_name: record.warehouse_name,
        supplier_article: record.supplier_article,
        barcode: record.barcode,
        quantity: record.quantity,
        in_way_to_client: record.in_way_to_client,
        in_way_from_client: record.in_way_from_client,
        quantity_full: record.quantity_full,
        category: record.category,
        subject: record.subject,
        brand: record.brand,
        tech_size: record.tech_size,
        price: record.price,
        discount: record.discount,
        is_supply: record.is_supply,
        is_realization: record.is_realization,
        sc_code: record.sc_code,
    }
}

pub struct StockReconciler<'a> {
    store: &'a dyn Store,
    marketplace: &'a dyn Marketplace,
}

impl<'a> StockReconciler<'a> {
    pub fn new(store: &'a dyn Store, marketplace: &'a dyn Marketplace) -> Self {
        Self { store, marketplace }
    }

    /// Fetch, reconcile and persist the seller's current stock.
    ///
    /// A failed fetch counts as an empty stock list and a failed write is
    /// logged; the returned pairs come from the fetched data either way.
    pub async fn get_stocks(
        &self,
        seller_id: i64,
        api_token: &str,
    ) -> Result<Reconciliation, StoreError> {
        let records = self.marketplace.stocks(api_token).await.unwrap_or_else(|err| {
            warn!(
                target = "logistics_watch.reconcile",
                seller_id,
                error = %err,
                "stock fetch failed; continuing with no stock"
            );
            Vec::new()
        });
        let identities = self.store.product_identities(seller_id).await?;
        let mut reconciliation = reconcile(seller_id, records, &identities);

        match self.store.insert_stocks(&reconciliation.rows).await {
            Ok(()) => reconciliation.persisted = true,
            Err(err) => error!(
                target = "logistics_watch.reconcile",
                seller_id,
                error = %err,
                "failed to persist stock snapshot"
            ),
        }
        info!(
            target = "logistics_watch.reconcile",
            seller_id,
            fetched = reconciliation.fetched,
            unmatched = reconciliation.unmatched,
            pairs = reconciliation.pairs.len(),
            "stock reconciled"
        );
        Ok(reconciliation)
    }
}

#[cfg(test)]
pub(crate) fn stock_record(nm_id: i64, warehouse: &str, quantity: i64) -> StockRecord {
    serde_json::from_value(serde_json::json!({
        "nmId": nm_id,
        "warehouseName": warehouse,
        "quantity": quantity,
        "lastChangeDate": "2024-02-01T09:00:00",
    }))
    .expect("stock record")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, NewProduct};
    use crate::wb::{WbError, models::ProductCard};
    use async_trait::async_trait;
    use serde_json::json;

    fn identities() -> Vec<ProductIdentity> {
        vec![
            ProductIdentity { id: 1, nm_id: 100 },
            ProductIdentity { id: 2, nm_id: 200 },
        ]
    }

    #[test]
    fn drops_unknown_products_and_keeps_batch() {
        let records = vec![
            stock_record(100, "Москва", 3),
            stock_record(999, "Москва", 5),
            stock_record(200, "Казань", 1),
        ];
        let out = reconcile(7, records, &identities());
        assert_eq!(out.unmatched, 1);
        assert_eq!(out.rows.len(), 2);
        assert_eq!(
            out.pairs.iter().cloned().collect::<Vec<_>>(),
            vec![StockPair::new(1, "Москва"), StockPair::new(2, "Казань")]
        );
    }

    #[test]
    fn empty_warehouses_are_persisted_but_not_paired() {
        let records = vec![stock_record(100, "Москва", 0), stock_record(200, "Казань", -1)];
        let out = reconcile(7, records, &identities());
        assert_eq!(out.rows.len(), 2);
        assert!(out.pairs.is_empty());
    }

    #[test]
    fn repeated_snapshots_collapse_to_one_pair() {
        let mut older = stock_record(100, "Москва", 2);
        older.last_change_date = None;
        let records = vec![older, stock_record(100, "Москва", 4)];
        let out = reconcile(7, records, &identities());
        assert_eq!(out.rows.len(), 2);
        assert_eq!(out.pairs.len(), 1);
        assert!(out.pairs.iter().all(|pair| pair.product_id == 1));
    }

    struct FixedStocks(Result<Vec<StockRecord>, ()>);

    #[async_trait]
    impl Marketplace for FixedStocks {
        async fn product_cards(&self, _token: &str) -> Result<Vec<ProductCard>, WbError> {
            Ok(Vec::new())
        }

        async fn stocks(&self, _token: &str) -> Result<Vec<StockRecord>, WbError> {
            self.0
                .clone()
                .map_err(|_| WbError::Request("HTTP 500 Internal Server Error".into()))
        }

        async fn check_token(&self, _token: &str) -> bool {
            true
        }
    }

    async fn seeded_store() -> MemoryStore {
        let store = MemoryStore::new();
        let product = |nm_id: i64| NewProduct {
            seller_id: 7,
            nm_id,
            imt_id: None,
            nm_uuid: None,
            subject_id: None,
            subject_name: None,
            vendor_code: None,
            brand: None,
            title: None,
            description: None,
            video: None,
            photos: json!(null),
            length: None,
            width: None,
            height: None,
            characteristics: json!(null),
            sizes: json!(null),
            tags: json!(null),
            created_at: None,
            updated_at: None,
        };
        store
            .upsert_products(&[product(100), product(200)])
            .await
            .expect("seed");
        store
    }

    #[tokio::test]
    async fn rerun_with_same_data_is_idempotent() {
        let store = seeded_store().await;
        let api = FixedStocks(Ok(vec![
            stock_record(100, "Москва", 3),
            stock_record(200, "Казань", 1),
        ]));
        let reconciler = StockReconciler::new(&store, &api);
        let first = reconciler.get_stocks(7, "t").await.expect("first");
        let second = reconciler.get_stocks(7, "t").await.expect("second");
        assert_eq!(first.pairs, second.pairs);
        assert!(second.persisted);
        assert_eq!(store.stock_rows().await.len(), 2);
    }

    #[tokio::test]
    async fn fetch_failure_yields_empty_stock() {
        let store = seeded_store().await;
        let api = FixedStocks(Err(()));
        let out = StockReconciler::new(&store, &api)
            .get_stocks(7, "t")
            .await
            .expect("reconcile");
        assert!(out.pairs.is_empty());
        assert_eq!(out.fetched, 0);
    }

    #[tokio::test]
    async fn write_failure_keeps_fetched_pairs() {
        let store = seeded_store().await;
        store.fail_stock_writes().await;
        let api = FixedStocks(Ok(vec![stock_record(100, "Москва", 3)]));
        let out = StockReconciler::new(&store, &api)
            .get_stocks(7, "t")
            .await
            .expect("reconcile");
        assert!(!out.persisted);
        assert_eq!(out.pairs.len(), 1);
    }
}
