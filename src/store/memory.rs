use super::{
    NewProduct, NewUser, ProductIdentity, ProductRecord, SellerRow, StockRow, Store, StoreError,
    TariffRow, TariffSource, UserRow, now_naive,
};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Process-local store used when no PostgREST endpoint is configured and in tests.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Tables>>,
}

#[derive(Default)]
struct Tables {
    users: Vec<UserRow>,
    sellers: Vec<SellerRow>,
    products: Vec<(i64, NewProduct)>,
    stocks: Vec<StockRow>,
    tariffs: Vec<TariffRow>,
    fail_stock_writes: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_tariffs(&self, rows: Vec<TariffRow>) {
        self.inner.lock().await.tariffs.extend(rows);
    }

    pub async fn stock_rows(&self) -> Vec<StockRow> {
        self.inner.lock().await.stocks.clone()
    }

    /// Make subsequent stock inserts fail, to exercise best-effort persistence.
    #[cfg(test)]
    pub async fn fail_stock_writes(&self) {
        self.inner.lock().await.fail_stock_writes = true;
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_user(&self, user_tg_id: i64) -> Result<Option<UserRow>, StoreError> {
        let guard = self.inner.lock().await;
        Ok(guard
            .users
            .iter()
            .find(|user| user.user_tg_id == user_tg_id)
            .cloned())
    }

    async fn insert_user(&self, user: &NewUser) -> Result<UserRow, StoreError> {
        let mut guard = self.inner.lock().await;
        if let Some(existing) = guard
            .users
            .iter()
            .find(|row| row.user_tg_id == user.user_tg_id)
        {
            return Ok(existing.clone());
        }
        let row = UserRow {
            id: guard.users.len() as i64 + 1,
            user_tg_id: user.user_tg_id,
            username: user.username.clone(),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            added_at: Some(now_naive()),
        };
        guard.users.push(row.clone());
        Ok(row)
    }

    async fn find_seller(&self, seller_id: i64) -> Result<Option<SellerRow>, StoreError> {
        let guard = self.inner.lock().await;
        Ok(guard
            .sellers
            .iter()
            .find(|seller| seller.id == seller_id)
            .cloned())
    }

    async fn upsert_seller(&self, user_id: i64, api_token: &str) -> Result<SellerRow, StoreError> {
        let mut guard = self.inner.lock().await;
        if let Some(existing) = guard
            .sellers
            .iter_mut()
            .find(|row| row.user_id == user_id && row.api_token == api_token)
        {
            existing.updated_at = Some(now_naive());
            return Ok(existing.clone());
        }
        let row = SellerRow {
            id: guard.sellers.len() as i64 + 1,
            user_id,
            api_token: api_token.to_string(),
            added_at: now_naive(),
            updated_at: None,
        };
        guard.sellers.push(row.clone());
        Ok(row)
    }

    async fn sellers_for_user(&self, user_tg_id: i64) -> Result<Vec<SellerRow>, StoreError> {
        let guard = self.inner.lock().await;
        let Some(user) = guard.users.iter().find(|u| u.user_tg_id == user_tg_id) else {
            return Ok(Vec::new());
        };
        Ok(guard
            .sellers
            .iter()
            .filter(|seller| seller.user_id == user.id)
            .cloned()
            .collect())
    }

    async fn chat_id_for_seller(&self, seller_id: i64) -> Result<Option<i64>, StoreError> {
        let guard = self.inner.lock().await;
        let user_id = guard
            .sellers
            .iter()
            .find(|seller| seller.id == seller_id)
            .map(|seller| seller.user_id);
        Ok(user_id.and_then(|id| {
            guard
                .users
                .iter()
                .find(|user| user.id == id)
                .map(|user| user.user_tg_id)
        }))
    }

    async fn upsert_products(&self, products: &[NewProduct]) -> Result<(), StoreError> {
        let mut guard = self.inner.lock().await;
        for product in products {
            let existing = guard
                .products
                .iter()
                .position(|(_, row)| row.seller_id == product.seller_id && row.nm_id == product.nm_id);
            match existing {
                Some(index) => guard.products[index].1 = product.clone(),
                None => {
                    let id = guard.products.len() as i64 + 1;
                    guard.products.push((id, product.clone()));
                }
            }
        }
        Ok(())
    }

    async fn product_identities(&self, seller_id: i64) -> Result<Vec<ProductIdentity>, StoreError> {
        let guard = self.inner.lock().await;
        Ok(guard
            .products
            .iter()
            .filter(|(_, row)| row.seller_id == seller_id)
            .map(|(id, row)| ProductIdentity {
                id: *id,
                nm_id: row.nm_id,
            })
            .collect())
    }

    async fn products(&self, seller_id: i64) -> Result<Vec<ProductRecord>, StoreError> {
        let guard = self.inner.lock().await;
        Ok(guard
            .products
            .iter()
            .filter(|(_, row)| row.seller_id == seller_id)
            .map(|(id, row)| ProductRecord {
                id: *id,
                nm_id: row.nm_id,
                vendor_code: row.vendor_code.clone(),
                title: row.title.clone(),
                length: row.length,
                width: row.width,
                height: row.height,
            })
            .collect())
    }

    async fn insert_stocks(&self, stocks: &[StockRow]) -> Result<(), StoreError> {
        let mut guard = self.inner.lock().await;
        if guard.fail_stock_writes {
            return Err(StoreError::Request("stock table unavailable".into()));
        }
        for stock in stocks {
            let duplicate = guard
                .stocks
                .iter()
                .any(|row| row.conflict_key() == stock.conflict_key());
            if !duplicate {
                guard.stocks.push(stock.clone());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TariffSource for MemoryStore {
    async fn tariffs_for(&self, date: NaiveDate) -> Result<Vec<TariffRow>, StoreError> {
        let guard = self.inner.lock().await;
        Ok(guard
            .tariffs
            .iter()
            .filter(|row| row.date == date)
            .cloned()
            .collect())
    }
}
