use crate::store::{StoreError, TariffRow, TariffSource};
use chrono::NaiveDate;
use std::sync::Arc;
use tracing::debug;

/// Holds one date's tariff rows; loading another date evicts them.
#[derive(Debug, Default)]
pub struct TariffCache {
    slot: Option<(NaiveDate, Arc<Vec<TariffRow>>)>,
}

impl TariffCache {
    pub fn get(&self, date: NaiveDate) -> Option<Arc<Vec<TariffRow>>> {
        match &self.slot {
            Some((cached, rows)) if *cached == date => Some(Arc::clone(rows)),
            _ => None,
        }
    }

    pub fn put(&mut self, date: NaiveDate, rows: Vec<TariffRow>) -> Arc<Vec<TariffRow>> {
        let rows = Arc::new(rows);
        self.slot = Some((date, Arc::clone(&rows)));
        rows
    }

    pub fn cached_date(&self) -> Option<NaiveDate> {
        self.slot.as_ref().map(|(date, _)| *date)
    }
}

/// Tariff lookups for a single run.
pub struct TariffBook<'a> {
    source: &'a dyn TariffSource,
    cache: TariffCache,
}

impl<'a> TariffBook<'a> {
    pub fn new(source: &'a dyn TariffSource) -> Self {
        Self {
            source,
            cache: TariffCache::default(),
        }
    }

    pub async fn get_tariffs(&mut self, date: NaiveDate) -> Result<Arc<Vec<TariffRow>>, StoreError> {
        if let Some(rows) = self.cache.get(date) {
            return Ok(rows);
        }
        let rows = self.source.tariffs_for(date).await?;
        debug!(
            target = "logistics_watch.tariffs",
            %date,
            rows = rows.len(),
            evicted = ?self.cache.cached_date(),
            "loaded tariff table"
        );
        Ok(self.cache.put(date, rows))
    }

    /// Warehouses whose tariff is flagged to change after `date`.
    pub async fn check_changes(&mut self, date: NaiveDate) -> Result<Vec<String>, StoreError> {
        let rows = self.get_tariffs(date).await?;
        Ok(rows
            .iter()
            .filter(|row| row.is_changing())
            .map(|row| row.warehouse_name.clone())
            .collect())
    }
}

#[cfg(test)]
pub(crate) fn tariff_row(warehouse: &str, date: NaiveDate, coefficient: f64, next: f64, sign: i64) -> TariffRow {
    TariffRow {
        warehouse_name: warehouse.to_string(),
        date,
        base_rate: 100.0,
        liter_rate: 10.0,
        coefficient,
        coefficient_next: next,
        change_sign: Some(sign),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TariffSource for CountingSource {
        async fn tariffs_for(&self, date: NaiveDate) -> Result<Vec<TariffRow>, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![
                tariff_row("Москва", date, 100.0, 120.0, 1),
                tariff_row("Казань", date, 100.0, 100.0, 0),
                tariff_row("Тула", date, 150.0, 125.0, -1),
            ])
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 2, d).expect("date")
    }

    #[tokio::test]
    async fn same_date_is_served_from_cache() {
        let source = CountingSource { calls: AtomicUsize::new(0) };
        let mut book = TariffBook::new(&source);
        let first = book.get_tariffs(day(1)).await.expect("tariffs");
        let second = book.get_tariffs(day(1)).await.expect("tariffs");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn new_date_replaces_cached_rows() {
        let source = CountingSource { calls: AtomicUsize::new(0) };
        let mut book = TariffBook::new(&source);
        book.get_tariffs(day(1)).await.expect("tariffs");
        book.get_tariffs(day(2)).await.expect("tariffs");
        assert_eq!(book.cache.cached_date(), Some(day(2)));
        book.get_tariffs(day(1)).await.expect("tariffs");
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn changes_follow_the_indicator_only() {
        let source = CountingSource { calls: AtomicUsize::new(0) };
        let mut book = TariffBook::new(&source);
        let changed = book.check_changes(day(1)).await.expect("changes");
        assert_eq!(changed, vec!["Москва".to_string(), "Тула".to_string()]);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }
}
