use crate::logistics::{
    CostModel, Report, StockReconciler, TariffBook,
    paginate::DEFAULT_MAX_CHARS,
    relevance::{AffectedProducts, relevant_products, relevant_stocks},
    report,
};
use crate::models::StageReport;
use crate::scheduler::utc_offset_from_env;
use crate::store::{NewProduct, Store, TariffSource};
use crate::wb::{Marketplace, models::ProductCard};
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde_json::{Value, json};
use std::{future::Future, sync::Arc, time::Instant};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct Pipeline {
    pub config: Arc<PipelineConfig>,
    store: Arc<dyn Store>,
    tariffs: Arc<dyn TariffSource>,
    marketplace: Arc<dyn Marketplace>,
}

/// Result of one run for one seller.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub seller_id: i64,
    pub date: NaiveDate,
    pub report: Report,
    pub stages: Vec<StageReport>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn Store>,
        tariffs: Arc<dyn TariffSource>,
        marketplace: Arc<dyn Marketplace>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            store,
            tariffs,
            marketplace,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub async fn run(&self, seller_id: i64, api_token: &str) -> Result<RunOutcome, PipelineError> {
        self.run_on(seller_id, api_token, self.config.today()).await
    }

    /// Run against the tariff table of `date`.
    pub async fn run_on(
        &self,
        seller_id: i64,
        api_token: &str,
        date: NaiveDate,
    ) -> Result<RunOutcome, PipelineError> {
        if seller_id <= 0 {
            return Err(PipelineError::invalid_input(
                "validate",
                "seller_id must be positive",
            ));
        }
        if api_token.trim().is_empty() {
            return Err(PipelineError::invalid_input("validate", "api_token is empty"));
        }

        let run_id = Uuid::new_v4();
        let mut stages = Vec::new();
        let store = self.store.as_ref();
        let marketplace = self.marketplace.as_ref();
        let mut book = TariffBook::new(self.tariffs.as_ref());

        self.capture_stage(
            "refresh_catalog",
            &mut stages,
            stages::refresh_catalog(store, marketplace, seller_id, api_token),
        )
        .await?;

        let stock = self
            .capture_stage(
                "reconcile_stocks",
                &mut stages,
                stages::reconcile_stocks(store, marketplace, seller_id, api_token),
            )
            .await?;

        let tariffs = self
            .capture_stage("load_tariffs", &mut stages, async {
                let rows = book
                    .get_tariffs(date)
                    .await
                    .map_err(|err| PipelineError::internal("load_tariffs", err.to_string()))?;
                let output = json!({ "date": date, "rows": rows.len() });
                Ok(StageOutcome::new(rows, output))
            })
            .await?;

        let changed = self
            .capture_stage("detect_changes", &mut stages, async {
                let changed = book
                    .check_changes(date)
                    .await
                    .map_err(|err| PipelineError::internal("detect_changes", err.to_string()))?;
                let output = json!({ "warehouses": changed });
                Ok(StageOutcome::new(changed, output))
            })
            .await?;

        let affected = self
            .capture_stage(
                "join_relevance",
                &mut stages,
                stages::join_relevance(store, seller_id, &stock, &changed),
            )
            .await?;

        let model = self.config.cost_model;
        let report = self
            .capture_stage("render_report", &mut stages, async {
                let report = report::render(&affected, &tariffs, &model)
                    .map_err(|err| PipelineError::internal("render_report", err.to_string()))?;
                let output = json!({
                    "has_changes": report.has_changes(),
                    "chars": report.text().chars().count(),
                });
                Ok(StageOutcome::new(report, output))
            })
            .await?;

        info!(
            target = "logistics_watch.pipeline",
            %run_id,
            seller_id,
            %date,
            products = affected.len(),
            has_changes = report.has_changes(),
            "run completed"
        );
        crate::metrics::run_finished(report.has_changes());

        Ok(RunOutcome {
            run_id,
            seller_id,
            date,
            report,
            stages,
        })
    }

    async fn capture_stage<T, Fut>(
        &self,
        name: &'static str,
        stages: &mut Vec<StageReport>,
        fut: Fut,
    ) -> Result<T, PipelineError>
    where
        Fut: Future<Output = Result<StageOutcome<T>, PipelineError>>,
    {
        let started = Instant::now();
        let outcome = fut.await?;
        let elapsed_ms = started.elapsed().as_millis();
        crate::metrics::stage_elapsed(name, elapsed_ms);
        stages.push(StageReport::new(name, elapsed_ms, outcome.output));
        Ok(outcome.value)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub cost_model: CostModel,
    pub max_message_chars: usize,
    pub utc_offset: FixedOffset,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cost_model: CostModel::default(),
            max_message_chars: DEFAULT_MAX_CHARS,
            utc_offset: crate::scheduler::default_utc_offset(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let base_volume = std::env::var("BASE_VOLUME_LITERS")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| v.is_finite() && *v >= 0.0)
            .unwrap_or(defaults.cost_model.base_volume);
        let max_message_chars = std::env::var("MAX_MESSAGE_CHARS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v >= 1)
            .unwrap_or(defaults.max_message_chars);
        Self {
            cost_model: CostModel::new(base_volume),
            max_message_chars,
            utc_offset: utc_offset_from_env(),
        }
    }

    /// Tariff date as seen in the marketplace's time zone.
    pub fn today(&self) -> NaiveDate {
        self.date_at(Utc::now())
    }

    pub fn date_at(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.utc_offset).date_naive()
    }
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    InvalidInput,
    NotFound,
    Credential,
    Internal,
}

impl PipelineError {
    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::InvalidInput,
        }
    }

    pub fn not_found(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::NotFound,
        }
    }

    pub fn credential(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::Credential,
        }
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::Internal,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

#[derive(Debug)]
pub struct StageOutcome<T> {
    pub value: T,
    pub output: Value,
}

impl<T> StageOutcome<T> {
    fn new(value: T, output: Value) -> Self {
        Self { value, output }
    }
}

pub mod stages {
    use super::*;
    use crate::logistics::StockPairs;

    /// Pull the seller's cards and upsert them. A failed fetch or write
    /// leaves the persisted catalog as it was.
    pub async fn refresh_catalog(
        store: &dyn Store,
        marketplace: &dyn Marketplace,
        seller_id: i64,
        api_token: &str,
    ) -> Result<StageOutcome<()>, PipelineError> {
        let cards = match marketplace.product_cards(api_token).await {
            Ok(cards) => cards,
            Err(err) => {
                warn!(
                    target = "logistics_watch.pipeline",
                    seller_id,
                    error = %err,
                    "card fetch failed; using stored catalog"
                );
                Vec::new()
            }
        };
        let products: Vec<NewProduct> = cards
            .into_iter()
            .map(|card| new_product(seller_id, card))
            .collect();

        let persisted = if products.is_empty() {
            false
        } else {
            match store.upsert_products(&products).await {
                Ok(()) => true,
                Err(err) => {
                    warn!(
                        target = "logistics_watch.pipeline",
                        seller_id,
                        error = %err,
                        "failed to upsert products"
                    );
                    false
                }
            }
        };
        Ok(StageOutcome::new(
            (),
            json!({ "fetched": products.len(), "persisted": persisted }),
        ))
    }

    pub async fn reconcile_stocks(
        store: &dyn Store,
        marketplace: &dyn Marketplace,
        seller_id: i64,
        api_token: &str,
    ) -> Result<StageOutcome<StockPairs>, PipelineError> {
        let reconciliation = StockReconciler::new(store, marketplace)
            .get_stocks(seller_id, api_token)
            .await
            .map_err(|err| PipelineError::internal("reconcile_stocks", err.to_string()))?;
        let output = json!({
            "fetched": reconciliation.fetched,
            "unmatched": reconciliation.unmatched,
            "pairs": reconciliation.pairs.len(),
            "persisted": reconciliation.persisted,
        });
        Ok(StageOutcome::new(reconciliation.pairs, output))
    }

    pub async fn join_relevance(
        store: &dyn Store,
        seller_id: i64,
        stock: &StockPairs,
        changed: &[String],
    ) -> Result<StageOutcome<AffectedProducts>, PipelineError> {
        let relevant = relevant_stocks(stock, changed);
        let affected = if relevant.is_empty() {
            AffectedProducts::new()
        } else {
            let products = store
                .products(seller_id)
                .await
                .map_err(|err| PipelineError::internal("join_relevance", err.to_string()))?;
            relevant_products(&products, &relevant)
        };
        let output = json!({
            "relevant_stocks": relevant.len(),
            "products": affected.keys().collect::<Vec<_>>(),
        });
        Ok(StageOutcome::new(affected, output))
    }

    pub fn new_product(seller_id: i64, card: ProductCard) -> NewProduct {
        NewProduct {
            seller_id,
            nm_id: card.nm_id,
            imt_id: card.imt_id,
            nm_uuid: card.nm_uuid,
            subject_id: card.subject_id,
            subject_name: card.subject_name,
            vendor_code: card.vendor_code,
            brand: card.brand,
            title: card.title,
            description: card.description,
            video: card.video,
            photos: card.photos,
            length: card.dimensions.length,
            width: card.dimensions.width,
            height: card.dimensions.height,
            characteristics: card.characteristics,
            sizes: card.sizes,
            tags: card.tags,
            created_at: card.created_at,
            updated_at: card.updated_at,
        }
    }
}
