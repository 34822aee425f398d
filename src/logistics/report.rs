use crate::logistics::cost::{CostModel, round_two, volume_liters};
use crate::logistics::relevance::{AffectedProduct, AffectedProducts};
use crate::store::TariffRow;
use crate::wb::config::product_url;
use std::collections::HashMap;
use std::fmt::Write as _;
use thiserror::Error;
use tracing::warn;

pub const REPORT_HEADER: &str = "Стоимость логистики для следующих товаров завтра изменится:";
pub const NO_CHANGES_MESSAGE: &str = "Завтра изменения тарифов вас не коснутся!";

const RISING: &str = "🔴";
const STEADY: &str = "🟢";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReportError {
    #[error("no tariff row for warehouse {warehouse} (product {nm_id})")]
    MissingTariff { warehouse: String, nm_id: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Report {
    NoChanges,
    Changes(String),
}

impl Report {
    pub fn text(&self) -> &str {
        match self {
            Report::NoChanges => NO_CHANGES_MESSAGE,
            Report::Changes(text) => text,
        }
    }

    pub fn has_changes(&self) -> bool {
        matches!(self, Report::Changes(_))
    }
}

pub fn render(
    affected: &AffectedProducts,
    tariffs: &[TariffRow],
    model: &CostModel,
) -> Result<Report, ReportError> {
    if affected.is_empty() {
        return Ok(Report::NoChanges);
    }
    let by_warehouse: HashMap<&str, &TariffRow> = tariffs
        .iter()
        .map(|row| (row.warehouse_name.as_str(), row))
        .collect();

    let mut text = format!("{REPORT_HEADER}\n\n");
    for (index, product) in affected.values().enumerate() {
        let _ = writeln!(
            text,
            "{}. [{} ({})]({})",
            index + 1,
            product.title.as_deref().unwrap_or_default(),
            product.vendor_code.as_deref().unwrap_or_default(),
            product_url(product.nm_id)
        );
        let volume = product_volume(product);
        for warehouse in &product.warehouses {
            let row = by_warehouse
                .get(warehouse.as_str())
                .ok_or_else(|| ReportError::MissingTariff {
                    warehouse: warehouse.clone(),
                    nm_id: product.nm_id,
                })?;
            let current = round_two(model.cost(volume, row.coefficient, row.base_rate, row.liter_rate));
            let next = round_two(model.cost(
                volume,
                row.coefficient_next,
                row.base_rate,
                row.liter_rate,
            ));
            let marker = if next > current { RISING } else { STEADY };
            let _ = writeln!(text, "- {marker} {warehouse}: {current:.2}₽ -> {next:.2}₽");
        }
        text.push('\n');
    }
    Ok(Report::Changes(text))
}

fn product_volume(product: &AffectedProduct) -> f64 {
    match (product.length, product.width, product.height) {
        (Some(length), Some(width), Some(height)) => volume_liters(length, width, height),
        _ => {
            warn!(
                target = "logistics_watch.report",
                nm_id = product.nm_id,
                "product has no dimensions; pricing at base rate"
            );
            0.0
        }
    }
}
