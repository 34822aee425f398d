//! Tariff-change core: cost formula, stock reconciliation, change detection,
//! relevance join, rendering and pagination. Nothing here talks HTTP.

pub mod cost;
pub mod paginate;
pub mod reconcile;
pub mod relevance;
pub mod report;
pub mod tariffs;

pub use cost::CostModel;
pub use paginate::paginate;
pub use reconcile::{StockPairs, StockReconciler};
pub use report::Report;
pub use tariffs::TariffBook;
