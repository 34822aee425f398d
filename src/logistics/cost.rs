/// Logistics cost for one product shipped through one warehouse.
///
/// Shipments up to `base_volume` liters pay the flat base rate; every liter
/// above it adds `liter_rate`. The warehouse coefficient is a percentage and
/// scales the whole amount.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostModel {
    pub base_volume: f64,
}

pub const DEFAULT_BASE_VOLUME: f64 = 1.0;

impl Default for CostModel {
    fn default() -> Self {
        Self {
            base_volume: DEFAULT_BASE_VOLUME,
        }
    }
}

impl CostModel {
    pub fn new(base_volume: f64) -> Self {
        Self { base_volume }
    }

    pub fn cost(&self, volume: f64, coefficient_pct: f64, base_rate: f64, liter_rate: f64) -> f64 {
        let coefficient = coefficient_pct / 100.0;
        if volume <= self.base_volume {
            base_rate * coefficient
        } else {
            (base_rate + (volume - self.base_volume) * liter_rate) * coefficient
        }
    }
}

/// Package volume in liters from centimeter dimensions.
pub fn volume_liters(length: f64, width: f64, height: f64) -> f64 {
    length * width * height / 1000.0
}

pub fn round_two(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
