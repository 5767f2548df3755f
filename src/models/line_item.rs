//! Line-item rows and price derivation

use serde::{Deserialize, Serialize};

/// How the extractor read the price on a line: per unit or for the whole line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceKind {
    PerUnit,
    Total,
}

impl PriceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceKind::PerUnit => "per_unit",
            PriceKind::Total => "total",
        }
    }

    /// Lenient parse of extractor output; anything unrecognized reads as
    /// `total`, the dominant form in order descriptions.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "per_unit" | "per unit" | "each" | "ea" => PriceKind::PerUnit,
            _ => PriceKind::Total,
        }
    }
}

/// Business line a line item is classified into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusinessLine {
    Signage,
    Printing,
    Engraving,
}

impl BusinessLine {
    pub fn as_str(&self) -> &'static str {
        match self {
            BusinessLine::Signage => "signage",
            BusinessLine::Printing => "printing",
            BusinessLine::Engraving => "engraving",
        }
    }

    /// Parse classifier output; unknown values stay unclassified.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "signage" => Some(BusinessLine::Signage),
            "printing" => Some(BusinessLine::Printing),
            "engraving" => Some(BusinessLine::Engraving),
            _ => None,
        }
    }
}

/// One extracted line item. Row shape is shared by the master and current
/// tables; `line_index` is 1-based in extraction order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItemRow {
    pub line_index: i64,
    pub quantity: i64,
    pub raw_price: Option<f64>,
    pub price_kind: PriceKind,
    pub unit_price: Option<f64>,
    pub total_revenue: Option<f64>,
    pub description: Option<String>,
    pub business_line: Option<BusinessLine>,
    pub material: Option<String>,
    pub dimensions: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DerivedPrices {
    pub unit_price: Option<f64>,
    pub total_revenue: Option<f64>,
}

/// Derive unit price and total revenue from the raw extracted price.
///
/// Per-unit prices multiply out to revenue; total prices divide down to a
/// unit price when the quantity is at least one.
pub fn derive_prices(raw_price: Option<f64>, quantity: i64, kind: PriceKind) -> DerivedPrices {
    let raw = match raw_price {
        Some(p) => p,
        None => {
            return DerivedPrices {
                unit_price: None,
                total_revenue: None,
            }
        }
    };
    match kind {
        PriceKind::PerUnit => {
            let qty = quantity.max(1) as f64;
            DerivedPrices {
                unit_price: Some(raw),
                total_revenue: Some(round2(raw * qty)),
            }
        }
        PriceKind::Total => {
            let unit = if quantity >= 1 {
                round2(raw / quantity as f64)
            } else {
                raw
            };
            DerivedPrices {
                unit_price: Some(unit),
                total_revenue: Some(raw),
            }
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
