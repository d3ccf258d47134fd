//! Orders and visits: typed views over `pedidos` and `visitas` records.
//!
//! Order totals are always derived from the line items; whatever totals
//! arrive with an order are overwritten by [`Order::recompute`].

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use tracing::warn;

use crate::db::DbState;
use crate::error::{Error, Result};
use crate::store::{self, into_record, Collection, Record};

/// Round to two decimal places (half away from zero).
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn non_negative(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}

// ---------------------------------------------------------------------------
// Dates
// ---------------------------------------------------------------------------

/// Parse a date as stored by any client version: RFC 3339, `YYYY-MM-DD`,
/// a local `YYYY-MM-DDTHH:MM[:SS]` form value, or epoch milliseconds.
/// Values without an offset are taken as UTC.
pub fn parse_date(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_date_str(s),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

pub fn parse_date_str(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|n| n.and_utc());
    }
    raw.parse::<i64>()
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

fn deserialize_date<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Value::deserialize(deserializer)?;
    parse_date(&raw).ok_or_else(|| serde::de::Error::custom(format!("unrecognized date: {raw}")))
}

fn deserialize_opt_date<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Value::deserialize(deserializer)?;
    Ok(parse_date(&raw))
}

fn serialize_date<S: Serializer>(
    date: &DateTime<Utc>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&date.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Farmacia,
    Optica,
}

impl EntityType {
    /// The collection holding entities of this type.
    pub fn collection(self) -> Collection {
        match self {
            EntityType::Farmacia => Collection::Farmacias,
            EntityType::Optica => Collection::Opticas,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Confirmado,
    #[default]
    Borrador,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LineItem {
    pub id: String,
    pub product_ref: Option<String>,
    pub name: String,
    pub quantity: f64,
    pub unit_price: f64,
    pub discount_pct: f64,
    pub line_total: f64,
}

impl LineItem {
    fn recompute(&mut self) {
        self.quantity = non_negative(self.quantity);
        self.unit_price = non_negative(self.unit_price);
        self.discount_pct = non_negative(self.discount_pct).min(100.0);
        self.line_total =
            round2(self.quantity * self.unit_price * (1.0 - self.discount_pct / 100.0));
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    #[serde(deserialize_with = "deserialize_date", serialize_with = "serialize_date")]
    pub fecha: DateTime<Utc>,
    #[serde(default)]
    pub estado: OrderStatus,
    #[serde(default)]
    pub lineas: Vec<LineItem>,
    #[serde(default)]
    pub elementos: f64,
    #[serde(default)]
    pub total: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notas: Option<String>,
}

impl Order {
    pub fn is_confirmed(&self) -> bool {
        self.estado == OrderStatus::Confirmado
    }

    /// Derive line totals, `total` and `elementos` from the line items.
    /// Negative quantities, prices and discounts are clamped to zero.
    pub fn recompute(&mut self) {
        for line in &mut self.lineas {
            line.recompute();
        }
        self.total = round2(self.lineas.iter().map(|l| l.line_total).sum());
        self.elementos = self.lineas.iter().map(|l| l.quantity).sum();
    }

    pub fn from_record(record: &Record) -> Result<Self> {
        serde_json::from_value(Value::Object(record.clone()))
            .map_err(|e| Error::Validation(format!("malformed order: {e}")))
    }

    pub fn to_record(&self) -> Result<Record> {
        into_record(serde_json::to_value(self)?)
    }
}

/// Every readable order in the local store. Unreadable rows are logged
/// and skipped.
pub fn load_orders(db: &DbState) -> Result<Vec<Order>> {
    Ok(store::all(db, Collection::Pedidos)?
        .iter()
        .filter_map(|record| match Order::from_record(record) {
            Ok(order) => Some(order),
            Err(e) => {
                warn!(
                    collection = %Collection::Pedidos,
                    id = ?record.get("id"),
                    error = %e,
                    "skipping unreadable order"
                );
                None
            }
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Visits
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Visit {
    #[serde(default)]
    pub id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    #[serde(
        default,
        deserialize_with = "deserialize_opt_date",
        skip_serializing_if = "Option::is_none"
    )]
    pub fecha: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notas: Option<String>,
}

impl Visit {
    pub fn from_record(record: &Record) -> Result<Self> {
        serde_json::from_value(Value::Object(record.clone()))
            .map_err(|e| Error::Validation(format!("malformed visit: {e}")))
    }

    pub fn to_record(&self) -> Result<Record> {
        into_record(serde_json::to_value(self)?)
    }
}

pub fn load_visits(db: &DbState) -> Result<Vec<Visit>> {
    Ok(store::all(db, Collection::Visitas)?
        .iter()
        .filter_map(|record| Visit::from_record(record).ok())
        .collect())
}
