//! Analytics Engine: purchase cadence and quarterly target tracking.
//!
//! Everything here is a pure function of its inputs; callers load orders
//! and visits from the local store and pass the current time explicitly.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::orders::{round2, EntityType, Order, Visit};
use crate::settings::AnalyticsSettings;
use crate::store::{record_id, Record};

/// Orders needed before a cadence is estimated.
pub const MIN_ORDERS_FOR_ESTIMATE: usize = 3;
/// Only the most recent orders shape the cadence.
pub const CADENCE_WINDOW: usize = 10;
/// Gaps above this are treated as data errors.
pub const MAX_PLAUSIBLE_GAP_DAYS: f64 = 3650.0;

const MS_PER_DAY: f64 = 86_400_000.0;

// ---------------------------------------------------------------------------
// Cadence
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Cadence {
    pub has_estimate: bool,
    pub avg_days: Option<f64>,
    pub last_date: Option<DateTime<Utc>>,
    pub next_date: Option<DateTime<Utc>>,
    /// Confirmed orders of the entity.
    pub count: usize,
}

fn is_entity_order(order: &Order, entity_id: &str, entity_type: EntityType) -> bool {
    order.entity_id == entity_id && order.entity_type == entity_type
}

/// Predict the next order date of one entity from its confirmed orders.
pub fn cadence(entity_id: &str, entity_type: EntityType, orders: &[Order]) -> Cadence {
    let mut dates: Vec<DateTime<Utc>> = orders
        .iter()
        .filter(|o| o.is_confirmed() && is_entity_order(o, entity_id, entity_type))
        .map(|o| o.fecha)
        .collect();
    dates.sort_unstable_by(|a, b| b.cmp(a));

    let count = dates.len();
    let last_date = dates.first().copied();
    let no_estimate = Cadence {
        has_estimate: false,
        avg_days: None,
        last_date,
        next_date: None,
        count,
    };
    if count < MIN_ORDERS_FOR_ESTIMATE {
        return no_estimate;
    }

    let mut recent: Vec<DateTime<Utc>> = dates.into_iter().take(CADENCE_WINDOW).collect();
    recent.reverse();
    let gaps: Vec<f64> = recent
        .windows(2)
        .map(|pair| (pair[1] - pair[0]).num_milliseconds() as f64 / MS_PER_DAY)
        .filter(|gap| *gap > 0.0 && *gap <= MAX_PLAUSIBLE_GAP_DAYS)
        .collect();
    let (Some(last), false) = (last_date, gaps.is_empty()) else {
        return no_estimate;
    };

    let avg_days = gaps.iter().sum::<f64>() / gaps.len() as f64;
    let next_date = last + Duration::milliseconds((avg_days * MS_PER_DAY).round() as i64);
    Cadence {
        has_estimate: true,
        avg_days: Some(avg_days),
        last_date,
        next_date: Some(next_date),
        count,
    }
}

/// Whole calendar days from `now` until `date` (negative when past).
pub fn days_until(date: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (date.date_naive() - now.date_naive()).num_days()
}

// ---------------------------------------------------------------------------
// Due soon
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DueEntity {
    pub entity_id: String,
    pub name: Option<String>,
    pub next_date: DateTime<Utc>,
    pub avg_days: f64,
    pub days_until: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DueSoon {
    /// Most overdue first.
    pub overdue: Vec<DueEntity>,
    /// Soonest first.
    pub upcoming: Vec<DueEntity>,
}

fn display_name(record: &Record) -> Option<String> {
    ["nombre", "name"]
        .iter()
        .find_map(|key| record.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}

/// Split entities with a cadence estimate into overdue and upcoming lists.
/// Entities without an estimate are left out.
pub fn due_soon(
    entities: &[Record],
    entity_type: EntityType,
    orders: &[Order],
    days_soon: i64,
    now: DateTime<Utc>,
) -> DueSoon {
    let mut due = DueSoon::default();
    for entity in entities {
        let Ok(entity_id) = record_id(entity) else {
            continue;
        };
        let c = cadence(entity_id, entity_type, orders);
        let (Some(next_date), Some(avg_days)) = (c.next_date, c.avg_days) else {
            continue;
        };
        let diff = days_until(next_date, now);
        let item = DueEntity {
            entity_id: entity_id.to_string(),
            name: display_name(entity),
            next_date,
            avg_days,
            days_until: diff,
        };
        if diff < 0 {
            due.overdue.push(item);
        } else if diff <= days_soon {
            due.upcoming.push(item);
        }
    }
    due.overdue.sort_by_key(|d| d.days_until);
    due.upcoming.sort_by_key(|d| d.days_until);
    due
}

// ---------------------------------------------------------------------------
// Quarters
// ---------------------------------------------------------------------------

fn quarter_of(date: DateTime<Utc>) -> u32 {
    (date.month() - 1) / 3 + 1
}

/// Quarter label: `{1..4}T{yy}`, e.g. `2T24`.
pub fn quarter_key(date: DateTime<Utc>) -> String {
    format!("{}T{:02}", quarter_of(date), date.year().rem_euclid(100))
}

fn utc_midnight(year: i32, month: u32) -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|n| Utc.from_utc_datetime(&n))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// `[start, end)` of the quarter containing `date`.
pub fn quarter_bounds(date: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let first_month = (quarter_of(date) - 1) * 3 + 1;
    let start = utc_midnight(date.year(), first_month);
    let end = if first_month == 10 {
        utc_midnight(date.year() + 1, 1)
    } else {
        utc_midnight(date.year(), first_month + 3)
    };
    (start, end)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuarterProgress {
    pub quarter_key: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub target: f64,
    pub stretch_target: f64,
    pub achieved: f64,
    /// Achieved as a percentage of target; 0 without a target.
    pub pct_achieved: f64,
    pub remaining: f64,
    pub remaining_stretch: f64,
    /// Calendar days left including today.
    pub days_left: i64,
    pub per_day: f64,
    pub per_week: f64,
    pub stretch_per_day: f64,
    pub stretch_per_week: f64,
}

/// Progress of confirmed sales against the current quarter's target.
pub fn quarter_progress(
    orders: &[Order],
    settings: &AnalyticsSettings,
    now: DateTime<Utc>,
) -> QuarterProgress {
    let key = quarter_key(now);
    let (start, end) = quarter_bounds(now);

    let target = settings.target_for(&key);
    let desired_pct = if settings.desired_pct.is_finite() {
        settings.desired_pct
    } else {
        0.0
    };
    let stretch_target = target * (1.0 + desired_pct / 100.0);

    let achieved = round2(
        orders
            .iter()
            .filter(|o| o.is_confirmed() && o.fecha >= start && o.fecha < end)
            .map(|o| o.total)
            .sum(),
    );

    let remaining = (target - achieved).max(0.0);
    let remaining_stretch = (stretch_target - achieved).max(0.0);
    let days_left = days_until(end, now).max(1);
    let weeks_left = (days_left as f64 / 7.0).max(1.0);
    let pct_achieved = if target > 0.0 {
        achieved * 100.0 / target
    } else {
        0.0
    };

    QuarterProgress {
        quarter_key: key,
        start,
        end,
        target,
        stretch_target,
        achieved,
        pct_achieved,
        remaining,
        remaining_stretch,
        days_left,
        per_day: remaining / days_left as f64,
        per_week: remaining / weeks_left,
        stretch_per_day: remaining_stretch / days_left as f64,
        stretch_per_week: remaining_stretch / weeks_left,
    }
}

// ---------------------------------------------------------------------------
// Entity summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySummary {
    pub entity_id: String,
    pub confirmed_orders: usize,
    pub total_amount: f64,
    pub last_order: Option<DateTime<Utc>>,
    pub last_visit: Option<DateTime<Utc>>,
}

pub fn entity_summary(
    entity_id: &str,
    entity_type: EntityType,
    orders: &[Order],
    visits: &[Visit],
) -> EntitySummary {
    let confirmed: Vec<&Order> = orders
        .iter()
        .filter(|o| o.is_confirmed() && is_entity_order(o, entity_id, entity_type))
        .collect();
    EntitySummary {
        entity_id: entity_id.to_string(),
        confirmed_orders: confirmed.len(),
        total_amount: round2(confirmed.iter().map(|o| o.total).sum()),
        last_order: confirmed.iter().map(|o| o.fecha).max(),
        last_visit: visits
            .iter()
            .filter(|v| v.entity_id == entity_id && v.entity_type == entity_type)
            .filter_map(|v| v.fecha)
            .max(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orders::{parse_date_str, OrderStatus};
    use crate::testing::rec;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn date(raw: &str) -> DateTime<Utc> {
        parse_date_str(raw).unwrap()
    }

    fn order(entity_id: &str, fecha: &str, total: f64, estado: OrderStatus) -> Order {
        Order {
            id: format!("{entity_id}-{fecha}"),
            entity_type: EntityType::Farmacia,
            entity_id: entity_id.into(),
            fecha: date(fecha),
            estado,
            lineas: Vec::new(),
            elementos: 0.0,
            total,
            notas: None,
        }
    }

    fn confirmed(entity_id: &str, dates: &[&str]) -> Vec<Order> {
        dates
            .iter()
            .map(|d| order(entity_id, d, 100.0, OrderStatus::Confirmado))
            .collect()
    }

    #[test]
    fn test_cadence_needs_three_confirmed_orders() {
        let mut orders = confirmed("f1", &["2024-01-01", "2024-02-01"]);
        orders.push(order("f1", "2024-03-01", 50.0, OrderStatus::Borrador));
        orders.extend(confirmed("f2", &["2024-03-01"]));
        let c = cadence("f1", EntityType::Farmacia, &orders);
        assert!(!c.has_estimate);
        assert_eq!(c.count, 2);
        assert_eq!(c.last_date, Some(date("2024-02-01")));
        assert_eq!(c.next_date, None);
    }

    #[test]
    fn test_cadence_average_gap() {
        // 31 and 30 day gaps.
        let orders = confirmed("f1", &["2024-03-02", "2024-01-01", "2024-02-01"]);
        let c = cadence("f1", EntityType::Farmacia, &orders);
        assert!(c.has_estimate);
        assert_eq!(c.avg_days, Some(30.5));
        assert_eq!(c.next_date, Some(date("2024-04-01T12:00:00Z")));
        assert_eq!(c.count, 3);
    }

    #[test]
    fn test_cadence_leap_february() {
        // Feb 2024 has 29 days, so both gaps are 31 days.
        let orders = confirmed("f1", &["2024-01-01", "2024-02-01", "2024-03-03"]);
        let c = cadence("f1", EntityType::Farmacia, &orders);
        let avg = c.avg_days.unwrap();
        assert!((avg - 30.5).abs() <= 0.5);
        assert_eq!(avg, 31.0);
        let next = c.next_date.unwrap();
        assert!((next - date("2024-04-02")).num_hours().abs() <= 24);
    }

    #[test]
    fn test_cadence_ignores_entity_type_mismatch_and_bad_gaps() {
        let mut orders = confirmed("f1", &["2024-01-01", "2024-01-01", "2024-01-11", "1990-01-01"]);
        let mut optica = order("f1", "2024-01-21", 10.0, OrderStatus::Confirmado);
        optica.entity_type = EntityType::Optica;
        orders.push(optica);

        let c = cadence("f1", EntityType::Farmacia, &orders);
        // Gaps: 1990->2024 (>3650, dropped), 0 (dropped), 10.
        assert_eq!(c.count, 4);
        assert_eq!(c.avg_days, Some(10.0));

        let same_day = confirmed("f3", &["2024-01-01", "2024-01-01", "2024-01-01"]);
        assert!(!cadence("f3", EntityType::Farmacia, &same_day).has_estimate);
    }

    #[test]
    fn test_cadence_uses_last_ten_orders() {
        let mut dates: Vec<String> = (1..=12)
            .map(|m| format!("2023-{m:02}-01"))
            .collect();
        dates.push("2023-12-11".into());
        let refs: Vec<&str> = dates.iter().map(String::as_str).collect();
        let c = cadence("f1", EntityType::Farmacia, &confirmed("f1", &refs));
        assert_eq!(c.count, 13);
        // Window is 2023-04-01 .. 2023-12-11: 254 days over 9 gaps.
        let expected = 254.0 / 9.0;
        assert!((c.avg_days.unwrap() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_due_soon_buckets_and_order() {
        let now = date("2024-04-01T09:00:00Z");
        let mut orders = confirmed("late", &["2024-01-01", "2024-02-01", "2024-03-01"]);
        orders.extend(confirmed("later", &["2023-12-01", "2024-01-01", "2024-02-01"]));
        orders.extend(confirmed("soon", &["2024-01-05", "2024-02-05", "2024-03-05"]));
        orders.extend(confirmed("far", &["2024-03-01", "2024-03-15", "2024-03-29"]));
        let entities = vec![
            rec(json!({ "id": "late", "nombre": "Farmacia Late" })),
            rec(json!({ "id": "later" })),
            rec(json!({ "id": "soon" })),
            rec(json!({ "id": "far" })),
            rec(json!({ "id": "nuevo" })),
        ];

        let due = due_soon(&entities, EntityType::Farmacia, &orders, 7, now);
        let overdue: Vec<&str> = due.overdue.iter().map(|d| d.entity_id.as_str()).collect();
        let upcoming: Vec<&str> = due.upcoming.iter().map(|d| d.entity_id.as_str()).collect();
        assert_eq!(overdue, ["later", "late"]);
        assert_eq!(upcoming, ["soon"]);
        assert_eq!(due.overdue[1].name.as_deref(), Some("Farmacia Late"));
        assert!(due.overdue[0].days_until < due.overdue[1].days_until);
    }

    #[test]
    fn test_days_until_uses_calendar_days() {
        let now = date("2024-04-01T23:59:00Z");
        assert_eq!(days_until(date("2024-04-02T00:01:00Z"), now), 1);
        assert_eq!(days_until(date("2024-04-01T00:00:00Z"), now), 0);
        assert_eq!(days_until(date("2024-03-31T23:00:00Z"), now), -1);
    }

    #[test]
    fn test_quarter_keys_and_bounds() {
        assert_eq!(quarter_key(date("2024-04-15")), "2T24");
        assert_eq!(quarter_key(date("2023-12-31")), "4T23");
        assert_eq!(quarter_key(date("2009-01-01")), "1T09");

        let (start, end) = quarter_bounds(date("2023-11-20"));
        assert_eq!(start, date("2023-10-01"));
        assert_eq!(end, date("2024-01-01"));
        let (start, end) = quarter_bounds(date("2024-05-31T23:00:00Z"));
        assert_eq!(start, date("2024-04-01"));
        assert_eq!(end, date("2024-07-01"));
    }

    #[test]
    fn test_quarter_progress() {
        let settings = AnalyticsSettings {
            quarter_targets: BTreeMap::from([("2T24".to_string(), 1000.0)]),
            desired_pct: 10.0,
            days_soon: 7,
        };
        let orders = vec![
            order("f1", "2024-04-02", 300.0, OrderStatus::Confirmado),
            order("f2", "2024-06-30T22:00:00Z", 100.0, OrderStatus::Confirmado),
            order("f1", "2024-05-01", 999.0, OrderStatus::Borrador),
            order("f1", "2024-03-31T23:59:59Z", 500.0, OrderStatus::Confirmado),
            order("f1", "2024-07-01", 500.0, OrderStatus::Confirmado),
        ];

        let p = quarter_progress(&orders, &settings, date("2024-06-17T10:00:00Z"));
        assert_eq!(p.quarter_key, "2T24");
        assert_eq!(p.achieved, 400.0);
        assert_eq!(p.pct_achieved, 40.0);
        assert!((p.stretch_target - 1100.0).abs() < 1e-9);
        assert_eq!(p.remaining, 600.0);
        assert!((p.remaining_stretch - 700.0).abs() < 1e-9);
        // June 17..=30.
        assert_eq!(p.days_left, 14);
        assert!((p.per_day - 600.0 / 14.0).abs() < 1e-9);
        assert!((p.per_week - 300.0).abs() < 1e-9);
        assert!((p.stretch_per_week - 350.0).abs() < 1e-9);
    }

    #[test]
    fn test_quarter_progress_last_day_and_missing_target() {
        let settings = AnalyticsSettings::default();
        let p = quarter_progress(&[], &settings, date("2024-12-31T18:00:00Z"));
        assert_eq!(p.quarter_key, "4T24");
        assert_eq!(p.target, 0.0);
        assert_eq!(p.pct_achieved, 0.0);
        assert_eq!(p.days_left, 1);
        assert_eq!(p.per_week, 0.0);
    }

    #[test]
    fn test_entity_summary() {
        let mut orders = confirmed("f1", &["2024-01-01", "2024-02-10"]);
        orders.push(order("f1", "2024-03-01", 70.0, OrderStatus::Borrador));
        let visits = vec![
            Visit {
                id: "v1".into(),
                entity_type: EntityType::Farmacia,
                entity_id: "f1".into(),
                fecha: Some(date("2024-03-05")),
                notas: None,
            },
            Visit {
                id: "v2".into(),
                entity_type: EntityType::Optica,
                entity_id: "f1".into(),
                fecha: Some(date("2024-04-05")),
                notas: None,
            },
        ];
        let s = entity_summary("f1", EntityType::Farmacia, &orders, &visits);
        assert_eq!(s.confirmed_orders, 2);
        assert_eq!(s.total_amount, 200.0);
        assert_eq!(s.last_order, Some(date("2024-02-10")));
        assert_eq!(s.last_visit, Some(date("2024-03-05")));
    }
}
