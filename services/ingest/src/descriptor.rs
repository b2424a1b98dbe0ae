//! Per-kind mapping from loosely shaped source records onto the fixed
//! destination columns.
//!
//! Source field names drift between API versions and between kinds, so every
//! column lists candidate paths (dotted for nested objects) tried in order.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::dates;
use paysync_common::EntityKind;
use paysync_db::records::models::NormalizedRecord;

/// How a numeric amount is interpreted before conversion to minor units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmountUnit {
    /// Integers are minor units; decimal strings and floats are major units.
    Auto,
    Major,
    Minor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Text,
    Timestamp,
    Amount(AmountUnit),
}

#[derive(Debug)]
pub struct FieldSpec {
    pub column: &'static str,
    pub paths: &'static [&'static str],
    pub ty: FieldType,
}

#[derive(Debug)]
pub struct ReferenceSpec {
    pub column: &'static str,
    pub paths: &'static [&'static str],
    /// Fields copied onto the placeholder parent when it has to be created.
    pub hints: &'static [FieldSpec],
}

#[derive(Debug)]
pub struct Descriptor {
    pub id_paths: &'static [&'static str],
    pub references: &'static [ReferenceSpec],
    pub fields: &'static [FieldSpec],
}

/// A timestamp or amount that could not be interpreted and was stored as null.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDiagnostic {
    pub column: &'static str,
    pub raw: String,
}

/// A normalized record plus the hints needed to create its missing parents.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRecord {
    pub record: NormalizedRecord,
    /// Reference column -> placeholder hints for the referenced parent.
    pub parent_hints: BTreeMap<&'static str, Map<String, Value>>,
}

#[derive(Debug, Default)]
pub struct Normalized {
    /// `None` when the source record carries no usable id.
    pub prepared: Option<PreparedRecord>,
    pub diagnostics: Vec<FieldDiagnostic>,
}

const ID_PATHS: &[&str] = &["id", "_id", "uuid"];
const CREATED_PATHS: &[&str] = &["created_at", "createdAt", "created", "date_created", "date"];
const CUSTOMER_PATHS: &[&str] = &["customer.id", "customer_id", "customerId", "customer"];

const fn text(column: &'static str, paths: &'static [&'static str]) -> FieldSpec {
    FieldSpec {
        column,
        paths,
        ty: FieldType::Text,
    }
}

const fn timestamp(column: &'static str, paths: &'static [&'static str]) -> FieldSpec {
    FieldSpec {
        column,
        paths,
        ty: FieldType::Timestamp,
    }
}

const fn amount(column: &'static str, paths: &'static [&'static str]) -> FieldSpec {
    FieldSpec {
        column,
        paths,
        ty: FieldType::Amount(AmountUnit::Auto),
    }
}

const CUSTOMER_HINTS: &[FieldSpec] = &[
    text("email", &["customer.email", "customer_email", "email"]),
    text("name", &["customer.name", "customer_name"]),
];

static CUSTOMER: Descriptor = Descriptor {
    id_paths: ID_PATHS,
    references: &[],
    fields: &[
        text("name", &["name", "full_name", "fullName"]),
        text("email", &["email"]),
        text("phone", &["phone", "phone_number", "phoneNumber"]),
        text("country", &["address.country", "country"]),
        timestamp("created_at", CREATED_PATHS),
        timestamp("source_updated_at", &["updated_at", "updatedAt"]),
    ],
};

static PLAN: Descriptor = Descriptor {
    id_paths: ID_PATHS,
    references: &[],
    fields: &[
        text("name", &["name", "nickname"]),
        amount("amount", &["amount", "price.amount", "price"]),
        text("currency", &["currency", "price.currency"]),
        text("interval", &["interval", "billing_interval", "recurrence"]),
        FieldSpec {
            column: "setup_fee",
            paths: &["setup_fee", "setupFee"],
            ty: FieldType::Amount(AmountUnit::Major),
        },
        text("status", &["status", "active"]),
        timestamp("created_at", CREATED_PATHS),
    ],
};

static TRANSFER: Descriptor = Descriptor {
    id_paths: ID_PATHS,
    references: &[],
    fields: &[
        amount("amount", &["amount"]),
        FieldSpec {
            column: "fee",
            paths: &["fee", "fees"],
            ty: FieldType::Amount(AmountUnit::Minor),
        },
        text("currency", &["currency"]),
        text("status", &["status"]),
        text("destination", &["destination.id", "destination", "bank_account"]),
        timestamp("created_at", CREATED_PATHS),
        timestamp("arrival_at", &["arrival_date", "arrival_at", "arrivalDate"]),
    ],
};

static PAYMENT_METHOD: Descriptor = Descriptor {
    id_paths: ID_PATHS,
    references: &[],
    fields: &[
        text("method_type", &["type", "method", "payment_type"]),
        text("brand", &["card.brand", "brand"]),
        text("last4", &["card.last4", "last4", "last_four"]),
        text("customer_ref", CUSTOMER_PATHS),
        timestamp("created_at", CREATED_PATHS),
    ],
};

static SUBSCRIPTION: Descriptor = Descriptor {
    id_paths: ID_PATHS,
    references: &[
        ReferenceSpec {
            column: "customer_id",
            paths: CUSTOMER_PATHS,
            hints: CUSTOMER_HINTS,
        },
        ReferenceSpec {
            column: "plan_id",
            paths: &["plan.id", "plan_id", "planId", "price.plan_id", "plan"],
            hints: &[
                amount("amount", &["plan.amount", "price.amount", "amount"]),
                text("currency", &["plan.currency", "price.currency", "currency"]),
                text("interval", &["plan.interval", "price.interval", "interval"]),
                text("name", &["plan.name", "plan_name", "price.nickname"]),
            ],
        },
    ],
    fields: &[
        text("status", &["status"]),
        amount("amount", &["price.amount", "amount", "plan.amount"]),
        text("currency", &["price.currency", "currency", "plan.currency"]),
        timestamp("started_at", &["start_date", "started_at", "startDate"]),
        timestamp(
            "current_period_end",
            &["current_period_end", "next_billing_date", "nextBillingDate"],
        ),
        timestamp("canceled_at", &["canceled_at", "cancelled_at", "canceledAt"]),
        timestamp("created_at", CREATED_PATHS),
    ],
};

static INVOICE: Descriptor = Descriptor {
    id_paths: ID_PATHS,
    references: &[
        ReferenceSpec {
            column: "customer_id",
            paths: CUSTOMER_PATHS,
            hints: CUSTOMER_HINTS,
        },
        ReferenceSpec {
            column: "subscription_id",
            paths: &[
                "subscription.id",
                "subscription_id",
                "subscriptionId",
                "subscription",
            ],
            hints: &[text("customer_id", CUSTOMER_PATHS)],
        },
    ],
    fields: &[
        text("status", &["status"]),
        amount("amount", &["amount", "total", "amount_due"]),
        amount("amount_paid", &["amount_paid", "paid_amount", "amountPaid"]),
        text("currency", &["currency"]),
        timestamp("created_at", CREATED_PATHS),
        timestamp(
            "paid_at",
            &["paid_at", "paidAt", "status_transitions.paid_at", "payment_date"],
        ),
        timestamp("due_at", &["due_date", "due_at", "dueDate"]),
    ],
};

static CHARGEBACK: Descriptor = Descriptor {
    id_paths: ID_PATHS,
    references: &[ReferenceSpec {
        column: "invoice_id",
        paths: &["invoice.id", "invoice_id", "invoiceId", "charge.invoice_id", "invoice"],
        hints: &[
            amount("amount", &["invoice.amount", "amount"]),
            text("currency", &["invoice.currency", "currency"]),
        ],
    }],
    fields: &[
        amount("amount", &["amount"]),
        text("currency", &["currency"]),
        text("status", &["status"]),
        text("reason", &["reason"]),
        timestamp("created_at", CREATED_PATHS),
        timestamp("resolved_at", &["resolved_at", "closed_at", "resolvedAt"]),
    ],
};

pub fn descriptor(kind: EntityKind) -> &'static Descriptor {
    match kind {
        EntityKind::Customer => &CUSTOMER,
        EntityKind::Plan => &PLAN,
        EntityKind::Transfer => &TRANSFER,
        EntityKind::PaymentMethod => &PAYMENT_METHOD,
        EntityKind::Subscription => &SUBSCRIPTION,
        EntityKind::Invoice => &INVOICE,
        EntityKind::Chargeback => &CHARGEBACK,
    }
}

/// Map one source record of `kind` onto its destination shape.
///
/// Never fails: uninterpretable timestamps and amounts become absent columns
/// with a diagnostic, and a record without an id yields `prepared: None`.
pub fn normalize_record(kind: EntityKind, source: &Value, reference_year: i32) -> Normalized {
    let descriptor = descriptor(kind);
    let mut diagnostics = Vec::new();

    let Some(id) = descriptor.id_paths.iter().find_map(|p| identifier(lookup(source, p))) else {
        return Normalized {
            prepared: None,
            diagnostics,
        };
    };

    let fields = extract_fields(descriptor.fields, source, reference_year, &mut diagnostics);

    let mut references = BTreeMap::new();
    let mut parent_hints = BTreeMap::new();
    for spec in descriptor.references {
        let Some(target_id) = spec.paths.iter().find_map(|p| identifier(lookup(source, p))) else {
            continue;
        };
        references.insert(spec.column.to_string(), target_id);
        let hints = extract_fields(spec.hints, source, reference_year, &mut diagnostics);
        if !hints.is_empty() {
            parent_hints.insert(spec.column, hints);
        }
    }

    Normalized {
        prepared: Some(PreparedRecord {
            record: NormalizedRecord {
                kind,
                id,
                references,
                fields,
                raw: Some(source.clone()),
                is_placeholder: false,
            },
            parent_hints,
        }),
        diagnostics,
    }
}

fn extract_fields(
    specs: &[FieldSpec],
    source: &Value,
    reference_year: i32,
    diagnostics: &mut Vec<FieldDiagnostic>,
) -> Map<String, Value> {
    let mut fields = Map::new();
    for spec in specs {
        let Some(raw) = spec
            .paths
            .iter()
            .filter_map(|p| lookup(source, p))
            .find(|v| !v.is_null())
        else {
            continue;
        };

        let value = match spec.ty {
            FieldType::Text => text_value(raw),
            FieldType::Timestamp => timestamp_value(raw, reference_year),
            FieldType::Amount(unit) => amount_value(raw, unit).map(Value::from),
        };

        match value {
            Some(v) => {
                fields.insert(spec.column.to_string(), v);
            }
            None if spec.ty == FieldType::Text => {}
            None => diagnostics.push(FieldDiagnostic {
                column: spec.column,
                raw: raw_string(raw),
            }),
        }
    }
    fields
}

/// Resolve a dotted path inside nested objects.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, segment| current.get(segment))
}

fn identifier(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn raw_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn text_value(value: &Value) -> Option<Value> {
    match value {
        Value::String(s) => Some(Value::String(s.clone())),
        Value::Number(n) => Some(Value::String(n.to_string())),
        Value::Bool(b) => Some(Value::String(b.to_string())),
        _ => None,
    }
}

fn timestamp_value(value: &Value, reference_year: i32) -> Option<Value> {
    let instant = match value {
        Value::String(s) => dates::normalize(Some(s), reference_year),
        Value::Number(n) => dates::normalize(Some(&n.to_string()), reference_year),
        _ => None,
    }?;
    Some(Value::String(
        instant.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
    ))
}

/// Convert a source amount into integer minor units.
pub fn amount_value(value: &Value, unit: AmountUnit) -> Option<i64> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                return match unit {
                    AmountUnit::Major => i.checked_mul(100),
                    AmountUnit::Auto | AmountUnit::Minor => Some(i),
                };
            }
            let f = n.as_f64()?;
            match unit {
                AmountUnit::Minor => float_to_minor(f, 1.0),
                AmountUnit::Auto | AmountUnit::Major => float_to_minor(f, 100.0),
            }
        }
        Value::String(s) => {
            let cleaned = clean_decimal(s)?;
            let f: f64 = cleaned.parse().ok()?;
            match unit {
                AmountUnit::Minor => float_to_minor(f, 1.0),
                AmountUnit::Auto | AmountUnit::Major => float_to_minor(f, 100.0),
            }
        }
        _ => None,
    }
}

fn float_to_minor(value: f64, scale: f64) -> Option<i64> {
    let scaled = (value * scale).round();
    if !scaled.is_finite() || scaled.abs() >= i64::MAX as f64 {
        return None;
    }
    Some(scaled as i64)
}

/// Strip currency symbols and grouping separators from a decimal string.
///
/// When both `.` and `,` appear, the last one is the decimal separator.
/// A lone `,` followed by one or two digits is a decimal comma. Grouped digits
/// must come in threes; anything else is ambiguous and yields `None`.
fn clean_decimal(raw: &str) -> Option<String> {
    let mut rest = raw.trim();
    for prefix in ["R$", "US$"] {
        if let Some(stripped) = rest.strip_prefix(prefix) {
            rest = stripped;
            break;
        }
    }
    let trimmed: String = rest
        .chars()
        .filter(|c| !matches!(c, '$' | '€' | '£' | ' ' | '_' | '\u{a0}'))
        .collect();
    if trimmed.is_empty() {
        return None;
    }

    let (decimal, grouping) = match (trimmed.rfind('.'), trimmed.rfind(',')) {
        (Some(dot), Some(comma)) if dot > comma => (Some('.'), Some(',')),
        (Some(_), Some(_)) => (Some(','), Some('.')),
        (Some(_), None) if trimmed.matches('.').count() > 1 => (None, Some('.')),
        (Some(_), None) => (Some('.'), None),
        // "12,50" uses a decimal comma; "1,250" groups thousands.
        (None, Some(pos)) if trimmed.matches(',').count() == 1 && trimmed.len() - pos - 1 <= 2 => {
            (Some(','), None)
        }
        (None, Some(_)) => (None, Some(',')),
        (None, None) => (None, None),
    };

    if let Some(d) = decimal {
        if trimmed.matches(d).count() > 1 {
            return None;
        }
    }

    if let Some(g) = grouping {
        let integer = match decimal.and_then(|d| trimmed.find(d)) {
            Some(pos) => &trimmed[..pos],
            None => trimmed.as_str(),
        };
        let mut groups = integer.split(g);
        let lead = groups.next().unwrap_or_default();
        if lead.trim_start_matches(['-', '+']).is_empty() || groups.any(|group| group.len() != 3) {
            return None;
        }
    }

    let cleaned: String = trimmed
        .chars()
        .filter(|c| Some(*c) != grouping)
        .map(|c| if Some(c) == decimal { '.' } else { c })
        .collect();

    let valid = cleaned
        .chars()
        .enumerate()
        .all(|(i, c)| c.is_ascii_digit() || c == '.' || (i == 0 && (c == '-' || c == '+')));
    valid.then_some(cleaned)
}
