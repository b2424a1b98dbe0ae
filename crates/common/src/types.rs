use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PaysyncError;

/// Billing entity kinds copied from the payment platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Invoice,
    Customer,
    Subscription,
    Plan,
    Transfer,
    PaymentMethod,
    Chargeback,
}

/// A foreign-key edge from one entity kind to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reference {
    /// Destination column holding the referenced id.
    pub column: &'static str,
    pub target: EntityKind,
    /// Optional references may be absent on a record; present ones are still resolved.
    pub required: bool,
}

const SUBSCRIPTION_REFS: &[Reference] = &[
    Reference {
        column: "customer_id",
        target: EntityKind::Customer,
        required: true,
    },
    Reference {
        column: "plan_id",
        target: EntityKind::Plan,
        required: true,
    },
];

const INVOICE_REFS: &[Reference] = &[
    Reference {
        column: "customer_id",
        target: EntityKind::Customer,
        required: true,
    },
    Reference {
        column: "subscription_id",
        target: EntityKind::Subscription,
        required: false,
    },
];

const CHARGEBACK_REFS: &[Reference] = &[Reference {
    column: "invoice_id",
    target: EntityKind::Invoice,
    required: true,
}];

impl EntityKind {
    pub const ALL: [EntityKind; 7] = [
        EntityKind::Customer,
        EntityKind::Plan,
        EntityKind::Transfer,
        EntityKind::PaymentMethod,
        EntityKind::Subscription,
        EntityKind::Invoice,
        EntityKind::Chargeback,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invoice => "invoice",
            Self::Customer => "customer",
            Self::Subscription => "subscription",
            Self::Plan => "plan",
            Self::Transfer => "transfer",
            Self::PaymentMethod => "payment_method",
            Self::Chargeback => "chargeback",
        }
    }

    /// Destination table name.
    pub fn table(&self) -> &'static str {
        match self {
            Self::Invoice => "billing_invoices",
            Self::Customer => "billing_customers",
            Self::Subscription => "billing_subscriptions",
            Self::Plan => "billing_plans",
            Self::Transfer => "billing_transfers",
            Self::PaymentMethod => "billing_payment_methods",
            Self::Chargeback => "billing_chargebacks",
        }
    }

    /// Path segment of the source collection endpoint.
    pub fn endpoint(&self) -> &'static str {
        match self {
            Self::Invoice => "invoices",
            Self::Customer => "customers",
            Self::Subscription => "subscriptions",
            Self::Plan => "plans",
            Self::Transfer => "transfers",
            Self::PaymentMethod => "payment-methods",
            Self::Chargeback => "chargebacks",
        }
    }

    pub fn references(&self) -> &'static [Reference] {
        match self {
            Self::Subscription => SUBSCRIPTION_REFS,
            Self::Invoice => INVOICE_REFS,
            Self::Chargeback => CHARGEBACK_REFS,
            _ => &[],
        }
    }

    /// Position in the dependency order: every kind only references kinds of a lower tier.
    pub fn tier(&self) -> u8 {
        match self {
            Self::Customer | Self::Plan | Self::Transfer | Self::PaymentMethod => 0,
            Self::Subscription => 1,
            Self::Invoice => 2,
            Self::Chargeback => 3,
        }
    }

    /// Group `kinds` into dependency tiers, lowest first. Duplicates are dropped.
    pub fn tiers(kinds: &[EntityKind]) -> Vec<Vec<EntityKind>> {
        let mut sorted: Vec<EntityKind> = kinds.to_vec();
        sorted.sort_by_key(|k| (k.tier(), *k));
        sorted.dedup();

        let mut tiers: Vec<Vec<EntityKind>> = Vec::new();
        for kind in sorted {
            match tiers.last_mut() {
                Some(last) if last[0].tier() == kind.tier() => last.push(kind),
                _ => tiers.push(vec![kind]),
            }
        }
        tiers
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = PaysyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace(['-', ' '], "_");
        let singular = normalized.strip_suffix('s').unwrap_or(&normalized);
        match singular {
            "invoice" => Ok(Self::Invoice),
            "customer" => Ok(Self::Customer),
            "subscription" => Ok(Self::Subscription),
            "plan" => Ok(Self::Plan),
            "transfer" => Ok(Self::Transfer),
            "payment_method" | "paymentmethod" => Ok(Self::PaymentMethod),
            "chargeback" => Ok(Self::Chargeback),
            _ => Err(PaysyncError::Config(format!("unknown entity kind: {s}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn references_only_point_to_lower_tiers() {
        for kind in EntityKind::ALL {
            for r in kind.references() {
                assert!(
                    r.target.tier() < kind.tier(),
                    "{kind} -> {} breaks tier order",
                    r.target
                );
            }
        }
    }

    #[test]
    fn tiers_group_independent_kinds() {
        let tiers = EntityKind::tiers(&[
            EntityKind::Chargeback,
            EntityKind::Invoice,
            EntityKind::Plan,
            EntityKind::Customer,
            EntityKind::Subscription,
        ]);
        assert_eq!(
            tiers,
            vec![
                vec![EntityKind::Customer, EntityKind::Plan],
                vec![EntityKind::Subscription],
                vec![EntityKind::Invoice],
                vec![EntityKind::Chargeback],
            ]
        );
    }

    #[test]
    fn tiers_skip_missing_levels_and_dedup() {
        let tiers = EntityKind::tiers(&[
            EntityKind::Invoice,
            EntityKind::Transfer,
            EntityKind::Invoice,
        ]);
        assert_eq!(
            tiers,
            vec![vec![EntityKind::Transfer], vec![EntityKind::Invoice]]
        );
    }

    #[test]
    fn parse_accepts_plural_and_dashes() {
        assert_eq!("Invoices".parse::<EntityKind>().unwrap(), EntityKind::Invoice);
        assert_eq!(
            "payment-methods".parse::<EntityKind>().unwrap(),
            EntityKind::PaymentMethod
        );
        assert_eq!(
            " chargeback ".parse::<EntityKind>().unwrap(),
            EntityKind::Chargeback
        );
    }

    #[test]
    fn parse_rejects_unknown() {
        let err = "refunds".parse::<EntityKind>().unwrap_err();
        assert!(err.to_string().contains("unknown entity kind"), "got: {err}");
    }

    #[test]
    fn serializes_snake_case() {
        let json = serde_json::to_string(&EntityKind::PaymentMethod).unwrap();
        assert_eq!(json, "\"payment_method\"");
    }
}
