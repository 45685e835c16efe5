//! Invoice, payment and balance records

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::error::BillingError;

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = BillingError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(BillingError::Database(format!(
                        "unknown {} value '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Pending,
    Paid,
    Overdue,
    Cancelled,
}

string_enum!(InvoiceStatus {
    Pending => "pending",
    Paid => "paid",
    Overdue => "overdue",
    Cancelled => "cancelled",
});

impl InvoiceStatus {
    /// Invoices in these states can still receive payments.
    pub fn is_payable(self) -> bool {
        matches!(self, InvoiceStatus::Pending | InvoiceStatus::Overdue)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Confirmed,
    Cancelled,
}

string_enum!(PaymentStatus {
    Pending => "pending",
    Confirmed => "confirmed",
    Cancelled => "cancelled",
});

impl PaymentStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }
}

/// Payment channel recorded on each payment row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// Merchant prepare/complete handshake
    TwoPhase,
    /// Hosted checkout page with a single webhook
    HostedCheckout,
    /// Cash or bank transfer recorded by a collector
    Offline,
    None,
}

string_enum!(Provider {
    TwoPhase => "two_phase",
    HostedCheckout => "hosted_checkout",
    Offline => "offline",
    None => "none",
});

impl Provider {
    pub fn is_online(self) -> bool {
        matches!(self, Provider::TwoPhase | Provider::HostedCheckout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Online,
    Offline,
}

string_enum!(PaymentMethod {
    Online => "online",
    Offline => "offline",
});

/// Terminal outcome applied by the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Confirm,
    Cancel,
}

impl Outcome {
    pub fn target_status(self) -> PaymentStatus {
        match self {
            Outcome::Confirm => PaymentStatus::Confirmed,
            Outcome::Cancel => PaymentStatus::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Invoice {
    pub id: Uuid,
    pub contract_id: Uuid,
    pub tenant_id: Uuid,
    /// Minor currency units
    pub amount: i64,
    pub due_date: Date,
    pub status: InvoiceStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Payment {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub tenant_id: Uuid,
    pub contract_id: Uuid,
    pub provider: Provider,
    pub method: PaymentMethod,
    pub amount: i64,
    pub status: PaymentStatus,
    pub provider_payment_ref: Option<String>,
    pub prepare_ref: Option<String>,
    /// Verbatim copy of the last provider message applied to this row
    pub raw_payload: Option<String>,
    pub collector_note: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub paid_at: Option<OffsetDateTime>,
}

impl Payment {
    /// A pending online attempt to pay the full invoice amount.
    pub fn intent(invoice: &Invoice, provider: Provider, now: OffsetDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            invoice_id: invoice.id,
            tenant_id: invoice.tenant_id,
            contract_id: invoice.contract_id,
            provider,
            method: PaymentMethod::Online,
            amount: invoice.amount,
            status: PaymentStatus::Pending,
            provider_payment_ref: None,
            prepare_ref: None,
            raw_payload: None,
            collector_note: None,
            created_at: now,
            paid_at: None,
        }
    }

    /// A collector-recorded payment, confirmed on creation.
    pub fn offline(invoice: &Invoice, amount: i64, note: &str, now: OffsetDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            invoice_id: invoice.id,
            tenant_id: invoice.tenant_id,
            contract_id: invoice.contract_id,
            provider: Provider::Offline,
            method: PaymentMethod::Offline,
            amount,
            status: PaymentStatus::Confirmed,
            provider_payment_ref: None,
            prepare_ref: None,
            raw_payload: None,
            collector_note: Some(note.to_string()),
            created_at: now,
            paid_at: Some(now),
        }
    }
}

/// Sum of confirmed payment amounts.
pub fn confirmed_total<'a>(payments: impl IntoIterator<Item = &'a Payment>) -> i64 {
    payments
        .into_iter()
        .filter(|p| p.status == PaymentStatus::Confirmed)
        .map(|p| p.amount)
        .sum()
}

/// Cached per-tenant aggregate. Rebuildable from invoices and payments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Balance {
    pub tenant_id: Uuid,
    pub invoiced_total: i64,
    pub paid_total: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Balance {
    /// Confirmed payments minus invoiced amounts; negative means the tenant owes.
    pub fn amount(&self) -> i64 {
        self.paid_total - self.invoiced_total
    }
}

/// Which step of a provider protocol produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Prepare,
    Complete,
    Webhook,
    Poll,
}

/// What the provider says happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    /// Two-phase prepare: hold the payment for a provider transaction
    Reserve,
    Confirm,
    Cancel,
    StillPending,
}

/// Provider-neutral form of an inbound callback, produced after signature checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InternalEvent {
    pub provider: Provider,
    pub provider_payment_ref: Option<String>,
    pub merchant_ref: Option<String>,
    pub prepare_ref: Option<String>,
    pub amount: Option<i64>,
    pub phase: Phase,
    pub outcome: EventOutcome,
    /// Negative provider error code, when the provider reported one
    pub provider_error: Option<i32>,
}
