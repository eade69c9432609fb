//! Payout channels: the mechanisms by which a scheduled reward is
//! actually delivered. Channels are injected strategies so the reward
//! sweep stays independent of any particular delivery system.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::directory::{DirectoryError, MemberDirectory, MemberPatch};

#[derive(Debug, Error)]
pub enum PayoutError {
    #[error("Payout channel not implemented")]
    NotImplemented,
    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PayoutChannelKind {
    InvoiceCredit,
    BankTransfer,
    Manual,
}

impl PayoutChannelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvoiceCredit => "invoice-credit",
            Self::BankTransfer => "bank-transfer",
            Self::Manual => "manual",
        }
    }
}

impl FromStr for PayoutChannelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "invoice-credit" => Ok(Self::InvoiceCredit),
            "bank-transfer" => Ok(Self::BankTransfer),
            "manual" => Ok(Self::Manual),
            other => Err(format!("unknown payout channel: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PayoutRequest {
    pub referrer_id: String,
    pub company_id: Option<String>,
    pub amount_eur: Decimal,
    pub due_date: DateTime<Utc>,
}

#[async_trait]
pub trait PayoutChannel: Send + Sync {
    async fn payout(&self, request: &PayoutRequest) -> Result<(), PayoutError>;
}

/// Credits the reward amount onto the referrer's next invoice by
/// accumulating it on the directory profile. Business referrers are
/// credited on the company record when one is present.
pub struct InvoiceCreditChannel {
    directory: Arc<dyn MemberDirectory>,
}

impl InvoiceCreditChannel {
    pub fn new(directory: Arc<dyn MemberDirectory>) -> Self {
        Self { directory }
    }
}

#[async_trait]
impl PayoutChannel for InvoiceCreditChannel {
    async fn payout(&self, request: &PayoutRequest) -> Result<(), PayoutError> {
        let target = request
            .company_id
            .as_deref()
            .unwrap_or(&request.referrer_id);

        let profile = self.directory.get_member(target).await?;
        let credited = profile.pending_credit_eur.unwrap_or(Decimal::ZERO) + request.amount_eur;

        let patch = MemberPatch {
            pending_credit_eur: Some(credited),
            ..MemberPatch::default()
        };
        self.directory.update_member(target, patch).await?;

        info!(
            "Credited {} EUR to {target} (total pending credit {credited})",
            request.amount_eur
        );
        Ok(())
    }
}

/// Not yet integrated with any banking provider; every payout attempt
/// fails so the reward ends up FAILED and visible to operators.
pub struct BankTransferChannel;

#[async_trait]
impl PayoutChannel for BankTransferChannel {
    async fn payout(&self, _request: &PayoutRequest) -> Result<(), PayoutError> {
        Err(PayoutError::NotImplemented)
    }
}

/// Payout handled outside the system; marking the reward paid is all
/// that is required.
pub struct ManualChannel;

#[async_trait]
impl PayoutChannel for ManualChannel {
    async fn payout(&self, request: &PayoutRequest) -> Result<(), PayoutError> {
        info!(
            "Manual payout of {} EUR for {} recorded as handled externally",
            request.amount_eur, request.referrer_id
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemberProfile;
    use crate::test_utils::StubDirectory;

    fn request(amount: Decimal, company_id: Option<&str>) -> PayoutRequest {
        PayoutRequest {
            referrer_id: "M1".to_string(),
            company_id: company_id.map(str::to_string),
            amount_eur: amount,
            due_date: Utc::now(),
        }
    }

    #[tokio::test]
    async fn invoice_credit_accumulates_on_member_profile() {
        let directory = Arc::new(StubDirectory::with_members([(
            "M1".to_string(),
            MemberProfile {
                pending_credit_eur: Some(Decimal::new(1050, 2)),
                ..MemberProfile::default()
            },
        )]));
        let channel = InvoiceCreditChannel::new(directory.clone());

        channel
            .payout(&request(Decimal::new(50000, 2), None))
            .await
            .unwrap();

        let profile = directory.get_member("M1").await.unwrap();
        assert_eq!(profile.pending_credit_eur, Some(Decimal::new(51050, 2)));
    }

    #[tokio::test]
    async fn invoice_credit_targets_company_when_present() {
        let directory = Arc::new(StubDirectory::with_members([(
            "C9".to_string(),
            MemberProfile::default(),
        )]));
        let channel = InvoiceCreditChannel::new(directory.clone());

        channel
            .payout(&request(Decimal::new(20000, 2), Some("C9")))
            .await
            .unwrap();

        let profile = directory.get_member("C9").await.unwrap();
        assert_eq!(profile.pending_credit_eur, Some(Decimal::new(20000, 2)));
    }

    #[tokio::test]
    async fn bank_transfer_always_fails() {
        let err = BankTransferChannel
            .payout(&request(Decimal::ONE, None))
            .await
            .unwrap_err();

        assert!(matches!(err, PayoutError::NotImplemented));
    }

    #[tokio::test]
    async fn manual_channel_is_a_no_op_success() {
        ManualChannel
            .payout(&request(Decimal::ONE, None))
            .await
            .unwrap();
    }
}
