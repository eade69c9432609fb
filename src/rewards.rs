//! Reward ledger: computes reward line items for a converted referral,
//! schedules them, and pays due rewards out through the configured
//! payout channel.
//!
//! The due sweep claims each reward with a conditional
//! SCHEDULED -> PROCESSING update before invoking the channel, so two
//! overlapping sweep executions can never double-pay the same reward.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::directory::MemberDirectory;
use crate::ledger::{Referral, ReferralKind, ReferralStatus};
use crate::payout::{
    BankTransferChannel, InvoiceCreditChannel, ManualChannel, PayoutChannel, PayoutChannelKind,
    PayoutRequest,
};
use crate::registry::OwnerType;

#[derive(Debug, Error)]
pub enum RewardError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Corrupt reward row: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewardStatus {
    Scheduled,
    Processing,
    Paid,
    Failed,
    Void,
}

impl RewardStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "SCHEDULED",
            Self::Processing => "PROCESSING",
            Self::Paid => "PAID",
            Self::Failed => "FAILED",
            Self::Void => "VOID",
        }
    }
}

impl FromStr for RewardStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SCHEDULED" => Ok(Self::Scheduled),
            "PROCESSING" => Ok(Self::Processing),
            "PAID" => Ok(Self::Paid),
            "FAILED" => Ok(Self::Failed),
            "VOID" => Ok(Self::Void),
            other => Err(format!("unknown reward status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reward {
    pub id: Uuid,
    pub referral_id: Uuid,
    pub referrer_id: String,
    pub referrer_type: OwnerType,
    pub referrer_company_id: Option<String>,
    pub amount_eur: Decimal,
    pub due_date: DateTime<Utc>,
    pub status: RewardStatus,
    pub channel: PayoutChannelKind,
    pub last_error: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
}

fn reward_from_row(row: &SqliteRow) -> Result<Reward, RewardError> {
    let id: String = row.try_get("id")?;
    let referral_id: String = row.try_get("referral_id")?;
    let referrer_type: String = row.try_get("referrer_type")?;
    let amount: String = row.try_get("amount_eur")?;
    let status: String = row.try_get("status")?;
    let channel: String = row.try_get("payout_channel")?;

    Ok(Reward {
        id: Uuid::parse_str(&id).map_err(|e| RewardError::Corrupt(e.to_string()))?,
        referral_id: Uuid::parse_str(&referral_id)
            .map_err(|e| RewardError::Corrupt(e.to_string()))?,
        referrer_id: row.try_get("referrer_id")?,
        referrer_type: referrer_type.parse().map_err(RewardError::Corrupt)?,
        referrer_company_id: row.try_get("referrer_company_id")?,
        amount_eur: Decimal::from_str(&amount).map_err(|e| RewardError::Corrupt(e.to_string()))?,
        due_date: row.try_get("due_date")?,
        status: status.parse().map_err(RewardError::Corrupt)?,
        channel: channel.parse().map_err(RewardError::Corrupt)?,
        last_error: row.try_get("last_error")?,
        paid_at: row.try_get("paid_at")?,
    })
}

pub async fn find_rewards_for_referral(
    pool: &SqlitePool,
    referral_id: Uuid,
) -> Result<Vec<Reward>, RewardError> {
    let rows = sqlx::query("SELECT * FROM rewards WHERE referral_id = ?1 ORDER BY due_date ASC")
        .bind(referral_id.to_string())
        .fetch_all(pool)
        .await?;

    rows.iter().map(reward_from_row).collect()
}

/// Which payout channel handles rewards for each referrer type.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ChannelConfig {
    #[serde(default = "default_channel")]
    pub member: PayoutChannelKind,
    #[serde(default = "default_channel")]
    pub business: PayoutChannelKind,
}

fn default_channel() -> PayoutChannelKind {
    PayoutChannelKind::InvoiceCredit
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            member: default_channel(),
            business: default_channel(),
        }
    }
}

impl ChannelConfig {
    fn channel_for(self, owner_type: OwnerType) -> PayoutChannelKind {
        match owner_type {
            OwnerType::Member => self.member,
            OwnerType::Business => self.business,
        }
    }
}

/// One implementation per channel kind; the sweep routes each reward by
/// its stored channel.
pub struct PayoutChannels {
    pub invoice_credit: Arc<dyn PayoutChannel>,
    pub bank_transfer: Arc<dyn PayoutChannel>,
    pub manual: Arc<dyn PayoutChannel>,
}

impl PayoutChannels {
    pub fn production(directory: Arc<dyn MemberDirectory>) -> Self {
        Self {
            invoice_credit: Arc::new(InvoiceCreditChannel::new(directory)),
            bank_transfer: Arc::new(BankTransferChannel),
            manual: Arc::new(ManualChannel),
        }
    }

    fn get(&self, kind: PayoutChannelKind) -> &dyn PayoutChannel {
        match kind {
            PayoutChannelKind::InvoiceCredit => self.invoice_credit.as_ref(),
            PayoutChannelKind::BankTransfer => self.bank_transfer.as_ref(),
            PayoutChannelKind::Manual => self.manual.as_ref(),
        }
    }
}

/// Per-item outcome counts of one due-reward sweep.
///
/// `skipped` counts rewards the sweep could not take on: claimed by an
/// overlapping sweep, or unreadable rows. `stuck` counts rewards whose
/// payout went through but whose PAID transition could not be recorded;
/// those rows stay PROCESSING and need operator attention.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepSummary {
    pub paid: usize,
    pub failed: usize,
    pub skipped: usize,
    pub stuck: usize,
}

/// Percentage of the subscription value and due-date offset in days.
const MEMBER_SCHEDULE: &[(u32, i64)] = &[(50, 0)];
const BUSINESS_SCHEDULE: &[(u32, i64)] = &[(20, 0), (10, 30), (5, 60)];

pub struct RewardLedger {
    pool: SqlitePool,
    channel_config: ChannelConfig,
    channels: PayoutChannels,
}

impl RewardLedger {
    pub fn new(pool: SqlitePool, channel_config: ChannelConfig, channels: PayoutChannels) -> Self {
        Self {
            pool,
            channel_config,
            channels,
        }
    }

    /// Creates the reward line items for a converted referral in one
    /// atomic batch and returns them. Non-converted referrals or
    /// referrals without a positive subscription value yield no rewards.
    #[tracing::instrument(skip(self, referral), fields(referral_id = %referral.id))]
    pub async fn create_rewards_for_conversion(
        &self,
        referral: &Referral,
    ) -> Result<Vec<Reward>, RewardError> {
        if referral.status != ReferralStatus::Converted {
            warn!(
                "Skipping reward creation for referral {} with status {}",
                referral.id,
                referral.status.as_str()
            );
            return Ok(Vec::new());
        }

        let ReferralKind::Membership {
            subscription_value, ..
        } = referral.kind
        else {
            warn!(
                "Skipping reward creation for referral {} without membership data",
                referral.id
            );
            return Ok(Vec::new());
        };

        if subscription_value <= Decimal::ZERO {
            warn!(
                "Skipping reward creation for referral {} with non-positive \
                 subscription value {subscription_value}",
                referral.id
            );
            return Ok(Vec::new());
        }

        let schedule = match referral.referrer_type {
            OwnerType::Member => MEMBER_SCHEDULE,
            OwnerType::Business => BUSINESS_SCHEDULE,
        };
        let channel = self.channel_config.channel_for(referral.referrer_type);
        let now = Utc::now();

        let rewards: Vec<Reward> = schedule
            .iter()
            .map(|&(percent, offset_days)| Reward {
                id: Uuid::new_v4(),
                referral_id: referral.id,
                referrer_id: referral.referrer_id.clone(),
                referrer_type: referral.referrer_type,
                referrer_company_id: referral.referrer_company_id.clone(),
                amount_eur: (subscription_value * Decimal::from(percent)
                    / Decimal::ONE_HUNDRED)
                    .round_dp(2),
                due_date: now + Duration::days(offset_days),
                status: RewardStatus::Scheduled,
                channel,
                last_error: None,
                paid_at: None,
            })
            .collect();

        let total: Decimal = rewards.iter().map(|r| r.amount_eur).sum();

        let mut tx = self.pool.begin().await?;

        for reward in &rewards {
            sqlx::query(
                r"
                INSERT INTO rewards
                    (id, referral_id, referrer_id, referrer_type, referrer_company_id,
                     amount_eur, due_date, status, payout_channel)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ",
            )
            .bind(reward.id.to_string())
            .bind(reward.referral_id.to_string())
            .bind(&reward.referrer_id)
            .bind(reward.referrer_type.as_str())
            .bind(reward.referrer_company_id.as_deref())
            .bind(reward.amount_eur.to_string())
            .bind(reward.due_date)
            .bind(reward.status.as_str())
            .bind(reward.channel.as_str())
            .execute(tx.as_mut())
            .await?;
        }

        let rewarded: Option<String> =
            sqlx::query_scalar("SELECT total_rewarded_eur FROM referral_codes WHERE owner_id = ?1")
                .bind(&referral.referrer_id)
                .fetch_optional(tx.as_mut())
                .await?;
        if let Some(rewarded) = rewarded {
            let rewarded =
                Decimal::from_str(&rewarded).map_err(|e| RewardError::Corrupt(e.to_string()))?;
            sqlx::query("UPDATE referral_codes SET total_rewarded_eur = ?1 WHERE owner_id = ?2")
                .bind((rewarded + total).to_string())
                .bind(&referral.referrer_id)
                .execute(tx.as_mut())
                .await?;
        }

        tx.commit().await?;

        info!(
            "Scheduled {} reward(s) totalling {total} EUR for referral {}",
            rewards.len(),
            referral.id
        );
        Ok(rewards)
    }

    /// Pays out every reward whose due date has passed. Each reward is
    /// processed independently; one payout failure never aborts the
    /// rest of the sweep. Returns per-item outcome counts; an error is
    /// surfaced only when the sweep query itself fails.
    #[tracing::instrument(skip(self))]
    pub async fn process_due_rewards(&self) -> Result<SweepSummary, RewardError> {
        let now = Utc::now();
        let rows =
            sqlx::query("SELECT * FROM rewards WHERE status = 'SCHEDULED' AND due_date <= ?1")
                .bind(now)
                .fetch_all(&self.pool)
                .await?;
        let mut summary = SweepSummary::default();
        let mut due = Vec::with_capacity(rows.len());
        for row in &rows {
            match reward_from_row(row) {
                Ok(reward) => due.push(reward),
                // One bad row must not starve the rest of the sweep.
                Err(e) => {
                    error!("Skipping unreadable reward row: {e}");
                    summary.skipped += 1;
                }
            }
        }

        if due.is_empty() && summary.skipped == 0 {
            info!("No rewards due");
            return Ok(summary);
        }

        info!("Processing {} due reward(s)", due.len());

        for reward in due {
            if !self.claim(reward.id).await? {
                // Another sweep got there first.
                summary.skipped += 1;
                continue;
            }

            let request = PayoutRequest {
                referrer_id: reward.referrer_id.clone(),
                company_id: reward.referrer_company_id.clone(),
                amount_eur: reward.amount_eur,
                due_date: reward.due_date,
            };

            match self.channels.get(reward.channel).payout(&request).await {
                Ok(()) => {
                    if let Err(e) = self.mark_paid(reward.id).await {
                        // Money moved but the row still says PROCESSING.
                        error!("Paid reward {} but could not record it: {e}", reward.id);
                        summary.stuck += 1;
                    } else {
                        summary.paid += 1;
                    }
                }
                Err(e) => {
                    warn!("Payout of reward {} failed: {e}", reward.id);
                    if let Err(db) = self.mark_failed(reward.id, &e.to_string()).await {
                        error!("Failed to record failure of reward {}: {db}", reward.id);
                    }
                    summary.failed += 1;
                }
            }
        }

        info!(
            "Sweep complete: {} paid, {} failed, {} skipped, {} stuck",
            summary.paid, summary.failed, summary.skipped, summary.stuck
        );
        Ok(summary)
    }

    /// Voids every still-scheduled reward of a referral. Completed
    /// payouts are never reversed. Returns the number of voided rewards.
    #[tracing::instrument(skip(self))]
    pub async fn void_future_rewards(&self, referral_id: Uuid) -> Result<u64, RewardError> {
        let result = sqlx::query(
            "UPDATE rewards SET status = 'VOID' WHERE referral_id = ?1 AND status = 'SCHEDULED'",
        )
        .bind(referral_id.to_string())
        .execute(&self.pool)
        .await?;

        let voided = result.rows_affected();
        if voided > 0 {
            info!("Voided {voided} scheduled reward(s) for referral {referral_id}");
        }
        Ok(voided)
    }

    /// Conditional SCHEDULED -> PROCESSING transition. Returns false if
    /// the reward was no longer SCHEDULED, i.e. already claimed.
    async fn claim(&self, reward_id: Uuid) -> Result<bool, RewardError> {
        let result = sqlx::query(
            "UPDATE rewards SET status = 'PROCESSING' WHERE id = ?1 AND status = 'SCHEDULED'",
        )
        .bind(reward_id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_paid(&self, reward_id: Uuid) -> Result<(), RewardError> {
        sqlx::query("UPDATE rewards SET status = 'PAID', paid_at = ?1 WHERE id = ?2")
            .bind(Utc::now())
            .bind(reward_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_failed(&self, reward_id: Uuid, message: &str) -> Result<(), RewardError> {
        sqlx::query("UPDATE rewards SET status = 'FAILED', last_error = ?1 WHERE id = ?2")
            .bind(message)
            .bind(reward_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
