//! Referral ledger: records that a user was brought in through a
//! referral code and later confirms the conversion exactly once.
//!
//! Every multi-document invariant (one referral per user, no self
//! referral, exactly-once conversion) is guarded by running the
//! read-check-write sequence inside a single store transaction. Writes
//! to the external member directory happen after commit and are
//! best-effort only.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::directory::{MemberDirectory, MemberPatch};
use crate::outcome::Outcome;
use crate::registry::{referral_code_from_row, OwnerType, RegistryError};
use crate::rewards::{RewardError, RewardLedger};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("Referral code not found: {0}")]
    ReferralCodeNotFound(String),
    #[error("User already referred through this code")]
    AlreadyReferred,
    #[error("Referrers cannot refer themselves")]
    SelfReferral,
    #[error("User already referred through another code")]
    AlreadyReferredByOtherCode,
    #[error("Referral not eligible for conversion (status {status})")]
    NotEligibleForConversion { status: ReferralStatus },
    #[error("Referral not found: {0}")]
    DocumentNotFound(Uuid),
    #[error("Reward creation failed: {0}")]
    Reward(#[from] RewardError),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Corrupt referral row: {0}")]
    Corrupt(String),
}

impl From<RegistryError> for LedgerError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Database(e) => Self::Database(e),
            other => Self::Corrupt(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferralStatus {
    Trial,
    AwaitingPayment,
    Converted,
}

impl ReferralStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trial => "TRIAL",
            Self::AwaitingPayment => "AWAITING_PAYMENT",
            Self::Converted => "CONVERTED",
        }
    }
}

impl std::fmt::Display for ReferralStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReferralStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TRIAL" => Ok(Self::Trial),
            "AWAITING_PAYMENT" => Ok(Self::AwaitingPayment),
            "CONVERTED" => Ok(Self::Converted),
            other => Err(format!("unknown referral status: {other}")),
        }
    }
}

/// A referral is either a trial-day visit or a paid membership signup;
/// exactly one variant's data is ever present.
#[derive(Debug, Clone, PartialEq)]
pub enum ReferralKind {
    TrialDay {
        trial_start_date: DateTime<Utc>,
        trial_day_id: String,
        opportunity_id: String,
    },
    Membership {
        membership_start_date: DateTime<Utc>,
        subscription_value: Decimal,
        referral_value: Decimal,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Referral {
    pub id: Uuid,
    pub referrer_id: String,
    pub referrer_company_id: Option<String>,
    pub referrer_type: OwnerType,
    pub referred_user_id: String,
    pub referral_code: String,
    pub status: ReferralStatus,
    pub kind: ReferralKind,
    pub reward_ids: Vec<Uuid>,
    pub converted_at: Option<DateTime<Utc>>,
}

/// Flat request as the intake boundary delivers it; `validate` turns it
/// into a [`ReferralKind`] or rejects it naming the offending field.
#[derive(Debug, Clone, Default)]
pub struct CreateReferralRequest {
    pub referral_code: String,
    pub referred_user_id: String,
    pub referrer_company_id: Option<String>,
    pub is_trialday: bool,
    pub trial_start_date: Option<DateTime<Utc>>,
    pub trial_day_id: Option<String>,
    pub opportunity_id: Option<String>,
    pub membership_start_date: Option<DateTime<Utc>>,
    pub subscription_value: Option<Decimal>,
    pub referral_value: Option<Decimal>,
}

impl CreateReferralRequest {
    fn validate(self) -> Result<ValidatedReferral, LedgerError> {
        use LedgerError::InvalidArgument;

        let kind = if self.is_trialday {
            if self.membership_start_date.is_some() {
                return Err(InvalidArgument(
                    "membership_start_date not allowed for trial-day referrals",
                ));
            }
            if self.subscription_value.is_some() {
                return Err(InvalidArgument(
                    "subscription_value not allowed for trial-day referrals",
                ));
            }
            if self.referral_value.is_some() {
                return Err(InvalidArgument(
                    "referral_value not allowed for trial-day referrals",
                ));
            }

            ReferralKind::TrialDay {
                trial_start_date: self
                    .trial_start_date
                    .ok_or(InvalidArgument("trial_start_date is required"))?,
                trial_day_id: self
                    .trial_day_id
                    .ok_or(InvalidArgument("trial_day_id is required"))?,
                opportunity_id: self
                    .opportunity_id
                    .ok_or(InvalidArgument("opportunity_id is required"))?,
            }
        } else {
            if self.trial_start_date.is_some() {
                return Err(InvalidArgument(
                    "trial_start_date not allowed for membership referrals",
                ));
            }
            if self.trial_day_id.is_some() {
                return Err(InvalidArgument(
                    "trial_day_id not allowed for membership referrals",
                ));
            }
            if self.opportunity_id.is_some() {
                return Err(InvalidArgument(
                    "opportunity_id not allowed for membership referrals",
                ));
            }

            ReferralKind::Membership {
                membership_start_date: self
                    .membership_start_date
                    .ok_or(InvalidArgument("membership_start_date is required"))?,
                subscription_value: self
                    .subscription_value
                    .ok_or(InvalidArgument("subscription_value is required"))?,
                referral_value: self
                    .referral_value
                    .ok_or(InvalidArgument("referral_value is required"))?,
            }
        };

        Ok(ValidatedReferral {
            referral_code: self.referral_code,
            referred_user_id: self.referred_user_id,
            referrer_company_id: self.referrer_company_id,
            kind,
        })
    }
}

struct ValidatedReferral {
    referral_code: String,
    referred_user_id: String,
    referrer_company_id: Option<String>,
    kind: ReferralKind,
}

pub(crate) fn referral_from_row(row: &SqliteRow) -> Result<Referral, LedgerError> {
    let id: String = row.try_get("id")?;
    let referrer_type: String = row.try_get("referrer_type")?;
    let status: String = row.try_get("status")?;

    let trial_day_id: Option<String> = row.try_get("trial_day_id")?;
    let subscription_value: Option<String> = row.try_get("subscription_value")?;

    let kind = match (trial_day_id, subscription_value) {
        (Some(trial_day_id), None) => ReferralKind::TrialDay {
            trial_start_date: row.try_get("trial_start_date")?,
            trial_day_id,
            opportunity_id: row.try_get("opportunity_id")?,
        },
        (None, Some(subscription_value)) => {
            let referral_value: String = row.try_get("referral_value")?;
            ReferralKind::Membership {
                membership_start_date: row.try_get("membership_start_date")?,
                subscription_value: Decimal::from_str(&subscription_value)
                    .map_err(|e| LedgerError::Corrupt(e.to_string()))?,
                referral_value: Decimal::from_str(&referral_value)
                    .map_err(|e| LedgerError::Corrupt(e.to_string()))?,
            }
        }
        _ => {
            return Err(LedgerError::Corrupt(format!(
                "referral {id} has neither or both of trial-day and membership data"
            )))
        }
    };

    let reward_ids: Option<String> = row.try_get("reward_ids")?;
    let reward_ids = match reward_ids {
        Some(json) => {
            serde_json::from_str(&json).map_err(|e| LedgerError::Corrupt(e.to_string()))?
        }
        None => Vec::new(),
    };

    Ok(Referral {
        id: Uuid::parse_str(&id).map_err(|e| LedgerError::Corrupt(e.to_string()))?,
        referrer_id: row.try_get("referrer_id")?,
        referrer_company_id: row.try_get("referrer_company_id")?,
        referrer_type: referrer_type.parse().map_err(LedgerError::Corrupt)?,
        referred_user_id: row.try_get("referred_user_id")?,
        referral_code: row.try_get("referral_code")?,
        status: status.parse().map_err(LedgerError::Corrupt)?,
        kind,
        reward_ids,
        converted_at: row.try_get("converted_at")?,
    })
}

pub async fn find_referral(
    pool: &SqlitePool,
    referral_id: Uuid,
) -> Result<Option<Referral>, LedgerError> {
    let row = sqlx::query("SELECT * FROM referrals WHERE id = ?1")
        .bind(referral_id.to_string())
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(referral_from_row).transpose()
}

pub struct ReferralLedger {
    pool: SqlitePool,
    directory: Arc<dyn MemberDirectory>,
    rewards: Arc<RewardLedger>,
}

impl ReferralLedger {
    pub fn new(
        pool: SqlitePool,
        directory: Arc<dyn MemberDirectory>,
        rewards: Arc<RewardLedger>,
    ) -> Self {
        Self {
            pool,
            directory,
            rewards,
        }
    }

    /// Records a referral for `referred_user_id` against the given
    /// code. The code lookup, duplicate checks, referral insert, and
    /// code counter update all run in one transaction; the referred
    /// user's directory profile is patched best-effort afterwards.
    #[tracing::instrument(skip(self, request), fields(code = %request.referral_code))]
    pub async fn create_referral(
        &self,
        request: CreateReferralRequest,
    ) -> Result<Outcome<Referral>, LedgerError> {
        let validated = request.validate()?;
        let code_upper = validated.referral_code.to_uppercase();

        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM referral_codes WHERE code = ?1")
            .bind(&code_upper)
            .fetch_optional(tx.as_mut())
            .await?
            .ok_or_else(|| LedgerError::ReferralCodeNotFound(code_upper.clone()))?;
        let code = referral_code_from_row(&row)?;

        let already_referred: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM referred_users WHERE code_owner_id = ?1 AND referred_user_id = ?2",
        )
        .bind(&code.owner_id)
        .bind(&validated.referred_user_id)
        .fetch_one(tx.as_mut())
        .await?;
        if already_referred > 0 {
            return Err(LedgerError::AlreadyReferred);
        }

        if validated.referred_user_id == code.owner_id {
            return Err(LedgerError::SelfReferral);
        }

        let referred_elsewhere: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM referrals WHERE referred_user_id = ?1")
                .bind(&validated.referred_user_id)
                .fetch_one(tx.as_mut())
                .await?;
        if referred_elsewhere > 0 {
            return Err(LedgerError::AlreadyReferredByOtherCode);
        }

        let status = match validated.kind {
            ReferralKind::TrialDay { .. } => ReferralStatus::Trial,
            ReferralKind::Membership { .. } => ReferralStatus::AwaitingPayment,
        };

        let referral = Referral {
            id: Uuid::new_v4(),
            referrer_id: code.owner_id.clone(),
            referrer_company_id: validated.referrer_company_id.or(code.company_id),
            referrer_type: code.owner_type,
            referred_user_id: validated.referred_user_id,
            referral_code: code.code.clone(),
            status,
            kind: validated.kind,
            reward_ids: Vec::new(),
            converted_at: None,
        };

        insert_referral_tx(&mut tx, &referral).await?;

        sqlx::query(
            "UPDATE referral_codes SET total_referred = total_referred + 1 WHERE owner_id = ?1",
        )
        .bind(&code.owner_id)
        .execute(tx.as_mut())
        .await?;

        sqlx::query("INSERT INTO referred_users (code_owner_id, referred_user_id) VALUES (?1, ?2)")
            .bind(&code.owner_id)
            .bind(&referral.referred_user_id)
            .execute(tx.as_mut())
            .await?;

        tx.commit().await?;

        let patch = MemberPatch {
            referral_code_used: Some(code.code),
            ..MemberPatch::default()
        };
        match self
            .directory
            .update_member(&referral.referred_user_id, patch)
            .await
        {
            Ok(()) => Ok(Outcome::applied(referral)),
            Err(e) => {
                warn!(
                    "Failed to record used referral code on profile of {}: {e}",
                    referral.referred_user_id
                );
                Ok(Outcome::degraded(referral, e))
            }
        }
    }

    /// Transitions a referral from AWAITING_PAYMENT to CONVERTED and
    /// fans out reward creation.
    ///
    /// Conversion is a one-way, one-time transition: a second call
    /// fails with `NotEligibleForConversion` instead of silently
    /// succeeding, because re-running the fan-out would double-create
    /// rewards. If reward creation fails after the commit, the
    /// conversion stays committed and the error propagates so the
    /// caller can retry just the reward linkage.
    #[tracing::instrument(skip(self))]
    pub async fn confirm_conversion(
        &self,
        referral_id: Uuid,
    ) -> Result<Outcome<Referral>, LedgerError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM referrals WHERE id = ?1")
            .bind(referral_id.to_string())
            .fetch_optional(tx.as_mut())
            .await?
            .ok_or(LedgerError::DocumentNotFound(referral_id))?;
        let mut referral = referral_from_row(&row)?;

        if referral.status != ReferralStatus::AwaitingPayment {
            return Err(LedgerError::NotEligibleForConversion {
                status: referral.status,
            });
        }

        let converted_at = Utc::now();
        sqlx::query("UPDATE referrals SET status = 'CONVERTED', converted_at = ?1 WHERE id = ?2")
            .bind(converted_at)
            .bind(referral_id.to_string())
            .execute(tx.as_mut())
            .await?;

        sqlx::query(
            "UPDATE referral_codes SET total_converted = total_converted + 1 WHERE owner_id = ?1",
        )
        .bind(&referral.referrer_id)
        .execute(tx.as_mut())
        .await?;

        tx.commit().await?;

        referral.status = ReferralStatus::Converted;
        referral.converted_at = Some(converted_at);

        // The conversion is durable from here on; reward creation and
        // the reward-id linkage must never undo it.
        let rewards = self.rewards.create_rewards_for_conversion(&referral).await?;
        let reward_ids: Vec<Uuid> = rewards.iter().map(|r| r.id).collect();

        match self.link_reward_ids(referral_id, &reward_ids).await {
            Ok(()) => {
                referral.reward_ids = reward_ids;
                Ok(Outcome::applied(referral))
            }
            Err(e) => {
                warn!("Failed to link reward ids to referral {referral_id}: {e}");
                Ok(Outcome::degraded(referral, e))
            }
        }
    }

    async fn link_reward_ids(
        &self,
        referral_id: Uuid,
        reward_ids: &[Uuid],
    ) -> Result<(), LedgerError> {
        let json = serde_json::to_string(reward_ids)
            .map_err(|e| LedgerError::Corrupt(e.to_string()))?;

        sqlx::query("UPDATE referrals SET reward_ids = ?1 WHERE id = ?2")
            .bind(json)
            .bind(referral_id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

pub(crate) async fn insert_referral_tx(
    tx: &mut Transaction<'_, Sqlite>,
    referral: &Referral,
) -> Result<(), LedgerError> {
    let (trial_start, trial_day_id, opportunity_id, membership_start, subscription, value) =
        match &referral.kind {
            ReferralKind::TrialDay {
                trial_start_date,
                trial_day_id,
                opportunity_id,
            } => (
                Some(*trial_start_date),
                Some(trial_day_id.as_str()),
                Some(opportunity_id.as_str()),
                None,
                None,
                None,
            ),
            ReferralKind::Membership {
                membership_start_date,
                subscription_value,
                referral_value,
            } => (
                None,
                None,
                None,
                Some(*membership_start_date),
                Some(subscription_value.to_string()),
                Some(referral_value.to_string()),
            ),
        };

    let result = sqlx::query(
        r"
        INSERT INTO referrals
            (id, referrer_id, referrer_company_id, referrer_type, referred_user_id,
             referral_code, status, trial_start_date, trial_day_id, opportunity_id,
             membership_start_date, subscription_value, referral_value)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
        ",
    )
    .bind(referral.id.to_string())
    .bind(&referral.referrer_id)
    .bind(referral.referrer_company_id.as_deref())
    .bind(referral.referrer_type.as_str())
    .bind(&referral.referred_user_id)
    .bind(&referral.referral_code)
    .bind(referral.status.as_str())
    .bind(trial_start)
    .bind(trial_day_id)
    .bind(opportunity_id)
    .bind(membership_start)
    .bind(subscription)
    .bind(value)
    .execute(tx.as_mut())
    .await;

    match result {
        Ok(_) => Ok(()),
        // Backstop for writers racing past the in-transaction checks:
        // the UNIQUE constraint on referred_user_id rejects the loser.
        Err(sqlx::Error::Database(db))
            if db.is_unique_violation() && db.message().contains("referred_user_id") =>
        {
            Err(LedgerError::AlreadyReferredByOtherCode)
        }
        Err(e) => Err(e.into()),
    }
}
