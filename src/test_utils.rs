//! Shared test fixtures: database setup, directory and payout stubs,
//! and builders for referral requests and referral rows.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use rust_decimal::Decimal;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::directory::{DirectoryError, MemberDirectory, MemberPatch, MemberProfile};
use crate::ledger::{
    insert_referral_tx, CreateReferralRequest, Referral, ReferralKind, ReferralStatus,
};
use crate::payout::{PayoutChannel, PayoutError, PayoutRequest};
use crate::registry::OwnerType;
use crate::rewards::PayoutChannels;

/// In-memory SQLite database with all migrations applied.
pub(crate) async fn setup_test_db() -> SqlitePool {
    let pool = SqlitePool::connect(":memory:").await.unwrap();
    sqlx::migrate!().run(&pool).await.unwrap();
    pool
}

/// In-memory member directory; updates can be toggled to fail so tests
/// can exercise the best-effort secondary-write paths.
#[derive(Default)]
pub(crate) struct StubDirectory {
    members: Mutex<HashMap<String, MemberProfile>>,
    fail_updates: AtomicBool,
}

impl StubDirectory {
    pub(crate) fn with_members(
        members: impl IntoIterator<Item = (String, MemberProfile)>,
    ) -> Self {
        Self {
            members: Mutex::new(members.into_iter().collect()),
            fail_updates: AtomicBool::new(false),
        }
    }

    pub(crate) fn add_member(&self, id: &str, profile: MemberProfile) {
        self.members
            .lock()
            .unwrap()
            .insert(id.to_string(), profile);
    }

    pub(crate) fn fail_updates(&self) {
        self.fail_updates.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl MemberDirectory for StubDirectory {
    async fn get_member(&self, member_id: &str) -> Result<MemberProfile, DirectoryError> {
        self.members
            .lock()
            .unwrap()
            .get(member_id)
            .cloned()
            .ok_or_else(|| DirectoryError::MemberNotFound(member_id.to_string()))
    }

    async fn update_member(
        &self,
        member_id: &str,
        patch: MemberPatch,
    ) -> Result<(), DirectoryError> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(DirectoryError::Api {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: "stubbed failure".to_string(),
            });
        }

        let mut members = self.members.lock().unwrap();
        let profile = members
            .entry(member_id.to_string())
            .or_insert_with(MemberProfile::default);

        if let Some(code) = patch.referral_own_code {
            profile.referral_own_code = Some(code);
        }
        if let Some(code) = patch.referral_code_used {
            profile.referral_code_used = Some(code);
        }
        if let Some(credit) = patch.pending_credit_eur {
            profile.pending_credit_eur = Some(credit);
        }

        Ok(())
    }
}

/// Payout channel that records every request and can be toggled to fail.
#[derive(Default)]
pub(crate) struct RecordingChannel {
    calls: Mutex<Vec<PayoutRequest>>,
    fail: AtomicBool,
}

impl RecordingChannel {
    pub(crate) fn calls(&self) -> Vec<PayoutRequest> {
        self.calls.lock().unwrap().clone()
    }

    #[allow(dead_code)]
    pub(crate) fn fail_payouts(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl PayoutChannel for RecordingChannel {
    async fn payout(&self, request: &PayoutRequest) -> Result<(), PayoutError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PayoutError::NotImplemented);
        }
        self.calls.lock().unwrap().push(request.clone());
        Ok(())
    }
}

/// A full channel set whose invoice-credit and manual slots record
/// calls, with the real always-failing bank-transfer stub in place.
pub(crate) fn recording_channels() -> (PayoutChannels, Arc<RecordingChannel>) {
    let recorder = Arc::new(RecordingChannel::default());
    let channels = PayoutChannels {
        invoice_credit: recorder.clone(),
        bank_transfer: Arc::new(crate::payout::BankTransferChannel),
        manual: recorder.clone(),
    };
    (channels, recorder)
}

pub(crate) async fn insert_code(
    pool: &SqlitePool,
    owner_id: &str,
    code: &str,
    company_id: Option<&str>,
    owner_type: OwnerType,
) {
    sqlx::query(
        "INSERT INTO referral_codes (owner_id, code, company_id, owner_type) \
         VALUES (?1, ?2, ?3, ?4)",
    )
    .bind(owner_id)
    .bind(code)
    .bind(company_id)
    .bind(owner_type.as_str())
    .execute(pool)
    .await
    .unwrap();
}

pub(crate) async fn insert_referral(pool: &SqlitePool, referral: &Referral) {
    let mut tx = pool.begin().await.unwrap();
    insert_referral_tx(&mut tx, referral).await.unwrap();
    tx.commit().await.unwrap();
}

pub(crate) fn trial_request(code: &str, referred_user_id: &str) -> CreateReferralRequest {
    CreateReferralRequest {
        referral_code: code.to_string(),
        referred_user_id: referred_user_id.to_string(),
        is_trialday: true,
        trial_start_date: Some(Utc::now()),
        trial_day_id: Some("TD1".to_string()),
        opportunity_id: Some("OP1".to_string()),
        ..CreateReferralRequest::default()
    }
}

pub(crate) fn membership_request(
    code: &str,
    referred_user_id: &str,
    subscription_value: Decimal,
) -> CreateReferralRequest {
    CreateReferralRequest {
        referral_code: code.to_string(),
        referred_user_id: referred_user_id.to_string(),
        is_trialday: false,
        membership_start_date: Some(Utc::now()),
        subscription_value: Some(subscription_value),
        referral_value: Some((subscription_value / Decimal::TWO).round_dp(2)),
        ..CreateReferralRequest::default()
    }
}

pub(crate) fn trial_referral(
    referrer_id: &str,
    referrer_type: OwnerType,
    referred_user_id: &str,
) -> Referral {
    Referral {
        id: Uuid::new_v4(),
        referrer_id: referrer_id.to_string(),
        referrer_company_id: None,
        referrer_type,
        referred_user_id: referred_user_id.to_string(),
        referral_code: "ABC123".to_string(),
        status: ReferralStatus::Trial,
        kind: ReferralKind::TrialDay {
            trial_start_date: Utc::now(),
            trial_day_id: "TD1".to_string(),
            opportunity_id: "OP1".to_string(),
        },
        reward_ids: Vec::new(),
        converted_at: None,
    }
}

pub(crate) fn membership_referral(
    referrer_id: &str,
    referrer_type: OwnerType,
    referred_user_id: &str,
    subscription_value: Decimal,
) -> Referral {
    Referral {
        id: Uuid::new_v4(),
        referrer_id: referrer_id.to_string(),
        referrer_company_id: None,
        referrer_type,
        referred_user_id: referred_user_id.to_string(),
        referral_code: "ABC123".to_string(),
        status: ReferralStatus::AwaitingPayment,
        kind: ReferralKind::Membership {
            membership_start_date: Utc::now(),
            subscription_value,
            referral_value: (subscription_value / Decimal::TWO).round_dp(2),
        },
        reward_ids: Vec::new(),
        converted_at: None,
    }
}
