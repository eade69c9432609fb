//! Referral code registry: issues exactly one 6-character code per
//! referrer and records the issued code on the referrer's directory
//! profile.
//!
//! Global code uniqueness and one-code-per-owner are both enforced by
//! the store's constraints; the issue loop treats an insert conflict on
//! the code column as a collision and regenerates, retrying a fixed
//! number of times before giving up.

use std::str::FromStr;
use std::sync::Arc;

use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::warn;

use crate::directory::{DirectoryError, MemberDirectory, MemberPatch};
use crate::outcome::Outcome;

pub(crate) const CODE_LENGTH: usize = 6;
const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const MAX_CODE_ATTEMPTS: u32 = 10;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Member {0} does not have referral permission")]
    NoPermission(String),
    #[error("Member {0} already owns a referral code")]
    AlreadyExists(String),
    #[error("Could not generate a unique referral code after {attempts} attempts")]
    UniqueCodeGenerationFailed { attempts: u32 },
    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Corrupt referral code row: {0}")]
    Corrupt(String),
}

/// Who owns a referral code (and therefore which reward schedule
/// applies on conversion).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OwnerType {
    Member,
    Business,
}

impl OwnerType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Member => "MEMBER",
            Self::Business => "BUSINESS",
        }
    }
}

impl FromStr for OwnerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MEMBER" => Ok(Self::Member),
            "BUSINESS" => Ok(Self::Business),
            other => Err(format!("unknown owner type: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferralCode {
    pub owner_id: String,
    pub code: String,
    pub company_id: Option<String>,
    pub owner_type: OwnerType,
    pub total_referred: i64,
    pub total_converted: i64,
    pub total_rewarded_eur: Decimal,
}

pub(crate) fn referral_code_from_row(row: &SqliteRow) -> Result<ReferralCode, RegistryError> {
    let owner_type: String = row.try_get("owner_type")?;
    let total_rewarded: String = row.try_get("total_rewarded_eur")?;

    Ok(ReferralCode {
        owner_id: row.try_get("owner_id")?,
        code: row.try_get("code")?,
        company_id: row.try_get("company_id")?,
        owner_type: owner_type.parse().map_err(RegistryError::Corrupt)?,
        total_referred: row.try_get("total_referred")?,
        total_converted: row.try_get("total_converted")?,
        total_rewarded_eur: Decimal::from_str(&total_rewarded)
            .map_err(|e| RegistryError::Corrupt(e.to_string()))?,
    })
}

pub async fn find_code_by_owner(
    pool: &SqlitePool,
    owner_id: &str,
) -> Result<Option<ReferralCode>, RegistryError> {
    let row = sqlx::query("SELECT * FROM referral_codes WHERE owner_id = ?1")
        .bind(owner_id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(referral_code_from_row).transpose()
}

fn generate_candidate<R: Rng>(rng: &mut R) -> String {
    (0..CODE_LENGTH)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

pub struct CodeRegistry {
    pool: SqlitePool,
    directory: Arc<dyn MemberDirectory>,
}

impl CodeRegistry {
    pub fn new(pool: SqlitePool, directory: Arc<dyn MemberDirectory>) -> Self {
        Self { pool, directory }
    }

    /// Issues a referral code for `owner_id`.
    ///
    /// The returned [`Outcome`] carries the committed code; its
    /// secondary effect records whether the code was also written back
    /// to the owner's directory profile. A failed write-back leaves the
    /// code fully usable, only the profile is stale.
    #[tracing::instrument(skip(self))]
    pub async fn issue_code(
        &self,
        owner_id: &str,
        company_id: Option<&str>,
        owner_type: OwnerType,
    ) -> Result<Outcome<ReferralCode>, RegistryError> {
        let profile = self.directory.get_member(owner_id).await?;
        if !profile.referral_permission {
            return Err(RegistryError::NoPermission(owner_id.to_string()));
        }

        if find_code_by_owner(&self.pool, owner_id).await?.is_some() {
            return Err(RegistryError::AlreadyExists(owner_id.to_string()));
        }

        let code = self.insert_with_retries(owner_id, company_id, owner_type).await?;

        let patch = MemberPatch {
            referral_own_code: Some(code.code.clone()),
            ..MemberPatch::default()
        };
        match self.directory.update_member(owner_id, patch).await {
            Ok(()) => Ok(Outcome::applied(code)),
            Err(e) => {
                warn!("Failed to write referral code back to profile of {owner_id}: {e}");
                Ok(Outcome::degraded(code, e))
            }
        }
    }

    async fn insert_with_retries(
        &self,
        owner_id: &str,
        company_id: Option<&str>,
        owner_type: OwnerType,
    ) -> Result<ReferralCode, RegistryError> {
        for attempt in 1..=MAX_CODE_ATTEMPTS {
            let candidate = generate_candidate(&mut rand::thread_rng());

            let result = sqlx::query(
                r"
                INSERT INTO referral_codes (owner_id, code, company_id, owner_type)
                VALUES (?1, ?2, ?3, ?4)
                ",
            )
            .bind(owner_id)
            .bind(&candidate)
            .bind(company_id)
            .bind(owner_type.as_str())
            .execute(&self.pool)
            .await;

            match result {
                Ok(_) => {
                    return Ok(ReferralCode {
                        owner_id: owner_id.to_string(),
                        code: candidate,
                        company_id: company_id.map(str::to_string),
                        owner_type,
                        total_referred: 0,
                        total_converted: 0,
                        total_rewarded_eur: Decimal::ZERO,
                    });
                }
                Err(sqlx::Error::Database(db))
                    if db.is_unique_violation() && db.message().contains("owner_id") =>
                {
                    // A concurrent issuance for the same owner won.
                    return Err(RegistryError::AlreadyExists(owner_id.to_string()));
                }
                Err(e) => {
                    warn!(
                        "Referral code insert attempt {attempt}/{MAX_CODE_ATTEMPTS} \
                         for {owner_id} failed: {e}"
                    );
                }
            }
        }

        Err(RegistryError::UniqueCodeGenerationFailed {
            attempts: MAX_CODE_ATTEMPTS,
        })
    }
}
