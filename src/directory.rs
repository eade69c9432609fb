//! Client for the external member directory (the coworking platform's
//! member records). The ledger only reads and patches a handful of
//! referral-related fields on profiles it does not own.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("Directory API error (status {status}): {message}")]
    Api { status: StatusCode, message: String },
    #[error("Member not found: {0}")]
    MemberNotFound(String),
}

/// Referral-related slice of a member profile. The directory holds many
/// more fields; only these are read or written here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemberProfile {
    #[serde(default)]
    pub referral_permission: bool,
    pub referral_own_code: Option<String>,
    pub referral_code_used: Option<String>,
    pub pending_credit_eur: Option<Decimal>,
}

/// Partial update; `None` fields are omitted from the request body.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MemberPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referral_own_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referral_code_used: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_credit_eur: Option<Decimal>,
}

#[async_trait]
pub trait MemberDirectory: Send + Sync {
    async fn get_member(&self, member_id: &str) -> Result<MemberProfile, DirectoryError>;

    async fn update_member(
        &self,
        member_id: &str,
        patch: MemberPatch,
    ) -> Result<(), DirectoryError>;
}

pub struct HttpMemberDirectory {
    client: Client,
    base_url: Url,
    api_token: String,
}

impl HttpMemberDirectory {
    pub fn new(base_url: Url, api_token: String) -> Self {
        Self {
            client: Client::new(),
            base_url,
            api_token,
        }
    }

    fn member_url(&self, member_id: &str) -> String {
        format!("{}members/{member_id}", self.base_url)
    }

    async fn check_status(
        response: reqwest::Response,
        member_id: &str,
    ) -> Result<reqwest::Response, DirectoryError> {
        if response.status() == StatusCode::NOT_FOUND {
            return Err(DirectoryError::MemberNotFound(member_id.to_string()));
        }

        if !response.status().is_success() {
            let status = response.status();
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());

            return Err(DirectoryError::Api { status, message });
        }

        Ok(response)
    }
}

#[async_trait]
impl MemberDirectory for HttpMemberDirectory {
    async fn get_member(&self, member_id: &str) -> Result<MemberProfile, DirectoryError> {
        let response = self
            .client
            .get(self.member_url(member_id))
            .bearer_auth(&self.api_token)
            .send()
            .await?;

        let response = Self::check_status(response, member_id).await?;

        Ok(response.json().await?)
    }

    async fn update_member(
        &self,
        member_id: &str,
        patch: MemberPatch,
    ) -> Result<(), DirectoryError> {
        let response = self
            .client
            .patch(self.member_url(member_id))
            .bearer_auth(&self.api_token)
            .json(&patch)
            .send()
            .await?;

        Self::check_status(response, member_id).await?;

        Ok(())
    }
}
