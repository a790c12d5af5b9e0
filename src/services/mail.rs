//! Client of the mail verification service
//!
//! The service mails a one-time code to an address and reports it back, and
//! checks whether a password opens a mailbox. Without a configured URL every
//! call fails with `NotConfigured`, which the session treats as "try later".

use super::http_client;
use crate::runtime::{MailVerifier, ServiceError};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub struct HttpMailVerifier {
    client: reqwest::Client,
    base_url: Option<String>,
}

#[derive(Debug, Serialize)]
struct CodeRequest<'a> {
    email: &'a str,
}

#[derive(Debug, Deserialize)]
struct CodeResponse {
    code: String,
}

#[derive(Debug, Serialize)]
struct PasswordRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct PasswordResponse {
    valid: bool,
}

impl HttpMailVerifier {
    pub fn new(base_url: Option<&str>) -> Result<Self, ServiceError> {
        if base_url.is_none() {
            tracing::warn!("MAIL_VERIFIER_URL not set, email verification is disabled");
        }
        Ok(Self {
            client: http_client(Duration::from_secs(30))?,
            base_url: base_url.map(|u| u.trim_end_matches('/').to_string()),
        })
    }

    async fn post<B: Serialize + Sync, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, ServiceError> {
        let base = self.base_url.as_ref().ok_or(ServiceError::NotConfigured)?;
        let response = self
            .client
            .post(format!("{base}/{path}"))
            .json(body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(ServiceError::BadResponse(format!("HTTP {status}: {text}")));
        }
        serde_json::from_str(&text)
            .map_err(|e| ServiceError::BadResponse(format!("{path} response: {e}")))
    }
}

#[async_trait]
impl MailVerifier for HttpMailVerifier {
    async fn send_code(&self, email: &str) -> Result<String, ServiceError> {
        let response: CodeResponse = self.post("code", &CodeRequest { email }).await?;
        tracing::info!("Verification code sent");
        Ok(response.code)
    }

    async fn check_password(&self, email: &str, password: &str) -> Result<bool, ServiceError> {
        let response: PasswordResponse = self
            .post("check_password", &PasswordRequest { email, password })
            .await?;
        Ok(response.valid)
    }
}
