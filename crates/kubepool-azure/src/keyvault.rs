//! Azure Key Vault secret backend
//!
//! Secret names are the coordination keys as-is. Deleting a secret on a vault
//! with soft-delete enabled leaves it recoverable under the same name, which
//! blocks a later write with a 409 until the deleted secret is purged.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

use kubepool_common::{Error, Result};
use kubepool_pool::{BackendError, SecretBackend};

use crate::models::{ErrorEnvelope, SecretBundle, SecretSetRequest};

/// Key Vault data-plane API version
pub const KEYVAULT_API_VERSION: &str = "7.4";

const SOFT_DELETE_CODE: &str = "ObjectIsDeletedButRecoverable";

/// [`SecretBackend`] over the Key Vault REST API
#[derive(Clone)]
pub struct KeyVaultBackend {
    client: reqwest::Client,
    vault_url: String,
    token: String,
}

impl std::fmt::Debug for KeyVaultBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyVaultBackend")
            .field("vault_url", &self.vault_url)
            .finish_non_exhaustive()
    }
}

impl KeyVaultBackend {
    /// Backend for vault `vault_name` in the public cloud
    pub fn new(vault_name: &str, token: impl Into<String>, timeout: Duration) -> Result<Self> {
        Self::with_vault_url(
            format!("https://{}.vault.azure.net", vault_name),
            token,
            timeout,
        )
    }

    /// Backend for an explicit vault URL (sovereign clouds, private endpoints)
    pub fn with_vault_url(
        vault_url: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                Error::provider_permanent("keyvault", format!("failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            vault_url: vault_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn secret_url(&self, collection: &str, name: &str) -> String {
        format!(
            "{}/{}/{}?api-version={}",
            self.vault_url, collection, name, KEYVAULT_API_VERSION
        )
    }

    async fn failure(response: reqwest::Response) -> BackendError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        classify(status, &body)
    }
}

/// Map a failed Key Vault response to a backend error
pub fn classify(status: StatusCode, body: &str) -> BackendError {
    let detail: Option<ErrorEnvelope> = serde_json::from_str(body).ok();
    let message = detail
        .as_ref()
        .map(|d| d.error.message.clone())
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| body.trim().to_string());

    match status {
        StatusCode::NOT_FOUND => BackendError::NotFound,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            BackendError::Unauthorized(format!("{}: {}", status, message))
        }
        StatusCode::CONFLICT
            if detail
                .as_ref()
                .is_some_and(|d| d.error.has_code(SOFT_DELETE_CODE)) =>
        {
            BackendError::SoftDeleted
        }
        _ => BackendError::Other(format!("{}: {}", status, message)),
    }
}

fn transport(e: reqwest::Error) -> BackendError {
    BackendError::Other(format!("request failed: {}", e))
}

#[async_trait]
impl SecretBackend for KeyVaultBackend {
    async fn get(&self, name: &str) -> std::result::Result<String, BackendError> {
        let response = self
            .client
            .get(self.secret_url("secrets", name))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(transport)?;

        if !response.status().is_success() {
            return Err(Self::failure(response).await);
        }

        let bundle: SecretBundle = response
            .json()
            .await
            .map_err(|e| BackendError::Other(format!("invalid secret bundle: {}", e)))?;
        Ok(bundle.value)
    }

    async fn set(&self, name: &str, value: &str) -> std::result::Result<(), BackendError> {
        let response = self
            .client
            .put(self.secret_url("secrets", name))
            .bearer_auth(&self.token)
            .json(&SecretSetRequest { value })
            .send()
            .await
            .map_err(transport)?;

        if !response.status().is_success() {
            return Err(Self::failure(response).await);
        }
        debug!(secret = %name, "Key Vault secret written");
        Ok(())
    }

    async fn delete(&self, name: &str) -> std::result::Result<(), BackendError> {
        let response = self
            .client
            .delete(self.secret_url("secrets", name))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(transport)?;

        if !response.status().is_success() {
            return Err(Self::failure(response).await);
        }
        debug!(secret = %name, "Key Vault secret deleted");
        Ok(())
    }

    async fn purge_deleted(&self, name: &str) -> std::result::Result<(), BackendError> {
        let response = self
            .client
            .delete(self.secret_url("deletedsecrets", name))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(transport)?;

        if !response.status().is_success() {
            return match Self::failure(response).await {
                // Already purged
                BackendError::NotFound => Ok(()),
                e => Err(e),
            };
        }
        debug!(secret = %name, "Key Vault deleted secret purged");
        Ok(())
    }
}
