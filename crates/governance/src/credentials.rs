//! Per-organization OAuth credentials for connected platforms.
//!
//! Tokens are sealed with [`SecretCipher`] using `"{organization}:{platform}"`
//! as associated data and persisted through the [`SecureDataClient`], so a
//! record copied to another tenant or platform fails to decrypt.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use secrecy::Secret;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use marketops_core::{doc, Document, Error, ErrorKind, OrganizationId, Result, ID_FIELD};
use marketops_resilience::Platform;
use marketops_store::SecureDataClient;

use crate::secrets::{EncryptedSecret, SecretCipher};

pub const CREDENTIALS_COLLECTION: &str = "integration_credentials";

/// Plaintext tokens for one platform connection.
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthTokens {
    pub access_token: Secret<String>,
    #[serde(default)]
    pub refresh_token: Option<Secret<String>>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl OAuthTokens {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: Secret::new(access_token.into()),
            refresh_token: None,
            expires_at: None,
            scopes: Vec::new(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Connection metadata, safe to return to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectedIntegration {
    pub platform: Platform,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CredentialRecord {
    platform: Platform,
    access_token: EncryptedSecret,
    refresh_token: Option<EncryptedSecret>,
    expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    scopes: Vec<String>,
    connected_at: DateTime<Utc>,
}

/// Encrypted credential storage scoped per organization.
pub struct CredentialVault {
    data: Arc<SecureDataClient>,
    cipher: SecretCipher,
}

fn context(org: &OrganizationId, platform: Platform) -> String {
    format!("{}:{}", org, platform.slug())
}

fn platform_filter(platform: Platform) -> Document {
    doc(json!({ "platform": platform.slug() }))
}

impl CredentialVault {
    pub fn new(data: Arc<SecureDataClient>, cipher: SecretCipher) -> Self {
        Self { data, cipher }
    }

    /// Save or replace the tokens for `platform`.
    pub async fn store(&self, org: &OrganizationId, platform: Platform, tokens: &OAuthTokens) -> Result<()> {
        let aad = context(org, platform);
        let record = CredentialRecord {
            platform,
            access_token: self.cipher.encrypt(&tokens.access_token, &aad)?,
            refresh_token: tokens
                .refresh_token
                .as_ref()
                .map(|token| self.cipher.encrypt(token, &aad))
                .transpose()?,
            expires_at: tokens.expires_at,
            scopes: tokens.scopes.clone(),
            connected_at: Utc::now(),
        };
        let Value::Object(fields) = serde_json::to_value(&record)? else {
            return Err(Error::internal("credential record did not serialize to an object"));
        };

        let update = doc(json!({ "$set": fields.clone() }));
        if self.replace(org, platform, &update).await? {
            tracing::info!(organization = %org, platform = %platform, "Integration credentials replaced");
            return Ok(());
        }

        // One record per organization and platform: the `_id` is derived from
        // both, so a concurrent connect loses the insert and falls back to `$set`.
        let mut document = fields;
        document.insert(ID_FIELD.to_string(), Value::String(context(org, platform)));
        match self.data.insert_one_secure(CREDENTIALS_COLLECTION, document, org).await {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::InvalidRequest => {
                if !self.replace(org, platform, &update).await? {
                    return Err(err);
                }
            }
            Err(err) => return Err(err),
        }

        tracing::info!(organization = %org, platform = %platform, "Integration credentials stored");
        Ok(())
    }

    async fn replace(&self, org: &OrganizationId, platform: Platform, update: &Document) -> Result<bool> {
        let updated = self
            .data
            .update_one_secure(CREDENTIALS_COLLECTION, &platform_filter(platform), update, org)
            .await?;
        Ok(updated.matched > 0)
    }

    /// Decrypted tokens for `platform`, if connected.
    pub async fn load(&self, org: &OrganizationId, platform: Platform) -> Result<Option<OAuthTokens>> {
        let Some(found) = self
            .data
            .find_one_secure(CREDENTIALS_COLLECTION, &platform_filter(platform), org)
            .await?
        else {
            return Ok(None);
        };

        let record: CredentialRecord = serde_json::from_value(Value::Object(found))?;
        let aad = context(org, platform);
        Ok(Some(OAuthTokens {
            access_token: self.cipher.decrypt(&record.access_token, &aad)?,
            refresh_token: record
                .refresh_token
                .as_ref()
                .map(|token| self.cipher.decrypt(token, &aad))
                .transpose()?,
            expires_at: record.expires_at,
            scopes: record.scopes,
        }))
    }

    /// Remove the credentials for `platform`. Returns whether any existed.
    pub async fn disconnect(&self, org: &OrganizationId, platform: Platform) -> Result<bool> {
        let removed = self
            .data
            .delete_one_secure(CREDENTIALS_COLLECTION, &platform_filter(platform), org)
            .await?;
        if removed {
            tracing::info!(organization = %org, platform = %platform, "Integration disconnected");
        }
        Ok(removed)
    }

    /// Connection metadata for every platform `org` has connected.
    pub async fn connected(&self, org: &OrganizationId) -> Result<Vec<ConnectedIntegration>> {
        let records = self
            .data
            .find_secure(CREDENTIALS_COLLECTION, &Document::new(), org, None)
            .await?;

        records
            .into_iter()
            .map(|record| {
                let record: CredentialRecord = serde_json::from_value(Value::Object(record))?;
                Ok(ConnectedIntegration {
                    platform: record.platform,
                    expires_at: record.expires_at,
                    scopes: record.scopes,
                    connected_at: record.connected_at,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marketops_core::{DocumentStore, UpdateResult, ViolationKind};
    use marketops_store::InMemoryDocumentStore;
    use secrecy::ExposeSecret;

    fn org(id: &str) -> OrganizationId {
        OrganizationId::parse(Some(id)).unwrap()
    }

    /// Delegates to the in-memory store but suspends before every call, the
    /// way a networked driver would.
    struct YieldingStore(InMemoryDocumentStore);

    #[async_trait::async_trait]
    impl DocumentStore for YieldingStore {
        async fn find_one(&self, collection: &str, filter: &Document) -> Result<Option<Document>> {
            tokio::task::yield_now().await;
            self.0.find_one(collection, filter).await
        }

        async fn find(&self, collection: &str, filter: &Document, limit: Option<usize>) -> Result<Vec<Document>> {
            tokio::task::yield_now().await;
            self.0.find(collection, filter, limit).await
        }

        async fn insert_one(&self, collection: &str, document: Document) -> Result<String> {
            tokio::task::yield_now().await;
            self.0.insert_one(collection, document).await
        }

        async fn update_one(&self, collection: &str, filter: &Document, update: &Document) -> Result<UpdateResult> {
            tokio::task::yield_now().await;
            self.0.update_one(collection, filter, update).await
        }

        async fn update_many(&self, collection: &str, filter: &Document, update: &Document) -> Result<UpdateResult> {
            tokio::task::yield_now().await;
            self.0.update_many(collection, filter, update).await
        }

        async fn delete_one(&self, collection: &str, filter: &Document) -> Result<bool> {
            tokio::task::yield_now().await;
            self.0.delete_one(collection, filter).await
        }
    }

    fn vault() -> (CredentialVault, Arc<SecureDataClient>) {
        let data = Arc::new(SecureDataClient::new(Box::new(InMemoryDocumentStore::new())));
        (CredentialVault::new(data.clone(), SecretCipher::new([3u8; 32])), data)
    }

    #[tokio::test]
    async fn test_store_load_replace_disconnect() {
        let (vault, data) = vault();
        let a = org("org_a");

        let mut tokens = OAuthTokens::new("access-1");
        tokens.refresh_token = Some(Secret::new("refresh-1".into()));
        tokens.scopes = vec!["ads.read".into()];
        vault.store(&a, Platform::GoogleAds, &tokens).await.unwrap();

        let raw = data
            .find_one_secure(CREDENTIALS_COLLECTION, &platform_filter(Platform::GoogleAds), &a)
            .await
            .unwrap()
            .unwrap();
        assert!(!Value::Object(raw).to_string().contains("access-1"));

        let loaded = vault.load(&a, Platform::GoogleAds).await.unwrap().unwrap();
        assert_eq!(loaded.access_token.expose_secret(), "access-1");
        assert_eq!(loaded.refresh_token.unwrap().expose_secret(), "refresh-1");

        vault
            .store(&a, Platform::GoogleAds, &OAuthTokens::new("access-2"))
            .await
            .unwrap();
        let connected = vault.connected(&a).await.unwrap();
        assert_eq!(connected.len(), 1);
        let loaded = vault.load(&a, Platform::GoogleAds).await.unwrap().unwrap();
        assert_eq!(loaded.access_token.expose_secret(), "access-2");
        assert!(loaded.refresh_token.is_none());

        assert!(vault.disconnect(&a, Platform::GoogleAds).await.unwrap());
        assert!(!vault.disconnect(&a, Platform::GoogleAds).await.unwrap());
        assert!(vault.load(&a, Platform::GoogleAds).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_other_tenant_sees_nothing() {
        let (vault, _data) = vault();
        vault
            .store(&org("org_a"), Platform::Stripe, &OAuthTokens::new("sk"))
            .await
            .unwrap();

        assert!(vault.load(&org("org_b"), Platform::Stripe).await.unwrap().is_none());
        assert!(vault.connected(&org("org_b")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_record_moved_between_platforms_fails_integrity() {
        let (vault, data) = vault();
        let a = org("org_a");
        vault.store(&a, Platform::Hubspot, &OAuthTokens::new("hs")).await.unwrap();

        data.update_one_secure(
            CREDENTIALS_COLLECTION,
            &platform_filter(Platform::Hubspot),
            &doc(json!({"$set": {"platform": "klaviyo"}})),
            &a,
        )
        .await
        .unwrap();

        let err = vault.load(&a, Platform::Klaviyo).await.unwrap_err();
        assert_eq!(err.violation(), Some(ViolationKind::Integrity));
    }

    #[tokio::test]
    async fn test_concurrent_connects_keep_one_record() {
        let data = Arc::new(SecureDataClient::new(Box::new(YieldingStore(InMemoryDocumentStore::new()))));
        let vault = CredentialVault::new(data, SecretCipher::new([3u8; 32]));
        let a = org("org_a");

        let first = OAuthTokens::new("sk_first");
        let second = OAuthTokens::new("sk_second");
        let (r1, r2) = tokio::join!(
            vault.store(&a, Platform::Stripe, &first),
            vault.store(&a, Platform::Stripe, &second),
        );
        r1.unwrap();
        r2.unwrap();

        let connected = vault.connected(&a).await.unwrap();
        assert_eq!(connected.len(), 1);
        assert_eq!(connected[0].platform, Platform::Stripe);

        let loaded = vault.load(&a, Platform::Stripe).await.unwrap().unwrap();
        assert!(["sk_first", "sk_second"].contains(&loaded.access_token.expose_secret().as_str()));

        // The same platform under another organization gets its own record.
        vault.store(&org("org_b"), Platform::Stripe, &OAuthTokens::new("sk_b")).await.unwrap();
        assert_eq!(vault.connected(&a).await.unwrap().len(), 1);
        assert_eq!(vault.connected(&org("org_b")).await.unwrap().len(), 1);
    }
}
