//! Third-party marketing platforms and their shared clients.

use std::str::FromStr;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use marketops_core::{config::AppConfig, config::HttpSettings, Error, Result};

use crate::circuit_breaker::{BreakerSnapshot, CircuitBreakerConfig, CircuitBreakerRegistry};
use crate::http_client::ResilientHttpClient;
use crate::retry::RetryConfig;

/// Integrations the platform talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    GoogleAds,
    MetaAds,
    LinkedinAds,
    Tiktok,
    Shopify,
    Hubspot,
    Stripe,
    Klaviyo,
    TripleWhale,
    GoHighLevel,
}

impl Platform {
    pub const ALL: [Platform; 10] = [
        Platform::GoogleAds,
        Platform::MetaAds,
        Platform::LinkedinAds,
        Platform::Tiktok,
        Platform::Shopify,
        Platform::Hubspot,
        Platform::Stripe,
        Platform::Klaviyo,
        Platform::TripleWhale,
        Platform::GoHighLevel,
    ];

    /// Stable identifier used in config keys, breaker names and storage.
    pub fn slug(&self) -> &'static str {
        match self {
            Self::GoogleAds => "google_ads",
            Self::MetaAds => "meta_ads",
            Self::LinkedinAds => "linkedin_ads",
            Self::Tiktok => "tiktok",
            Self::Shopify => "shopify",
            Self::Hubspot => "hubspot",
            Self::Stripe => "stripe",
            Self::Klaviyo => "klaviyo",
            Self::TripleWhale => "triple_whale",
            Self::GoHighLevel => "go_high_level",
        }
    }

    /// Public API root. Shopify is per-store and has none.
    pub fn default_base_url(&self) -> Option<&'static str> {
        match self {
            Self::GoogleAds => Some("https://googleads.googleapis.com/v16/"),
            Self::MetaAds => Some("https://graph.facebook.com/v19.0/"),
            Self::LinkedinAds => Some("https://api.linkedin.com/rest/"),
            Self::Tiktok => Some("https://business-api.tiktok.com/open_api/v1.3/"),
            Self::Shopify => None,
            Self::Hubspot => Some("https://api.hubapi.com/"),
            Self::Stripe => Some("https://api.stripe.com/v1/"),
            Self::Klaviyo => Some("https://a.klaviyo.com/api/"),
            Self::TripleWhale => Some("https://api.triplewhale.com/api/v2/"),
            Self::GoHighLevel => Some("https://services.leadconnectorhq.com/"),
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.slug())
    }
}

impl FromStr for Platform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.slug() == s)
            .ok_or_else(|| Error::invalid_request(format!("Unknown platform '{}'", s)))
    }
}

/// Lazily built, process-wide clients, one per platform.
pub struct PlatformRegistry {
    http: HttpSettings,
    retry: RetryConfig,
    breakers: CircuitBreakerRegistry,
    clients: DashMap<Platform, Arc<ResilientHttpClient>>,
}

impl PlatformRegistry {
    pub fn new(http: HttpSettings, retry: RetryConfig, breaker: CircuitBreakerConfig) -> Self {
        Self {
            http,
            retry,
            breakers: CircuitBreakerRegistry::new(breaker),
            clients: DashMap::new(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.http.clone(),
            RetryConfig::from_settings(&config.retry),
            CircuitBreakerConfig::from_settings(&config.circuit_breaker),
        )
    }

    /// Base URL for `platform`: config override, then the public default.
    pub fn base_url(&self, platform: Platform) -> Result<String> {
        self.http
            .base_urls
            .get(platform.slug())
            .cloned()
            .or_else(|| platform.default_base_url().map(str::to_string))
            .ok_or_else(|| {
                Error::config(format!(
                    "No base URL configured for {} (set http.base_urls.{})",
                    platform,
                    platform.slug()
                ))
            })
    }

    /// Shared client for `platform`, built on first use.
    pub fn client(&self, platform: Platform) -> Result<Arc<ResilientHttpClient>> {
        if let Some(client) = self.clients.get(&platform) {
            return Ok(client.value().clone());
        }

        let client = ResilientHttpClient::builder(platform.slug(), self.base_url(platform)?)
            .with_settings(&self.http)
            .with_retry(self.retry.clone())
            .with_breaker(self.breakers.get_or_create(platform.slug()))
            .build()?;

        Ok(self
            .clients
            .entry(platform)
            .or_insert_with(|| Arc::new(client))
            .value()
            .clone())
    }

    /// Breaker state of every platform contacted so far.
    pub fn breaker_states(&self) -> Vec<BreakerSnapshot> {
        self.breakers.snapshots()
    }
}
