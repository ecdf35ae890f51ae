//! Configured STH services: a token manager and a history fetcher per id.

use crate::config::{BridgeConfig, QueryDefaults, ServiceConfig};
use crate::credentials::CredentialStore;
use crate::error::{Error, Result};
use crate::history::{HistoryFetcher, HistoryQuery, HistoryResult, ResponseFormat, Tenant};
use crate::oauth::TokenManager;
use chrono::{Duration, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Caller input for one history trigger.
///
/// Anything left unset falls back to the service's `QueryDefaults`; the
/// entity id has no default.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct HistoryRequest {
    pub entity_id: Option<String>,
    pub entity_type: Option<String>,
    pub attribute: Option<String>,
    pub last_n: Option<u32>,
    pub period_ms: Option<i64>,
    pub format: Option<ResponseFormat>,
}

impl HistoryRequest {
    pub fn for_entity(entity_id: &str) -> Self {
        Self {
            entity_id: Some(entity_id.to_string()),
            ..Default::default()
        }
    }

    /// Resolves the request against `defaults`.
    pub fn resolve(&self, defaults: &QueryDefaults) -> Result<HistoryQuery> {
        fn required(value: Option<&String>, name: &str) -> Result<String> {
            value
                .filter(|v| !v.trim().is_empty())
                .cloned()
                .ok_or_else(|| Error::InvalidQuery(format!("missing {}", name)))
        }

        let entity_id = required(self.entity_id.as_ref(), "entity_id")?;
        let entity_type = required(
            self.entity_type.as_ref().or(defaults.entity_type.as_ref()),
            "entity_type",
        )?;
        let attribute = required(
            self.attribute.as_ref().or(defaults.attribute.as_ref()),
            "attribute",
        )?;

        let period_ms = self.period_ms.unwrap_or(defaults.period_ms);
        if period_ms < 0 {
            return Err(Error::InvalidQuery("period_ms must not be negative".to_string()));
        }

        let window_start_offset = match period_ms {
            0 => None,
            ms => Some(Duration::try_milliseconds(ms).ok_or_else(|| {
                Error::InvalidQuery("period_ms is out of range".to_string())
            })?),
        };

        let query = HistoryQuery {
            entity_id,
            entity_type,
            attribute,
            sample_count: self.last_n.unwrap_or(defaults.last_n),
            window_start_offset,
        };
        query.date_from(Utc::now())?;

        Ok(query)
    }

    /// The requested body format, falling back to `defaults`.
    pub fn format_or(&self, defaults: &QueryDefaults) -> ResponseFormat {
        self.format.unwrap_or(defaults.format)
    }
}

/// One STH endpoint with its authentication state.
pub struct Service {
    id: String,
    tokens: TokenManager,
    fetcher: HistoryFetcher,
    defaults: QueryDefaults,
    refresh_margin: Duration,
}

impl Service {
    pub fn new(
        id: &str,
        tokens: TokenManager,
        fetcher: HistoryFetcher,
        defaults: QueryDefaults,
        refresh_margin: Duration,
    ) -> Self {
        Self {
            id: id.to_string(),
            tokens,
            fetcher,
            defaults,
            refresh_margin,
        }
    }

    /// Builds a service from its configuration, restoring any stored token.
    pub fn from_config(
        id: &str,
        config: &ServiceConfig,
        store: Arc<dyn CredentialStore>,
        refresh_margin: Duration,
    ) -> Result<Self> {
        let fetcher = HistoryFetcher::new(
            config.base_url()?,
            Tenant {
                service: config.fiware_service.clone(),
                service_path: config.fiware_service_path.clone(),
            },
        );
        let tokens = TokenManager::load(id, config.oauth.clone(), store)?;

        Ok(Self::new(
            id,
            tokens,
            fetcher,
            config.query.clone(),
            refresh_margin,
        ))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    pub fn fetcher(&self) -> &HistoryFetcher {
        &self.fetcher
    }

    pub fn defaults(&self) -> &QueryDefaults {
        &self.defaults
    }

    /// Handles one trigger: refresh the token if it is close to expiry, then
    /// fetch with whatever token is current.
    pub async fn query(&self, request: &HistoryRequest) -> Result<HistoryResult> {
        let query = request.resolve(&self.defaults)?;

        if self.tokens.ensure_fresh(self.refresh_margin).await?.is_some() {
            debug!(service = %self.id, "Token refreshed before query");
        }

        let access_token = self.tokens.current_access_token();
        self.fetcher.fetch(&query, access_token.as_deref()).await
    }
}

/// All configured services, keyed by id.
#[derive(Default)]
pub struct ServiceRegistry {
    services: BTreeMap<String, Arc<Service>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &BridgeConfig, store: Arc<dyn CredentialStore>) -> Result<Self> {
        let mut registry = Self::new();
        let margin = config.refresh.margin()?;

        for (id, service_config) in &config.services {
            let service = Service::from_config(id, service_config, store.clone(), margin)
                .map_err(|e| match e {
                    Error::Config(msg) => Error::Config(format!("service '{}': {}", id, msg)),
                    other => other,
                })?;

            info!(
                service = %id,
                url = %service.fetcher().base_url(),
                authenticated = service.tokens().current_access_token().is_some(),
                "Service registered"
            );
            registry.insert(service);
        }

        Ok(registry)
    }

    pub fn insert(&mut self, service: Service) {
        self.services
            .insert(service.id().to_string(), Arc::new(service));
    }

    pub fn get(&self, id: &str) -> Option<Arc<Service>> {
        self.services.get(id).cloned()
    }

    /// The service whose token manager issued `state`.
    pub fn find_by_state(&self, state: &str) -> Option<Arc<Service>> {
        self.services
            .values()
            .find(|service| service.tokens().owns_state(state))
            .cloned()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
