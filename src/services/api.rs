// src/services/api.rs

//! Upstream data and auth clients.
//!
//! Every data call carries a namespace/locale pair and a bearer token; responses are either a
//! JSON snapshot or one of 404 (`NotFound`), 429 (`RateLimited`) and 5xx/timeout (`Transient`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use url::Url;

use crate::error::{AppError, Result};
use crate::models::{AccessToken, ApiConfig, JobCredentials};
use crate::utils::http::create_async_client;

/// Upstream data namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Profile,
    Dynamic,
    Static,
}

impl Namespace {
    fn prefix(&self) -> &'static str {
        match self {
            Self::Profile => "profile",
            Self::Dynamic => "dynamic",
            Self::Static => "static",
        }
    }
}

/// Every upstream resource the workers read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiRequest {
    CharacterStatus { realm: String, name: String },
    CharacterSummary { realm: String, name: String },
    CharacterMedia { realm: String, name: String },
    CharacterMounts { realm: String, name: String },
    CharacterPets { realm: String, name: String },
    CharacterProfessions { realm: String, name: String },
    GuildSummary { realm: String, name: String },
    GuildRoster { realm: String, name: String },
    GuildAchievements { realm: String, name: String },
    GuildActivity { realm: String, name: String },
    Realm { slug: String },
    Item { id: u64 },
    Auctions { connected_realm_id: u32 },
    Commodities,
}

impl ApiRequest {
    pub fn path(&self) -> String {
        let character = |realm: &str, name: &str, tail: &str| {
            format!(
                "/profile/wow/character/{}/{}{}",
                realm,
                name.to_lowercase(),
                tail
            )
        };
        let guild = |realm: &str, name: &str, tail: &str| {
            format!("/data/wow/guild/{}/{}{}", realm, crate::utils::to_slug(name), tail)
        };

        match self {
            Self::CharacterStatus { realm, name } => character(realm, name, "/status"),
            Self::CharacterSummary { realm, name } => character(realm, name, ""),
            Self::CharacterMedia { realm, name } => character(realm, name, "/character-media"),
            Self::CharacterMounts { realm, name } => character(realm, name, "/collections/mounts"),
            Self::CharacterPets { realm, name } => character(realm, name, "/collections/pets"),
            Self::CharacterProfessions { realm, name } => character(realm, name, "/professions"),
            Self::GuildSummary { realm, name } => guild(realm, name, ""),
            Self::GuildRoster { realm, name } => guild(realm, name, "/roster"),
            Self::GuildAchievements { realm, name } => guild(realm, name, "/achievements"),
            Self::GuildActivity { realm, name } => guild(realm, name, "/activity"),
            Self::Realm { slug } => format!("/data/wow/realm/{slug}"),
            Self::Item { id } => format!("/data/wow/item/{id}"),
            Self::Auctions { connected_realm_id } => {
                format!("/data/wow/connected-realm/{connected_realm_id}/auctions")
            }
            Self::Commodities => "/data/wow/auctions/commodities".to_string(),
        }
    }

    pub fn namespace(&self) -> Namespace {
        match self {
            Self::CharacterStatus { .. }
            | Self::CharacterSummary { .. }
            | Self::CharacterMedia { .. }
            | Self::CharacterMounts { .. }
            | Self::CharacterPets { .. }
            | Self::CharacterProfessions { .. } => Namespace::Profile,
            Self::GuildSummary { .. }
            | Self::GuildRoster { .. }
            | Self::GuildAchievements { .. }
            | Self::GuildActivity { .. }
            | Self::Realm { .. }
            | Self::Auctions { .. }
            | Self::Commodities => Namespace::Dynamic,
            Self::Item { .. } => Namespace::Static,
        }
    }
}

/// A successful upstream response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub body: serde_json::Value,
    /// Upstream `Last-Modified`, when sent
    pub last_modified: Option<DateTime<Utc>>,
}

impl ApiResponse {
    pub fn new(body: serde_json::Value) -> Self {
        Self {
            body,
            last_modified: None,
        }
    }

    /// Decode the body into a typed response.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.body.clone())?)
    }
}

/// Read access to the upstream API.
#[async_trait]
pub trait DataProvider: Send + Sync {
    async fn fetch(&self, request: &ApiRequest, credentials: &JobCredentials)
    -> Result<ApiResponse>;
}

/// Client-credentials token exchange.
#[async_trait]
pub trait TokenExchange: Send + Sync {
    async fn exchange(&self, client_id: &str, client_secret: &str) -> Result<AccessToken>;
}

/// HTTP implementation of [`DataProvider`].
pub struct BattleNetClient {
    client: Client,
    base_url: Url,
    region: String,
    locale: String,
}

impl BattleNetClient {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        Ok(Self {
            client: create_async_client(config)?,
            base_url: Url::parse(&config.base_url())?,
            region: config.region.clone(),
            locale: config.locale.clone(),
        })
    }

    fn url(&self, request: &ApiRequest) -> Result<Url> {
        let mut url = self.base_url.join(&request.path())?;
        let namespace = format!("{}-{}", request.namespace().prefix(), self.region);
        url.query_pairs_mut()
            .append_pair("namespace", &namespace)
            .append_pair("locale", &self.locale);
        Ok(url)
    }
}

#[async_trait]
impl DataProvider for BattleNetClient {
    async fn fetch(
        &self,
        request: &ApiRequest,
        credentials: &JobCredentials,
    ) -> Result<ApiResponse> {
        let url = self.url(request)?;
        let context = request.path();

        let response = self
            .client
            .get(url)
            .bearer_auth(&credentials.access_token)
            .send()
            .await
            .map_err(|e| classify_send_error(&context, e))?;

        let status = response.status();
        check_status(status, &context, &credentials.client_id)?;

        let last_modified = response
            .headers()
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
            .map(|dt| dt.with_timezone(&Utc));

        let bytes = response
            .bytes()
            .await
            .map_err(|e| classify_send_error(&context, e))?;
        let body = serde_json::from_slice(&bytes)?;

        Ok(ApiResponse {
            body,
            last_modified,
        })
    }
}

/// HTTP implementation of [`TokenExchange`].
pub struct OAuthClient {
    client: Client,
    auth_url: Url,
}

impl OAuthClient {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        Ok(Self {
            client: create_async_client(config)?,
            auth_url: Url::parse(&config.auth_url)?,
        })
    }
}

#[async_trait]
impl TokenExchange for OAuthClient {
    async fn exchange(&self, client_id: &str, client_secret: &str) -> Result<AccessToken> {
        let response = self
            .client
            .post(self.auth_url.clone())
            .basic_auth(client_id, Some(client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| classify_send_error("token exchange", e))?;

        check_status(response.status(), "token exchange", client_id)?;
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Map an upstream status code onto the error taxonomy.
fn check_status(status: StatusCode, context: &str, client_id: &str) -> Result<()> {
    if status.is_success() {
        return Ok(());
    }
    match status {
        StatusCode::NOT_FOUND => Err(AppError::not_found(context.to_string())),
        StatusCode::TOO_MANY_REQUESTS => Err(AppError::rate_limited(client_id)),
        s => Err(AppError::transient(context, format!("upstream answered {s}"))),
    }
}

fn classify_send_error(context: &str, error: reqwest::Error) -> AppError {
    if error.is_timeout() {
        AppError::transient(context, "request timed out")
    } else {
        AppError::Http(error)
    }
}
