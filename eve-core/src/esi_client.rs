use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mockall::automock;
use reqwest::header::HeaderMap;
use reqwest::{StatusCode, Url};
use reqwest_middleware::{ClientWithMiddleware, RequestBuilder};
use serde::de::DeserializeOwned;
use std::any::type_name;
use std::collections::HashMap;
use std::fmt::Debug;
use tokio_util::sync::CancellationToken;

use eve_domain::{ActiveShip, CharacterId, CharacterLocation, Error, EsiLocation, EsiShip, EsiSkills, RegionId, Result, VerifiedCharacter};

/// A character bearer token. Debug never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(pub String);

impl Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AuthToken(***)")
    }
}

/// A paginated upstream resource: the page count is declared in a response
/// header and every page is fetched with the same path and query.
#[derive(Debug, Clone, PartialEq)]
pub struct PaginatedResource {
    pub path: String,
    pub query: Vec<(String, String)>,
    pub auth: Option<AuthToken>,
    /// When set, page 1 is requested conditionally and an unchanged
    /// snapshot comes back as `not_modified`.
    pub if_modified_since: Option<DateTime<Utc>>,
}

impl PaginatedResource {
    pub fn market_orders(region_id: RegionId) -> Self {
        PaginatedResource {
            path: format!("markets/{}/orders/", region_id.0),
            query: vec![("order_type".to_string(), "all".to_string())],
            auth: None,
            if_modified_since: None,
        }
    }

    pub fn character_assets(character_id: CharacterId, token: AuthToken) -> Self {
        PaginatedResource {
            path: format!("characters/{}/assets/", character_id.0),
            query: Vec::new(),
            auth: Some(token),
            if_modified_since: None,
        }
    }

    pub fn with_if_modified_since(mut self, since: Option<DateTime<Utc>>) -> Self {
        self.if_modified_since = since;
        self
    }
}

/// One page of a paginated resource, bytes untyped. Typing is the
/// caller's business.
#[derive(Debug, Clone, PartialEq)]
pub struct PageResponse {
    pub body: Vec<u8>,
    /// Total page count declared by the upstream, absent on single-page
    /// resources.
    pub pages: Option<u32>,
    pub expires_at: Option<DateTime<Utc>>,
    pub not_modified: bool,
}

#[automock]
#[async_trait]
pub trait EsiClientTrait: Send + Sync + Debug {
    async fn get_page(&self, resource: &PaginatedResource, page: u32, cancel: CancellationToken) -> Result<PageResponse>;

    async fn get_location(&self, character_id: CharacterId, token: &AuthToken, cancel: CancellationToken) -> Result<CharacterLocation>;

    async fn get_active_ship(&self, character_id: CharacterId, token: &AuthToken, cancel: CancellationToken) -> Result<ActiveShip>;

    async fn get_skill_levels(&self, character_id: CharacterId, token: &AuthToken, cancel: CancellationToken) -> Result<HashMap<i32, u8>>;

    async fn verify(&self, token: &AuthToken, cancel: CancellationToken) -> Result<VerifiedCharacter>;
}

#[derive(Debug, Clone)]
pub struct EsiClient {
    pub client: ClientWithMiddleware,
    pub base_url: Url,
}

impl EsiClient {
    /// Creates a client with a base_url. Inserts a trailing '/' if
    /// necessary so joins behave.
    pub fn try_with_base_url(client: ClientWithMiddleware, base_url: &str) -> anyhow::Result<Self> {
        let with_trailing_slash = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{}/", base_url)
        };
        let base_url = Url::parse(&with_trailing_slash)?;
        Ok(EsiClient { client, base_url })
    }

    fn join(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| Error::Internal(format!("malformed endpoint path '{path}': {e}")))
    }

    fn authorized(request: RequestBuilder, token: Option<&AuthToken>) -> RequestBuilder {
        match token {
            Some(token) => request.bearer_auth(&token.0),
            None => request,
        }
    }

    /// Sends a request, racing the cancellation signal. A cancelled
    /// request returns immediately without consuming retry budget.
    async fn send(request: RequestBuilder, cancel: &CancellationToken) -> Result<reqwest::Response> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::transient("request cancelled")),
            result = request.send() => result.map_err(classify_send_error),
        }
    }

    async fn make_api_call<T: DeserializeOwned>(request: RequestBuilder, cancel: &CancellationToken) -> Result<T> {
        let resp = Self::send(request, cancel).await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(map_status(status, &body));
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| Error::transient(format!("failed to read response body: {e}")))?;

        serde_json::from_slice(&body).map_err(|e| Error::protocol(format!("error decoding response for type {}: {e}", type_name::<T>())))
    }
}

#[async_trait]
impl EsiClientTrait for EsiClient {
    async fn get_page(&self, resource: &PaginatedResource, page: u32, cancel: CancellationToken) -> Result<PageResponse> {
        let mut request = self
            .client
            .get(self.join(&resource.path)?)
            .query(&resource.query)
            .query(&[("page", page.to_string())]);
        request = Self::authorized(request, resource.auth.as_ref());
        if let Some(since) = resource.if_modified_since {
            request = request.header(reqwest::header::IF_MODIFIED_SINCE, since.to_rfc2822());
        }

        let resp = Self::send(request, &cancel).await?;
        let status = resp.status();
        let pages = parse_pages_header(resp.headers());
        let expires_at = parse_expires_header(resp.headers());

        if status == StatusCode::NOT_MODIFIED {
            return Ok(PageResponse {
                body: Vec::new(),
                pages,
                expires_at,
                not_modified: true,
            });
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(map_status(status, &body));
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| Error::transient(format!("failed to read page {page} body: {e}")))?
            .to_vec();

        Ok(PageResponse {
            body,
            pages,
            expires_at,
            not_modified: false,
        })
    }

    async fn get_location(&self, character_id: CharacterId, token: &AuthToken, cancel: CancellationToken) -> Result<CharacterLocation> {
        let request = Self::authorized(self.client.get(self.join(&format!("characters/{}/location/", character_id.0))?), Some(token));

        let location: EsiLocation = Self::make_api_call(request, &cancel).await?;
        Ok(location.into_location())
    }

    async fn get_active_ship(&self, character_id: CharacterId, token: &AuthToken, cancel: CancellationToken) -> Result<ActiveShip> {
        let request = Self::authorized(self.client.get(self.join(&format!("characters/{}/ship/", character_id.0))?), Some(token));

        let ship: EsiShip = Self::make_api_call(request, &cancel).await?;
        Ok(ship.into_active_ship())
    }

    async fn get_skill_levels(&self, character_id: CharacterId, token: &AuthToken, cancel: CancellationToken) -> Result<HashMap<i32, u8>> {
        let request = Self::authorized(self.client.get(self.join(&format!("characters/{}/skills/", character_id.0))?), Some(token));

        let skills: EsiSkills = Self::make_api_call(request, &cancel).await?;
        Ok(skills.into_levels())
    }

    async fn verify(&self, token: &AuthToken, cancel: CancellationToken) -> Result<VerifiedCharacter> {
        let request = Self::authorized(self.client.get(self.join("verify/")?), Some(token));

        Self::make_api_call(request, &cancel).await
    }
}

/// The status taxonomy: auth is never masked, 404 is a normal lookup
/// miss, 420/429 only surface after the retry layer gave up, 5xx is
/// transient, anything else is a protocol surprise.
pub fn map_status(status: StatusCode, body: &str) -> Error {
    let snippet: String = body.chars().take(200).collect();
    match status.as_u16() {
        401 | 403 => Error::Auth(format!("upstream {status}: {snippet}")),
        404 => Error::not_found(format!("upstream 404: {snippet}")),
        420 | 429 => Error::RateLimited(format!("upstream {status} after retries: {snippet}")),
        500..=599 => Error::transient(format!("upstream {status}: {snippet}")),
        _ => Error::protocol(format!("unexpected upstream {status}: {snippet}")),
    }
}

fn classify_send_error(error: reqwest_middleware::Error) -> Error {
    Error::transient(format!("upstream request failed: {error}"))
}

fn parse_pages_header(headers: &HeaderMap) -> Option<u32> {
    headers
        .get("x-pages")
        .or_else(|| headers.get("pages"))
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u32>().ok())
}

fn parse_expires_header(headers: &HeaderMap) -> Option<DateTime<Utc>> {
    headers
        .get(reqwest::header::EXPIRES)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn status_mapping_matches_the_taxonomy() {
        assert_eq!(map_status(StatusCode::UNAUTHORIZED, "").kind().as_str(), "auth_error");
        assert_eq!(map_status(StatusCode::FORBIDDEN, "").kind().as_str(), "auth_error");
        assert_eq!(map_status(StatusCode::NOT_FOUND, "").kind().as_str(), "not_found");
        assert_eq!(map_status(StatusCode::from_u16(420).unwrap(), "").kind().as_str(), "rate_limited");
        assert_eq!(map_status(StatusCode::TOO_MANY_REQUESTS, "").kind().as_str(), "rate_limited");
        assert_eq!(map_status(StatusCode::BAD_GATEWAY, "").kind().as_str(), "transient");
        assert_eq!(map_status(StatusCode::IM_A_TEAPOT, "").kind().as_str(), "protocol_error");
    }

    #[test]
    fn pages_header_parses_with_fallback_name() {
        let mut headers = HeaderMap::new();
        headers.insert("x-pages", HeaderValue::from_static("17"));
        assert_eq!(parse_pages_header(&headers), Some(17));

        let mut headers = HeaderMap::new();
        headers.insert("pages", HeaderValue::from_static("3"));
        assert_eq!(parse_pages_header(&headers), Some(3));

        let mut headers = HeaderMap::new();
        headers.insert("x-pages", HeaderValue::from_static("not-a-number"));
        assert_eq!(parse_pages_header(&headers), None);
    }

    #[test]
    fn expires_header_parses_http_date() {
        let mut headers = HeaderMap::new();
        headers.insert(reqwest::header::EXPIRES, HeaderValue::from_static("Sat, 01 Aug 2026 12:05:00 GMT"));
        let expires = parse_expires_header(&headers).unwrap();
        assert_eq!(expires.to_rfc3339(), "2026-08-01T12:05:00+00:00");
    }

    #[test]
    fn auth_token_debug_never_leaks() {
        let token = AuthToken("super-secret-bearer".to_string());
        assert!(!format!("{token:?}").contains("super-secret"));
    }

    #[test]
    fn market_orders_resource_shape() {
        let resource = PaginatedResource::market_orders(RegionId(10000002));
        assert_eq!(resource.path, "markets/10000002/orders/");
        assert!(resource.auth.is_none());
        assert_eq!(resource.query, vec![("order_type".to_string(), "all".to_string())]);
    }
}
