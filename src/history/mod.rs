//! Client for the STH (Short-Term History) raw-data API.
//!
//! One `fetch` is one GET:
//!
//! ```text
//! <base>/STH/v1/contextEntities/type/<type>/id/<id>/attributes/<attr>?lastN=<n>[&dateFrom=<ms>]
//! ```
//!
//! The response body is returned as the raw bytes received; no schema is
//! assumed. How the body is rendered to callers (`txt` or `bin`) is a
//! `ResponseFormat` choice made per service or per request.

use crate::error::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// One history request, built per trigger.
#[derive(Clone, Debug, PartialEq)]
pub struct HistoryQuery {
    pub entity_id: String,
    pub entity_type: String,
    pub attribute: String,
    /// Value of `lastN`
    pub sample_count: u32,
    /// How far back `dateFrom` reaches. `None` or zero omits `dateFrom`.
    pub window_start_offset: Option<Duration>,
}

impl HistoryQuery {
    /// Path and query string, relative to the service base URL.
    pub fn path_and_query(&self, now: DateTime<Utc>) -> Result<String> {
        let mut path = format!(
            "/STH/v1/contextEntities/type/{}/id/{}/attributes/{}?lastN={}",
            self.entity_type, self.entity_id, self.attribute, self.sample_count
        );

        if let Some(date_from) = self.date_from(now)? {
            path.push_str(&format!("&dateFrom={}", date_from));
        }

        Ok(path)
    }

    /// `dateFrom` in epoch milliseconds, if a window is requested.
    ///
    /// A window reaching past the earliest representable date is an
    /// `Error::InvalidQuery`.
    pub fn date_from(&self, now: DateTime<Utc>) -> Result<Option<i64>> {
        let Some(offset) = self
            .window_start_offset
            .filter(|offset| *offset != Duration::zero())
        else {
            return Ok(None);
        };

        now.checked_sub_signed(offset)
            .map(|from| Some(from.timestamp_millis()))
            .ok_or_else(|| {
                Error::InvalidQuery(format!(
                    "history window of {} ms is out of range",
                    offset.num_milliseconds()
                ))
            })
    }
}

/// How a history body is handed to callers of the HTTP API.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseFormat {
    /// UTF-8 text, passed through as a string
    #[default]
    #[serde(rename = "txt")]
    Text,
    /// Arbitrary bytes, base64-encoded
    #[serde(rename = "bin")]
    Binary,
}

/// Status and body of a successful history request.
#[derive(Clone, Debug, PartialEq)]
pub struct HistoryResult {
    pub status_code: u16,
    /// Response body exactly as received
    pub body: Vec<u8>,
}

impl HistoryResult {
    /// The body as text, if it is valid UTF-8.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

/// Multi-tenancy scope sent with every request.
#[derive(Clone, Debug, Default)]
pub struct Tenant {
    /// `Fiware-Service`
    pub service: String,
    /// `Fiware-ServicePath`
    pub service_path: String,
}

/// HTTP client for one STH endpoint.
pub struct HistoryFetcher {
    base_url: String,
    tenant: Tenant,
    http_client: Client,
}

impl HistoryFetcher {
    /// `base_url` is scheme, host and port with no trailing slash.
    pub fn new(base_url: String, tenant: Tenant) -> Self {
        Self {
            base_url,
            tenant,
            http_client: Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Full request URL for `query` evaluated at `now`.
    pub fn url_for(&self, query: &HistoryQuery, now: DateTime<Utc>) -> Result<String> {
        Ok(format!("{}{}", self.base_url, query.path_and_query(now)?))
    }

    /// Issues one GET. Only HTTP 200 counts as success.
    ///
    /// Any other status, and any transport failure, is an `Error::Request`
    /// carrying the status (if one was received) and the error detail.
    pub async fn fetch(
        &self,
        query: &HistoryQuery,
        access_token: Option<&str>,
    ) -> Result<HistoryResult> {
        let url = self.url_for(query, Utc::now())?;
        debug!(
            entity = %query.entity_id,
            attribute = %query.attribute,
            authenticated = access_token.is_some(),
            url = %url,
            "Querying STH"
        );

        let mut request = self
            .http_client
            .get(&url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .header("Fiware-Service", &self.tenant.service)
            .header("Fiware-ServicePath", &self.tenant.service_path);

        if let Some(token) = access_token {
            request = request.header("X-Auth-Token", token);
        }

        let response = request.send().await.map_err(|e| {
            warn!(entity = %query.entity_id, error = %e, "STH request failed");
            Error::Request {
                status: e.status().map(|s| s.as_u16()),
                detail: e.to_string(),
            }
        })?;

        let status = response.status();
        let body = response.bytes().await.map_err(|e| Error::Request {
            status: Some(status.as_u16()),
            detail: format!("failed to read response body: {}", e),
        })?;

        if status != StatusCode::OK {
            warn!(
                entity = %query.entity_id,
                status = status.as_u16(),
                "STH returned an error status"
            );
            return Err(Error::Request {
                status: Some(status.as_u16()),
                detail: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        Ok(HistoryResult {
            status_code: status.as_u16(),
            body: body.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn sensor_query(offset: Option<Duration>) -> HistoryQuery {
        HistoryQuery {
            entity_id: "sensor1".to_string(),
            entity_type: "Thing".to_string(),
            attribute: "temp".to_string(),
            sample_count: 10,
            window_start_offset: offset,
        }
    }

    fn tenant() -> Tenant {
        Tenant {
            service: "openiot".to_string(),
            service_path: "/".to_string(),
        }
    }

    #[test]
    fn test_path_without_window() {
        let now = Utc::now();
        assert_eq!(
            sensor_query(None).path_and_query(now).unwrap(),
            "/STH/v1/contextEntities/type/Thing/id/sensor1/attributes/temp?lastN=10"
        );
    }

    #[test]
    fn test_zero_window_is_unset() {
        let now = Utc::now();
        let query = sensor_query(Some(Duration::zero()));
        assert_eq!(
            query.path_and_query(now).unwrap(),
            "/STH/v1/contextEntities/type/Thing/id/sensor1/attributes/temp?lastN=10"
        );
        assert_eq!(query.date_from(now).unwrap(), None);
    }

    #[test]
    fn test_date_from_is_now_minus_offset() {
        let now = Utc::now();
        let query = sensor_query(Some(Duration::hours(1)));

        let expected = now.timestamp_millis() - 3_600_000;
        assert_eq!(query.date_from(now).unwrap(), Some(expected));
        assert!(query
            .path_and_query(now)
            .unwrap()
            .ends_with(&format!("?lastN=10&dateFrom={}", expected)));
    }

    #[test]
    fn test_window_past_earliest_date_is_invalid_query() {
        let now = Utc::now();
        let query = sensor_query(Some(Duration::milliseconds(i64::MAX)));

        assert!(matches!(query.date_from(now), Err(Error::InvalidQuery(_))));
        assert!(matches!(
            query.path_and_query(now),
            Err(Error::InvalidQuery(_))
        ));
    }

    #[test]
    fn test_url_for_joins_base() {
        let fetcher = HistoryFetcher::new("http://sth.local:8666".to_string(), tenant());
        let url = fetcher.url_for(&sensor_query(None), Utc::now()).unwrap();
        assert_eq!(
            url,
            "http://sth.local:8666/STH/v1/contextEntities/type/Thing/id/sensor1/attributes/temp?lastN=10"
        );
    }

    #[tokio::test]
    async fn test_fetch_ok_returns_body_unmodified() {
        let body = r#"{"contextResponses":[{"contextElement":{"attributes":[{"name":"temp","values":[]}]}}]}"#;

        let mut server = Server::new_async().await;
        let mock = server
            .mock(
                "GET",
                Matcher::Regex(
                    r"^/STH/v1/contextEntities/type/Thing/id/sensor1/attributes/temp(\?|$)"
                        .into(),
                ),
            )
            .match_query(Matcher::UrlEncoded("lastN".into(), "10".into()))
            .match_header("content-type", "application/json")
            .match_header("accept", "application/json")
            .match_header("fiware-service", "openiot")
            .match_header("fiware-servicepath", "/")
            .match_header("x-auth-token", "secret-token")
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let fetcher = HistoryFetcher::new(server.url(), tenant());
        let result = fetcher
            .fetch(&sensor_query(None), Some("secret-token"))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(result.status_code, 200);
        assert_eq!(result.body, body.as_bytes());
        assert_eq!(result.text(), Some(body));
    }

    #[tokio::test]
    async fn test_fetch_keeps_non_utf8_body_bytes() {
        let body: &[u8] = &[0x00, 0xff, 0xfe, 0x80, b'x'];

        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", Matcher::Any)
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let fetcher = HistoryFetcher::new(server.url(), tenant());
        let result = fetcher.fetch(&sensor_query(None), None).await.unwrap();

        assert_eq!(result.body, body);
        assert!(result.text().is_none());
    }

    #[test]
    fn test_response_format_names() {
        assert_eq!(
            serde_json::to_string(&ResponseFormat::Binary).unwrap(),
            r#""bin""#
        );
        let format: ResponseFormat = serde_json::from_str(r#""txt""#).unwrap();
        assert_eq!(format, ResponseFormat::Text);
    }

    #[tokio::test]
    async fn test_fetch_without_token_omits_auth_header() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", Matcher::Any)
            .match_header("x-auth-token", Matcher::Missing)
            .with_status(200)
            .with_body("[]")
            .create_async()
            .await;

        let fetcher = HistoryFetcher::new(server.url(), tenant());
        fetcher.fetch(&sensor_query(None), None).await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_sends_date_from() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", Matcher::Any)
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("lastN".into(), "10".into()),
                Matcher::Regex("dateFrom=\\d+".into()),
            ]))
            .with_status(200)
            .create_async()
            .await;

        let fetcher = HistoryFetcher::new(server.url(), tenant());
        fetcher
            .fetch(&sensor_query(Some(Duration::minutes(5))), None)
            .await
            .unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_404_is_request_error() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", Matcher::Any)
            .with_status(404)
            .with_body(r#"{"error":"NotFound"}"#)
            .create_async()
            .await;

        let fetcher = HistoryFetcher::new(server.url(), tenant());
        let err = fetcher.fetch(&sensor_query(None), None).await.unwrap_err();

        match err {
            Error::Request { status, detail } => {
                assert_eq!(status, Some(404));
                assert!(detail.contains("NotFound"));
            }
            other => panic!("expected request error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_non_200_success_is_error() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", Matcher::Any)
            .with_status(204)
            .create_async()
            .await;

        let fetcher = HistoryFetcher::new(server.url(), tenant());
        let err = fetcher.fetch(&sensor_query(None), None).await.unwrap_err();
        assert_eq!(err.status_code(), Some(204));
    }

    #[tokio::test]
    async fn test_fetch_transport_error_has_no_status() {
        let fetcher = HistoryFetcher::new("http://127.0.0.1:9".to_string(), tenant());
        let err = fetcher.fetch(&sensor_query(None), None).await.unwrap_err();

        assert!(matches!(err, Error::Request { status: None, .. }));
    }
}
