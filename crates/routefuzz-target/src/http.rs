//! Blocking HTTP request sender.

use crate::{value_text, CookieJar, HttpRequest, RequestSender, SendError};
use log::{debug, warn};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, COOKIE, SET_COOKIE};
use reqwest::redirect::Policy;
use reqwest::Method;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

const CONTENT_TYPE_JSON: &str = "application/json";

/// Headers recorded in traffic that must not be replayed verbatim.
const STRIPPED_HEADERS: &[&str] = &["content-length", "cookies", "cookie"];

/// Sends requests with reqwest, never following redirects.
pub struct HttpSender {
    client: Client,
}

impl HttpSender {
    pub fn new(timeout: Duration) -> Result<Self, SendError> {
        let client = Client::builder()
            .redirect(Policy::none())
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

impl RequestSender for HttpSender {
    fn send(
        &mut self,
        cookies: &mut CookieJar,
        request: &HttpRequest,
    ) -> Result<Option<u16>, SendError> {
        let verb = request.verb.to_ascii_uppercase();
        if verb == "GET" && !request.body_params.is_empty() {
            return Err(SendError::BodyOnGet {
                url: request.url.clone(),
            });
        }
        let method = Method::from_bytes(verb.as_bytes())
            .map_err(|_| SendError::InvalidVerb(request.verb.clone()))?;

        let json_body = wants_json(&request.headers);
        let mut builder = self
            .client
            .request(method, &request.url)
            .headers(build_headers(&request.headers)?);

        if let Some(cookie) = cookies.header_value() {
            let value = HeaderValue::from_str(&cookie).map_err(|_| SendError::InvalidHeader {
                name: COOKIE.to_string(),
            })?;
            builder = builder.header(COOKIE, value);
        }
        if !request.query_params.is_empty() {
            builder = builder.query(&encode_pairs(&request.query_params));
        }
        if !request.body_params.is_empty() {
            builder = if json_body {
                builder.json(&request.body_params)
            } else {
                builder.form(&encode_pairs(&request.body_params))
            };
        }

        debug!(
            "{} {} query={:?} body={:?}",
            verb, request.url, request.query_params, request.body_params
        );

        let response = match builder.send() {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                warn!("timeout: {} {}", verb, request.url);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let status = response.status();
        // Error and redirect responses do not update the session.
        if status.is_success() || status.is_informational() {
            for value in response.headers().get_all(SET_COOKIE) {
                if let Ok(text) = value.to_str() {
                    cookies.store_set_cookie(text);
                }
            }
        }
        Ok(Some(status.as_u16()))
    }
}

fn wants_json(headers: &BTreeMap<String, String>) -> bool {
    headers.iter().any(|(name, value)| {
        name.eq_ignore_ascii_case("content-type") && value.trim() == CONTENT_TYPE_JSON
    })
}

/// Recorded headers minus the stripped set and any content type, which the
/// body encoder sets itself.
fn build_headers(headers: &BTreeMap<String, String>) -> Result<HeaderMap, SendError> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let lower = name.to_ascii_lowercase();
        if lower == "content-type" || STRIPPED_HEADERS.contains(&lower.as_str()) {
            continue;
        }
        let invalid = || SendError::InvalidHeader { name: name.clone() };
        let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid())?;
        let header_value = HeaderValue::from_str(value).map_err(|_| invalid())?;
        map.insert(header_name, header_value);
    }
    Ok(map)
}

/// Flatten params into key/value pairs; arrays repeat the key.
fn encode_pairs(params: &BTreeMap<String, Value>) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for (name, value) in params {
        match value {
            Value::Array(items) => {
                for item in items {
                    pairs.push((name.clone(), value_text(item)));
                }
            }
            other => pairs.push((name.clone(), value_text(other))),
        }
    }
    pairs
}
