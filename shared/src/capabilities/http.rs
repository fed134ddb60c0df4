//! Request building and response interpretation for the trip/marker API.
//!
//! Effects themselves go through `crux_http`; this module only decides
//! which URL and body to send and how to turn whatever comes back into a
//! JSON value or an [`ApiFailure`].

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::warn;
use url::Url;

use crate::model::{PlaceId, TripId};

/// Bodies above this are not parsed.
pub const MAX_RESPONSE_BODY_SIZE: usize = 20 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum ApiFailure {
    #[error("network error: {0}")]
    Transport(String),

    #[error("HTTP {code}: {message}")]
    Status { code: u16, message: String },

    #[error("invalid response body: {0}")]
    Decode(String),

    #[error("{message}")]
    Server { message: String },

    #[error("invalid request URL: {0}")]
    InvalidUrl(String),
}

impl ApiFailure {
    #[must_use]
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type ApiResult = Result<Value, ApiFailure>;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApiMethod {
    Get,
    Post,
    Patch,
    Delete,
}

/// A fully-resolved request, ready to hand to `crux_http`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApiRequest {
    pub method: ApiMethod,
    pub url: String,
    pub body: Option<Value>,
}

/// Which trip an assignment goes to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TripTarget {
    Existing(TripId),
    New { name: String },
}

/// Server-side filter for the marker reload.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerFilter {
    pub source_types: Vec<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiEndpoints {
    base: Url,
}

impl ApiEndpoints {
    /// `base` must be a hierarchical URL (http/https); see `CoreConfig::base_url`.
    #[must_use]
    pub fn new(base: Url) -> Self {
        Self { base }
    }

    fn url(&self, segments: &[&str]) -> Result<Url, ApiFailure> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| ApiFailure::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: ApiMethod, segments: &[&str], body: Option<Value>) -> Result<ApiRequest, ApiFailure> {
        Ok(ApiRequest {
            method,
            url: self.url(segments)?.to_string(),
            body,
        })
    }

    pub fn list_trips(&self) -> Result<ApiRequest, ApiFailure> {
        self.request(ApiMethod::Get, &["api", "trips"], None)
    }

    pub fn get_trip(&self, id: &TripId) -> Result<ApiRequest, ApiFailure> {
        self.request(ApiMethod::Get, &["api", "trips", id.as_str()], None)
    }

    pub fn create_trip(&self, name: &str, description: &str) -> Result<ApiRequest, ApiFailure> {
        self.request(
            ApiMethod::Post,
            &["api", "trips"],
            Some(json!({ "name": name, "description": description })),
        )
    }

    pub fn update_trip(&self, id: &TripId, fields: Value) -> Result<ApiRequest, ApiFailure> {
        self.request(ApiMethod::Patch, &["api", "trips", id.as_str()], Some(fields))
    }

    pub fn delete_trip(&self, id: &TripId) -> Result<ApiRequest, ApiFailure> {
        self.request(ApiMethod::Delete, &["api", "trips", id.as_str()], None)
    }

    pub fn assign_places(&self, target: &TripTarget, place_ids: &[PlaceId]) -> Result<ApiRequest, ApiFailure> {
        let body = match target {
            TripTarget::Existing(id) => json!({ "trip_id": id, "place_ids": place_ids }),
            TripTarget::New { name } => json!({ "trip_name": name, "place_ids": place_ids }),
        };
        self.request(ApiMethod::Post, &["api", "trips", "assign"], Some(body))
    }

    pub fn remove_place(&self, trip_id: &TripId, place_id: &PlaceId) -> Result<ApiRequest, ApiFailure> {
        self.request(
            ApiMethod::Delete,
            &["api", "trips", trip_id.as_str(), "locations", place_id.as_str()],
            None,
        )
    }

    pub fn archive_places(&self, place_ids: &[PlaceId]) -> Result<ApiRequest, ApiFailure> {
        self.request(
            ApiMethod::Post,
            &["api", "places", "archive"],
            Some(json!({ "place_ids": place_ids })),
        )
    }

    pub fn delete_places(&self, place_ids: &[PlaceId]) -> Result<ApiRequest, ApiFailure> {
        self.request(
            ApiMethod::Post,
            &["api", "places", "delete"],
            Some(json!({ "place_ids": place_ids })),
        )
    }

    pub fn map_data(&self, filter: &MarkerFilter) -> Result<ApiRequest, ApiFailure> {
        let mut url = self.url(&["api", "map_data"])?;
        {
            let mut query = url.query_pairs_mut();
            for source in filter.source_types.iter().filter(|s| !s.trim().is_empty()) {
                query.append_pair("source_type", source.trim());
            }
            if let Some(start) = filter.start_date.as_deref().filter(|s| !s.is_empty()) {
                query.append_pair("start_date", start);
            }
            if let Some(end) = filter.end_date.as_deref().filter(|s| !s.is_empty()) {
                query.append_pair("end_date", end);
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        Ok(ApiRequest {
            method: ApiMethod::Get,
            url: url.to_string(),
            body: None,
        })
    }
}

fn server_message(body: &Value) -> Option<String> {
    ["message", "error"]
        .iter()
        .find_map(|key| body.get(*key)?.as_str())
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
}

/// Turns a status code and raw body into the JSON payload or a failure.
/// A 2xx body with `"status": "error"` is a failure; an empty body is `null`.
pub fn interpret_response(status: u16, body: &[u8]) -> ApiResult {
    if body.len() > MAX_RESPONSE_BODY_SIZE {
        return Err(ApiFailure::Decode(format!(
            "body of {} bytes exceeds {MAX_RESPONSE_BODY_SIZE}",
            body.len()
        )));
    }

    let parsed = if body.iter().all(u8::is_ascii_whitespace) {
        Ok(Value::Null)
    } else {
        serde_json::from_slice::<Value>(body)
    };

    if !(200..300).contains(&status) {
        let message = parsed
            .as_ref()
            .ok()
            .and_then(server_message)
            .unwrap_or_else(|| format!("request failed with status {status}"));
        return Err(ApiFailure::Status { code: status, message });
    }

    let value = parsed.map_err(|e| {
        warn!(status, error = %e, "response body is not JSON");
        ApiFailure::Decode(e.to_string())
    })?;

    if value.get("status").and_then(Value::as_str) == Some("error") {
        let message = server_message(&value).unwrap_or_else(|| "The server reported an error".into());
        return Err(ApiFailure::Server { message });
    }
    Ok(value)
}

/// Adapter for the `crux_http` send callback.
pub fn read_response(result: crux_http::Result<crux_http::Response<Vec<u8>>>) -> ApiResult {
    match result {
        Ok(mut response) => {
            let status: u16 = response.status().into();
            let body = response.take_body().unwrap_or_default();
            interpret_response(status, &body)
        }
        Err(e) => Err(ApiFailure::Transport(e.to_string())),
    }
}
