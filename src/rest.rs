// ABOUTME: HTTP collaborator for a node's REST endpoints
// ABOUTME: Track loading/decoding and route planner administration over ureq

use crate::config::NodeConfig;
use crate::error::Error;
use crate::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Result category of `/loadtracks`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadType {
    /// A single track
    TrackLoaded,
    /// A playlist
    PlaylistLoaded,
    /// Search results
    SearchResult,
    /// Nothing matched
    NoMatches,
    /// Loading failed
    LoadFailed,
}

/// Response of `/loadtracks`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadTracksResponse {
    /// Result category
    pub load_type: LoadType,
    /// Playlist details when a playlist was loaded
    #[serde(default)]
    pub playlist_info: PlaylistInfo,
    /// Loaded tracks
    #[serde(default)]
    pub tracks: Vec<Track>,
    /// Failure details when loading failed
    #[serde(default)]
    pub exception: Option<LoadException>,
}

/// Playlist details
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistInfo {
    /// Playlist name
    #[serde(default)]
    pub name: Option<String>,
    /// Index of the selected track
    #[serde(default)]
    pub selected_track: Option<i64>,
}

/// Failure details
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadException {
    /// Message
    pub message: String,
    /// Severity
    pub severity: String,
}

/// Encoded track with its metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    /// Encoded track
    pub track: String,
    /// Metadata
    pub info: TrackInfo,
}

/// Track metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    /// Source-specific identifier
    pub identifier: String,
    /// Whether seeking is supported
    pub is_seekable: bool,
    /// Author
    pub author: String,
    /// Length in milliseconds
    pub length: u64,
    /// Whether this is a live stream
    pub is_stream: bool,
    /// Start position in milliseconds
    pub position: u64,
    /// Title
    pub title: String,
    /// Source url
    #[serde(default)]
    pub uri: Option<String>,
    /// Source name
    #[serde(default)]
    pub source_name: Option<String>,
}

/// Response of `/routeplanner/status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutePlannerStatus {
    /// Planner class, `None` when no planner is configured
    #[serde(default)]
    pub class: Option<String>,
    /// Planner-specific details
    #[serde(default)]
    pub details: Option<serde_json::Value>,
}

struct RestInner {
    agent: ureq::Agent,
    base_url: String,
    password: String,
    node_id: String,
    requests: AtomicU64,
}

/// REST client for one node
///
/// Clones share the agent and the request counter.
#[derive(Clone)]
pub struct Rest {
    inner: Arc<RestInner>,
}

impl std::fmt::Debug for Rest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rest")
            .field("base_url", &self.inner.base_url)
            .field("requests", &self.requests())
            .finish()
    }
}

impl Rest {
    /// Client for the node described by `config`
    pub fn new(config: &NodeConfig) -> Self {
        Self::with_base_url(config.http_url(), &config.password, &config.id)
    }

    /// Client for an explicit base url
    pub fn with_base_url(base_url: impl Into<String>, password: &str, node_id: &str) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(30))
            .user_agent(&format!("lavawire/{}", env!("CARGO_PKG_VERSION")))
            .build();

        Self {
            inner: Arc::new(RestInner {
                agent,
                base_url: base_url.into().trim_end_matches('/').to_string(),
                password: password.to_string(),
                node_id: node_id.to_string(),
                requests: AtomicU64::new(0),
            }),
        }
    }

    /// Base url of the node
    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    /// Requests made so far
    pub fn requests(&self) -> u64 {
        self.inner.requests.load(Ordering::SeqCst)
    }

    /// Load or search with `identifier`
    pub async fn load_tracks(&self, identifier: &str) -> Result<LoadTracksResponse> {
        let identifier = identifier.to_string();
        self.blocking(move |rest| {
            rest.call("GET", "/loadtracks", &[("identifier", &identifier)], None)
                .and_then(read_json)
        })
        .await
    }

    /// Decode several encoded tracks
    pub async fn decode_tracks(&self, tracks: Vec<String>) -> Result<Vec<Track>> {
        self.blocking(move |rest| {
            let body = serde_json::to_value(&tracks)?;
            rest.call("POST", "/decodetracks", &[], Some(&body))
                .and_then(read_json)
        })
        .await
    }

    /// Decode one encoded track
    pub async fn decode_track(&self, track: &str) -> Result<TrackInfo> {
        let track = track.to_string();
        self.blocking(move |rest| {
            rest.call("GET", "/decodetrack", &[("track", &track)], None)
                .and_then(read_json)
        })
        .await
    }

    /// Route planner status
    pub async fn route_planner_status(&self) -> Result<RoutePlannerStatus> {
        self.blocking(|rest| {
            rest.call("GET", "/routeplanner/status", &[], None)
                .and_then(read_json)
        })
        .await
    }

    /// Unmark failing addresses, one request each, in order
    ///
    /// Stops at the first failed request.
    pub async fn free_addresses(&self, addresses: &[&str]) -> Result<()> {
        let bodies: Vec<serde_json::Value> = addresses
            .iter()
            .map(|address| serde_json::json!({ "address": address }))
            .collect();
        self.blocking(move |rest| {
            for body in &bodies {
                rest.call("POST", "/routeplanner/free/address", &[], Some(body))?;
            }
            Ok(())
        })
        .await
    }

    /// Unmark every failing address
    pub async fn free_all_addresses(&self) -> Result<()> {
        self.blocking(|rest| {
            rest.call("POST", "/routeplanner/free/all", &[], None)
                .map(drop)
        })
        .await
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&RestInner) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| Error::Rest(format!("request task failed: {}", e)))?
    }
}

impl RestInner {
    fn call(
        &self,
        method: &str,
        endpoint: &str,
        query: &[(&str, &str)],
        body: Option<&serde_json::Value>,
    ) -> Result<ureq::Response> {
        let url = format!("{}{}", self.base_url, endpoint);
        let mut request = self
            .agent
            .request(method, &url)
            .set("Authorization", &self.password);
        for (name, value) in query {
            request = request.query(name, value);
        }

        let result = match body {
            Some(body) => request.send_json(body),
            None => request.call(),
        };

        let total = self.requests.fetch_add(1, Ordering::SeqCst) + 1;
        log::debug!(
            "[{}] rest: {} {} | total requests={}",
            self.node_id,
            method,
            endpoint,
            total
        );

        result.map_err(|e| match e {
            ureq::Error::Status(code, _) => {
                Error::Rest(format!("{} {} returned status {}", method, endpoint, code))
            }
            other => Error::Rest(other.to_string()),
        })
    }
}

fn read_json<T: DeserializeOwned>(response: ureq::Response) -> Result<T> {
    response
        .into_json()
        .map_err(|e| Error::Rest(format!("invalid response body: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_from_config() {
        let rest = Rest::new(&NodeConfig::new("a", "lava.local", 2333, "pw").secure(true));
        assert_eq!(rest.base_url(), "https://lava.local:2333");
        assert_eq!(rest.requests(), 0);

        let rest = Rest::with_base_url("http://127.0.0.1:80/", "pw", "b");
        assert_eq!(rest.base_url(), "http://127.0.0.1:80");
    }

    #[test]
    fn test_parse_load_tracks_response() {
        let raw = r#"{
            "loadType": "SEARCH_RESULT",
            "playlistInfo": {},
            "tracks": [{
                "track": "QAAAjQ",
                "info": {
                    "identifier": "dQw4w9WgXcQ",
                    "isSeekable": true,
                    "author": "RickAstleyVEVO",
                    "length": 212000,
                    "isStream": false,
                    "position": 0,
                    "title": "Rick Astley - Never Gonna Give You Up",
                    "uri": "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
                    "sourceName": "youtube"
                }
            }]
        }"#;

        let response: LoadTracksResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(response.load_type, LoadType::SearchResult);
        assert_eq!(response.tracks.len(), 1);
        assert_eq!(response.tracks[0].info.length, 212000);
        assert_eq!(response.playlist_info, PlaylistInfo::default());
    }
}
