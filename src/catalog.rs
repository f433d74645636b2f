// Slot Catalog Client: per-window availability queries, normalized into Slots

use std::sync::Arc;

use chrono::NaiveDateTime;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    config::BookingConfig,
    error::ApiError,
    policy::PriorityPolicy,
    session::Credentials,
    upstream::{snippet, RoomQuery, VenueApi},
    window::TimeWindow,
};

// Label the upstream puts on rows that can be booked right now
pub const BOOKABLE_MARKER: &str = "可预约";

// One bookable (window, venue) pair. Rebuilt every discovery cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Slot {
    pub venue_id: String,
    pub wid: String,
    pub window: TimeWindow,
    pub venue_name: String,
    pub rank: usize,
}

impl Slot {
    pub fn label(&self) -> String {
        format!("{} - {}", self.window, self.venue_name)
    }
}

// Result of one discovery pass, including what was skipped or failed
#[derive(Debug, Default)]
pub struct Discovery {
    pub slots: Vec<Slot>,
    pub queried: Vec<TimeWindow>,
    pub skipped: Vec<TimeWindow>,
    pub failures: Vec<(TimeWindow, ApiError)>,
}

impl Discovery {
    // Every queried window failed at the transport level (nothing learned about availability)
    pub fn upstream_down(&self) -> bool {
        !self.queried.is_empty()
            && self.failures.len() == self.queried.len()
            && self.failures.iter().all(|(_, e)| e.is_transport())
    }

    pub fn session_expired(&self) -> bool {
        self.failures
            .iter()
            .any(|(_, e)| matches!(e, ApiError::SessionExpired(_)))
    }
}

#[derive(Debug, Deserialize)]
struct OpeningRoomResponse {
    #[serde(default)]
    code: Value,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    datas: Option<OpeningRoomDatas>,
}

#[derive(Debug, Deserialize)]
struct OpeningRoomDatas {
    #[serde(rename = "getOpeningRoom", default)]
    opening_room: Option<RoomPage>,
}

#[derive(Debug, Deserialize)]
struct RoomPage {
    #[serde(default)]
    rows: Vec<RoomRow>,
}

#[derive(Debug, Deserialize)]
struct RoomRow {
    #[serde(rename = "WID", default)]
    wid: Value,
    #[serde(rename = "CDMC", default)]
    name: Option<String>,
    #[serde(rename = "CGBM", default)]
    hall: Value,
    #[serde(default = "default_disabled")]
    disabled: bool,
    #[serde(default)]
    text: Option<String>,
}

fn default_disabled() -> bool {
    true
}

// Upstream is inconsistent about numbers vs strings in ids and codes
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

// A room reported by the opening-room endpoint, before ranking
#[derive(Debug, Clone, PartialEq)]
pub struct OpenRoom {
    pub wid: String,
    pub venue_id: String,
    pub venue_name: String,
}

// Parse one opening-room response body; only rows explicitly marked bookable survive.
pub fn parse_opening_rooms(body: &str) -> Result<Vec<OpenRoom>, ApiError> {
    let response: OpeningRoomResponse = serde_json::from_str(body)
        .map_err(|e| ApiError::MalformedResponse(format!("{e}: {}", snippet(body, 120))))?;

    let code = value_to_string(&response.code);
    if code != "0" {
        return Err(ApiError::Application {
            code,
            message: response.msg.unwrap_or_default(),
        });
    }

    let rows = response
        .datas
        .ok_or_else(|| ApiError::MalformedResponse("missing 'datas'".into()))?
        .opening_room
        .map(|page| page.rows)
        .unwrap_or_default();

    Ok(rows
        .into_iter()
        .filter(|row| !row.disabled && row.text.as_deref() == Some(BOOKABLE_MARKER))
        .filter_map(|row| {
            let wid = value_to_string(&row.wid);
            if wid.is_empty() {
                return None;
            }
            Some(OpenRoom {
                wid,
                venue_id: value_to_string(&row.hall),
                venue_name: row.name.unwrap_or_default(),
            })
        })
        .collect())
}

pub struct SlotCatalog {
    api: Arc<dyn VenueApi>,
}

impl SlotCatalog {
    pub fn new(api: Arc<dyn VenueApi>) -> Self {
        Self { api }
    }

    pub async fn discover(
        &self,
        config: &BookingConfig,
        creds: &Credentials,
        now: NaiveDateTime,
    ) -> Vec<Slot> {
        self.discover_detailed(config, creds, now).await.slots
    }

    // Queries every still-valid preferred window concurrently. A failing window
    // contributes zero slots and never aborts the others.
    pub async fn discover_detailed(
        &self,
        config: &BookingConfig,
        creds: &Credentials,
        now: NaiveDateTime,
    ) -> Discovery {
        let mut discovery = Discovery::default();

        for window in &config.preferred_windows {
            if window.is_valid_on(config.target_date, now) {
                discovery.queried.push(window.clone());
            } else {
                info!(window = %window, "skipping elapsed window");
                discovery.skipped.push(window.clone());
            }
        }

        let queries = discovery
            .queried
            .iter()
            .map(|window| self.query_window(config, creds, window));
        let results = join_all(queries).await;

        let policy = PriorityPolicy::new(&config.preferred_windows);
        for (window, result) in discovery.queried.iter().zip(results) {
            match result {
                Ok(rooms) => {
                    if rooms.is_empty() {
                        debug!(window = %window, "no bookable venues");
                    }
                    for room in rooms {
                        let slot = Slot {
                            venue_id: room.venue_id,
                            wid: room.wid,
                            window: window.clone(),
                            venue_name: room.venue_name,
                            rank: policy.rank(window),
                        };
                        info!(slot = %slot.label(), wid = %slot.wid, "bookable venue");
                        discovery.slots.push(slot);
                    }
                }
                Err(err) => {
                    warn!(window = %window, error = %err, "availability query failed");
                    discovery.failures.push((window.clone(), err));
                }
            }
        }

        // stable: venues keep upstream order within a window
        discovery.slots.sort_by_key(|s| s.rank);
        discovery
    }

    async fn query_window(
        &self,
        config: &BookingConfig,
        creds: &Credentials,
        window: &TimeWindow,
    ) -> Result<Vec<OpenRoom>, ApiError> {
        let query = RoomQuery::for_window(config, window);
        debug!(date = %query.date, window = %window, "querying availability");
        let res = self.api.query_rooms(creds, &query).await?;
        res.ensure_json_ok()?;
        parse_opening_rooms(&res.body)
    }
}
