//! Converts raw server records into canonical entities.
//!
//! Nothing here fails loudly: a record without a usable identifier (or, for
//! markers, without a finite position) normalizes to `None` and list builders
//! drop it.

use serde_json::{Map, Value};

use crate::model::{LatLng, Marker, PlaceId, Trip, TripId, TripPatch, TripRef, UNTITLED_TRIP_NAME};

type Record = Map<String, Value>;

fn clean_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// First non-empty string among `keys`.
fn first_string(record: &Record, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| clean_string(record.get(*key)))
        .find(|s| !s.is_empty())
}

/// Like [`first_string`] but distinguishes "present and blank" from "absent".
fn present_string(record: &Record, keys: &[&str]) -> Option<String> {
    let mut blank_seen = false;
    for key in keys {
        if let Some(s) = clean_string(record.get(*key)) {
            if !s.is_empty() {
                return Some(s);
            }
            blank_seen = true;
        } else if matches!(record.get(*key), Some(Value::Null)) {
            blank_seen = true;
        }
    }
    blank_seen.then(String::new)
}

fn coerce_f64(value: Option<&Value>) -> Option<f64> {
    let n = match value? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

fn coerce_count(value: Option<&Value>) -> Option<u32> {
    let n = coerce_f64(value)?;
    if n < 0.0 {
        return None;
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Some(n.floor().min(f64::from(u32::MAX)) as u32)
}

fn coerce_bool(value: Option<&Value>) -> Option<bool> {
    match value? {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" | "" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Items of a list payload: either a bare array or `{ <key>: [...] }`.
#[must_use]
pub fn list_items<'a>(payload: &'a Value, key: &str) -> &'a [Value] {
    match payload {
        Value::Array(items) => items,
        Value::Object(map) => match map.get(key) {
            Some(Value::Array(items)) => items,
            _ => &[],
        },
        _ => &[],
    }
}

/// The trip record of a `{ trip: {...} }` envelope, or the payload itself.
#[must_use]
pub fn trip_record(payload: &Value) -> &Value {
    match payload.get("trip") {
        Some(trip @ Value::Object(_)) => trip,
        _ => payload,
    }
}

/// Partial trip from a server record. `None` without an identifier.
#[must_use]
pub fn normalize_trip_patch(value: &Value) -> Option<TripPatch> {
    let record = value.as_object()?;
    let id = first_string(record, &["id", "trip_id"])?;

    let name = first_string(record, &["name"]);
    let description = present_string(record, &["description"]);

    let location_count = coerce_count(record.get("location_count"))
        .or_else(|| coerce_count(record.get("place_count")))
        .or_else(|| match record.get("place_ids") {
            Some(Value::Array(ids)) => u32::try_from(ids.len()).ok(),
            _ => None,
        });

    Some(TripPatch {
        id: TripId::new(id),
        name,
        description,
        location_count,
        created_at: present_string(record, &["created_at", "created"]),
        updated_at: first_string(record, &["updated_at", "updated"]),
        latest_location_date: present_string(record, &["latest_location_date"]),
        google_photos_url: present_string(record, &["google_photos_url", "photos_url"]),
    })
}

/// Full trip; absent fields are defaulted and a blank name becomes
/// [`UNTITLED_TRIP_NAME`].
#[must_use]
pub fn normalize_trip(value: &Value) -> Option<Trip> {
    normalize_trip_patch(value).map(TripPatch::into_trip)
}

#[must_use]
pub fn normalize_trips(payload: &Value) -> Vec<Trip> {
    list_items(payload, "trips")
        .iter()
        .filter_map(normalize_trip)
        .collect()
}

fn normalize_trip_ref(value: &Value) -> Option<TripRef> {
    match value {
        Value::Object(record) => {
            let id = first_string(record, &["id", "trip_id"])?;
            let name = first_string(record, &["name"]).unwrap_or_else(|| UNTITLED_TRIP_NAME.into());
            Some(TripRef {
                id: TripId::new(id),
                name,
            })
        }
        other => {
            let id = clean_string(Some(other)).filter(|s| !s.is_empty())?;
            Some(TripRef {
                id: TripId::new(id),
                name: UNTITLED_TRIP_NAME.into(),
            })
        }
    }
}

/// Marker from a server record. The id may be empty (synthetic marker);
/// the position must be finite and in range.
#[must_use]
pub fn normalize_marker(value: &Value) -> Option<Marker> {
    let record = value.as_object()?;

    let lat = coerce_f64(record.get("lat")).or_else(|| coerce_f64(record.get("latitude")))?;
    let lng = ["lng", "lon", "longitude"]
        .iter()
        .find_map(|key| coerce_f64(record.get(*key)))?;
    let position = LatLng::new(lat, lng)?;

    let mut trips: Vec<TripRef> = Vec::new();
    if let Some(Value::Array(raw_trips)) = record.get("trips") {
        for trip in raw_trips.iter().filter_map(normalize_trip_ref) {
            if !trips.iter().any(|t| t.id == trip.id) {
                trips.push(trip);
            }
        }
    }

    Some(Marker {
        id: PlaceId::new(first_string(record, &["id", "place_id"]).unwrap_or_default()),
        position,
        place: first_string(record, &["place", "place_name", "name"]).unwrap_or_default(),
        alias: first_string(record, &["alias"]).unwrap_or_default(),
        address: first_string(record, &["address"]).unwrap_or_default(),
        date: first_string(record, &["date", "visit_date", "start_date"]).unwrap_or_default(),
        source_type: first_string(record, &["source_type"]).unwrap_or_default(),
        archived: coerce_bool(record.get("archived")).unwrap_or(false),
        trips,
    })
}

#[must_use]
pub fn normalize_markers(payload: &Value) -> Vec<Marker> {
    list_items(payload, "markers")
        .iter()
        .filter_map(normalize_marker)
        .collect()
}

/// `{ trip, locations }` detail payload. The trip comes back as a patch so
/// fields the server left out do not overwrite what is already known.
#[must_use]
pub fn normalize_trip_detail(payload: &Value) -> Option<(TripPatch, Vec<Marker>)> {
    let trip = normalize_trip_patch(trip_record(payload))?;
    let locations = list_items(payload, "locations")
        .iter()
        .filter_map(normalize_marker)
        .collect();
    Some((trip, locations))
}
