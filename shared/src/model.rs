use serde::{Deserialize, Serialize};
use std::fmt;

use crate::time;

/// Shown when a trip record carries no usable name.
pub const UNTITLED_TRIP_NAME: &str = "Untitled Trip";
/// Shown when a marker has neither an alias nor a place name.
pub const UNKNOWN_PLACE_NAME: &str = "Unknown";

// --- Typed IDs ---

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

typed_id!(TripId);
typed_id!(PlaceId);

impl PlaceId {
    /// Synthetic markers are rendered but carry no server identity.
    #[must_use]
    pub fn is_synthetic(&self) -> bool {
        self.0.is_empty()
    }
}

// --- Coordinates ---

/// Validated lat/lng
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    #[must_use]
    pub fn new(lat: f64, lng: f64) -> Option<Self> {
        if !lat.is_finite() || !lng.is_finite() {
            return None;
        }
        if !(-90.0..=90.0).contains(&lat) {
            return None;
        }
        if !(-180.0..=180.0).contains(&lng) {
            return None;
        }
        Some(Self { lat, lng })
    }
}

/// Axis-aligned geographic rectangle. Edges are inclusive.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoBounds {
    pub south: f64,
    pub west: f64,
    pub north: f64,
    pub east: f64,
}

impl GeoBounds {
    #[must_use]
    pub fn from_corners(a: LatLng, b: LatLng) -> Self {
        Self {
            south: a.lat.min(b.lat),
            west: a.lng.min(b.lng),
            north: a.lat.max(b.lat),
            east: a.lng.max(b.lng),
        }
    }

    #[must_use]
    pub fn contains(&self, point: LatLng) -> bool {
        (self.south..=self.north).contains(&point.lat) && (self.west..=self.east).contains(&point.lng)
    }
}

// --- Entities ---

/// Lightweight (id, name) pair attached to a marker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TripRef {
    pub id: TripId,
    pub name: String,
}

/// A single geolocated place rendered on the map.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub id: PlaceId,
    pub position: LatLng,
    pub place: String,
    pub alias: String,
    pub address: String,
    pub date: String,
    pub source_type: String,
    pub archived: bool,
    pub trips: Vec<TripRef>,
}

impl Marker {
    #[must_use]
    pub fn display_name(&self) -> &str {
        if !self.alias.is_empty() {
            &self.alias
        } else if !self.place.is_empty() {
            &self.place
        } else {
            UNKNOWN_PLACE_NAME
        }
    }

    #[must_use]
    pub fn belongs_to(&self, trip_id: &TripId) -> bool {
        self.trips.iter().any(|t| &t.id == trip_id)
    }

    /// Adds or renames the membership. Returns `true` if anything changed.
    pub fn attach_trip(&mut self, trip: &TripRef) -> bool {
        match self.trips.iter_mut().find(|t| t.id == trip.id) {
            Some(existing) if existing.name == trip.name => false,
            Some(existing) => {
                existing.name.clone_from(&trip.name);
                true
            }
            None => {
                self.trips.push(trip.clone());
                true
            }
        }
    }

    pub fn detach_trip(&mut self, trip_id: &TripId) -> bool {
        let before = self.trips.len();
        self.trips.retain(|t| &t.id != trip_id);
        self.trips.len() != before
    }

    pub fn rename_trip(&mut self, trip_id: &TripId, name: &str) -> bool {
        match self.trips.iter_mut().find(|t| &t.id == trip_id) {
            Some(existing) if existing.name != name => {
                existing.name = name.to_string();
                true
            }
            _ => false,
        }
    }
}

/// A named, user-defined grouping of markers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trip {
    pub id: TripId,
    pub name: String,
    pub description: String,
    pub location_count: u32,
    pub created_at: String,
    pub updated_at: String,
    pub latest_location_date: String,
    pub google_photos_url: String,
}

impl Trip {
    /// Stand-in used while a trip that is not in any cache is being fetched.
    #[must_use]
    pub fn placeholder(id: TripId) -> Self {
        TripPatch::new(id).into_trip()
    }

    /// `latest_location_date`, else `updated_at`, else `created_at`.
    #[must_use]
    pub fn activity_date(&self) -> &str {
        [&self.latest_location_date, &self.updated_at, &self.created_at]
            .into_iter()
            .find(|s| !s.is_empty())
            .map_or("", String::as_str)
    }

    /// Epoch millis of [`Self::activity_date`]; unparseable or absent dates sort as 0.
    #[must_use]
    pub fn activity_epoch_ms(&self) -> i64 {
        time::parse_timestamp_ms(self.activity_date()).unwrap_or(0)
    }

    #[must_use]
    pub fn to_ref(&self) -> TripRef {
        TripRef {
            id: self.id.clone(),
            name: self.name.clone(),
        }
    }

    /// Merges the fields present in `patch`; absent fields keep their value.
    pub fn apply(&mut self, patch: &TripPatch) {
        if let Some(name) = &patch.name {
            self.name.clone_from(name);
        }
        if let Some(description) = &patch.description {
            self.description.clone_from(description);
        }
        if let Some(count) = patch.location_count {
            self.location_count = count;
        }
        if let Some(created_at) = &patch.created_at {
            self.created_at.clone_from(created_at);
        }
        if let Some(updated_at) = &patch.updated_at {
            self.updated_at.clone_from(updated_at);
        }
        if let Some(latest) = &patch.latest_location_date {
            self.latest_location_date.clone_from(latest);
        }
        if let Some(url) = &patch.google_photos_url {
            self.google_photos_url.clone_from(url);
        }
    }
}

/// Partial trip record: only the fields the server actually sent.
///
/// `name` is never `Some("")`; a blank incoming name is treated as absent so a
/// merge cannot erase a stored name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TripPatch {
    pub id: TripId,
    pub name: Option<String>,
    pub description: Option<String>,
    pub location_count: Option<u32>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub latest_location_date: Option<String>,
    pub google_photos_url: Option<String>,
}

impl TripPatch {
    #[must_use]
    pub fn new(id: TripId) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    /// Builds a full trip, defaulting every absent field.
    #[must_use]
    pub fn into_trip(self) -> Trip {
        let created_at = self.created_at.unwrap_or_default();
        let updated_at = self.updated_at.unwrap_or_else(|| created_at.clone());
        Trip {
            id: self.id,
            name: self.name.unwrap_or_else(|| UNTITLED_TRIP_NAME.to_string()),
            description: self.description.unwrap_or_default(),
            location_count: self.location_count.unwrap_or(0),
            created_at,
            updated_at,
            latest_location_date: self.latest_location_date.unwrap_or_default(),
            google_photos_url: self.google_photos_url.unwrap_or_default(),
        }
    }
}
