//! Ordered, searchable collection of trip summaries.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::{Trip, TripId, TripPatch};
use crate::time;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TripSortField {
    Name,
    #[default]
    LatestActivity,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    Ascending,
    #[default]
    Descending,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TripSort {
    pub field: TripSortField,
    pub direction: SortDirection,
}

impl TripSort {
    #[must_use]
    pub fn new(field: TripSortField, direction: SortDirection) -> Self {
        Self { field, direction }
    }
}

fn compare_names(a: &Trip, b: &Trip) -> Ordering {
    a.name.to_lowercase().cmp(&b.name.to_lowercase())
}

fn compare_activity(a: &Trip, b: &Trip) -> Ordering {
    a.activity_epoch_ms().cmp(&b.activity_epoch_ms())
}

/// Primary field in the requested direction, then the other field
/// ascending, then id.
fn compare(a: &Trip, b: &Trip, sort: TripSort) -> Ordering {
    let (primary, secondary) = match sort.field {
        TripSortField::Name => (compare_names(a, b), compare_activity(a, b)),
        TripSortField::LatestActivity => (compare_activity(a, b), compare_names(a, b)),
    };
    let primary = match sort.direction {
        SortDirection::Ascending => primary,
        SortDirection::Descending => primary.reverse(),
    };
    primary.then(secondary).then_with(|| a.id.cmp(&b.id))
}

fn matches_search(trip: &Trip, needle: &str) -> bool {
    let count = trip.location_count.to_string();
    let noun = if trip.location_count == 1 { "location" } else { "locations" };
    let count_label = format!("{count} {noun}");
    let activity_label = time::format_activity_label(trip.activity_date()).unwrap_or_default();

    [
        trip.name.as_str(),
        trip.description.as_str(),
        count.as_str(),
        count_label.as_str(),
        trip.created_at.as_str(),
        trip.updated_at.as_str(),
        trip.latest_location_date.as_str(),
        activity_label.as_str(),
    ]
    .iter()
    .any(|field| field.to_lowercase().contains(needle))
}

#[derive(Debug, Default)]
pub struct TripListCache {
    trips: Vec<Trip>,
    loaded: bool,
}

impl TripListCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` once a list response has been applied.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.trips.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.trips.is_empty()
    }

    /// Replaces the whole list. Later duplicates of an id win.
    pub fn replace(&mut self, trips: Vec<Trip>) {
        self.trips.clear();
        for trip in trips {
            match self.trips.iter_mut().find(|t| t.id == trip.id) {
                Some(existing) => *existing = trip,
                None => self.trips.push(trip),
            }
        }
        self.loaded = true;
        debug!(count = self.trips.len(), "trip list replaced");
    }

    /// Merges `patch` into the stored trip, or inserts it with defaults.
    /// Returns the resulting trip.
    pub fn upsert(&mut self, patch: &TripPatch) -> &Trip {
        let position = match self.trips.iter().position(|t| t.id == patch.id) {
            Some(position) => {
                self.trips[position].apply(patch);
                position
            }
            None => {
                self.trips.push(patch.clone().into_trip());
                self.trips.len() - 1
            }
        };
        &self.trips[position]
    }

    pub fn remove(&mut self, id: &TripId) -> Option<Trip> {
        let position = self.trips.iter().position(|t| &t.id == id)?;
        Some(self.trips.remove(position))
    }

    #[must_use]
    pub fn get(&self, id: &TripId) -> Option<&Trip> {
        self.trips.iter().find(|t| &t.id == id)
    }

    pub fn get_mut(&mut self, id: &TripId) -> Option<&mut Trip> {
        self.trips.iter_mut().find(|t| &t.id == id)
    }

    /// Adds `delta` to a trip's count, saturating at zero. Missing trips are
    /// ignored.
    pub fn adjust_location_count(&mut self, id: &TripId, delta: i64) -> bool {
        let Some(trip) = self.get_mut(id) else {
            return false;
        };
        let next = (i64::from(trip.location_count) + delta).clamp(0, i64::from(u32::MAX));
        trip.location_count = u32::try_from(next).unwrap_or(0);
        true
    }

    /// Trips matching `search` (case-insensitive substring; blank matches
    /// everything), ordered by `sort`.
    #[must_use]
    pub fn query(&self, search: &str, sort: TripSort) -> Vec<&Trip> {
        let needle = search.trim().to_lowercase();
        let mut result: Vec<&Trip> = self
            .trips
            .iter()
            .filter(|t| needle.is_empty() || matches_search(t, &needle))
            .collect();
        result.sort_by(|a, b| compare(a, b, sort));
        result
    }

    pub fn clear(&mut self) {
        self.trips.clear();
        self.loaded = false;
    }
}
