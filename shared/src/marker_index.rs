//! Marker index: identifier → rendered marker handle + last-known snapshot.
//!
//! The shell owns the actual map-widget markers and refers to them by
//! [`MarkerHandle`]. Every mutation here reports which handles went away so
//! the shell never keeps a dangling one.

use std::collections::BTreeMap;

use geojson::{feature::Id, Feature, FeatureCollection, Geometry, JsonObject, Value as GeoValue};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::model::{GeoBounds, Marker, PlaceId, TripId, TripRef};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MarkerHandle(pub u64);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexedMarker {
    pub handle: MarkerHandle,
    pub data: Marker,
}

/// Handles the shell must drop and create after a wholesale replace.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerDiff {
    pub removed: Vec<MarkerHandle>,
    pub added: Vec<MarkerHandle>,
}

#[derive(Debug, Default)]
pub struct MarkerIndex {
    entries: BTreeMap<PlaceId, IndexedMarker>,
    /// Rendered but not addressable; never selectable.
    synthetic: Vec<IndexedMarker>,
    next_handle: u64,
}

impl MarkerIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate_handle(&mut self) -> MarkerHandle {
        self.next_handle += 1;
        MarkerHandle(self.next_handle)
    }

    /// Inserts or replaces the entry for `id`. Returns the handle it displaced,
    /// if any, which the caller must remove from the map.
    pub fn upsert(&mut self, id: PlaceId, handle: MarkerHandle, data: Marker) -> Option<MarkerHandle> {
        if id.is_synthetic() {
            self.synthetic.push(IndexedMarker { handle, data });
            return None;
        }
        self.entries
            .insert(id, IndexedMarker { handle, data })
            .map(|previous| previous.handle)
            .filter(|previous| *previous != handle)
    }

    #[must_use]
    pub fn get(&self, id: &PlaceId) -> Option<&IndexedMarker> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: &PlaceId) -> Option<&mut IndexedMarker> {
        self.entries.get_mut(id)
    }

    pub fn remove(&mut self, id: &PlaceId) -> Option<IndexedMarker> {
        self.entries.remove(id)
    }

    #[must_use]
    pub fn contains(&self, id: &PlaceId) -> bool {
        self.entries.contains_key(id)
    }

    /// Identifiers of every addressable rendered marker.
    #[must_use]
    pub fn all_ids(&self) -> Vec<PlaceId> {
        self.entries.keys().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len() + self.synthetic.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &IndexedMarker> {
        self.entries.values().chain(self.synthetic.iter())
    }

    /// Drops everything and indexes `markers` with fresh handles. Later
    /// duplicates of an id win.
    pub fn replace_all(&mut self, markers: Vec<Marker>) -> MarkerDiff {
        let removed: Vec<MarkerHandle> = self.iter().map(|m| m.handle).collect();
        self.entries.clear();
        self.synthetic.clear();

        let mut added = Vec::with_capacity(markers.len());
        for marker in markers {
            let handle = self.allocate_handle();
            if let Some(displaced) = self.upsert(marker.id.clone(), handle, marker) {
                added.retain(|h| *h != displaced);
            }
            added.push(handle);
        }

        debug!(removed = removed.len(), added = added.len(), "marker index replaced");
        MarkerDiff { removed, added }
    }

    /// Addressable markers whose position lies inside `bounds`.
    #[must_use]
    pub fn ids_within(&self, bounds: &GeoBounds) -> Vec<PlaceId> {
        self.entries
            .iter()
            .filter(|(_, m)| bounds.contains(m.data.position))
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn clear(&mut self) -> Vec<MarkerHandle> {
        let removed = self.iter().map(|m| m.handle).collect();
        self.entries.clear();
        self.synthetic.clear();
        removed
    }

    // --- Membership snapshots ---

    /// Adds `trip` to each listed marker. Returns how many snapshots changed.
    pub fn attach_trip(&mut self, ids: &[PlaceId], trip: &TripRef) -> usize {
        let mut changed = 0;
        for id in ids {
            if let Some(m) = self.entries.get_mut(id) {
                changed += usize::from(m.data.attach_trip(trip));
            }
        }
        changed
    }

    pub fn detach_trip(&mut self, ids: &[PlaceId], trip_id: &TripId) -> usize {
        let mut changed = 0;
        for id in ids {
            if let Some(m) = self.entries.get_mut(id) {
                changed += usize::from(m.data.detach_trip(trip_id));
            }
        }
        changed
    }

    /// Removes `trip_id` from every marker snapshot.
    pub fn forget_trip(&mut self, trip_id: &TripId) -> usize {
        self.entries
            .values_mut()
            .map(|m| m.data.detach_trip(trip_id))
            .filter(|changed| *changed)
            .count()
    }

    pub fn rename_trip(&mut self, trip_id: &TripId, name: &str) -> usize {
        self.entries
            .values_mut()
            .map(|m| m.data.rename_trip(trip_id, name))
            .filter(|changed| *changed)
            .count()
    }

    pub fn set_archived(&mut self, ids: &[PlaceId]) -> usize {
        let mut changed = 0;
        for id in ids {
            if let Some(m) = self.entries.get_mut(id) {
                changed += usize::from(!std::mem::replace(&mut m.data.archived, true));
            }
        }
        changed
    }

    // --- Rendering ---

    /// GeoJSON layer for the shell's map widget.
    #[must_use]
    pub fn to_feature_collection(&self, is_selected: impl Fn(&PlaceId) -> bool) -> FeatureCollection {
        let features = self
            .iter()
            .map(|m| {
                let marker = &m.data;
                let mut properties = JsonObject::new();
                properties.insert("handle".into(), json!(m.handle.0));
                properties.insert("display_name".into(), json!(marker.display_name()));
                properties.insert("source_type".into(), json!(marker.source_type));
                properties.insert("archived".into(), json!(marker.archived));
                properties.insert("selected".into(), json!(is_selected(&marker.id)));
                properties.insert("date".into(), json!(marker.date));
                properties.insert("trips".into(), json!(marker.trips));

                Feature {
                    bbox: None,
                    geometry: Some(Geometry::new(GeoValue::Point(vec![
                        marker.position.lng,
                        marker.position.lat,
                    ]))),
                    id: Some(Id::String(marker.id.to_string())),
                    properties: Some(properties),
                    foreign_members: None,
                }
            })
            .collect();

        FeatureCollection {
            bbox: None,
            features,
            foreign_members: None,
        }
    }
}
