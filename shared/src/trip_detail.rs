//! Trip detail view state, its request-sequence guards, and the per-trip
//! location cache used for instant re-open.

use std::num::NonZeroUsize;

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::{Marker, PlaceId, Trip, TripId, TripPatch};
use crate::time;

/// Default number of trips whose locations are kept for instant re-open.
pub const DEFAULT_LOCATION_CACHE_CAPACITY: usize = 64;

// ============================================================================
// Sequence guard
// ============================================================================

/// Monotonic per-subsystem request counter. Never rewinds, even on reset,
/// so responses dispatched before a reset stay stale.
#[derive(Debug, Default, Clone, Copy)]
pub struct RequestSequence {
    latest: u64,
}

impl RequestSequence {
    pub fn next(&mut self) -> u64 {
        self.latest += 1;
        self.latest
    }

    #[must_use]
    pub fn is_latest(&self, seq: u64) -> bool {
        seq == self.latest
    }

    #[must_use]
    pub fn latest(&self) -> u64 {
        self.latest
    }
}

/// Captured at dispatch; checked when the response arrives.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestTicket {
    pub seq: u64,
    pub target: TripId,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    Applied,
    Stale,
}

// ============================================================================
// Location cache
// ============================================================================

#[derive(Clone, Debug, PartialEq)]
pub struct CacheEntry {
    pub trip: Trip,
    pub locations: Vec<Marker>,
}

impl CacheEntry {
    fn contains_any(&self, places: &[PlaceId]) -> bool {
        self.locations.iter().any(|l| places.contains(&l.id))
    }
}

#[derive(Debug)]
pub struct LocationCache {
    entries: LruCache<TripId, CacheEntry>,
}

impl LocationCache {
    #[must_use]
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: LruCache::new(capacity),
        }
    }

    pub fn get(&mut self, id: &TripId) -> Option<&CacheEntry> {
        self.entries.get(id)
    }

    #[must_use]
    pub fn peek(&self, id: &TripId) -> Option<&CacheEntry> {
        self.entries.peek(id)
    }

    fn peek_mut(&mut self, id: &TripId) -> Option<&mut CacheEntry> {
        self.entries.peek_mut(id)
    }

    pub fn put(&mut self, id: TripId, entry: CacheEntry) {
        self.entries.put(id, entry);
    }

    pub fn invalidate(&mut self, id: &TripId) -> bool {
        self.entries.pop(id).is_some()
    }

    #[must_use]
    pub fn contains(&self, id: &TripId) -> bool {
        self.entries.contains(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn resize(&mut self, capacity: NonZeroUsize) {
        self.entries.resize(capacity);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

// ============================================================================
// Detail state
// ============================================================================

#[derive(Clone, Debug, PartialEq)]
pub struct TripDetail {
    pub trip: Trip,
    pub locations: Vec<Marker>,
    /// A refresh is in flight.
    pub loading: bool,
    /// Content came from the location cache and has not been refreshed yet.
    pub from_cache: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenOutcome {
    pub ticket: RequestTicket,
    pub served_from_cache: bool,
}

/// Count and latest date of `locations`.
#[must_use]
pub fn summarize(locations: &[Marker]) -> (u32, String) {
    let count = u32::try_from(locations.len()).unwrap_or(u32::MAX);
    let latest = time::latest_date(locations.iter().map(|l| l.date.as_str()));
    (count, latest)
}

/// Fills the count and latest date the server left out of a detail
/// response from the locations it did send.
pub fn complete_from_locations(patch: &mut TripPatch, locations: &[Marker]) {
    let (count, latest) = summarize(locations);
    patch.location_count.get_or_insert(count);
    if patch.latest_location_date.is_none() && !latest.is_empty() {
        patch.latest_location_date = Some(latest);
    }
}

fn filter_locations(locations: &mut Vec<Marker>, places: &[PlaceId]) -> bool {
    let before = locations.len();
    locations.retain(|l| !places.contains(&l.id));
    locations.len() != before
}

fn merge_locations(locations: &mut Vec<Marker>, added: &[Marker]) {
    for marker in added {
        if !locations.iter().any(|l| l.id == marker.id) {
            locations.push(marker.clone());
        }
    }
}

#[derive(Debug)]
pub struct TripDetailCache {
    open: Option<TripDetail>,
    detail_seq: RequestSequence,
    description_seq: RequestSequence,
    cache: LocationCache,
}

impl Default for TripDetailCache {
    fn default() -> Self {
        Self::new(NonZeroUsize::new(DEFAULT_LOCATION_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN))
    }
}

impl TripDetailCache {
    #[must_use]
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            open: None,
            detail_seq: RequestSequence::default(),
            description_seq: RequestSequence::default(),
            cache: LocationCache::new(capacity),
        }
    }

    #[must_use]
    pub fn current(&self) -> Option<&TripDetail> {
        self.open.as_ref()
    }

    #[must_use]
    pub fn current_id(&self) -> Option<&TripId> {
        self.open.as_ref().map(|d| &d.trip.id)
    }

    #[must_use]
    pub fn is_open(&self, id: &TripId) -> bool {
        self.current_id() == Some(id)
    }

    #[must_use]
    pub fn location_cache(&self) -> &LocationCache {
        &self.cache
    }

    pub fn set_capacity(&mut self, capacity: NonZeroUsize) {
        self.cache.resize(capacity);
    }

    /// Shows `id` immediately (from the location cache, else from
    /// `fallback`, else a placeholder) and dispatches a refresh ticket.
    pub fn open(&mut self, id: &TripId, fallback: Option<&Trip>) -> OpenOutcome {
        let ticket = RequestTicket {
            seq: self.detail_seq.next(),
            target: id.clone(),
        };

        let detail = match self.cache.get(id) {
            Some(entry) => TripDetail {
                trip: entry.trip.clone(),
                locations: entry.locations.clone(),
                loading: true,
                from_cache: true,
            },
            None => TripDetail {
                trip: fallback
                    .cloned()
                    .unwrap_or_else(|| Trip::placeholder(id.clone())),
                locations: Vec::new(),
                loading: true,
                from_cache: false,
            },
        };
        let served_from_cache = detail.from_cache;
        self.open = Some(detail);

        debug!(trip_id = %id, seq = ticket.seq, served_from_cache, "trip detail opened");
        OpenOutcome {
            ticket,
            served_from_cache,
        }
    }

    pub fn close(&mut self) -> bool {
        self.open.take().is_some()
    }

    /// Re-fetches the open trip without replacing what is shown. Any
    /// response to an earlier ticket becomes stale.
    pub fn reload(&mut self) -> Option<RequestTicket> {
        let detail = self.open.as_mut()?;
        detail.loading = true;
        let ticket = RequestTicket {
            seq: self.detail_seq.next(),
            target: detail.trip.id.clone(),
        };
        debug!(trip_id = %ticket.target, seq = ticket.seq, "trip detail reloading");
        Some(ticket)
    }

    fn accepts(&self, ticket: &RequestTicket) -> bool {
        self.detail_seq.is_latest(ticket.seq) && self.is_open(&ticket.target)
    }

    /// Applies a detail response only if it is the latest dispatched and
    /// the same trip is still open; otherwise nothing is touched. `patch`
    /// is merged onto the trip already shown.
    pub fn apply_refresh(
        &mut self,
        ticket: &RequestTicket,
        patch: &TripPatch,
        locations: Vec<Marker>,
    ) -> RefreshOutcome {
        let detail = match self.open.as_mut() {
            Some(detail)
                if self.detail_seq.is_latest(ticket.seq)
                    && detail.trip.id == ticket.target
                    && patch.id == ticket.target =>
            {
                detail
            }
            _ => {
                debug!(
                    seq = ticket.seq,
                    latest = self.detail_seq.latest(),
                    trip_id = %ticket.target,
                    "discarding stale trip detail"
                );
                return RefreshOutcome::Stale;
            }
        };

        detail.trip.apply(patch);
        detail.locations = locations;
        detail.loading = false;
        detail.from_cache = false;
        self.cache.put(
            detail.trip.id.clone(),
            CacheEntry {
                trip: detail.trip.clone(),
                locations: detail.locations.clone(),
            },
        );
        RefreshOutcome::Applied
    }

    /// Clears the loading flag if `ticket` is still current. Cached content
    /// stays on screen.
    pub fn refresh_failed(&mut self, ticket: &RequestTicket) -> RefreshOutcome {
        if !self.accepts(ticket) {
            return RefreshOutcome::Stale;
        }
        if let Some(detail) = self.open.as_mut() {
            detail.loading = false;
        }
        RefreshOutcome::Applied
    }

    pub fn begin_description_save(&mut self, id: &TripId) -> RequestTicket {
        RequestTicket {
            seq: self.description_seq.next(),
            target: id.clone(),
        }
    }

    #[must_use]
    pub fn is_latest_description(&self, ticket: &RequestTicket) -> bool {
        self.description_seq.is_latest(ticket.seq)
    }

    /// Merges `patch` into the open detail and the cached entry. The
    /// location list is untouched. Returns `true` if the open detail changed.
    pub fn patch_trip(&mut self, patch: &TripPatch) -> bool {
        if let Some(entry) = self.cache.peek_mut(&patch.id) {
            entry.trip.apply(patch);
        }
        match self.open.as_mut() {
            Some(detail) if detail.trip.id == patch.id => {
                detail.trip.apply(patch);
                true
            }
            _ => false,
        }
    }

    /// Count and latest date of `trip_id`'s locations once `place_id` is
    /// gone, from the open detail or the cache. `None` if neither holds the
    /// place.
    #[must_use]
    pub fn preview_removal(&self, trip_id: &TripId, place_id: &PlaceId) -> Option<(u32, String)> {
        let from_detail = self
            .open
            .as_ref()
            .filter(|d| &d.trip.id == trip_id)
            .map(|d| d.locations.as_slice());
        let from_cache = self.cache.peek(trip_id).map(|e| e.locations.as_slice());

        [from_detail, from_cache]
            .into_iter()
            .flatten()
            .find(|locations| locations.iter().any(|l| &l.id == place_id))
            .map(|locations| {
                let remaining: Vec<Marker> = locations
                    .iter()
                    .filter(|l| &l.id != place_id)
                    .cloned()
                    .collect();
                summarize(&remaining)
            })
    }

    /// Filters `place_id` out of the open detail and the cached entry of
    /// `trip_id`, applying the resolved trip fields. A holder that does not
    /// contain the place is left untouched. Returns `true` if the open
    /// detail changed.
    pub fn remove_location(&mut self, trip_id: &TripId, place_id: &PlaceId, resolved: &TripPatch) -> bool {
        let places = std::slice::from_ref(place_id);

        if let Some(entry) = self.cache.peek_mut(trip_id) {
            if filter_locations(&mut entry.locations, places) {
                entry.trip.apply(resolved);
            }
        }

        match self.open.as_mut() {
            Some(detail) if &detail.trip.id == trip_id => {
                let changed = filter_locations(&mut detail.locations, places);
                if changed {
                    detail.trip.apply(resolved);
                }
                changed
            }
            _ => false,
        }
    }

    /// Adds `markers` to `trip_id`'s detail and cached entry (skipping ids
    /// already present) and applies `patch`. Returns `true` if the open
    /// detail changed.
    pub fn extend_locations(&mut self, trip_id: &TripId, markers: &[Marker], patch: &TripPatch) -> bool {
        if let Some(entry) = self.cache.peek_mut(trip_id) {
            merge_locations(&mut entry.locations, markers);
            entry.trip.apply(patch);
        }
        match self.open.as_mut() {
            Some(detail) if &detail.trip.id == trip_id => {
                merge_locations(&mut detail.locations, markers);
                detail.trip.apply(patch);
                true
            }
            _ => false,
        }
    }

    pub fn invalidate(&mut self, trip_id: &TripId) -> bool {
        self.cache.invalidate(trip_id)
    }

    /// Drops the trip's cache entry and closes the detail if it is the one
    /// showing. Returns `true` if the detail was closed.
    pub fn purge(&mut self, trip_id: &TripId) -> bool {
        self.cache.invalidate(trip_id);
        if self.is_open(trip_id) {
            self.open = None;
            true
        } else {
            false
        }
    }

    /// Removes deleted places from every view. The open detail is filtered
    /// in place (with its count and latest date recomputed) and its cache
    /// entry rewritten; any other cached entry containing them is
    /// invalidated. Returns the open trip's recomputed fields if it changed.
    pub fn remove_places_everywhere(&mut self, places: &[PlaceId]) -> Option<TripPatch> {
        let mut open_patch = None;
        if let Some(detail) = self.open.as_mut() {
            if filter_locations(&mut detail.locations, places) {
                let (count, latest) = summarize(&detail.locations);
                let patch = TripPatch {
                    location_count: Some(count),
                    latest_location_date: Some(latest),
                    ..TripPatch::new(detail.trip.id.clone())
                };
                detail.trip.apply(&patch);
                open_patch = Some(patch);
            }
        }

        let stale: Vec<TripId> = self
            .cache
            .entries
            .iter()
            .filter(|(_, entry)| entry.contains_any(places))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            self.cache.invalidate(id);
        }
        if let (Some(detail), Some(_)) = (self.open.as_ref(), open_patch.as_ref()) {
            self.cache.put(
                detail.trip.id.clone(),
                CacheEntry {
                    trip: detail.trip.clone(),
                    locations: detail.locations.clone(),
                },
            );
        }

        debug!(invalidated = stale.len(), "removed deleted places from trip caches");
        open_patch
    }

    /// Closes the detail and empties the cache. Sequence counters keep
    /// counting so pre-reset responses are rejected.
    pub fn reset(&mut self) {
        self.open = None;
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marker_index::tests::marker_at;

    fn trip(id: &str, name: &str) -> Trip {
        let mut trip = Trip::placeholder(TripId::new(id));
        trip.name = name.into();
        trip
    }

    fn named(id: &str, name: &str) -> TripPatch {
        TripPatch {
            name: Some(name.into()),
            ..TripPatch::new(TripId::new(id))
        }
    }

    fn dated(id: &str, date: &str) -> Marker {
        let mut marker = marker_at(id, 0.0, 0.0);
        marker.date = date.into();
        marker
    }

    fn cache() -> TripDetailCache {
        TripDetailCache::new(NonZeroUsize::new(4).unwrap())
    }

    mod sequence_tests {
        use super::*;

        #[test]
        fn test_stale_detail_response_is_discarded() {
            let mut details = cache();
            let x = TripId::new("x");
            let y = TripId::new("y");

            let first = details.open(&x, None).ticket;
            let second = details.open(&y, None).ticket;
            assert_eq!((first.seq, second.seq), (1, 2));

            assert_eq!(
                details.apply_refresh(&second, &named("y", "Y"), vec![marker_at("b", 0.0, 0.0)]),
                RefreshOutcome::Applied
            );
            assert_eq!(
                details.apply_refresh(&first, &named("x", "X"), vec![marker_at("a", 0.0, 0.0)]),
                RefreshOutcome::Stale
            );

            let shown = details.current().unwrap();
            assert_eq!(shown.trip.name, "Y");
            assert_eq!(shown.locations[0].id.as_str(), "b");
            assert!(!details.location_cache().contains(&x));
        }

        #[test]
        fn test_response_after_close_is_discarded() {
            let mut details = cache();
            let ticket = details.open(&TripId::new("x"), None).ticket;
            details.close();
            assert_eq!(
                details.apply_refresh(&ticket, &named("x", "X"), vec![]),
                RefreshOutcome::Stale
            );
            assert!(details.current().is_none());
            assert!(details.location_cache().is_empty());
        }

        #[test]
        fn test_sequence_survives_reset() {
            let mut details = cache();
            let ticket = details.open(&TripId::new("x"), None).ticket;
            details.reset();
            let again = details.open(&TripId::new("x"), None).ticket;
            assert!(again.seq > ticket.seq);
            assert_eq!(
                details.apply_refresh(&ticket, &named("x", "X"), vec![]),
                RefreshOutcome::Stale
            );
        }

        #[test]
        fn test_only_latest_description_counts() {
            let mut details = cache();
            let id = TripId::new("x");
            let first = details.begin_description_save(&id);
            let second = details.begin_description_save(&id);
            assert!(!details.is_latest_description(&first));
            assert!(details.is_latest_description(&second));
        }
    }

    mod cache_tests {
        use super::*;

        #[test]
        fn test_reopen_serves_from_cache() {
            let mut details = cache();
            let id = TripId::new("x");
            let ticket = details.open(&id, None).ticket;
            details.apply_refresh(&ticket, &named("x", "X"), vec![marker_at("a", 0.0, 0.0)]);
            details.close();

            let reopened = details.open(&id, None);
            assert!(reopened.served_from_cache);
            let shown = details.current().unwrap();
            assert!(shown.loading);
            assert_eq!(shown.locations.len(), 1);
        }

        #[test]
        fn test_open_without_cache_uses_fallback() {
            let mut details = cache();
            let fallback = trip("x", "From list");
            let opened = details.open(&fallback.id, Some(&fallback));
            assert!(!opened.served_from_cache);
            assert_eq!(details.current().unwrap().trip.name, "From list");
        }

        #[test]
        fn test_refresh_merges_onto_shown_trip() {
            let mut details = cache();
            let mut fallback = trip("x", "From list");
            fallback.description = "pasta".into();
            fallback.google_photos_url = "https://photos.example/x".into();
            let ticket = details.open(&fallback.id, Some(&fallback)).ticket;

            details.apply_refresh(&ticket, &named("x", "Rome"), vec![dated("a", "2024-01-01")]);

            let shown = &details.current().unwrap().trip;
            assert_eq!(shown.name, "Rome");
            assert_eq!(shown.description, "pasta");
            assert_eq!(shown.google_photos_url, "https://photos.example/x");
            let cached = details.location_cache().peek(&fallback.id).unwrap();
            assert_eq!(cached.trip.description, "pasta");
        }

        #[test]
        fn test_complete_from_locations_fills_only_absent_fields() {
            let locations = [dated("a", "2024-01-01"), dated("b", "2024-04-01")];

            let mut bare = TripPatch::new(TripId::new("x"));
            complete_from_locations(&mut bare, &locations);
            assert_eq!(bare.location_count, Some(2));
            assert_eq!(bare.latest_location_date.as_deref(), Some("2024-04-01"));

            let mut sent = TripPatch {
                location_count: Some(7),
                latest_location_date: Some("2023-12-31".into()),
                ..TripPatch::new(TripId::new("x"))
            };
            complete_from_locations(&mut sent, &locations);
            assert_eq!(sent.location_count, Some(7));
            assert_eq!(sent.latest_location_date.as_deref(), Some("2023-12-31"));

            let mut undated = TripPatch::new(TripId::new("x"));
            complete_from_locations(&mut undated, &[dated("a", "")]);
            assert_eq!(undated.latest_location_date, None);
        }

        #[test]
        fn test_remove_last_location_recomputes() {
            let mut details = cache();
            let id = TripId::new("x");
            let ticket = details.open(&id, None).ticket;
            details.apply_refresh(
                &ticket,
                &named("x", "X"),
                vec![dated("a", "2024-01-01"), dated("b", "2024-05-01")],
            );

            let place = PlaceId::new("b");
            let (count, latest) = details.preview_removal(&id, &place).unwrap();
            assert_eq!((count, latest.as_str()), (1, "2024-01-01"));
            let patch = TripPatch {
                location_count: Some(count),
                latest_location_date: Some(latest),
                ..TripPatch::new(id.clone())
            };
            assert!(details.remove_location(&id, &place, &patch));

            let place = PlaceId::new("a");
            let (count, latest) = details.preview_removal(&id, &place).unwrap();
            assert_eq!((count, latest.as_str()), (0, ""));
        }

        #[test]
        fn test_remove_unknown_place_is_noop() {
            let mut details = cache();
            let id = TripId::new("x");
            let ticket = details.open(&id, None).ticket;
            details.apply_refresh(&ticket, &named("x", "X"), vec![dated("a", "2024-01-01")]);
            let before = details.location_cache().peek(&id).cloned();

            let ghost = PlaceId::new("ghost");
            assert_eq!(details.preview_removal(&id, &ghost), None);
            let patch = TripPatch {
                name: Some("Changed".into()),
                ..TripPatch::new(id.clone())
            };
            assert!(!details.remove_location(&id, &ghost, &patch));
            assert_eq!(details.location_cache().peek(&id).cloned(), before);
            assert_eq!(details.current().unwrap().trip.name, "X");
        }

        #[test]
        fn test_purge_open_and_other() {
            let mut details = cache();
            let x = TripId::new("x");
            let y = TripId::new("y");
            let ticket = details.open(&x, None).ticket;
            details.apply_refresh(&ticket, &named("x", "X"), vec![]);
            details.cache.put(
                y.clone(),
                CacheEntry {
                    trip: trip("y", "Y"),
                    locations: vec![],
                },
            );

            assert!(!details.purge(&y));
            assert!(details.is_open(&x));
            assert!(!details.location_cache().contains(&y));

            assert!(details.purge(&x));
            assert!(details.current().is_none());
            assert!(details.location_cache().is_empty());
        }

        #[test]
        fn test_remove_places_everywhere() {
            let mut details = cache();
            let x = TripId::new("x");
            let y = TripId::new("y");
            details.cache.put(
                y.clone(),
                CacheEntry {
                    trip: trip("y", "Y"),
                    locations: vec![dated("a", "2024-01-01")],
                },
            );
            let ticket = details.open(&x, None).ticket;
            details.apply_refresh(
                &ticket,
                &named("x", "X"),
                vec![dated("a", "2024-03-01"), dated("b", "2024-02-01")],
            );

            let patch = details.remove_places_everywhere(&[PlaceId::new("a")]).unwrap();
            assert_eq!(patch.location_count, Some(1));
            assert_eq!(patch.latest_location_date.as_deref(), Some("2024-02-01"));
            assert!(!details.location_cache().contains(&y));
            assert_eq!(details.location_cache().peek(&x).unwrap().locations.len(), 1);
            assert_eq!(details.current().unwrap().trip.location_count, 1);
        }

        #[test]
        fn test_patch_keeps_locations() {
            let mut details = cache();
            let id = TripId::new("x");
            let ticket = details.open(&id, None).ticket;
            details.apply_refresh(&ticket, &named("x", "X"), vec![dated("a", "2024-01-01")]);

            let patch = TripPatch {
                name: Some("Renamed".into()),
                ..TripPatch::new(id.clone())
            };
            assert!(details.patch_trip(&patch));
            let entry = details.location_cache().peek(&id).unwrap();
            assert_eq!(entry.trip.name, "Renamed");
            assert_eq!(entry.locations.len(), 1);
        }

        #[test]
        fn test_extend_skips_duplicates() {
            let mut details = cache();
            let id = TripId::new("x");
            let ticket = details.open(&id, None).ticket;
            details.apply_refresh(&ticket, &named("x", "X"), vec![dated("a", "2024-01-01")]);

            let patch = TripPatch {
                location_count: Some(2),
                ..TripPatch::new(id.clone())
            };
            details.extend_locations(&id, &[dated("a", ""), dated("b", "")], &patch);
            let shown = details.current().unwrap();
            assert_eq!(shown.locations.len(), 2);
            assert_eq!(shown.trip.location_count, 2);
        }

        #[test]
        fn test_lru_eviction() {
            let mut details = TripDetailCache::new(NonZeroUsize::new(1).unwrap());
            for id in ["x", "y"] {
                let ticket = details.open(&TripId::new(id), None).ticket;
                details.apply_refresh(&ticket, &named(id, id), vec![]);
            }
            assert!(!details.location_cache().contains(&TripId::new("x")));
            assert!(details.location_cache().contains(&TripId::new("y")));
        }
    }
}
