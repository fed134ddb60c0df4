//! Synchronization coordinator.
//!
//! Owns every cache (trip list, trip detail + location cache, marker index)
//! and the selection machine. Each network completion or mutation goes
//! through one method here, which updates the caches in a fixed order
//! (list, then detail/location cache, then markers) and returns a
//! [`SyncDiff`] describing what the views must redraw and what follow-up
//! requests are due.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{ApiEndpoints, ApiFailure, ApiRequest, ApiResult, MarkerFilter, TripTarget};
use crate::config::{ConfigError, CoreConfig};
use crate::marker_index::{MarkerHandle, MarkerIndex};
use crate::model::{Marker, PlaceId, Trip, TripId, TripPatch};
use crate::normalize;
use crate::selection::{MapCommand, SelectionError, SelectionEvent, SelectionMachine};
use crate::time;
use crate::trip_detail::{self, RefreshOutcome, RequestSequence, RequestTicket, TripDetail, TripDetailCache};
use crate::trip_list::{TripListCache, TripSort};
use crate::{AppError, ErrorKind, ToastKind, ToastMessage};

// ============================================================================
// Diff
// ============================================================================

/// What changed in one coordinator call. Consumed uniformly by the render
/// layer and by the follow-up request logic.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct SyncDiff {
    pub trip_list_changed: bool,
    pub detail_changed: bool,
    pub detail_closed: bool,
    pub markers_changed: bool,
    pub selection_changed: bool,
    pub manage_state_changed: bool,
    pub toast_changed: bool,
    /// A full marker reload should follow.
    pub reload_markers: bool,
    /// A best-effort trip list refresh should follow.
    pub refresh_trip_list: bool,
    /// The open trip detail should be fetched again.
    pub refresh_detail: bool,
}

impl SyncDiff {
    #[must_use]
    pub fn needs_render(&self) -> bool {
        self.trip_list_changed
            || self.detail_changed
            || self.detail_closed
            || self.markers_changed
            || self.selection_changed
            || self.manage_state_changed
            || self.toast_changed
    }

    pub fn merge(&mut self, other: &SyncDiff) {
        self.trip_list_changed |= other.trip_list_changed;
        self.detail_changed |= other.detail_changed;
        self.detail_closed |= other.detail_closed;
        self.markers_changed |= other.markers_changed;
        self.selection_changed |= other.selection_changed;
        self.manage_state_changed |= other.manage_state_changed;
        self.toast_changed |= other.toast_changed;
        self.reload_markers |= other.reload_markers;
        self.refresh_trip_list |= other.refresh_trip_list;
        self.refresh_detail |= other.refresh_detail;
    }

    fn toast() -> Self {
        Self {
            toast_changed: true,
            ..Self::default()
        }
    }
}

// ============================================================================
// Mutations
// ============================================================================

/// A server-side mutation. Carried through the request so the completion
/// handler knows exactly what was asked for.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    ArchiveMarkers { place_ids: Vec<PlaceId> },
    DeleteMarkers { place_ids: Vec<PlaceId> },
    AssignToTrip { target: TripTarget, place_ids: Vec<PlaceId> },
    RemoveFromTrip { trip_id: TripId, place_id: PlaceId },
    CreateTrip { name: String, description: String },
    RenameTrip { trip_id: TripId, name: String },
    UpdateDescription { ticket: RequestTicket, description: String },
    DeleteTrip { trip_id: TripId },
}

impl Mutation {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::ArchiveMarkers { .. } => "archive_markers",
            Self::DeleteMarkers { .. } => "delete_markers",
            Self::AssignToTrip { .. } => "assign_to_trip",
            Self::RemoveFromTrip { .. } => "remove_from_trip",
            Self::CreateTrip { .. } => "create_trip",
            Self::RenameTrip { .. } => "rename_trip",
            Self::UpdateDescription { .. } => "update_description",
            Self::DeleteTrip { .. } => "delete_trip",
        }
    }

    fn request(&self, api: &ApiEndpoints) -> Result<ApiRequest, ApiFailure> {
        match self {
            Self::ArchiveMarkers { place_ids } => api.archive_places(place_ids),
            Self::DeleteMarkers { place_ids } => api.delete_places(place_ids),
            Self::AssignToTrip { target, place_ids } => api.assign_places(target, place_ids),
            Self::RemoveFromTrip { trip_id, place_id } => api.remove_place(trip_id, place_id),
            Self::CreateTrip { name, description } => api.create_trip(name, description),
            Self::RenameTrip { trip_id, name } => api.update_trip(trip_id, json!({ "name": name })),
            Self::UpdateDescription { ticket, description } => {
                api.update_trip(&ticket.target, json!({ "description": description }))
            }
            Self::DeleteTrip { trip_id } => api.delete_trip(trip_id),
        }
    }

    fn success_message(&self) -> String {
        fn locations(n: usize) -> String {
            if n == 1 {
                "1 location".into()
            } else {
                format!("{n} locations")
            }
        }
        match self {
            Self::ArchiveMarkers { place_ids } => format!("Archived {}", locations(place_ids.len())),
            Self::DeleteMarkers { place_ids } => format!("Deleted {}", locations(place_ids.len())),
            Self::AssignToTrip { place_ids, .. } => {
                format!("Added {} to trip", locations(place_ids.len()))
            }
            Self::RemoveFromTrip { .. } => "Removed location from trip".into(),
            Self::CreateTrip { .. } => "Trip created".into(),
            Self::RenameTrip { .. } => "Trip renamed".into(),
            Self::UpdateDescription { .. } => "Description saved".into(),
            Self::DeleteTrip { .. } => "Trip deleted".into(),
        }
    }
}

fn validation(message: &str) -> AppError {
    AppError::new(ErrorKind::Validation, message)
}

fn require_places(place_ids: &[PlaceId]) -> Result<(), AppError> {
    if place_ids.is_empty() {
        Err(validation("Select at least one location first."))
    } else {
        Ok(())
    }
}

fn require_name(name: &str) -> Result<String, AppError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        Err(validation("Trip name is required."))
    } else {
        Ok(trimmed.to_string())
    }
}

fn require_trip_id(id: &TripId) -> Result<TripId, AppError> {
    let trimmed = id.as_str().trim();
    if trimmed.is_empty() {
        Err(validation("No trip selected."))
    } else {
        Ok(TripId::new(trimmed))
    }
}

/// Trims names, drops blank or duplicate place ids and refuses requests
/// that could not succeed.
pub fn validate_mutation(mutation: Mutation) -> Result<Mutation, AppError> {
    fn clean_ids(ids: Vec<PlaceId>) -> Vec<PlaceId> {
        let mut cleaned: Vec<PlaceId> = Vec::with_capacity(ids.len());
        for id in ids {
            let id = PlaceId::new(id.as_str().trim());
            if !id.is_synthetic() && !cleaned.contains(&id) {
                cleaned.push(id);
            }
        }
        cleaned
    }

    let validated = match mutation {
        Mutation::ArchiveMarkers { place_ids } => {
            let place_ids = clean_ids(place_ids);
            require_places(&place_ids)?;
            Mutation::ArchiveMarkers { place_ids }
        }
        Mutation::DeleteMarkers { place_ids } => {
            let place_ids = clean_ids(place_ids);
            require_places(&place_ids)?;
            Mutation::DeleteMarkers { place_ids }
        }
        Mutation::AssignToTrip { target, place_ids } => {
            let place_ids = clean_ids(place_ids);
            require_places(&place_ids)?;
            let target = match target {
                TripTarget::Existing(id) => TripTarget::Existing(require_trip_id(&id)?),
                TripTarget::New { name } => TripTarget::New {
                    name: require_name(&name)?,
                },
            };
            Mutation::AssignToTrip { target, place_ids }
        }
        Mutation::RemoveFromTrip { trip_id, place_id } => {
            let place_id = PlaceId::new(place_id.as_str().trim());
            if place_id.is_synthetic() {
                return Err(validation("No location selected."));
            }
            Mutation::RemoveFromTrip {
                trip_id: require_trip_id(&trip_id)?,
                place_id,
            }
        }
        Mutation::CreateTrip { name, description } => Mutation::CreateTrip {
            name: require_name(&name)?,
            description: description.trim().to_string(),
        },
        Mutation::RenameTrip { trip_id, name } => Mutation::RenameTrip {
            trip_id: require_trip_id(&trip_id)?,
            name: require_name(&name)?,
        },
        Mutation::UpdateDescription { ticket, description } => Mutation::UpdateDescription {
            ticket,
            description: description.trim().to_string(),
        },
        Mutation::DeleteTrip { trip_id } => Mutation::DeleteTrip {
            trip_id: require_trip_id(&trip_id)?,
        },
    };
    Ok(validated)
}

/// Trip fields from a mutation response, if it carries a trip record.
fn response_patch(payload: &Value) -> Option<TripPatch> {
    normalize::normalize_trip_patch(normalize::trip_record(payload))
}

/// Captured when a list load is dispatched.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadTicket {
    pub seq: u64,
    /// Failures are logged, never surfaced.
    pub best_effort: bool,
}

/// Map side effects accumulated since the last render.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FrameOutput {
    pub map_commands: Vec<MapCommand>,
    pub removed_handles: Vec<MarkerHandle>,
}

// ============================================================================
// Coordinator
// ============================================================================

#[derive(Debug)]
pub struct Coordinator {
    config: CoreConfig,
    trips: TripListCache,
    details: TripDetailCache,
    markers: MarkerIndex,
    selection: SelectionMachine,
    search: String,
    /// Chosen by the user; `None` follows the configured default.
    sort: Option<TripSort>,
    marker_filter: MarkerFilter,
    list_seq: RequestSequence,
    marker_seq: RequestSequence,
    trips_loading: bool,
    markers_loading: bool,
    toast: Option<ToastMessage>,
    frame: FrameOutput,
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new(CoreConfig::default())
    }
}

impl Coordinator {
    /// Builds a coordinator from `config`. Invalid capacity or threshold
    /// values fall back to their defaults; use [`Self::configure`] to
    /// validate.
    #[must_use]
    pub fn new(config: CoreConfig) -> Self {
        let defaults = CoreConfig::default();
        let capacity = config
            .cache_capacity()
            .or_else(|_| defaults.cache_capacity())
            .unwrap_or(std::num::NonZeroUsize::MIN);
        let threshold = if config.drag_threshold_px.is_finite() && config.drag_threshold_px > 0.0 {
            config.drag_threshold_px
        } else {
            defaults.drag_threshold_px
        };

        Self {
            trips: TripListCache::new(),
            details: TripDetailCache::new(capacity),
            markers: MarkerIndex::new(),
            selection: SelectionMachine::new(threshold),
            search: String::new(),
            sort: None,
            marker_filter: MarkerFilter::default(),
            list_seq: RequestSequence::default(),
            marker_seq: RequestSequence::default(),
            trips_loading: false,
            markers_loading: false,
            toast: None,
            frame: FrameOutput::default(),
            config,
        }
    }

    pub fn configure(&mut self, config: CoreConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.details.set_capacity(config.cache_capacity()?);
        self.selection.set_threshold(config.drag_threshold_px);
        info!(base_url = %config.api_base_url, "core configured");
        self.config = config;
        Ok(())
    }

    fn endpoints(&self) -> Result<ApiEndpoints, AppError> {
        self.config
            .base_url()
            .map(ApiEndpoints::new)
            .map_err(|e| AppError::new(ErrorKind::Validation, e.to_string()))
    }

    // --- Read accessors ---

    #[must_use]
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    #[must_use]
    pub fn trips(&self) -> &TripListCache {
        &self.trips
    }

    /// Trip list as currently searched and sorted.
    #[must_use]
    pub fn visible_trips(&self) -> Vec<&Trip> {
        self.trips.query(&self.search, self.sort())
    }

    #[must_use]
    pub fn search(&self) -> &str {
        &self.search
    }

    #[must_use]
    pub fn sort(&self) -> TripSort {
        self.sort.unwrap_or(self.config.default_sort)
    }

    #[must_use]
    pub fn detail(&self) -> Option<&TripDetail> {
        self.details.current()
    }

    #[must_use]
    pub fn details(&self) -> &TripDetailCache {
        &self.details
    }

    #[must_use]
    pub fn markers(&self) -> &MarkerIndex {
        &self.markers
    }

    #[must_use]
    pub fn selection(&self) -> &SelectionMachine {
        &self.selection
    }

    #[must_use]
    pub fn marker_filter(&self) -> &MarkerFilter {
        &self.marker_filter
    }

    #[must_use]
    pub fn trips_loading(&self) -> bool {
        self.trips_loading
    }

    #[must_use]
    pub fn markers_loading(&self) -> bool {
        self.markers_loading
    }

    #[must_use]
    pub fn toast(&self) -> Option<&ToastMessage> {
        self.toast.as_ref()
    }

    #[must_use]
    pub fn frame(&self) -> &FrameOutput {
        &self.frame
    }

    /// Clears the per-update map side effects. Called at the start of each
    /// update so the view only carries the latest batch.
    pub fn begin_frame(&mut self) {
        self.frame = FrameOutput::default();
    }

    // --- Toasts ---

    pub fn notify(&mut self, message: impl Into<String>, kind: ToastKind) -> SyncDiff {
        self.toast = Some(ToastMessage::new(message, kind, self.config.toast_duration_ms));
        SyncDiff::toast()
    }

    /// Surfaces a failed operation. Caches are not touched.
    pub fn report(&mut self, error: &AppError) -> SyncDiff {
        warn!(code = error.code(), error = %error, "operation failed");
        self.notify(error.user_facing_message(), ToastKind::Error)
    }

    pub fn dismiss_toast(&mut self) -> SyncDiff {
        if self.toast.take().is_some() {
            SyncDiff::toast()
        } else {
            SyncDiff::default()
        }
    }

    // --- Trip list ---

    pub fn set_search(&mut self, term: String) -> SyncDiff {
        self.search = term;
        SyncDiff {
            trip_list_changed: true,
            ..SyncDiff::default()
        }
    }

    pub fn set_sort(&mut self, sort: TripSort) -> SyncDiff {
        self.sort = Some(sort);
        SyncDiff {
            trip_list_changed: true,
            ..SyncDiff::default()
        }
    }

    pub fn begin_trip_list_load(&mut self, best_effort: bool) -> Result<(LoadTicket, ApiRequest), AppError> {
        let request = self.endpoints()?.list_trips()?;
        let ticket = LoadTicket {
            seq: self.list_seq.next(),
            best_effort,
        };
        if !best_effort {
            self.trips_loading = true;
        }
        debug!(seq = ticket.seq, best_effort, "trip list load dispatched");
        Ok((ticket, request))
    }

    #[instrument(skip(self, result), fields(seq = ticket.seq))]
    pub fn apply_trip_list(&mut self, ticket: LoadTicket, result: ApiResult) -> SyncDiff {
        if !self.list_seq.is_latest(ticket.seq) {
            debug!(latest = self.list_seq.latest(), "discarding stale trip list");
            return SyncDiff::default();
        }
        self.trips_loading = false;

        let mut diff = SyncDiff {
            trip_list_changed: true,
            ..SyncDiff::default()
        };
        match result {
            Ok(payload) => {
                let trips = normalize::normalize_trips(&payload);
                debug!(count = trips.len(), "trip list loaded");
                self.trips.replace(trips);
            }
            Err(failure) if ticket.best_effort => {
                warn!(error = %failure, "best-effort trip list refresh failed");
            }
            Err(failure) => {
                let error = AppError::from(failure).with_context("operation", "load_trips");
                diff.merge(&self.report(&error));
            }
        }
        diff
    }

    // --- Trip detail ---

    pub fn open_trip(&mut self, trip_id: &TripId) -> Result<(RequestTicket, ApiRequest), AppError> {
        let trip_id = require_trip_id(trip_id)?;
        let request = self.endpoints()?.get_trip(&trip_id)?;
        let fallback = self.trips.get(&trip_id).cloned();
        let opened = self.details.open(&trip_id, fallback.as_ref());
        Ok((opened.ticket, request))
    }

    /// Request for re-fetching the open trip, if one is open.
    pub fn reload_open_trip(&mut self) -> Result<Option<(RequestTicket, ApiRequest)>, AppError> {
        let Some(trip_id) = self.details.current_id().cloned() else {
            return Ok(None);
        };
        let request = self.endpoints()?.get_trip(&trip_id)?;
        Ok(self.details.reload().map(|ticket| (ticket, request)))
    }

    pub fn close_trip(&mut self) -> SyncDiff {
        SyncDiff {
            detail_closed: self.details.close(),
            ..SyncDiff::default()
        }
    }

    #[instrument(skip(self, result), fields(seq = ticket.seq, trip_id = %ticket.target))]
    pub fn apply_trip_detail(&mut self, ticket: &RequestTicket, result: ApiResult) -> SyncDiff {
        match result {
            Ok(payload) => {
                let Some((mut patch, locations)) = normalize::normalize_trip_detail(&payload) else {
                    warn!("trip detail payload has no usable trip");
                    let failed = self.details.refresh_failed(ticket) == RefreshOutcome::Applied;
                    return SyncDiff {
                        detail_changed: failed,
                        ..SyncDiff::default()
                    };
                };
                trip_detail::complete_from_locations(&mut patch, &locations);
                if self.details.apply_refresh(ticket, &patch, locations) == RefreshOutcome::Stale {
                    return SyncDiff::default();
                }
                let mut diff = SyncDiff {
                    detail_changed: true,
                    ..SyncDiff::default()
                };
                if let Some(listed) = self.trips.get_mut(&patch.id) {
                    let before = listed.clone();
                    listed.apply(&patch);
                    diff.trip_list_changed = *listed != before;
                }
                diff
            }
            Err(failure) => {
                if self.details.refresh_failed(ticket) == RefreshOutcome::Stale {
                    debug!(error = %failure, "ignoring failure of stale trip detail request");
                    return SyncDiff::default();
                }
                let error = AppError::from(failure)
                    .with_context("operation", "load_trip")
                    .with_context("trip_id", ticket.target.as_str());
                let mut diff = self.report(&error);
                diff.detail_changed = true;
                diff
            }
        }
    }

    // --- Markers ---

    pub fn begin_marker_reload(
        &mut self,
        filter: Option<MarkerFilter>,
        best_effort: bool,
    ) -> Result<(LoadTicket, ApiRequest), AppError> {
        let candidate = filter.unwrap_or_else(|| self.marker_filter.clone());
        let request = self.endpoints()?.map_data(&candidate)?;
        self.marker_filter = candidate;
        let ticket = LoadTicket {
            seq: self.marker_seq.next(),
            best_effort,
        };
        self.markers_loading = true;
        debug!(seq = ticket.seq, "marker reload dispatched");
        Ok((ticket, request))
    }

    #[instrument(skip(self, result), fields(seq = ticket.seq))]
    pub fn apply_marker_reload(&mut self, ticket: LoadTicket, result: ApiResult) -> SyncDiff {
        if !self.marker_seq.is_latest(ticket.seq) {
            debug!(latest = self.marker_seq.latest(), "discarding stale marker load");
            return SyncDiff::default();
        }
        self.markers_loading = false;

        match result {
            Ok(payload) => {
                let markers = normalize::normalize_markers(&payload);
                let handles = self.markers.replace_all(markers);
                self.frame.removed_handles.extend(handles.removed);
                let pruned = self.selection.prune(&self.markers);
                SyncDiff {
                    markers_changed: true,
                    selection_changed: pruned > 0,
                    ..SyncDiff::default()
                }
            }
            Err(failure) if ticket.best_effort => {
                warn!(error = %failure, "best-effort marker reload failed");
                SyncDiff::default()
            }
            Err(failure) => {
                let error = AppError::from(failure).with_context("operation", "load_markers");
                self.report(&error)
            }
        }
    }

    /// Drops a marker from the index and, if selected, from the selection.
    pub fn remove_marker(&mut self, id: &PlaceId) -> SyncDiff {
        let Some(removed) = self.markers.remove(id) else {
            return SyncDiff::default();
        };
        self.frame.removed_handles.push(removed.handle);
        SyncDiff {
            markers_changed: true,
            selection_changed: self.selection.deselect(id),
            ..SyncDiff::default()
        }
    }

    // --- Selection ---

    pub fn dispatch_selection(&mut self, event: SelectionEvent) -> Result<SyncDiff, SelectionError> {
        let outcome = self.selection.dispatch(event, &self.markers)?;
        self.frame.map_commands.extend(outcome.commands);
        Ok(SyncDiff {
            selection_changed: outcome.selection_changed,
            manage_state_changed: outcome.state_changed,
            ..SyncDiff::default()
        })
    }

    /// Explicit ids, or the current selection when `None`.
    #[must_use]
    pub fn resolve_place_ids(&self, explicit: Option<Vec<String>>) -> Vec<PlaceId> {
        match explicit {
            Some(ids) => ids.into_iter().map(PlaceId::new).collect(),
            None => self.selection.selected_ids(),
        }
    }

    // --- Mutations ---

    pub fn begin_description_save(&mut self, trip_id: &TripId, description: String) -> Mutation {
        Mutation::UpdateDescription {
            ticket: self.details.begin_description_save(trip_id),
            description,
        }
    }

    /// Validates `mutation` and builds its request. Nothing is changed
    /// locally until the server confirms.
    pub fn prepare_mutation(&self, mutation: Mutation) -> Result<(Mutation, ApiRequest), AppError> {
        let mutation = validate_mutation(mutation)?;
        let request = mutation.request(&self.endpoints()?)?;
        debug!(mutation = mutation.name(), url = %request.url, "mutation dispatched");
        Ok((mutation, request))
    }

    /// Propagates a confirmed mutation to every cache.
    #[instrument(skip(self, mutation, payload), fields(mutation = mutation.name()))]
    pub fn apply_mutation(&mut self, mutation: &Mutation, payload: &Value) -> SyncDiff {
        let mut diff = match mutation {
            Mutation::ArchiveMarkers { place_ids } => self.apply_archive(place_ids),
            Mutation::DeleteMarkers { place_ids } => self.apply_delete_markers(place_ids),
            Mutation::AssignToTrip { target, place_ids } => self.apply_assign(target, place_ids, payload),
            Mutation::RemoveFromTrip { trip_id, place_id } => {
                self.apply_remove_location(trip_id, place_id, payload)
            }
            Mutation::CreateTrip { .. } => self.apply_create(payload),
            Mutation::RenameTrip { trip_id, name } => self.apply_rename(trip_id, name, payload),
            Mutation::UpdateDescription { ticket, description } => {
                if !self.details.is_latest_description(ticket) {
                    debug!(seq = ticket.seq, "discarding stale description save");
                    return SyncDiff::default();
                }
                self.apply_description(&ticket.target, description, payload)
            }
            Mutation::DeleteTrip { trip_id } => self.apply_delete_trip(trip_id),
        };
        info!(?diff, "mutation applied");
        diff.merge(&self.notify(mutation.success_message(), ToastKind::Success));
        diff
    }

    /// The server refused or never answered; caches stay as they were.
    pub fn mutation_failed(&mut self, mutation: &Mutation, failure: ApiFailure) -> SyncDiff {
        if let Mutation::UpdateDescription { ticket, .. } = mutation {
            if !self.details.is_latest_description(ticket) {
                debug!(seq = ticket.seq, error = %failure, "ignoring failure of stale description save");
                return SyncDiff::default();
            }
        }
        let error = AppError::from(failure).with_context("operation", mutation.name());
        self.report(&error)
    }

    fn apply_archive(&mut self, place_ids: &[PlaceId]) -> SyncDiff {
        let patched = self.markers.set_archived(place_ids);
        SyncDiff {
            markers_changed: patched > 0,
            reload_markers: true,
            ..SyncDiff::default()
        }
    }

    fn apply_delete_markers(&mut self, place_ids: &[PlaceId]) -> SyncDiff {
        let mut diff = SyncDiff {
            reload_markers: true,
            refresh_trip_list: true,
            ..SyncDiff::default()
        };

        // 1. trip list: every trip a deleted marker belonged to loses one
        let memberships: Vec<TripId> = place_ids
            .iter()
            .filter_map(|id| self.markers.get(id))
            .flat_map(|m| m.data.trips.iter().map(|t| t.id.clone()))
            .collect();
        for trip_id in &memberships {
            diff.trip_list_changed |= self.trips.adjust_location_count(trip_id, -1);
        }

        // 2. detail and location cache
        if let Some(patch) = self.details.remove_places_everywhere(place_ids) {
            diff.detail_changed = true;
            if let Some(listed) = self.trips.get_mut(&patch.id) {
                listed.apply(&patch);
                diff.trip_list_changed = true;
            }
        }

        // 3. markers and selection
        for id in place_ids {
            diff.merge(&self.remove_marker(id));
        }
        diff
    }

    fn apply_assign(&mut self, target: &TripTarget, place_ids: &[PlaceId], payload: &Value) -> SyncDiff {
        let patch = response_patch(payload).or_else(|| match target {
            TripTarget::Existing(id) => Some(TripPatch::new(id.clone())),
            TripTarget::New { .. } => None,
        });
        let Some(mut patch) = patch else {
            warn!("assignment response carries no trip; refreshing");
            return SyncDiff {
                refresh_trip_list: true,
                ..SyncDiff::default()
            };
        };
        if patch.name.is_none() {
            if let TripTarget::New { name } = target {
                patch.name = Some(name.clone());
            }
        }

        let newly_added: Vec<PlaceId> = place_ids
            .iter()
            .filter(|id| {
                self.markers
                    .get(id)
                    .map_or(true, |m| !m.data.belongs_to(&patch.id))
            })
            .cloned()
            .collect();
        if patch.location_count.is_none() {
            let current = self.trips.get(&patch.id).map_or(0, |t| t.location_count);
            let added = u32::try_from(newly_added.len()).unwrap_or(u32::MAX);
            patch.location_count = Some(current.saturating_add(added));
        }

        let snapshots: Vec<Marker> = place_ids
            .iter()
            .filter_map(|id| self.markers.get(id))
            .map(|m| m.data.clone())
            .collect();
        if patch.latest_location_date.is_none() {
            let listed = self.trips.get(&patch.id).map(|t| t.latest_location_date.as_str());
            let shown = self
                .details
                .current()
                .filter(|d| d.trip.id == patch.id)
                .map(|d| d.trip.latest_location_date.as_str());
            let latest = time::latest_date(
                listed
                    .into_iter()
                    .chain(shown)
                    .chain(snapshots.iter().map(|m| m.date.as_str())),
            );
            if !latest.is_empty() {
                patch.latest_location_date = Some(latest);
            }
        }

        // 1. trip list
        let trip_ref = self.trips.upsert(&patch).to_ref();
        let mut diff = SyncDiff {
            trip_list_changed: true,
            ..SyncDiff::default()
        };

        // 2. detail and location cache
        if snapshots.len() < place_ids.len() {
            // unknown places cannot be listed; the cached list would be short
            warn!(
                trip_id = %trip_ref.id,
                requested = place_ids.len(),
                known = snapshots.len(),
                "assigned places missing from the marker index"
            );
            self.details.invalidate(&trip_ref.id);
            diff.refresh_detail = self.details.is_open(&trip_ref.id);
        }
        diff.detail_changed = self.details.extend_locations(&trip_ref.id, &snapshots, &patch);

        // 3. marker membership snapshots
        diff.markers_changed = self.markers.attach_trip(place_ids, &trip_ref) > 0;
        diff
    }

    fn apply_remove_location(&mut self, trip_id: &TripId, place_id: &PlaceId, payload: &Value) -> SyncDiff {
        let server = response_patch(payload)
            .filter(|p| &p.id == trip_id)
            .unwrap_or_else(|| TripPatch::new(trip_id.clone()));

        let mut resolved = server.clone();
        let preview = self.details.preview_removal(trip_id, place_id);
        if resolved.location_count.is_none() {
            resolved.location_count = match &preview {
                Some((count, _)) => Some(*count),
                None => self
                    .trips
                    .get(trip_id)
                    .map(|t| t.location_count.saturating_sub(1)),
            };
        }
        if resolved.latest_location_date.is_none() {
            resolved.latest_location_date = preview.map(|(_, latest)| latest);
        }
        if server.latest_location_date.is_none() && server.updated_at.is_none() {
            // approximate: the server did not say when the trip changed
            resolved.updated_at = Some(time::now_iso());
        }

        let mut diff = SyncDiff::default();
        // 1. trip list
        if let Some(listed) = self.trips.get_mut(trip_id) {
            listed.apply(&resolved);
            diff.trip_list_changed = true;
        }
        // 2. detail and location cache
        diff.detail_changed = self.details.remove_location(trip_id, place_id, &resolved);
        // 3. marker membership snapshot
        diff.markers_changed = self.markers.detach_trip(std::slice::from_ref(place_id), trip_id) > 0;
        diff
    }

    fn apply_create(&mut self, payload: &Value) -> SyncDiff {
        match response_patch(payload) {
            Some(patch) => {
                self.trips.upsert(&patch);
                SyncDiff {
                    trip_list_changed: true,
                    ..SyncDiff::default()
                }
            }
            None => SyncDiff {
                refresh_trip_list: true,
                ..SyncDiff::default()
            },
        }
    }

    fn apply_rename(&mut self, trip_id: &TripId, name: &str, payload: &Value) -> SyncDiff {
        let mut patch = response_patch(payload)
            .filter(|p| &p.id == trip_id)
            .unwrap_or_else(|| TripPatch::new(trip_id.clone()));
        let name = patch.name.get_or_insert_with(|| name.to_string()).clone();

        let mut diff = SyncDiff::default();
        if let Some(listed) = self.trips.get_mut(trip_id) {
            listed.apply(&patch);
            diff.trip_list_changed = true;
        }
        diff.detail_changed = self.details.patch_trip(&patch);
        diff.markers_changed = self.markers.rename_trip(trip_id, &name) > 0;
        diff
    }

    fn apply_description(&mut self, trip_id: &TripId, description: &str, payload: &Value) -> SyncDiff {
        let mut patch = response_patch(payload)
            .filter(|p| &p.id == trip_id)
            .unwrap_or_else(|| TripPatch::new(trip_id.clone()));
        patch
            .description
            .get_or_insert_with(|| description.to_string());

        let mut diff = SyncDiff::default();
        if let Some(listed) = self.trips.get_mut(trip_id) {
            listed.apply(&patch);
            diff.trip_list_changed = true;
        }
        diff.detail_changed = self.details.patch_trip(&patch);
        diff
    }

    fn apply_delete_trip(&mut self, trip_id: &TripId) -> SyncDiff {
        let removed = self.trips.remove(trip_id).is_some();
        let closed = self.details.purge(trip_id);
        let detached = self.markers.forget_trip(trip_id);
        SyncDiff {
            trip_list_changed: removed,
            detail_closed: closed,
            markers_changed: detached > 0,
            ..SyncDiff::default()
        }
    }

    // --- Session ---

    /// Back to a freshly-constructed state with the current config.
    /// Sequence counters keep counting so in-flight responses are dropped.
    pub fn reset(&mut self) -> SyncDiff {
        let removed = self.markers.clear();
        self.frame.removed_handles.extend(removed);
        self.trips.clear();
        self.details.reset();
        self.frame.map_commands.clear();
        // hand the saved map interactions back before forgetting them
        if let Ok(outcome) = self.selection.dispatch(SelectionEvent::ExitManageMode, &self.markers) {
            self.frame.map_commands.extend(outcome.commands);
        }
        self.selection.reset();
        self.search.clear();
        self.sort = None;
        self.marker_filter = MarkerFilter::default();
        // invalidate anything in flight
        self.list_seq.next();
        self.marker_seq.next();
        self.trips_loading = false;
        self.markers_loading = false;
        self.toast = None;
        info!("session reset");
        SyncDiff {
            trip_list_changed: true,
            detail_closed: true,
            markers_changed: true,
            selection_changed: true,
            manage_state_changed: true,
            toast_changed: true,
            ..SyncDiff::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selection::{InteractionFlags, PointerButton, PointerSample, ScreenPoint};
    use crate::model::LatLng;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    fn trip_json(id: &str, name: &str, count: u32) -> Value {
        json!({ "id": id, "name": name, "location_count": count, "created_at": "2024-01-01" })
    }

    fn marker_json(id: &str, lat: f64, lng: f64, date: &str, trips: &[(&str, &str)]) -> Value {
        let trips: Vec<Value> = trips
            .iter()
            .map(|(id, name)| json!({ "id": id, "name": name }))
            .collect();
        json!({ "id": id, "lat": lat, "lng": lng, "place": id, "date": date, "trips": trips })
    }

    fn loaded() -> Coordinator {
        let mut core = Coordinator::default();
        let (ticket, _) = core.begin_trip_list_load(false).unwrap();
        core.apply_trip_list(
            ticket,
            Ok(json!({ "trips": [trip_json("t1", "Rome", 2), trip_json("t2", "Oslo", 1)] })),
        );
        let (ticket, _) = core.begin_marker_reload(None, false).unwrap();
        core.apply_marker_reload(
            ticket,
            Ok(json!([
                marker_json("a", 1.0, 1.0, "2024-01-01", &[("t1", "Rome")]),
                marker_json("b", 2.0, 2.0, "2024-02-01", &[("t1", "Rome"), ("t2", "Oslo")]),
                marker_json("c", 10.0, 10.0, "2024-03-01", &[]),
            ])),
        );
        core
    }

    fn open_rome(core: &mut Coordinator) {
        let (ticket, _) = core.open_trip(&TripId::new("t1")).unwrap();
        core.apply_trip_detail(
            &ticket,
            Ok(json!({
                "trip": trip_json("t1", "Rome", 2),
                "locations": [
                    marker_json("a", 1.0, 1.0, "2024-01-01", &[("t1", "Rome")]),
                    marker_json("b", 2.0, 2.0, "2024-02-01", &[("t1", "Rome")]),
                ],
            })),
        );
    }

    fn count(core: &Coordinator, id: &str) -> u32 {
        core.trips().get(&TripId::new(id)).unwrap().location_count
    }

    fn enter_manage_mode(core: &mut Coordinator) {
        core.dispatch_selection(SelectionEvent::EnterManageMode {
            current: InteractionFlags::default(),
        })
        .unwrap();
    }

    fn select(core: &mut Coordinator, id: &str) {
        core.dispatch_selection(SelectionEvent::ToggleMarker { id: PlaceId::new(id) })
            .unwrap();
    }

    mod load_tests {
        use super::*;

        #[test]
        fn test_stale_list_response_dropped() {
            let mut core = Coordinator::default();
            let (first, _) = core.begin_trip_list_load(false).unwrap();
            let (second, _) = core.begin_trip_list_load(false).unwrap();

            core.apply_trip_list(second, Ok(json!([trip_json("new", "New", 0)])));
            let diff = core.apply_trip_list(first, Ok(json!([trip_json("old", "Old", 0)])));

            assert_eq!(diff, SyncDiff::default());
            assert_eq!(core.trips().len(), 1);
            assert!(core.trips().get(&TripId::new("new")).is_some());
        }

        #[test]
        fn test_list_failure_surfaces_toast_unless_best_effort() {
            let mut core = loaded();
            let (ticket, _) = core.begin_trip_list_load(true).unwrap();
            core.apply_trip_list(ticket, Err(ApiFailure::Transport("offline".into())));
            assert!(core.toast().is_none());
            assert_eq!(core.trips().len(), 2);

            let (ticket, _) = core.begin_trip_list_load(false).unwrap();
            core.apply_trip_list(ticket, Err(ApiFailure::Transport("offline".into())));
            assert_eq!(core.toast().unwrap().kind, ToastKind::Error);
            assert_eq!(core.trips().len(), 2);
            assert!(!core.trips_loading());
        }

        #[test]
        fn test_detail_out_of_order() {
            let mut core = loaded();
            let (x, _) = core.open_trip(&TripId::new("t1")).unwrap();
            let (y, _) = core.open_trip(&TripId::new("t2")).unwrap();

            core.apply_trip_detail(
                &y,
                Ok(json!({ "trip": trip_json("t2", "Oslo", 1), "locations": [] })),
            );
            let diff = core.apply_trip_detail(
                &x,
                Ok(json!({ "trip": trip_json("t1", "Rome", 2), "locations": [] })),
            );

            assert!(!diff.detail_changed);
            assert_eq!(core.detail().unwrap().trip.name, "Oslo");
        }

        #[test]
        fn test_partial_detail_merges_into_list_entry() {
            let mut core = Coordinator::default();
            let (ticket, _) = core.begin_trip_list_load(false).unwrap();
            core.apply_trip_list(
                ticket,
                Ok(json!([{
                    "id": "t1",
                    "name": "Rome",
                    "description": "pasta",
                    "location_count": 2,
                    "latest_location_date": "2024-01-01",
                    "google_photos_url": "https://photos.example/rome",
                }])),
            );

            let (ticket, _) = core.open_trip(&TripId::new("t1")).unwrap();
            core.apply_trip_detail(
                &ticket,
                Ok(json!({
                    "trip": { "id": "t1", "name": "Rome" },
                    "locations": [marker_json("a", 1.0, 1.0, "2023-06-01", &[])],
                })),
            );

            let listed = core.trips().get(&TripId::new("t1")).unwrap();
            assert_eq!(listed.description, "pasta");
            assert_eq!(listed.google_photos_url, "https://photos.example/rome");
            assert_eq!(listed.latest_location_date, "2024-01-01");
            // the server sent no count, so the returned locations decide it
            assert_eq!(listed.location_count, 1);

            let shown = &core.detail().unwrap().trip;
            assert_eq!(shown.description, "pasta");
            assert_eq!(shown.location_count, 1);
            assert_eq!(shown.latest_location_date, "2024-01-01");
        }

        #[test]
        fn test_detail_failure_after_close_is_silent() {
            let mut core = loaded();
            let (ticket, _) = core.open_trip(&TripId::new("t1")).unwrap();
            core.close_trip();
            let diff = core.apply_trip_detail(&ticket, Err(ApiFailure::Transport("x".into())));
            assert_eq!(diff, SyncDiff::default());
            assert!(core.toast().is_none());
        }

        #[test]
        fn test_open_uses_list_snapshot_while_loading() {
            let mut core = loaded();
            core.open_trip(&TripId::new("t2")).unwrap();
            let detail = core.detail().unwrap();
            assert_eq!(detail.trip.name, "Oslo");
            assert!(detail.loading);
        }

        #[test]
        fn test_marker_reload_prunes_selection() {
            let mut core = loaded();
            enter_manage_mode(&mut core);
            select(&mut core, "a");
            select(&mut core, "c");

            let (ticket, _) = core.begin_marker_reload(None, false).unwrap();
            let diff = core.apply_marker_reload(
                ticket,
                Ok(json!({ "markers": [marker_json("c", 10.0, 10.0, "", &[])] })),
            );

            assert!(diff.selection_changed);
            assert_eq!(core.selection().selected_ids(), vec![PlaceId::new("c")]);
            assert_eq!(core.frame().removed_handles.len(), 3);
        }
    }

    mod mutation_tests {
        use super::*;

        #[test]
        fn test_validation_rejects_before_request() {
            let core = loaded();
            let err = core
                .prepare_mutation(Mutation::ArchiveMarkers { place_ids: vec![] })
                .unwrap_err();
            assert_eq!(err.kind, ErrorKind::Validation);

            let err = core
                .prepare_mutation(Mutation::AssignToTrip {
                    target: TripTarget::New { name: "   ".into() },
                    place_ids: vec![PlaceId::new("a")],
                })
                .unwrap_err();
            assert_eq!(err.kind, ErrorKind::Validation);
        }

        #[test]
        fn test_prepare_trims_and_dedups() {
            let core = loaded();
            let (mutation, request) = core
                .prepare_mutation(Mutation::AssignToTrip {
                    target: TripTarget::New { name: "  Alps ".into() },
                    place_ids: vec![PlaceId::new("a"), PlaceId::new(" a "), PlaceId::new("")],
                })
                .unwrap();
            assert_eq!(
                mutation,
                Mutation::AssignToTrip {
                    target: TripTarget::New { name: "Alps".into() },
                    place_ids: vec![PlaceId::new("a")],
                }
            );
            assert_eq!(
                request.body,
                Some(json!({ "trip_name": "Alps", "place_ids": ["a"] }))
            );
        }

        #[test]
        fn test_failure_leaves_caches_untouched() {
            let mut core = loaded();
            open_rome(&mut core);
            let mutation = Mutation::DeleteTrip {
                trip_id: TripId::new("t1"),
            };
            core.mutation_failed(&mutation, ApiFailure::Status {
                code: 500,
                message: "boom".into(),
            });

            assert_eq!(core.trips().len(), 2);
            assert!(core.details().is_open(&TripId::new("t1")));
            assert_eq!(core.toast().unwrap().kind, ToastKind::Error);
        }

        #[test]
        fn test_delete_open_trip_closes_detail() {
            let mut core = loaded();
            open_rome(&mut core);
            let diff = core.apply_mutation(
                &Mutation::DeleteTrip {
                    trip_id: TripId::new("t1"),
                },
                &json!({ "status": "success" }),
            );

            assert!(diff.detail_closed);
            assert!(core.detail().is_none());
            assert!(!core.details().location_cache().contains(&TripId::new("t1")));
            assert!(core.trips().get(&TripId::new("t1")).is_none());
            assert!(!core
                .markers()
                .get(&PlaceId::new("a"))
                .unwrap()
                .data
                .belongs_to(&TripId::new("t1")));
        }

        #[test]
        fn test_delete_other_trip_leaves_detail() {
            let mut core = loaded();
            open_rome(&mut core);
            let diff = core.apply_mutation(
                &Mutation::DeleteTrip {
                    trip_id: TripId::new("t2"),
                },
                &Value::Null,
            );
            assert!(!diff.detail_closed);
            assert!(core.details().is_open(&TripId::new("t1")));
        }

        #[test]
        fn test_remove_location_recomputes_when_server_is_silent() {
            let mut core = loaded();
            open_rome(&mut core);
            let started = time::parse_timestamp_ms(&time::now_iso()).unwrap();

            core.apply_mutation(
                &Mutation::RemoveFromTrip {
                    trip_id: TripId::new("t1"),
                    place_id: PlaceId::new("b"),
                },
                &json!({ "status": "success" }),
            );

            let detail = core.detail().unwrap();
            assert_eq!(detail.locations.len(), 1);
            assert_eq!(detail.trip.location_count, 1);
            assert_eq!(detail.trip.latest_location_date, "2024-01-01");
            assert_eq!(count(&core, "t1"), 1);
            // approximate timestamp: only check it is recent
            let updated = time::parse_timestamp_ms(&detail.trip.updated_at).unwrap();
            assert!(updated >= started - 1_000);

            core.apply_mutation(
                &Mutation::RemoveFromTrip {
                    trip_id: TripId::new("t1"),
                    place_id: PlaceId::new("a"),
                },
                &Value::Null,
            );
            let detail = core.detail().unwrap();
            assert_eq!(detail.trip.location_count, 0);
            assert_eq!(detail.trip.latest_location_date, "");
        }

        #[test]
        fn test_remove_location_prefers_server_fields() {
            let mut core = loaded();
            open_rome(&mut core);
            core.apply_mutation(
                &Mutation::RemoveFromTrip {
                    trip_id: TripId::new("t1"),
                    place_id: PlaceId::new("b"),
                },
                &json!({ "trip": { "id": "t1", "location_count": 7, "updated_at": "2024-06-01" } }),
            );
            let detail = core.detail().unwrap();
            assert_eq!(detail.trip.location_count, 7);
            assert_eq!(detail.trip.updated_at, "2024-06-01");
            assert_eq!(detail.trip.latest_location_date, "2024-01-01");
        }

        #[test]
        fn test_delete_markers_updates_everything() {
            let mut core = loaded();
            open_rome(&mut core);
            enter_manage_mode(&mut core);
            select(&mut core, "b");
            select(&mut core, "c");

            let diff = core.apply_mutation(
                &Mutation::DeleteMarkers {
                    place_ids: vec![PlaceId::new("b")],
                },
                &json!({ "status": "success", "message": "Deleted" }),
            );

            assert!(diff.reload_markers);
            assert!(diff.refresh_trip_list);
            assert!(diff.selection_changed);
            assert_eq!(core.selection().selected_ids(), vec![PlaceId::new("c")]);
            assert!(!core.markers().contains(&PlaceId::new("b")));
            assert_eq!(count(&core, "t1"), 1);
            assert_eq!(count(&core, "t2"), 0);
            assert_eq!(core.detail().unwrap().locations.len(), 1);
        }

        #[test]
        fn test_assign_to_new_trip() {
            let mut core = loaded();
            let diff = core.apply_mutation(
                &Mutation::AssignToTrip {
                    target: TripTarget::New { name: "Alps".into() },
                    place_ids: vec![PlaceId::new("c")],
                },
                &json!({ "trip": { "id": "t9", "name": "Alps", "location_count": 1 } }),
            );

            assert!(diff.trip_list_changed);
            assert!(diff.markers_changed);
            assert!(!diff.reload_markers);
            assert_eq!(count(&core, "t9"), 1);
            assert!(core
                .markers()
                .get(&PlaceId::new("c"))
                .unwrap()
                .data
                .belongs_to(&TripId::new("t9")));
        }

        #[test]
        fn test_assign_to_open_trip_extends_detail() {
            let mut core = loaded();
            open_rome(&mut core);
            let diff = core.apply_mutation(
                &Mutation::AssignToTrip {
                    target: TripTarget::Existing(TripId::new("t1")),
                    place_ids: vec![PlaceId::new("c"), PlaceId::new("a")],
                },
                &Value::Null,
            );

            assert!(diff.detail_changed);
            assert_eq!(core.detail().unwrap().locations.len(), 3);
            assert_eq!(count(&core, "t1"), 3);
        }

        #[test]
        fn test_assign_without_server_fields_advances_latest_date() {
            let mut core = loaded();
            open_rome(&mut core);
            assert_eq!(core.trips().get(&TripId::new("t1")).unwrap().latest_location_date, "2024-02-01");

            core.apply_mutation(
                &Mutation::AssignToTrip {
                    target: TripTarget::Existing(TripId::new("t1")),
                    place_ids: vec![PlaceId::new("c")],
                },
                &json!({ "status": "success" }),
            );
            let rome = core.trips().get(&TripId::new("t1")).unwrap();
            assert_eq!(rome.location_count, 3);
            assert_eq!(rome.latest_location_date, "2024-03-01");
            assert_eq!(core.detail().unwrap().trip.latest_location_date, "2024-03-01");

            // an older place never moves the date backwards
            core.apply_mutation(
                &Mutation::AssignToTrip {
                    target: TripTarget::Existing(TripId::new("t2")),
                    place_ids: vec![PlaceId::new("a")],
                },
                &Value::Null,
            );
            assert_eq!(core.trips().get(&TripId::new("t2")).unwrap().latest_location_date, "2024-01-01");
            core.apply_mutation(
                &Mutation::AssignToTrip {
                    target: TripTarget::Existing(TripId::new("t1")),
                    place_ids: vec![PlaceId::new("a")],
                },
                &Value::Null,
            );
            assert_eq!(core.trips().get(&TripId::new("t1")).unwrap().latest_location_date, "2024-03-01");
        }

        #[test]
        fn test_assign_with_unknown_places_drops_cached_locations() {
            let mut core = loaded();
            open_rome(&mut core);
            let t1 = TripId::new("t1");
            assert!(core.details().location_cache().contains(&t1));

            let diff = core.apply_mutation(
                &Mutation::AssignToTrip {
                    target: TripTarget::Existing(t1.clone()),
                    place_ids: vec![PlaceId::new("c"), PlaceId::new("ghost")],
                },
                &Value::Null,
            );

            assert!(diff.refresh_detail);
            assert!(!core.details().location_cache().contains(&t1));
            // what is known is still shown until the refetch lands
            assert_eq!(core.detail().unwrap().locations.len(), 3);

            let (ticket, request) = core.reload_open_trip().unwrap().unwrap();
            assert_eq!(ticket.target, t1);
            assert_eq!(request.method, crate::capabilities::ApiMethod::Get);
            assert!(core.detail().unwrap().loading);
        }

        #[test]
        fn test_assign_with_unknown_places_to_closed_trip_only_invalidates() {
            let mut core = loaded();
            open_rome(&mut core);
            core.close_trip();

            let diff = core.apply_mutation(
                &Mutation::AssignToTrip {
                    target: TripTarget::Existing(TripId::new("t1")),
                    place_ids: vec![PlaceId::new("ghost")],
                },
                &Value::Null,
            );

            assert!(!diff.refresh_detail);
            assert!(!core.details().location_cache().contains(&TripId::new("t1")));
            assert_eq!(core.reload_open_trip().unwrap(), None);
        }

        #[test]
        fn test_rename_updates_memberships() {
            let mut core = loaded();
            open_rome(&mut core);
            core.apply_mutation(
                &Mutation::RenameTrip {
                    trip_id: TripId::new("t1"),
                    name: "Roma".into(),
                },
                &json!({ "trip": { "id": "t1", "name": "Roma" } }),
            );

            assert_eq!(core.trips().get(&TripId::new("t1")).unwrap().name, "Roma");
            assert_eq!(core.detail().unwrap().trip.name, "Roma");
            assert_eq!(core.detail().unwrap().locations.len(), 2);
            let b = &core.markers().get(&PlaceId::new("b")).unwrap().data;
            assert_eq!(b.trips[0].name, "Roma");
            assert_eq!(b.trips[1].name, "Oslo");
        }

        #[test]
        fn test_only_latest_description_applies() {
            let mut core = loaded();
            open_rome(&mut core);
            let first = core.begin_description_save(&TripId::new("t1"), "first".into());
            let second = core.begin_description_save(&TripId::new("t1"), "second".into());

            core.apply_mutation(&second, &json!({ "trip": { "id": "t1", "description": "second" } }));
            let diff = core.apply_mutation(&first, &json!({ "trip": { "id": "t1", "description": "first" } }));
            assert_eq!(diff, SyncDiff::default());
            assert_eq!(core.detail().unwrap().trip.description, "second");

            let diff = core.mutation_failed(&first, ApiFailure::Transport("late".into()));
            assert_eq!(diff, SyncDiff::default());
        }

        #[test]
        fn test_archive_patches_then_reloads() {
            let mut core = loaded();
            let diff = core.apply_mutation(
                &Mutation::ArchiveMarkers {
                    place_ids: vec![PlaceId::new("a")],
                },
                &json!({ "status": "success" }),
            );
            assert!(diff.reload_markers);
            assert!(!diff.refresh_trip_list);
            assert!(core.markers().get(&PlaceId::new("a")).unwrap().data.archived);
            assert_eq!(core.toast().unwrap().kind, ToastKind::Success);
        }
    }

    mod session_tests {
        use super::*;

        #[test]
        fn test_reset_discards_state_and_pending_loads() {
            let mut core = loaded();
            open_rome(&mut core);
            enter_manage_mode(&mut core);
            let (ticket, _) = core.begin_trip_list_load(false).unwrap();

            core.reset();
            assert!(core.trips().is_empty());
            assert!(core.detail().is_none());
            assert!(core.markers().is_empty());
            assert!(!core.selection().is_active());
            assert_eq!(
                core.frame().map_commands.last(),
                Some(&MapCommand::SetInteractions(InteractionFlags::default()))
            );

            core.apply_trip_list(ticket, Ok(json!([trip_json("late", "Late", 0)])));
            assert!(core.trips().is_empty());
        }

        #[test]
        fn test_configure_rejects_invalid() {
            let mut core = Coordinator::default();
            let bad = CoreConfig {
                location_cache_capacity: 0,
                ..CoreConfig::default()
            };
            assert_matches!(core.configure(bad), Err(ConfigError::ZeroCacheCapacity));
            assert_eq!(core.config(), &CoreConfig::default());
        }

        #[test]
        fn test_configure_keeps_chosen_sort() {
            use crate::trip_list::{SortDirection, TripSortField};

            let by_name = TripSort {
                field: TripSortField::Name,
                direction: SortDirection::Ascending,
            };
            let oldest_first = TripSort {
                field: TripSortField::LatestActivity,
                direction: SortDirection::Ascending,
            };

            let mut core = Coordinator::default();
            core.configure(CoreConfig {
                default_sort: oldest_first,
                ..CoreConfig::default()
            })
            .unwrap();
            assert_eq!(core.sort(), oldest_first);

            core.set_sort(by_name);
            core.configure(CoreConfig::default()).unwrap();
            assert_eq!(core.sort(), by_name);

            core.reset();
            assert_eq!(core.sort(), CoreConfig::default().default_sort);
        }

        #[test]
        fn test_selection_commands_collected_per_frame() {
            let mut core = loaded();
            enter_manage_mode(&mut core);
            assert_eq!(core.frame().map_commands.len(), 1);
            core.begin_frame();
            assert!(core.frame().map_commands.is_empty());

            let at = PointerSample {
                geo: LatLng::new(0.0, 0.0).unwrap(),
                screen: ScreenPoint { x: 0.0, y: 0.0 },
            };
            core.dispatch_selection(SelectionEvent::PointerDown {
                button: PointerButton::Primary,
                at,
                remove_modifier: false,
            })
            .unwrap();
            assert!(core.selection().selection_rect().is_some());
        }
    }

    proptest! {
        #[test]
        fn prop_selection_stays_within_index(
            picks in prop::collection::vec(prop::sample::select(vec!["a", "b", "c"]), 0..6),
            deleted in prop::collection::vec(prop::sample::select(vec!["a", "b", "c"]), 0..3),
        ) {
            let mut core = loaded();
            enter_manage_mode(&mut core);
            for pick in &picks {
                select(&mut core, pick);
            }
            let place_ids = deleted.iter().map(|d| PlaceId::new(*d)).collect();
            core.apply_mutation(&Mutation::DeleteMarkers { place_ids }, &Value::Null);

            let ids = core.markers().all_ids();
            prop_assert!(core.selection().selected().all(|id| ids.contains(id)));
        }
    }
}
