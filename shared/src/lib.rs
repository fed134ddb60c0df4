#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod capabilities;
pub mod config;
pub mod event;
pub mod marker_index;
pub mod model;
pub mod normalize;
pub mod selection;
pub mod sync;
pub mod time;
pub mod trip_detail;
pub mod trip_list;

use std::collections::HashMap;

use geojson::FeatureCollection;
use serde::{Deserialize, Serialize};

pub use app::App;
pub use capabilities::{ApiFailure, Capabilities, Effect, MarkerFilter, TripTarget};
pub use config::{ConfigError, CoreConfig};
pub use crux_core::{render::Render, App as CruxApp};
pub use event::Event;
pub use model::{GeoBounds, LatLng, Marker, PlaceId, Trip, TripId, TripPatch, TripRef};
pub use selection::{GestureKind, MapCommand, SelectionEvent};
pub use sync::{Coordinator, Mutation, SyncDiff};
pub use trip_list::{SortDirection, TripSort, TripSortField};

use marker_index::MarkerHandle;

pub const DESCRIPTION_PREVIEW_LENGTH: usize = 80;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Network,
    Timeout,
    Validation,
    NotFound,
    Conflict,
    Server,
    Deserialization,
    Unknown,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Network => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Validation => "VALIDATION_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::Server => "SERVER_ERROR",
            Self::Deserialization => "DESERIALIZATION_ERROR",
            Self::Unknown => "UNKNOWN_ERROR",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppError {
    pub kind: ErrorKind,
    pub message: String,
    pub context: HashMap<String, String>,
}

impl AppError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.kind.code()
    }

    #[must_use]
    pub fn user_facing_message(&self) -> String {
        match self.kind {
            ErrorKind::Network => {
                "Unable to connect. Please check your connection and try again.".into()
            }
            ErrorKind::Timeout => "The request timed out. Please try again.".into(),
            ErrorKind::Validation | ErrorKind::Server if !self.message.is_empty() => {
                self.message.clone()
            }
            ErrorKind::NotFound => "The requested item could not be found.".into(),
            ErrorKind::Conflict => {
                "This action conflicts with a recent change. Please refresh and try again.".into()
            }
            ErrorKind::Deserialization => "The server sent an unexpected response.".into(),
            ErrorKind::Validation | ErrorKind::Server | ErrorKind::Unknown => {
                "An unexpected error occurred. Please try again.".into()
            }
        }
    }

    #[must_use]
    pub fn from_http_status(status: u16, message: Option<&str>) -> Self {
        let kind = match status {
            400 | 422 => ErrorKind::Validation,
            404 => ErrorKind::NotFound,
            408 | 504 => ErrorKind::Timeout,
            409 => ErrorKind::Conflict,
            500..=599 => ErrorKind::Server,
            _ => ErrorKind::Unknown,
        };
        let message = message
            .filter(|m| !m.trim().is_empty())
            .map_or_else(|| format!("HTTP error: {status}"), str::to_string);

        Self::new(kind, message).with_context("http_status", status.to_string())
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code(), self.message)
    }
}

impl std::error::Error for AppError {}

impl From<ApiFailure> for AppError {
    fn from(failure: ApiFailure) -> Self {
        match failure {
            ApiFailure::Transport(detail) => AppError::new(ErrorKind::Network, detail),
            ApiFailure::Status { code, message } => AppError::from_http_status(code, Some(&message)),
            ApiFailure::Decode(detail) => AppError::new(ErrorKind::Deserialization, detail),
            ApiFailure::Server { message } => AppError::new(ErrorKind::Server, message),
            ApiFailure::InvalidUrl(url) => {
                AppError::new(ErrorKind::Validation, format!("Invalid request URL: {url}"))
            }
        }
    }
}

impl From<ConfigError> for AppError {
    fn from(e: ConfigError) -> Self {
        AppError::new(ErrorKind::Validation, e.to_string())
    }
}

// ============================================================================
// Toasts
// ============================================================================

#[must_use]
pub fn get_current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToastMessage {
    pub message: String,
    pub kind: ToastKind,
    pub created_at_ms: u64,
    pub duration_ms: u32,
}

impl ToastMessage {
    #[must_use]
    pub fn new(message: impl Into<String>, kind: ToastKind, duration_ms: u32) -> Self {
        Self {
            message: message.into(),
            kind,
            created_at_ms: get_current_time_ms(),
            duration_ms,
        }
    }

    #[must_use]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.created_at_ms) > u64::from(self.duration_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToastKind {
    #[default]
    Info,
    Success,
    Warning,
    Error,
}

// ============================================================================
// Model & view
// ============================================================================

#[derive(Debug, Default)]
pub struct Model {
    pub core: Coordinator,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TripListItem {
    pub id: String,
    pub name: String,
    pub location_count: u32,
    pub count_label: String,
    pub activity_label: String,
    pub description_preview: String,
    pub google_photos_url: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LocationItem {
    pub id: String,
    pub display_name: String,
    pub address: String,
    pub date: String,
    pub source_type: String,
    pub lat: f64,
    pub lng: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TripDetailView {
    pub summary: TripListItem,
    pub description: String,
    pub created_at: String,
    pub updated_at: String,
    pub locations: Vec<LocationItem>,
    pub loading: bool,
    pub from_cache: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToastView {
    pub message: String,
    pub kind: ToastKind,
    pub duration_ms: u32,
}

impl From<&ToastMessage> for ToastView {
    fn from(t: &ToastMessage) -> Self {
        Self {
            message: t.message.clone(),
            kind: t.kind,
            duration_ms: t.duration_ms,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ViewModel {
    pub trips: Vec<TripListItem>,
    pub trip_search: String,
    pub trip_sort: TripSort,
    pub trips_loading: bool,
    pub detail: Option<TripDetailView>,
    pub marker_layer: FeatureCollection,
    pub marker_count: usize,
    pub markers_loading: bool,
    pub manage_mode: bool,
    pub gesture: Option<GestureKind>,
    pub selected_ids: Vec<String>,
    pub selection_rect: Option<GeoBounds>,
    /// Apply in order after rendering.
    pub map_commands: Vec<MapCommand>,
    pub removed_marker_handles: Vec<MarkerHandle>,
    pub toast: Option<ToastView>,
}

pub mod app {
    use super::*;
    use crate::capabilities::{read_response, ApiMethod, ApiRequest, ApiResult};
    use crate::sync::Mutation;
    use tracing::{debug, error, warn};

    #[derive(Default)]
    pub struct App;

    impl App {
        fn send<F>(request: ApiRequest, caps: &Capabilities, make_event: F)
        where
            F: FnOnce(ApiResult) -> Event + Send + 'static,
        {
            let ApiRequest { method, url, body } = request;
            let mut builder = match method {
                ApiMethod::Get => caps.http.get(&url),
                ApiMethod::Post => caps.http.post(&url),
                ApiMethod::Patch => caps.http.patch(&url),
                ApiMethod::Delete => caps.http.delete(&url),
            };

            if let Some(body) = body {
                let bytes = match serde_json::to_vec(&body) {
                    Ok(b) => b,
                    Err(e) => {
                        error!(url = %url, error = %e, "request body serialization failed");
                        return;
                    }
                };
                builder = builder
                    .header("Content-Type", "application/json")
                    .body(bytes);
            }

            builder.send(move |result| make_event(read_response(result)));
        }

        fn load_trips(core: &mut Coordinator, caps: &Capabilities, best_effort: bool) -> SyncDiff {
            match core.begin_trip_list_load(best_effort) {
                Ok((ticket, request)) => {
                    Self::send(request, caps, move |result| Event::TripsLoaded { ticket, result });
                    SyncDiff {
                        trip_list_changed: !best_effort,
                        ..SyncDiff::default()
                    }
                }
                Err(e) => core.report(&e),
            }
        }

        fn load_markers(
            core: &mut Coordinator,
            caps: &Capabilities,
            filter: Option<MarkerFilter>,
            best_effort: bool,
        ) -> SyncDiff {
            match core.begin_marker_reload(filter, best_effort) {
                Ok((ticket, request)) => {
                    Self::send(request, caps, move |result| Event::MarkersLoaded { ticket, result });
                    SyncDiff {
                        markers_changed: true,
                        ..SyncDiff::default()
                    }
                }
                Err(e) => core.report(&e),
            }
        }

        fn mutate(core: &mut Coordinator, caps: &Capabilities, mutation: Mutation) -> SyncDiff {
            match core.prepare_mutation(mutation) {
                Ok((mutation, request)) => {
                    Self::send(request, caps, move |result| Event::MutationCompleted {
                        mutation: Box::new(mutation),
                        result,
                    });
                    SyncDiff::default()
                }
                Err(e) => core.report(&e),
            }
        }

        /// Issues the reloads a diff asks for. Both are best-effort: the
        /// primary operation already succeeded.
        fn follow_up(diff: &SyncDiff, core: &mut Coordinator, caps: &Capabilities) -> SyncDiff {
            let mut extra = SyncDiff::default();
            if diff.reload_markers {
                extra.merge(&Self::load_markers(core, caps, None, true));
            }
            if diff.refresh_trip_list {
                extra.merge(&Self::load_trips(core, caps, true));
            }
            if diff.refresh_detail {
                match core.reload_open_trip() {
                    Ok(Some((ticket, request))) => {
                        Self::send(request, caps, move |result| Event::TripDetailLoaded {
                            ticket,
                            result,
                        });
                        extra.detail_changed = true;
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "could not reload trip detail"),
                }
            }
            extra
        }

        fn handle(event: Event, core: &mut Coordinator, caps: &Capabilities) -> SyncDiff {
            match event {
                Event::Noop => SyncDiff::default(),

                Event::Configure(config) => match core.configure(config) {
                    Ok(()) => SyncDiff::default(),
                    Err(e) => core.report(&AppError::from(e)),
                },
                Event::ResetSession => core.reset(),

                Event::RefreshTrips => Self::load_trips(core, caps, false),
                Event::SearchTrips { term } => core.set_search(term),
                Event::SortTrips(sort) => core.set_sort(sort),

                Event::OpenTrip { trip_id } => match core.open_trip(&trip_id) {
                    Ok((ticket, request)) => {
                        Self::send(request, caps, move |result| Event::TripDetailLoaded {
                            ticket,
                            result,
                        });
                        SyncDiff {
                            detail_changed: true,
                            ..SyncDiff::default()
                        }
                    }
                    Err(e) => core.report(&e),
                },
                Event::CloseTrip => core.close_trip(),

                Event::ReloadMarkers(filter) => Self::load_markers(core, caps, filter, false),

                Event::CreateTrip { name, description } => {
                    Self::mutate(core, caps, Mutation::CreateTrip { name, description })
                }
                Event::RenameTrip { trip_id, name } => {
                    Self::mutate(core, caps, Mutation::RenameTrip { trip_id, name })
                }
                Event::SaveTripDescription {
                    trip_id,
                    description,
                } => {
                    let mutation = core.begin_description_save(&trip_id, description);
                    Self::mutate(core, caps, mutation)
                }
                Event::DeleteTrip { trip_id } => Self::mutate(core, caps, Mutation::DeleteTrip { trip_id }),
                Event::AssignToTrip { target, place_ids } => {
                    let place_ids = core.resolve_place_ids(place_ids);
                    Self::mutate(core, caps, Mutation::AssignToTrip { target, place_ids })
                }
                Event::RemoveFromTrip { trip_id, place_id } => {
                    Self::mutate(core, caps, Mutation::RemoveFromTrip { trip_id, place_id })
                }
                Event::ArchiveMarkers { place_ids } => {
                    let place_ids = core.resolve_place_ids(place_ids);
                    Self::mutate(core, caps, Mutation::ArchiveMarkers { place_ids })
                }
                Event::DeleteMarkers { place_ids } => {
                    let place_ids = core.resolve_place_ids(place_ids);
                    Self::mutate(core, caps, Mutation::DeleteMarkers { place_ids })
                }

                Event::Selection(selection_event) => match core.dispatch_selection(selection_event) {
                    Ok(diff) => diff,
                    Err(e) => {
                        debug!(error = %e, "selection event ignored");
                        SyncDiff::default()
                    }
                },
                Event::DismissToast => core.dismiss_toast(),

                Event::TripsLoaded { ticket, result } => core.apply_trip_list(ticket, result),
                Event::TripDetailLoaded { ticket, result } => core.apply_trip_detail(&ticket, result),
                Event::MarkersLoaded { ticket, result } => core.apply_marker_reload(ticket, result),
                Event::MutationCompleted { mutation, result } => match result {
                    Ok(payload) => core.apply_mutation(&mutation, &payload),
                    Err(failure) => core.mutation_failed(&mutation, failure),
                },
            }
        }

        fn build_trip_item(trip: &Trip) -> TripListItem {
            let count_label = if trip.location_count == 1 {
                "1 location".to_string()
            } else {
                format!("{} locations", trip.location_count)
            };
            let description_preview = if trip.description.chars().count() > DESCRIPTION_PREVIEW_LENGTH {
                let mut preview: String = trip
                    .description
                    .chars()
                    .take(DESCRIPTION_PREVIEW_LENGTH - 1)
                    .collect();
                preview.push('…');
                preview
            } else {
                trip.description.clone()
            };

            TripListItem {
                id: trip.id.to_string(),
                name: trip.name.clone(),
                location_count: trip.location_count,
                count_label,
                activity_label: time::format_activity_label(trip.activity_date()).unwrap_or_default(),
                description_preview,
                google_photos_url: trip.google_photos_url.clone(),
            }
        }

        fn build_location_item(marker: &Marker) -> LocationItem {
            LocationItem {
                id: marker.id.to_string(),
                display_name: marker.display_name().to_string(),
                address: marker.address.clone(),
                date: marker.date.clone(),
                source_type: marker.source_type.clone(),
                lat: marker.position.lat,
                lng: marker.position.lng,
            }
        }
    }

    impl crux_core::App for App {
        type Event = Event;
        type Model = Model;
        type ViewModel = ViewModel;
        type Capabilities = Capabilities;

        fn update(&self, event: Self::Event, model: &mut Self::Model, caps: &Self::Capabilities) {
            debug!(
                event = event.name(),
                user_initiated = event.is_user_initiated(),
                "update"
            );
            let core = &mut model.core;
            core.begin_frame();

            let mut diff = Self::handle(event, core, caps);
            let extra = Self::follow_up(&diff, core, caps);
            diff.merge(&extra);

            let frame = core.frame();
            if diff.needs_render() || !frame.map_commands.is_empty() || !frame.removed_handles.is_empty() {
                caps.render.render();
            }
        }

        fn view(&self, model: &Self::Model) -> Self::ViewModel {
            let core = &model.core;
            let selection = core.selection();

            let detail = core.detail().map(|d| TripDetailView {
                summary: Self::build_trip_item(&d.trip),
                description: d.trip.description.clone(),
                created_at: d.trip.created_at.clone(),
                updated_at: d.trip.updated_at.clone(),
                locations: d.locations.iter().map(Self::build_location_item).collect(),
                loading: d.loading,
                from_cache: d.from_cache,
            });

            ViewModel {
                trips: core
                    .visible_trips()
                    .into_iter()
                    .map(Self::build_trip_item)
                    .collect(),
                trip_search: core.search().to_string(),
                trip_sort: core.sort(),
                trips_loading: core.trips_loading(),
                detail,
                marker_layer: core
                    .markers()
                    .to_feature_collection(|id| selection.is_selected(id)),
                marker_count: core.markers().len(),
                markers_loading: core.markers_loading(),
                manage_mode: selection.is_active(),
                gesture: selection.gesture(),
                selected_ids: selection.selected().map(ToString::to_string).collect(),
                selection_rect: selection.selection_rect(),
                map_commands: core.frame().map_commands.clone(),
                removed_marker_handles: core.frame().removed_handles.clone(),
                toast: core.toast().map(ToastView::from),
            }
        }
    }
}
