use serde::{Deserialize, Serialize};

use crate::capabilities::{ApiResult, MarkerFilter, TripTarget};
use crate::config::CoreConfig;
use crate::model::{PlaceId, TripId};
use crate::selection::SelectionEvent;
use crate::sync::{LoadTicket, Mutation};
use crate::trip_detail::RequestTicket;
use crate::trip_list::TripSort;

/// Everything the shell (or a completed request) can tell the core.
///
/// `place_ids: None` on bulk marker operations means "the current
/// selection".
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum Event {
    Noop,

    // Session
    Configure(CoreConfig),
    ResetSession,

    // Trip list
    RefreshTrips,
    SearchTrips {
        term: String,
    },
    SortTrips(TripSort),

    // Trip detail
    OpenTrip {
        trip_id: TripId,
    },
    CloseTrip,

    // Markers
    ReloadMarkers(Option<MarkerFilter>),

    // Mutations
    CreateTrip {
        name: String,
        description: String,
    },
    RenameTrip {
        trip_id: TripId,
        name: String,
    },
    SaveTripDescription {
        trip_id: TripId,
        description: String,
    },
    DeleteTrip {
        trip_id: TripId,
    },
    AssignToTrip {
        target: TripTarget,
        place_ids: Option<Vec<String>>,
    },
    RemoveFromTrip {
        trip_id: TripId,
        place_id: PlaceId,
    },
    ArchiveMarkers {
        place_ids: Option<Vec<String>>,
    },
    DeleteMarkers {
        place_ids: Option<Vec<String>>,
    },

    // Manage mode
    Selection(SelectionEvent),

    DismissToast,

    // Request completions
    TripsLoaded {
        ticket: LoadTicket,
        result: ApiResult,
    },
    TripDetailLoaded {
        ticket: RequestTicket,
        result: ApiResult,
    },
    MarkersLoaded {
        ticket: LoadTicket,
        result: ApiResult,
    },
    MutationCompleted {
        mutation: Box<Mutation>,
        result: ApiResult,
    },
}

impl Event {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Noop => "noop",
            Self::Configure(_) => "configure",
            Self::ResetSession => "reset_session",
            Self::RefreshTrips => "refresh_trips",
            Self::SearchTrips { .. } => "search_trips",
            Self::SortTrips(_) => "sort_trips",
            Self::OpenTrip { .. } => "open_trip",
            Self::CloseTrip => "close_trip",
            Self::ReloadMarkers(_) => "reload_markers",
            Self::CreateTrip { .. } => "create_trip",
            Self::RenameTrip { .. } => "rename_trip",
            Self::SaveTripDescription { .. } => "save_trip_description",
            Self::DeleteTrip { .. } => "delete_trip",
            Self::AssignToTrip { .. } => "assign_to_trip",
            Self::RemoveFromTrip { .. } => "remove_from_trip",
            Self::ArchiveMarkers { .. } => "archive_markers",
            Self::DeleteMarkers { .. } => "delete_markers",
            Self::Selection(e) => e.name(),
            Self::DismissToast => "dismiss_toast",
            Self::TripsLoaded { .. } => "trips_loaded",
            Self::TripDetailLoaded { .. } => "trip_detail_loaded",
            Self::MarkersLoaded { .. } => "markers_loaded",
            Self::MutationCompleted { .. } => "mutation_completed",
        }
    }

    /// Completions arrive from the network rather than from the user.
    #[must_use]
    pub fn is_user_initiated(&self) -> bool {
        !matches!(
            self,
            Self::Noop
                | Self::TripsLoaded { .. }
                | Self::TripDetailLoaded { .. }
                | Self::MarkersLoaded { .. }
                | Self::MutationCompleted { .. }
        )
    }
}
