mod http;

pub use self::http::{
    interpret_response, read_response, ApiEndpoints, ApiFailure, ApiMethod, ApiRequest, ApiResult,
    MarkerFilter, TripTarget, MAX_RESPONSE_BODY_SIZE,
};

pub use crux_core::render::Render;
pub use crux_http::Http;

use crate::event::Event;
use crate::App;

// The Effect derive reads the event type off each field's generic argument;
// type aliases hide it.
#[derive(crux_core::macros::Effect)]
pub struct Capabilities {
    pub http: Http<Event>,
    pub render: Render<Event>,
}
