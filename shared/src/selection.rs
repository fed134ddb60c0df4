//! Manage-mode selection state machine.
//!
//! Pointer and keyboard input arrives as [`SelectionEvent`]s and goes through
//! [`SelectionMachine::dispatch`], which checks transition legality and returns
//! what changed plus any imperative [`MapCommand`]s for the shell.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::marker_index::MarkerIndex;
use crate::model::{GeoBounds, LatLng, PlaceId};

/// Pixel displacement (per axis) below which a primary-button release is a click.
pub const DEFAULT_DRAG_THRESHOLD_PX: f64 = 5.0;

// ============================================================================
// Inputs
// ============================================================================

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScreenPoint {
    pub x: f64,
    pub y: f64,
}

/// One pointer position in both coordinate spaces.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PointerSample {
    pub geo: LatLng,
    pub screen: ScreenPoint,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PointerButton {
    Primary,
    Middle,
    Secondary,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Key {
    Escape,
    Other(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SelectionEvent {
    /// `current` is the map's interaction state right before entering.
    EnterManageMode { current: InteractionFlags },
    ExitManageMode,
    PointerDown {
        button: PointerButton,
        at: PointerSample,
        /// Modifier held at press time; selects [`SelectionMode::Remove`].
        remove_modifier: bool,
    },
    PointerMove { at: PointerSample },
    /// A release only ends the gesture its button started.
    PointerUp { button: PointerButton, at: PointerSample },
    PointerLeave,
    KeyDown { key: Key, modal_open: bool },
    ToggleMarker { id: PlaceId },
    ClearSelection,
}

impl SelectionEvent {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::EnterManageMode { .. } => "enter_manage_mode",
            Self::ExitManageMode => "exit_manage_mode",
            Self::PointerDown { .. } => "pointer_down",
            Self::PointerMove { .. } => "pointer_move",
            Self::PointerUp { .. } => "pointer_up",
            Self::PointerLeave => "pointer_leave",
            Self::KeyDown { .. } => "key_down",
            Self::ToggleMarker { .. } => "toggle_marker",
            Self::ClearSelection => "clear_selection",
        }
    }
}

// ============================================================================
// State
// ============================================================================

/// Map interaction toggles the shell exposes. Captured on entering manage
/// mode and restored verbatim on exit.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct InteractionFlags {
    pub dragging: bool,
    pub scroll_wheel_zoom: bool,
    pub box_zoom: bool,
    pub double_click_zoom: bool,
    pub touch_zoom: bool,
    pub keyboard: bool,
}

impl Default for InteractionFlags {
    fn default() -> Self {
        Self {
            dragging: true,
            scroll_wheel_zoom: true,
            box_zoom: true,
            double_click_zoom: true,
            touch_zoom: true,
            keyboard: true,
        }
    }
}

impl InteractionFlags {
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            dragging: false,
            scroll_wheel_zoom: false,
            box_zoom: false,
            double_click_zoom: false,
            touch_zoom: false,
            keyboard: false,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectionMode {
    Add,
    Remove,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DragGesture {
    pub mode: SelectionMode,
    pub start: PointerSample,
    pub current: PointerSample,
}

impl DragGesture {
    #[must_use]
    pub fn bounds(&self) -> GeoBounds {
        GeoBounds::from_corners(self.start.geo, self.current.geo)
    }

    fn exceeds(&self, threshold_px: f64) -> bool {
        let dx = (self.current.screen.x - self.start.screen.x).abs();
        let dy = (self.current.screen.y - self.start.screen.y).abs();
        dx >= threshold_px || dy >= threshold_px
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PanGesture {
    pub last: ScreenPoint,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum ManageState {
    #[default]
    Inactive,
    Idle,
    Dragging(DragGesture),
    Panning(PanGesture),
}

impl ManageState {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Idle => "idle",
            Self::Dragging(_) => "dragging",
            Self::Panning(_) => "panning",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GestureKind {
    Dragging,
    Panning,
}

// ============================================================================
// Outputs
// ============================================================================

/// Imperative map effects, applied by the shell in order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MapCommand {
    /// Immediate viewport translation in pixels, no animation.
    PanBy { dx: f64, dy: f64 },
    SetInteractions(InteractionFlags),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectionOutcome {
    pub selection_changed: bool,
    pub state_changed: bool,
    pub commands: Vec<MapCommand>,
}

impl SelectionOutcome {
    fn state() -> Self {
        Self {
            state_changed: true,
            ..Self::default()
        }
    }

    fn selection(changed: bool) -> Self {
        Self {
            selection_changed: changed,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectionError {
    #[error("manage mode is not active")]
    NotInManageMode,
    #[error("a {0} gesture is already in progress")]
    GestureInProgress(&'static str),
    #[error("no gesture in progress")]
    NoGesture,
    #[error("marker {0} is not on the map")]
    UnknownMarker(PlaceId),
}

// ============================================================================
// Machine
// ============================================================================

#[derive(Debug)]
pub struct SelectionMachine {
    state: ManageState,
    selected: BTreeSet<PlaceId>,
    saved_flags: Option<InteractionFlags>,
    threshold_px: f64,
}

impl Default for SelectionMachine {
    fn default() -> Self {
        Self::new(DEFAULT_DRAG_THRESHOLD_PX)
    }
}

impl SelectionMachine {
    #[must_use]
    pub fn new(threshold_px: f64) -> Self {
        Self {
            state: ManageState::Inactive,
            selected: BTreeSet::new(),
            saved_flags: None,
            threshold_px,
        }
    }

    pub fn set_threshold(&mut self, threshold_px: f64) {
        self.threshold_px = threshold_px;
    }

    #[must_use]
    pub fn state(&self) -> &ManageState {
        &self.state
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        !matches!(self.state, ManageState::Inactive)
    }

    #[must_use]
    pub fn gesture(&self) -> Option<GestureKind> {
        match self.state {
            ManageState::Dragging(_) => Some(GestureKind::Dragging),
            ManageState::Panning(_) => Some(GestureKind::Panning),
            _ => None,
        }
    }

    /// Live rectangle of an in-progress drag.
    #[must_use]
    pub fn selection_rect(&self) -> Option<GeoBounds> {
        match &self.state {
            ManageState::Dragging(drag) => Some(drag.bounds()),
            _ => None,
        }
    }

    pub fn selected(&self) -> impl Iterator<Item = &PlaceId> {
        self.selected.iter()
    }

    #[must_use]
    pub fn selected_ids(&self) -> Vec<PlaceId> {
        self.selected.iter().cloned().collect()
    }

    #[must_use]
    pub fn is_selected(&self, id: &PlaceId) -> bool {
        self.selected.contains(id)
    }

    #[must_use]
    pub fn selection_len(&self) -> usize {
        self.selected.len()
    }

    /// Adds `id` if the index knows it. Returns `true` if the set changed.
    pub fn select(&mut self, id: &PlaceId, index: &MarkerIndex) -> bool {
        index.contains(id) && self.selected.insert(id.clone())
    }

    pub fn deselect(&mut self, id: &PlaceId) -> bool {
        self.selected.remove(id)
    }

    pub fn clear(&mut self) -> bool {
        let changed = !self.selected.is_empty();
        self.selected.clear();
        changed
    }

    /// Drops ids no longer present in `index`. Returns how many were dropped.
    pub fn prune(&mut self, index: &MarkerIndex) -> usize {
        let before = self.selected.len();
        self.selected.retain(|id| index.contains(id));
        let pruned = before - self.selected.len();
        if pruned > 0 {
            debug!(pruned, "pruned selection after marker reload");
        }
        pruned
    }

    /// Back to the freshly-constructed state; the threshold is kept.
    pub fn reset(&mut self) {
        self.state = ManageState::Inactive;
        self.selected.clear();
        self.saved_flags = None;
    }

    pub fn dispatch(
        &mut self,
        event: SelectionEvent,
        index: &MarkerIndex,
    ) -> Result<SelectionOutcome, SelectionError> {
        match event {
            SelectionEvent::EnterManageMode { current } => Ok(self.enter(current)),
            SelectionEvent::ExitManageMode => Ok(self.exit()),
            SelectionEvent::PointerDown {
                button,
                at,
                remove_modifier,
            } => self.pointer_down(button, at, remove_modifier),
            SelectionEvent::PointerMove { at } => Ok(self.pointer_move(at)),
            SelectionEvent::PointerUp { button, at } => {
                if self.released_by(button) {
                    self.pointer_up(Some(at), index)
                } else {
                    debug!(?button, "release of another button ignored");
                    Ok(SelectionOutcome::default())
                }
            }
            SelectionEvent::PointerLeave => match self.state {
                ManageState::Dragging(_) | ManageState::Panning(_) => self.pointer_up(None, index),
                _ => Ok(SelectionOutcome::default()),
            },
            SelectionEvent::KeyDown { key, modal_open } => {
                if key == Key::Escape && !modal_open && self.is_active() {
                    Ok(self.exit())
                } else {
                    Ok(SelectionOutcome::default())
                }
            }
            SelectionEvent::ToggleMarker { id } => {
                if !self.is_active() {
                    return Err(SelectionError::NotInManageMode);
                }
                if !index.contains(&id) {
                    return Err(SelectionError::UnknownMarker(id));
                }
                if !self.deselect(&id) {
                    self.selected.insert(id);
                }
                Ok(SelectionOutcome::selection(true))
            }
            SelectionEvent::ClearSelection => Ok(SelectionOutcome::selection(self.clear())),
        }
    }

    fn enter(&mut self, current: InteractionFlags) -> SelectionOutcome {
        if self.is_active() {
            debug!("manage mode already active; keeping saved interaction flags");
            return SelectionOutcome::default();
        }
        self.saved_flags = Some(current);
        self.state = ManageState::Idle;
        SelectionOutcome {
            commands: vec![MapCommand::SetInteractions(InteractionFlags::disabled())],
            ..SelectionOutcome::state()
        }
    }

    fn exit(&mut self) -> SelectionOutcome {
        if !self.is_active() {
            return SelectionOutcome::default();
        }
        self.state = ManageState::Inactive;
        let restored = self.saved_flags.take().unwrap_or_default();
        SelectionOutcome {
            selection_changed: self.clear(),
            state_changed: true,
            commands: vec![MapCommand::SetInteractions(restored)],
        }
    }

    fn pointer_down(
        &mut self,
        button: PointerButton,
        at: PointerSample,
        remove_modifier: bool,
    ) -> Result<SelectionOutcome, SelectionError> {
        match self.state {
            ManageState::Inactive => Err(SelectionError::NotInManageMode),
            ManageState::Dragging(_) | ManageState::Panning(_) => {
                Err(SelectionError::GestureInProgress(self.state.name()))
            }
            ManageState::Idle => {
                match button {
                    PointerButton::Primary => {
                        let mode = if remove_modifier {
                            SelectionMode::Remove
                        } else {
                            SelectionMode::Add
                        };
                        self.state = ManageState::Dragging(DragGesture {
                            mode,
                            start: at,
                            current: at,
                        });
                    }
                    PointerButton::Middle => {
                        self.state = ManageState::Panning(PanGesture { last: at.screen });
                    }
                    PointerButton::Secondary => return Ok(SelectionOutcome::default()),
                }
                Ok(SelectionOutcome::state())
            }
        }
    }

    fn pointer_move(&mut self, at: PointerSample) -> SelectionOutcome {
        match &mut self.state {
            ManageState::Dragging(drag) => {
                drag.current = at;
                SelectionOutcome::state()
            }
            ManageState::Panning(pan) => {
                let dx = at.screen.x - pan.last.x;
                let dy = at.screen.y - pan.last.y;
                pan.last = at.screen;
                SelectionOutcome {
                    commands: vec![MapCommand::PanBy { dx: -dx, dy: -dy }],
                    ..SelectionOutcome::default()
                }
            }
            _ => SelectionOutcome::default(),
        }
    }

    /// Ends the current gesture. `at == None` means the pointer left the map
    /// and the last known sample is used.
    fn released_by(&self, button: PointerButton) -> bool {
        match self.state {
            ManageState::Dragging(_) => button == PointerButton::Primary,
            ManageState::Panning(_) => button == PointerButton::Middle,
            ManageState::Inactive | ManageState::Idle => true,
        }
    }

    fn pointer_up(
        &mut self,
        at: Option<PointerSample>,
        index: &MarkerIndex,
    ) -> Result<SelectionOutcome, SelectionError> {
        match std::mem::replace(&mut self.state, ManageState::Idle) {
            ManageState::Inactive => {
                self.state = ManageState::Inactive;
                Err(SelectionError::NotInManageMode)
            }
            ManageState::Idle => Err(SelectionError::NoGesture),
            ManageState::Panning(_) => Ok(SelectionOutcome::state()),
            ManageState::Dragging(mut drag) => {
                if let Some(at) = at {
                    drag.current = at;
                }
                if !drag.exceeds(self.threshold_px) {
                    debug!("drag below threshold treated as click");
                    return Ok(SelectionOutcome::state());
                }
                let hits = index.ids_within(&drag.bounds());
                let changed = match drag.mode {
                    SelectionMode::Add => hits
                        .into_iter()
                        .fold(false, |acc, id| self.selected.insert(id) || acc),
                    SelectionMode::Remove => hits
                        .iter()
                        .fold(false, |acc, id| self.selected.remove(id) || acc),
                };
                debug!(mode = ?drag.mode, selected = self.selected.len(), "box selection applied");
                Ok(SelectionOutcome {
                    selection_changed: changed,
                    ..SelectionOutcome::state()
                })
            }
        }
    }
}
