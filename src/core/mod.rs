//! Playback engine - buffer exchange, clip/track/main workflows, events
//!
//! Independent of any UI: hosts drive `MainWorkflow` (or single tracks) and
//! composite the returned buffers themselves.

pub mod clip_state;
pub mod clip_workflow;
pub mod event_bus;
pub mod main_workflow;
pub mod stacked_buffer;
pub mod track_workflow;
pub mod workflow_events;

pub use clip_state::ClipState;
pub use clip_workflow::ClipWorkflow;
pub use event_bus::EventBus;
pub use main_workflow::MainWorkflow;
pub use track_workflow::TrackWorkflow;
