//! Data models for chipin entities.
//!
//! - `EventSummary`: list entry for the events feed
//! - `EventDetail`, `Participant`: a single event with its participants and funding
//! - `NewEvent`: payload for creating an event
//! - `StatusMessage`: acknowledgement returned by join and contribute

pub mod event;

pub use event::{EventDetail, EventSummary, NewEvent, Participant, StatusMessage};
