//! Multi-camera capture, alignment and live detection broadcast.
//!
//! Camera workers acquire frames on their own threads, warp them into a
//! common reference view and hand them to the [`hub::BroadcastHub`] through
//! latest-value channels. The hub fans JPEG frames out to WebSocket
//! subscribers per source and runs the designated source through a
//! [`detect::DetectionStage`], broadcasting boxes and keeping a history of
//! every tracked object.

pub mod capture;
pub mod channel;
pub mod codec;
pub mod config;
pub mod detect;
pub mod frame;
pub mod hub;
pub mod registry;
pub mod server;
pub mod track;
pub mod transform;

pub use config::Config;
pub use frame::Frame;
pub use hub::{BroadcastHub, HubError, HubState};
