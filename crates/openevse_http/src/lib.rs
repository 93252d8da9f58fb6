//! Client for the OpenEVSE WiFi gateway's local API.
//!
//! Covers the JSON HTTP endpoints (`/status`, `/config`, `/override`,
//! `/claims`, `/limit`), the RAPI pass-through at `/r`, the `/ws` push
//! channel and the upstream firmware release lookup.

mod client;
mod error;
mod readings;
mod requests;
mod version;
mod websocket;

pub use client::Callback;
pub use client::ClientOptions;
pub use client::OpenEvse;
pub use error::ClientError;
pub use readings::Readings;
pub use requests::ClaimRequest;
pub use requests::FirmwareRelease;
pub use requests::Identity;
pub use requests::LimitRequest;
pub use requests::OverrideRequest;
pub use version::FirmwareVersion;
pub use websocket::WsState;
