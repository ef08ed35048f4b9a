//! Device-authenticated upload client (C8, spec §4.7).

pub mod auth;
pub mod client;
pub mod transport;

pub use auth::DeviceAuth;
pub use client::{ConnectResult, UploadClient, UploadResult};
pub use transport::{HttpTransport, Transport};
