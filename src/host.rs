//! Host platform boundary
//!
//! These are the calls the bridge makes into whatever hosts it: a SignalK
//! server, or the standalone web host in the `mayara-bridge` binary.
//! They cover status reporting, provider registration and binary frame
//! emission.

use std::sync::Arc;

use crate::provider::RadarProvider;

/// Stream key under which a device's frames are emitted.
pub fn stream_key(device_id: &str) -> String {
    format!("radars/{}", device_id)
}

/// Receives every binary frame a relay reads, unmodified.
pub trait StreamSink: Send + Sync {
    /// Emit one frame to downstream clients.
    ///
    /// Returns true if at least one client received the data.
    fn emit_frame(&self, stream_key: &str, frame: &[u8]) -> bool;
}

/// Human-readable plugin status, as shown by the host.
pub trait StatusReporter: Send + Sync {
    fn set_status(&self, msg: &str);
    fn set_error(&self, msg: &str);
}

/// Registration of the radar provider method surface.
pub trait ProviderRegistry: Send + Sync {
    /// Returns true on success, false if the host refused the registration.
    fn register_provider(&self, provider_id: &str, provider: Arc<RadarProvider>) -> bool;

    fn unregister_provider(&self, provider_id: &str);
}
