//! Media source interface.
//!
//! The platform's capture layer (camera, microphone, screen share) sits
//! behind these traits; the call core only acquires, toggles, replaces and
//! stops tracks. Acquisition is the one human-scale suspension point in a
//! call — it may wait on a permission prompt.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::MediaError;
use crate::types::MediaKind;

/// Produces local capture tracks on request.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Capture one track per requested kind.
    ///
    /// Fails with a [`MediaError`] naming the actionable cause; the call
    /// core reports it and never retries.
    async fn acquire(&self, kinds: &[MediaKind]) -> Result<Vec<Arc<dyn MediaTrack>>, MediaError>;
}

/// One local capture track attached to the transport.
#[async_trait]
pub trait MediaTrack: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    /// Enable or disable the track without renegotiation (mute/unmute,
    /// video on/off). The transport keeps carrying the track either way.
    fn set_enabled(&self, enabled: bool);

    fn is_enabled(&self) -> bool;

    /// Stop capturing and release the underlying device.
    fn stop(&self);

    /// Resolves when the track ends on its own, e.g. the user revokes a
    /// shared source. Used to auto-revert a switched media source.
    async fn ended(&self);
}
