//! Device capabilities the core consumes.
//!
//! Each trait is one native collaborator (location service, accelerometer,
//! microphone, audio player, dialer, push service). Streams are handed out as
//! `mpsc` receivers: dropping the receiver is how a subscriber releases the
//! native subscription.

use crate::error::Result;
use crate::types::{LocationSample, ShakeSample};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    Granted,
    Denied,
    Undetermined,
}

impl PermissionStatus {
    pub fn is_granted(self) -> bool {
        self == PermissionStatus::Granted
    }
}

/// Parameters for a location watch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WatchOptions {
    pub min_interval: Duration,
    pub min_distance_m: f64,
}

#[async_trait]
pub trait LocationProvider: Send + Sync {
    async fn request_foreground_permission(&self) -> PermissionStatus;
    async fn request_background_permission(&self) -> PermissionStatus;
    /// Start a position watch. The stream ends when the receiver is dropped.
    async fn watch_position(&self, options: WatchOptions)
        -> Result<mpsc::Receiver<LocationSample>>;
}

#[async_trait]
pub trait Accelerometer: Send + Sync {
    async fn subscribe(&self, interval: Duration) -> Result<mpsc::Receiver<ShakeSample>>;
}

#[async_trait]
pub trait AudioRecorder: Send + Sync {
    async fn request_permission(&self) -> PermissionStatus;
    async fn start(&self) -> Result<()>;
    /// Finalize the capture and return the artifact's URI
    async fn stop(&self) -> Result<String>;
}

/// Looping sound player used for the fake-call ringtone
#[async_trait]
pub trait RingtonePlayer: Send + Sync {
    async fn load(&self) -> Result<()>;
    async fn play_looping(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    /// Reset the playback position to the start
    async fn rewind(&self) -> Result<()>;
    async fn unload(&self) -> Result<()>;
}

#[async_trait]
pub trait Dialer: Send + Sync {
    async fn can_open(&self, uri: &str) -> bool;
    async fn open(&self, uri: &str) -> Result<()>;
}

/// Notification shown while the app is in the foreground
#[derive(Debug, Clone, PartialEq)]
pub struct PushNotification {
    pub title: String,
    pub body: String,
}

#[async_trait]
pub trait PushService: Send + Sync {
    async fn permission_status(&self) -> PermissionStatus;
    async fn request_permission(&self) -> PermissionStatus;
    async fn device_token(&self) -> Result<String>;
    async fn foreground_notifications(&self) -> Result<mpsc::Receiver<PushNotification>>;
}

/// Bundle of capabilities handed to the monitor
#[derive(Clone)]
pub struct Platform {
    pub location: Arc<dyn LocationProvider>,
    pub accelerometer: Arc<dyn Accelerometer>,
    pub recorder: Arc<dyn AudioRecorder>,
    pub ringtone: Arc<dyn RingtonePlayer>,
    pub dialer: Arc<dyn Dialer>,
    pub push: Arc<dyn PushService>,
}
