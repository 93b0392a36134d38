use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::debug;

use crate::engine::{MediaTrack, TrackKind};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CameraFacing {
    #[default]
    Front,
    Back,
}

impl CameraFacing {
    pub fn flipped(self) -> Self {
        match self {
            Self::Front => Self::Back,
            Self::Back => Self::Front,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MediaControls {
    pub microphone_enabled: bool,
    pub camera_enabled: bool,
    pub camera_facing: CameraFacing,
}

impl Default for MediaControls {
    fn default() -> Self {
        Self {
            microphone_enabled: true,
            camera_enabled: true,
            camera_facing: CameraFacing::Front,
        }
    }
}

/// Local camera and microphone, owned by one session at a time.
#[async_trait]
pub trait CaptureDevices: Send + Sync + 'static {
    /// Starts capturing and returns the local tracks to publish.
    async fn start(&mut self) -> Result<Vec<MediaTrack>>;
    async fn set_microphone_enabled(&mut self, enabled: bool) -> Result<()>;
    async fn set_camera_enabled(&mut self, enabled: bool) -> Result<()>;
    async fn flip_camera(&mut self, facing: CameraFacing) -> Result<()>;
    async fn stop(&mut self) -> Result<()>;
}

/// Devices that produce track handles without touching any hardware.
#[derive(Debug, Default)]
pub struct SyntheticCapture {
    tracks: Vec<MediaTrack>,
}

impl SyntheticCapture {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CaptureDevices for SyntheticCapture {
    async fn start(&mut self) -> Result<Vec<MediaTrack>> {
        if !self.tracks.is_empty() {
            bail!("capture already started");
        }
        self.tracks = vec![
            MediaTrack::local(TrackKind::Audio),
            MediaTrack::local(TrackKind::Video),
        ];
        debug!("synthetic capture started");
        Ok(self.tracks.clone())
    }

    async fn set_microphone_enabled(&mut self, enabled: bool) -> Result<()> {
        debug!("microphone enabled: {}", enabled);
        Ok(())
    }

    async fn set_camera_enabled(&mut self, enabled: bool) -> Result<()> {
        debug!("camera enabled: {}", enabled);
        Ok(())
    }

    async fn flip_camera(&mut self, facing: CameraFacing) -> Result<()> {
        debug!("camera facing: {:?}", facing);
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.tracks.clear();
        debug!("synthetic capture stopped");
        Ok(())
    }
}
