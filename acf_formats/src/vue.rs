//! Camera records and the textual animation output.
//!
//! Containers interleave camera chunks with the video stream; each record
//! becomes one entry of the scene animation file, keyed by the frame that
//! was current when the chunk arrived.

use anyhow::{Result, ensure};
use byteorder::{ByteOrder, LittleEndian};

/// Eight signed 32-bit fields per camera chunk.
pub const CAMERA_RECORD_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CameraRecord {
    pub cam_x: i32,
    pub cam_y: i32,
    pub cam_z: i32,
    pub target_x: i32,
    pub target_y: i32,
    pub target_z: i32,
    /// Stored in the stream but apparently ignored by the engine.
    pub roll: i32,
    pub focal: i32,
}

impl CameraRecord {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        ensure!(
            payload.len() >= CAMERA_RECORD_LEN,
            "camera chunk holds {} bytes, expected at least {CAMERA_RECORD_LEN}",
            payload.len()
        );
        let field = |index: usize| LittleEndian::read_i32(&payload[index * 4..index * 4 + 4]);
        // Position and target are stored x, z, y on disk.
        Ok(Self {
            cam_x: field(0),
            cam_z: field(1),
            cam_y: field(2),
            target_x: field(3),
            target_z: field(4),
            target_y: field(5),
            roll: field(6),
            focal: field(7),
        })
    }

    /// Angular field of view derived from the focal length, against the
    /// 320-pixel projection plane the streams were authored for.
    pub fn field_of_view(&self) -> f64 {
        (1200.0 * std::f64::consts::PI) / ((320.0 / 2.0) / (self.focal as f64 - 0.5)).atan()
            / 180.0
    }

    /// One animation-file entry for this record.
    pub fn vue_entry(&self, frame: u32) -> String {
        format!(
            "frame {} \r\ncamera {} {} {} {} {} {} {} {}\r\n",
            frame,
            self.cam_x,
            self.cam_y,
            self.cam_z,
            self.target_x,
            self.target_y,
            self.target_z,
            self.roll,
            self.field_of_view()
        )
    }
}

/// Concatenates the animation entries for every captured camera record.
pub fn render_vue(cameras: &[(u32, CameraRecord)]) -> String {
    cameras
        .iter()
        .map(|(frame, camera)| camera.vue_entry(*frame))
        .collect()
}
