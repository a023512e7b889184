//! Calibration data stored in the device EEPROM.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Layout version written by current tooling.
pub const EEPROM_VERSION: u32 = 6;

int_enum!(
    CameraBoardSocket: i32 = Auto {
        Auto = -1,
        Rgb = 0,
        Left = 1,
        Right = 2,
    }
);

int_enum!(
    CameraModel: i8 = Perspective {
        Perspective = 0,
        Fisheye = 1,
        Equirectangular = 2,
        RadialDivision = 3,
    }
);

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Point3f {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Extrinsics {
    pub rotation_matrix: Vec<Vec<f32>>,
    /// Measured translation, in centimetres.
    pub translation: Point3f,
    /// Translation from the board design.
    pub spec_translation: Point3f,
    pub to_camera_socket: CameraBoardSocket,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CameraInfo {
    pub camera_type: CameraModel,
    pub width: u16,
    pub height: u16,
    /// Horizontal field of view from the datasheet, in degrees.
    pub spec_hfov_deg: f32,
    pub lens_position: u8,
    pub intrinsic_matrix: Vec<Vec<f32>>,
    pub distortion_coeff: Vec<f32>,
    pub extrinsics: Extrinsics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StereoRectification {
    pub rectified_rotation_left: Vec<Vec<f32>>,
    pub rectified_rotation_right: Vec<Vec<f32>>,
    pub left_camera_socket: CameraBoardSocket,
    pub right_camera_socket: CameraBoardSocket,
}

impl Default for StereoRectification {
    fn default() -> Self {
        Self {
            rectified_rotation_left: Vec::new(),
            rectified_rotation_right: Vec::new(),
            left_camera_socket: CameraBoardSocket::Left,
            right_camera_socket: CameraBoardSocket::Right,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EepromData {
    pub version: u32,
    pub board_name: String,
    pub board_rev: String,
    pub camera_data: BTreeMap<CameraBoardSocket, CameraInfo>,
    pub stereo_rectification_data: StereoRectification,
    pub imu_extrinsics: Extrinsics,
    pub miscellaneous_data: Vec<u8>,
}

impl Default for EepromData {
    fn default() -> Self {
        Self {
            version: EEPROM_VERSION,
            board_name: String::new(),
            board_rev: String::new(),
            camera_data: BTreeMap::new(),
            stereo_rectification_data: StereoRectification::default(),
            imu_extrinsics: Extrinsics::default(),
            miscellaneous_data: Vec::new(),
        }
    }
}

impl EepromData {
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(blob: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(blob)?)
    }

    pub fn camera(&self, socket: CameraBoardSocket) -> Option<&CameraInfo> {
        self.camera_data.get(&socket)
    }

    /// Baseline between two cameras from their extrinsics, in centimetres.
    pub fn baseline(&self, from: CameraBoardSocket, to: CameraBoardSocket) -> Option<f32> {
        let ext = &self.camera(from)?.extrinsics;
        if ext.to_camera_socket != to {
            return None;
        }
        let t = ext.translation;
        Some((t.x * t.x + t.y * t.y + t.z * t.z).sqrt())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calibrated() -> EepromData {
        let mut data = EepromData {
            board_name: "BW1098OBC".into(),
            board_rev: "R0M0E0".into(),
            ..Default::default()
        };
        data.camera_data.insert(
            CameraBoardSocket::Left,
            CameraInfo {
                width: 1280,
                height: 800,
                spec_hfov_deg: 71.86,
                extrinsics: Extrinsics {
                    translation: Point3f {
                        x: -7.5,
                        y: 0.0,
                        z: 0.0,
                    },
                    to_camera_socket: CameraBoardSocket::Right,
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        data
    }

    #[test]
    fn defaults_to_current_version() {
        let data = EepromData::from_json(b"{}").unwrap();
        assert_eq!(data.version, 6);
        assert_eq!(data.stereo_rectification_data.left_camera_socket, CameraBoardSocket::Left);
    }

    #[test]
    fn socket_keyed_map_roundtrip() {
        let data = calibrated();
        let json = data.to_json().unwrap();
        assert!(String::from_utf8_lossy(&json).contains(r#""cameraData":{"1":"#));
        assert_eq!(EepromData::from_json(&json).unwrap(), data);
    }

    #[test]
    fn baseline_from_extrinsics() {
        let data = calibrated();
        assert_eq!(data.baseline(CameraBoardSocket::Left, CameraBoardSocket::Right), Some(7.5));
        assert_eq!(data.baseline(CameraBoardSocket::Left, CameraBoardSocket::Rgb), None);
        assert_eq!(data.baseline(CameraBoardSocket::Right, CameraBoardSocket::Left), None);
    }
}
