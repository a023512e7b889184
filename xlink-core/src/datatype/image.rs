//! Frame and detection messages.

use serde::{Deserialize, Serialize};

use super::{DatatypeEnum, RawMessage, Timestamp};

int_enum!(
    /// Pixel layout of a frame.
    FrameType: i32 = None {
        Yuv422i = 0,
        Yuv444p = 1,
        Yuv420p = 2,
        Yuv422p = 3,
        Yuv400p = 4,
        Rgba8888 = 5,
        Rgb161616 = 6,
        Rgb888p = 7,
        Bgr888p = 8,
        Rgb888i = 9,
        Bgr888i = 10,
        Lut2 = 11,
        Lut4 = 12,
        Lut16 = 13,
        Raw16 = 14,
        Raw14 = 15,
        Raw12 = 16,
        Raw10 = 17,
        Raw8 = 18,
        Pack10 = 19,
        Pack12 = 20,
        Yuv444i = 21,
        Nv12 = 22,
        Nv21 = 23,
        Bitstream = 24,
        Hdr = 25,
        RgbF16F16F16p = 26,
        BgrF16F16F16p = 27,
        RgbF16F16F16i = 28,
        BgrF16F16F16i = 29,
        Gray8 = 30,
        GrayF16 = 31,
        None = 32,
    }
);

impl FrameType {
    /// Bytes per pixel of the first plane.
    pub fn bytes_per_pixel(self) -> u32 {
        use FrameType::*;
        match self {
            Rgb161616 | RgbF16F16F16p | BgrF16F16F16p | RgbF16F16F16i | BgrF16F16F16i
            | GrayF16 | Raw16 | Raw14 | Raw12 | Raw10 | Pack10 | Pack12 => 2,
            None => 0,
            _ => 1,
        }
    }
}

/// Geometry of a frame buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Specs {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    pub width: u32,
    pub height: u32,
    /// Distance in bytes between vertically adjacent pixels.
    pub stride: u32,
    #[serde(rename = "bytesPP")]
    pub bytes_pp: u32,
    pub p1_offset: u32,
    pub p2_offset: u32,
    pub p3_offset: u32,
}

impl Specs {
    /// Tightly packed single-plane geometry.
    pub fn packed(frame_type: FrameType, width: u32, height: u32) -> Self {
        let bytes_pp = frame_type.bytes_per_pixel();
        Self {
            frame_type,
            width,
            height,
            stride: width * bytes_pp,
            bytes_pp,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RawImgFrame {
    pub fb: Specs,
    pub category: u32,
    /// Source that produced the frame (color, mono, ...).
    pub instance_num: u32,
    pub sequence_num: i64,
    pub ts: Timestamp,
    pub ts_device: Timestamp,
}

impl RawMessage for RawImgFrame {
    const DATATYPE: DatatypeEnum = DatatypeEnum::ImgFrame;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImgDetection {
    pub label: u32,
    pub confidence: f32,
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RawImgDetections {
    pub detections: Vec<ImgDetection>,
    /// Sequence number of the frame the detections belong to.
    pub sequence_num: i64,
    pub ts: Timestamp,
    pub ts_device: Timestamp,
}

impl RawMessage for RawImgDetections {
    const DATATYPE: DatatypeEnum = DatatypeEnum::ImgDetections;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::StreamMessage;

    #[test]
    fn packed_specs() {
        let specs = Specs::packed(FrameType::Raw16, 640, 400);
        assert_eq!(specs.stride, 1280);
        assert_eq!(specs.bytes_pp, 2);
        assert_eq!(Specs::packed(FrameType::Bgr888p, 300, 300).stride, 300);
    }

    #[test]
    fn frame_keys_match_device() {
        let frame = RawImgFrame {
            fb: Specs::packed(FrameType::Gray8, 4, 2),
            sequence_num: 9,
            ..Default::default()
        };
        let json: serde_json::Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["fb"]["type"], 30);
        assert_eq!(json["fb"]["bytesPP"], 1);
        assert_eq!(json["sequenceNum"], 9);
    }

    #[test]
    fn detections_over_a_message() {
        let dets = RawImgDetections {
            detections: vec![ImgDetection {
                label: 15,
                confidence: 0.75,
                xmin: 0.1,
                ymin: 0.2,
                xmax: 0.5,
                ymax: 0.9,
            }],
            sequence_num: 3,
            ..Default::default()
        };
        let packet = dets.to_message(Vec::new()).unwrap().serialize();
        let msg = StreamMessage::parse(packet).unwrap();
        assert_eq!(msg.datatype, DatatypeEnum::ImgDetections);
        assert_eq!(msg.decode::<RawImgDetections>().unwrap(), dets);
        assert!(msg.decode::<RawImgFrame>().is_err());
    }
}
