//! Typed messages carried as stream packets.
//!
//! ## Packet layout
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────┬───────────────────┐
//! │ data         │ metadata     │ datatype     │ metadata length   │
//! │ (raw bytes)  │ (JSON)       │ i32 LE       │ u32 LE            │
//! └──────────────┴──────────────┴──────────────┴───────────────────┘
//! ```
//!
//! The trailer sits at the end of the packet so the bulk data can be
//! written first. Metadata is self-describing JSON: every struct takes
//! defaults for missing fields and ignores unknown ones, so older and newer
//! peers interoperate.

pub mod image;
pub mod stereo;

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, XLinkError};

pub use image::{FrameType, ImgDetection, RawImgDetections, RawImgFrame};
pub use stereo::RawStereoDepthConfig;

/// Size of the trailer closing every message.
pub const TRAILER_SIZE: usize = 8;

int_enum!(
    /// Kind of message carried by a packet.
    DatatypeEnum: i32 = Buffer {
        Buffer = 0,
        ImgFrame = 1,
        NNData = 2,
        ImageManipConfig = 3,
        CameraControl = 4,
        ImgDetections = 5,
        SpatialImgDetections = 6,
        SystemInformation = 7,
        SpatialLocationCalculatorConfig = 8,
        SpatialLocationCalculatorData = 9,
        EdgeDetectorConfig = 10,
        AprilTagConfig = 11,
        AprilTags = 12,
        Tracklets = 13,
        IMUData = 14,
        StereoDepthConfig = 15,
        FeatureTrackerConfig = 16,
        TrackedFeatures = 17,
    }
);

impl DatatypeEnum {
    /// Every message is a buffer; otherwise kinds only match themselves.
    pub fn is_subclass_of(self, parent: DatatypeEnum) -> bool {
        parent == DatatypeEnum::Buffer || parent == self
    }
}

/// Capture time of a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timestamp {
    pub sec: i64,
    pub nsec: i64,
}

impl Timestamp {
    pub fn from_duration(d: std::time::Duration) -> Self {
        Self {
            sec: d.as_secs() as i64,
            nsec: d.subsec_nanos() as i64,
        }
    }
}

// ── StreamMessage ────────────────────────────────────────────────

/// A packet split into its payload, metadata and kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    pub datatype: DatatypeEnum,
    pub data: Bytes,
    pub metadata: Bytes,
}

impl StreamMessage {
    /// A plain buffer without metadata.
    pub fn buffer(data: impl Into<Bytes>) -> Self {
        Self {
            datatype: DatatypeEnum::Buffer,
            data: data.into(),
            metadata: Bytes::new(),
        }
    }

    /// Split a received packet. Shares the packet's memory.
    pub fn parse(packet: Bytes) -> Result<Self> {
        let len = packet.len();
        if len < TRAILER_SIZE {
            return Err(XLinkError::Truncated {
                what: "message trailer",
                expected: TRAILER_SIZE,
                actual: len,
            });
        }
        let word = |at: usize| [packet[at], packet[at + 1], packet[at + 2], packet[at + 3]];
        let metadata_len = u32::from_le_bytes(word(len - 4)) as usize;
        let datatype = DatatypeEnum::try_from(i32::from_le_bytes(word(len - 8)))?;

        let body = len - TRAILER_SIZE;
        if metadata_len > body {
            return Err(XLinkError::Encoding(format!(
                "metadata length {metadata_len} exceeds message body of {body} bytes"
            )));
        }
        let split = body - metadata_len;
        Ok(Self {
            datatype,
            data: packet.slice(..split),
            metadata: packet.slice(split..body),
        })
    }

    /// Lay the message out as a single packet.
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.data.len() + self.metadata.len() + TRAILER_SIZE);
        buf.put_slice(&self.data);
        buf.put_slice(&self.metadata);
        buf.put_i32_le(self.datatype.into());
        buf.put_u32_le(self.metadata.len() as u32);
        buf.freeze()
    }

    /// Decode the metadata as `T`, checking the datatype first.
    pub fn decode<T: RawMessage>(&self) -> Result<T> {
        if !self.datatype.is_subclass_of(T::DATATYPE) {
            return Err(XLinkError::Encoding(format!(
                "expected {} message, got {}",
                T::DATATYPE,
                self.datatype
            )));
        }
        let raw: T = serde_json::from_slice(&self.metadata)?;
        raw.validate()?;
        Ok(raw)
    }
}

/// A metadata struct with a fixed datatype.
pub trait RawMessage: Serialize + DeserializeOwned {
    const DATATYPE: DatatypeEnum;

    /// Reject values the device would refuse. Runs on every decode.
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Pair this metadata with `data` as a ready-to-send message.
    fn to_message(&self, data: impl Into<Bytes>) -> Result<StreamMessage> {
        Ok(StreamMessage {
            datatype: Self::DATATYPE,
            data: data.into(),
            metadata: Bytes::from(serde_json::to_vec(self)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_trailer_layout() {
        let bytes = StreamMessage::buffer(vec![1u8, 2, 3]).serialize();
        assert_eq!(&bytes[..], &[1, 2, 3, 0, 0, 0, 0, 0, 0, 0, 0]);
        let back = StreamMessage::parse(bytes).unwrap();
        assert_eq!(back.data.as_ref(), &[1, 2, 3]);
        assert!(back.metadata.is_empty());
    }

    #[test]
    fn metadata_sits_between_data_and_trailer() {
        let msg = StreamMessage {
            datatype: DatatypeEnum::ImgFrame,
            data: Bytes::from_static(b"pixels"),
            metadata: Bytes::from_static(b"{}"),
        };
        let bytes = msg.serialize();
        assert_eq!(&bytes[6..8], b"{}");
        assert_eq!(&bytes[8..12], &1i32.to_le_bytes());
        assert_eq!(&bytes[12..], &2u32.to_le_bytes());
        assert_eq!(StreamMessage::parse(bytes).unwrap(), msg);
    }

    #[test]
    fn rejects_bad_trailers() {
        assert!(matches!(
            StreamMessage::parse(Bytes::from_static(&[0; 7])),
            Err(XLinkError::Truncated { .. })
        ));

        let mut oversized = BytesMut::new();
        oversized.put_slice(b"ab");
        oversized.put_i32_le(0);
        oversized.put_u32_le(3);
        assert!(matches!(
            StreamMessage::parse(oversized.freeze()),
            Err(XLinkError::Encoding(_))
        ));

        let mut unknown = BytesMut::new();
        unknown.put_i32_le(99);
        unknown.put_u32_le(0);
        assert!(matches!(
            StreamMessage::parse(unknown.freeze()),
            Err(XLinkError::UnknownVariant { .. })
        ));
    }

    #[test]
    fn subclassing() {
        assert!(DatatypeEnum::ImgFrame.is_subclass_of(DatatypeEnum::Buffer));
        assert!(DatatypeEnum::ImgFrame.is_subclass_of(DatatypeEnum::ImgFrame));
        assert!(!DatatypeEnum::ImgFrame.is_subclass_of(DatatypeEnum::NNData));
    }
}
