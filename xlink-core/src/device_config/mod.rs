//! Configuration sent to a device before and right after boot, and the
//! calibration data stored in its EEPROM.

pub mod board;
pub mod eeprom;

pub use board::{BoardConfig, Gpio, PrebootConfig, Uart, UsbConfig};
pub use eeprom::{CameraBoardSocket, CameraInfo, EepromData, Extrinsics, StereoRectification};
