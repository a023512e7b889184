//! Board and preboot configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, XLinkError};
use crate::types::UsbSpeed;

/// Watchdog timeout applied unless the preboot config overrides it.
pub const DEFAULT_WATCHDOG_TIMEOUT: Duration = Duration::from_millis(4_000);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UsbConfig {
    pub vid: u16,
    pub pid: u16,
    pub flash_booted_vid: u16,
    pub flash_booted_pid: u16,
    pub max_speed: UsbSpeed,
}

impl Default for UsbConfig {
    fn default() -> Self {
        Self {
            vid: 0x03E7,
            pid: 0xF63B,
            flash_booted_vid: 0x03E7,
            flash_booted_pid: 0xF63D,
            max_speed: UsbSpeed::Super,
        }
    }
}

int_enum!(
    GpioMode: i8 = Direct {
        AltMode0 = 0,
        AltMode1 = 1,
        AltMode2 = 2,
        AltMode3 = 3,
        AltMode4 = 4,
        AltMode5 = 5,
        AltMode6 = 6,
        Direct = 7,
    }
);

int_enum!(
    GpioDirection: i8 = Input {
        Input = 0,
        Output = 1,
    }
);

int_enum!(
    GpioLevel: i8 = Low {
        Low = 0,
        High = 1,
    }
);

int_enum!(
    GpioPull: i8 = NoPull {
        NoPull = 0,
        PullUp = 1,
        PullDown = 2,
        BusKeeper = 3,
    }
);

int_enum!(
    /// Drive strength in mA.
    GpioDrive: i8 = Ma2 {
        Ma2 = 2,
        Ma4 = 4,
        Ma8 = 8,
        Ma12 = 12,
    }
);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Gpio {
    pub mode: GpioMode,
    pub direction: GpioDirection,
    pub level: GpioLevel,
    pub pull: GpioPull,
    pub drive: GpioDrive,
    pub schmitt: bool,
    pub slew_fast: bool,
}

impl Gpio {
    pub fn output(level: GpioLevel) -> Self {
        Self {
            direction: GpioDirection::Output,
            level,
            ..Default::default()
        }
    }

    pub fn input(pull: GpioPull) -> Self {
        Self {
            pull,
            ..Default::default()
        }
    }
}

/// Placeholder for per-instance UART settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Uart {
    pub tmp: i8,
}

/// Configuration applied by the firmware right after boot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BoardConfig {
    pub usb: UsbConfig,
    pub watchdog_timeout_ms: Option<u32>,
    pub watchdog_initial_delay_ms: Option<u32>,
    /// GPIO settings by pin number.
    pub gpio: BTreeMap<i8, Gpio>,
    /// UART settings by instance.
    pub uart: BTreeMap<i8, Uart>,
}

impl BoardConfig {
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(blob: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(blob)?)
    }

    pub fn with_gpio(mut self, pin: i8, gpio: Gpio) -> Result<Self> {
        if pin < 0 {
            return Err(XLinkError::Encoding(format!("invalid gpio pin {pin}")));
        }
        self.gpio.insert(pin, gpio);
        Ok(self)
    }

    pub fn watchdog_timeout(&self) -> Option<Duration> {
        self.watchdog_timeout_ms
            .map(|ms| Duration::from_millis(ms as u64))
    }
}

/// Configuration consumed by the boot ROM stage, before the link is up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PrebootConfig {
    pub usb: UsbConfig,
    /// `None` disables the watchdog.
    pub watchdog_timeout_ms: Option<u32>,
}

impl Default for PrebootConfig {
    fn default() -> Self {
        Self {
            usb: UsbConfig::default(),
            watchdog_timeout_ms: Some(DEFAULT_WATCHDOG_TIMEOUT.as_millis() as u32),
        }
    }
}

impl PrebootConfig {
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(blob: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(blob)?)
    }
}
