//! DS18B20 probes through the Linux `w1_therm` sysfs interface
//!
//! Each probe shows up as `<base>/<device>/w1_slave` with two lines:
//!
//! ```text
//! 4b 01 4b 46 7f ff 05 10 d8 : crc=d8 YES
//! 4b 01 4b 46 7f ff 05 10 d8 t=20687
//! ```

use super::{RawReadError, RawReading, SensorSource};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Power-on reset value of the DS18B20 scratchpad, in millidegrees.
/// Returned when a conversion did not complete.
pub const POWER_ON_RESET_MILLIDEGREES: i64 = 85_000;

/// Default sysfs location of 1-Wire devices
pub const DEFAULT_W1_BASE: &str = "/sys/bus/w1/devices";

/// Raw reader for one DS18B20 probe
#[derive(Debug, Clone)]
pub struct W1ThermSource {
    path: PathBuf,
}

impl W1ThermSource {
    pub fn new<P: AsRef<Path>>(base: P, device: &str) -> Self {
        Self {
            path: base.as_ref().join(device).join("w1_slave"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SensorSource for W1ThermSource {
    async fn read_raw(&self) -> RawReading {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => parse_w1_slave(&contents),
            Err(e) if e.kind() == ErrorKind::TimedOut => Err(RawReadError::BusTimeout),
            Err(e) => Err(RawReadError::BusFault(format!(
                "{}: {}",
                self.path.display(),
                e.kind()
            ))),
        }
    }
}

/// Parse `w1_slave` contents into degrees Celsius
pub fn parse_w1_slave(contents: &str) -> RawReading {
    let mut lines = contents.lines();

    let crc_line = lines
        .next()
        .ok_or_else(|| RawReadError::BusFault("empty w1_slave output".to_string()))?;
    if !crc_line.trim_end().ends_with("YES") {
        return Err(RawReadError::BusFault("CRC check failed".to_string()));
    }

    let data_line = lines
        .next()
        .ok_or_else(|| RawReadError::BusFault("missing temperature line".to_string()))?;
    let raw = data_line
        .rsplit_once("t=")
        .map(|(_, t)| t.trim())
        .ok_or_else(|| RawReadError::BusFault("missing t= field".to_string()))?;
    let millidegrees: i64 = raw
        .parse()
        .map_err(|_| RawReadError::BusFault(format!("unparseable temperature '{raw}'")))?;

    let celsius = millidegrees as f64 / 1000.0;
    if millidegrees == POWER_ON_RESET_MILLIDEGREES {
        return Err(RawReadError::Sentinel(celsius));
    }

    Ok(celsius)
}
