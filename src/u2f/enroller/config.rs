use std::time::Duration;

use serde_derive::*;

use crate::u2f::error::Error;

/// Longest timer an enroller will arm.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Whether the device's own attestation is passed through or replaced.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ConveyancePreference {
    #[default]
    #[serde(rename = "direct")]
    Direct,
    #[serde(rename = "none")]
    Anonymized,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct EnrollerConfig {
    /// Timeout requested by the relying party, in seconds.
    pub timeout_seconds: f64,
    /// Taken off the request timeout for the protocol timer, half of it for the watchdog.
    pub attenuation_seconds: f64,
    pub conveyance: ConveyancePreference,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_msg_url: Option<String>,
    pub remote_log_limit: usize,
    pub remote_log_window_seconds: u64,
}

impl Default for EnrollerConfig {
    fn default() -> Self {
        EnrollerConfig {
            timeout_seconds: 30.0,
            attenuation_seconds: 1.0,
            conveyance: ConveyancePreference::Direct,
            log_msg_url: None,
            remote_log_limit: 10,
            remote_log_window_seconds: 60,
        }
    }
}

impl EnrollerConfig {
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let config: EnrollerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects timeouts outside `0..=MAX_TIMEOUT`.
    pub fn validate(&self) -> Result<(), Error> {
        let range = 0.0..=MAX_TIMEOUT.as_secs_f64();

        if !range.contains(&self.timeout_seconds) {
            return Err(Error::Validation(format!("timeoutSeconds out of range: {}", self.timeout_seconds)));
        }

        if !range.contains(&self.attenuation_seconds) {
            return Err(Error::Validation(format!("attenuationSeconds out of range: {}", self.attenuation_seconds)));
        }

        Ok(())
    }

    /// Lifetime of the enroller's own timer.
    pub fn protocol_timeout(&self) -> Duration {
        attenuate(self.timeout_seconds, self.attenuation_seconds)
    }

    /// Lifetime of the watchdog, always at least the protocol timeout.
    pub fn watchdog_timeout(&self) -> Duration {
        attenuate(self.timeout_seconds, self.attenuation_seconds / 2.0)
    }

    pub fn remote_log_window(&self) -> Duration {
        Duration::from_secs(self.remote_log_window_seconds)
    }
}

fn attenuate(seconds: f64, by: f64) -> Duration {
    let remaining = seconds - by.max(0.0);

    match Duration::try_from_secs_f64(remaining) {
        Ok(duration) => duration.min(MAX_TIMEOUT),
        Err(_) if remaining > 0.0 => MAX_TIMEOUT,
        Err(_) => Duration::ZERO,
    }
}
