use crate::camera::FacingMode;
use crate::coordinator::ScanSettings;
use crate::error::ConfigError;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub port: u16,
    pub lookup_url: Url,
    pub service_point: i64,
    pub access_token: Option<String>,
    pub scan_interval: Duration,
    pub lookup_delay: Duration,
    pub camera_timeout: Duration,
    pub camera_facing: FacingMode,
    pub camera_width: u32,
    pub camera_height: u32,
    pub tesseract_path: String,
    pub tesseract_lang: String,
    pub hub_host: Option<String>,
    pub notify_device: String,
    pub db_path: String,
    pub auto_start: bool,
}

impl ScannerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(var: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str, default: &str| var(name).unwrap_or_else(|| default.to_string());
        let lookup_url_raw = get("LOOKUP_URL", "http://localhost:8080/agendamento/placa");
        let lookup_url = Url::parse(&lookup_url_raw).map_err(|_| ConfigError::Invalid {
            name: "LOOKUP_URL",
            value: lookup_url_raw.clone(),
        })?;
        let facing_raw = get("CAMERA_FACING", "environment");
        let camera_facing = FacingMode::parse(&facing_raw).ok_or(ConfigError::Invalid {
            name: "CAMERA_FACING",
            value: facing_raw.clone(),
        })?;
        Ok(ScannerConfig {
            port: parse(&var, "PORT", 8402)?,
            lookup_url,
            service_point: parse(&var, "SERVICE_POINT_ID", 1)?,
            access_token: var("ACCESS_TOKEN").filter(|t| !t.is_empty()),
            scan_interval: Duration::from_millis(positive(&var, "SCAN_INTERVAL_MS", 1000)?),
            lookup_delay: Duration::from_millis(parse(&var, "LOOKUP_DELAY_MS", 100)?),
            camera_timeout: Duration::from_secs(positive(&var, "CAMERA_TIMEOUT_SECS", 8)?),
            camera_facing,
            camera_width: parse(&var, "CAMERA_WIDTH", 1280)?,
            camera_height: parse(&var, "CAMERA_HEIGHT", 720)?,
            tesseract_path: get("TESSERACT_PATH", "tesseract"),
            tesseract_lang: get("TESSERACT_LANG", "eng"),
            hub_host: var("HOST").filter(|h| !h.is_empty()),
            notify_device: get("NOTIFY_DEVICE", "ALL_DEVICES"),
            db_path: get("DB_PATH", "/data/scans.db"),
            auto_start: parse(&var, "AUTO_START", false)?,
        })
    }

    pub fn scan_settings(&self) -> ScanSettings {
        ScanSettings {
            tick_interval: self.scan_interval,
            lookup_delay: self.lookup_delay,
        }
    }
}

fn parse<F, T>(var: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match var(name) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}

/// Like `parse`, but zero is rejected.
fn positive<F>(var: &F, name: &'static str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match parse(var, name, default)? {
        0 => Err(ConfigError::Invalid {
            name,
            value: "0".to_string(),
        }),
        n => Ok(n),
    }
}
