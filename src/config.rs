//! INI config files for both server roles.
//!
//! The block device reads `[Server]`, `[MulticastGroup]` and
//! `[Authentication]`; the frontend additionally reads one `[volume<k>]`
//! section per volume it should manage.

use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use indexmap::IndexMap;
use thiserror::Error;

use crate::disk::DEFAULT_BLOCK_SIZE;
use crate::uuid::Uuid;

pub const DEFAULT_BLOCK_COUNT: u64 = 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("syntax error on line {0}")]
    Syntax(usize),

    #[error("missing [{0}] section")]
    MissingSection(&'static str),

    #[error("missing {key} in [{section}]")]
    MissingKey { section: String, key: &'static str },

    #[error("bad value for {key} in [{section}]: {value}")]
    BadValue {
        section: String,
        key: &'static str,
        value: String,
    },
}

/// A parsed INI file: sections of key/value pairs, order preserved.
#[derive(Debug, Default)]
pub struct Ini {
    sections: IndexMap<String, IndexMap<String, String>>,
}

impl Ini {
    pub fn parse(text: &str) -> Result<Ini, ConfigError> {
        let mut ini = Ini::default();
        let mut current: Option<String> = None;

        for (number, raw) in text.lines().enumerate() {
            let line = raw.trim();

            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }

            if let Some(name) = line.strip_prefix('[') {
                let name = name
                    .strip_suffix(']')
                    .ok_or(ConfigError::Syntax(number + 1))?;
                ini.sections.entry(name.to_string()).or_default();
                current = Some(name.to_string());
                continue;
            }

            let (key, value) = line
                .split_once('=')
                .ok_or(ConfigError::Syntax(number + 1))?;
            let section = current
                .as_ref()
                .ok_or(ConfigError::Syntax(number + 1))?;

            ini.sections
                .get_mut(section)
                .expect("section inserted above")
                .insert(key.trim().to_string(), value.trim().to_string());
        }

        Ok(ini)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Ini, ConfigError> {
        let text = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        })?;
        Ini::parse(&text)
    }

    pub fn section(&self, name: &str) -> Option<&IndexMap<String, String>> {
        self.sections.get(name)
    }

    pub fn sections(&self) -> impl Iterator<Item = (&str, &IndexMap<String, String>)> {
        self.sections.iter().map(|(k, v)| (k.as_str(), v))
    }
}

fn require<'a>(
    section: &'a IndexMap<String, String>,
    section_name: &str,
    key: &'static str,
) -> Result<&'a str, ConfigError> {
    section
        .get(key)
        .map(|s| s.as_str())
        .ok_or_else(|| ConfigError::MissingKey {
            section: section_name.to_string(),
            key,
        })
}

fn parse_value<T>(
    section_name: &str,
    key: &'static str,
    value: &str,
) -> Result<T, ConfigError>
where
    T: FromStr,
{
    value.parse().map_err(|_| ConfigError::BadValue {
        section: section_name.to_string(),
        key,
        value: value.to_string(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MulticastConfig {
    pub address: Ipv4Addr,
    pub port: u16,
}

impl MulticastConfig {
    fn from_ini(ini: &Ini) -> Result<MulticastConfig, ConfigError> {
        let section = ini
            .section("MulticastGroup")
            .ok_or(ConfigError::MissingSection("MulticastGroup"))?;

        Ok(MulticastConfig {
            address: parse_value("MulticastGroup", "address", require(section, "MulticastGroup", "address")?)?,
            port: parse_value("MulticastGroup", "port", require(section, "MulticastGroup", "port")?)?,
        })
    }
}

fn long_password(ini: &Ini) -> Result<String, ConfigError> {
    let section = ini
        .section("Authentication")
        .ok_or(ConfigError::MissingSection("Authentication"))?;
    Ok(require(section, "Authentication", "long_password")?.to_string())
}

/// Block device server configuration.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub disk_name: PathBuf,
    pub disk_info_name: Option<PathBuf>,
    pub disk_uuid: Uuid,
    pub volume_uuid: Uuid,
    pub multicast: MulticastConfig,
    pub long_password: String,
}

impl DeviceConfig {
    pub fn from_ini(ini: &Ini) -> Result<DeviceConfig, ConfigError> {
        let server = ini
            .section("Server")
            .ok_or(ConfigError::MissingSection("Server"))?;

        Ok(DeviceConfig {
            disk_name: PathBuf::from(require(server, "Server", "disk_name")?),
            disk_info_name: server.get("disk_info_name").map(PathBuf::from),
            disk_uuid: parse_value("Server", "disk_uuid", require(server, "Server", "disk_uuid")?)?,
            volume_uuid: parse_value("Server", "volume_uuid", require(server, "Server", "volume_uuid")?)?,
            multicast: MulticastConfig::from_ini(ini)?,
            long_password: long_password(ini)?,
        })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<DeviceConfig, ConfigError> {
        DeviceConfig::from_ini(&Ini::load(path)?)
    }
}

/// One `[volume<k>]` block on the frontend.
#[derive(Debug, Clone)]
pub struct VolumeConfig {
    pub volume_uuid: Uuid,
    pub long_password: String,
    pub block_size: u32,
    pub block_count: u64,
}

/// Frontend server configuration.
#[derive(Debug, Clone)]
pub struct FrontendConfig {
    pub volumes: Vec<VolumeConfig>,
    pub multicast: MulticastConfig,
    pub long_password: String,
}

impl FrontendConfig {
    pub fn from_ini(ini: &Ini) -> Result<FrontendConfig, ConfigError> {
        let mut volumes = Vec::new();

        for (name, section) in ini.sections() {
            if !name.starts_with("volume") {
                continue;
            }

            let block_size = match section.get("block_size") {
                Some(value) => parse_value(name, "block_size", value)?,
                None => DEFAULT_BLOCK_SIZE,
            };
            let block_count = match section.get("block_count") {
                Some(value) => parse_value(name, "block_count", value)?,
                None => DEFAULT_BLOCK_COUNT,
            };

            volumes.push(VolumeConfig {
                volume_uuid: parse_value(name, "volume_uuid", require(section, name, "volume_uuid")?)?,
                long_password: require(section, name, "long_password")?.to_string(),
                block_size,
                block_count,
            });
        }

        Ok(FrontendConfig {
            volumes,
            multicast: MulticastConfig::from_ini(ini)?,
            long_password: long_password(ini)?,
        })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<FrontendConfig, ConfigError> {
        FrontendConfig::from_ini(&Ini::load(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICE_INI: &str = "
; block device sample
[Server]
disk_name = /tmp/disk0
disk_info_name = /tmp/disk0.info
disk_uuid = 00112233-4455-6677-8899-aabbccddeeff
volume_uuid = ffeeddcc-bbaa-9988-7766-554433221100

[MulticastGroup]
address = 239.192.0.100
port = 5555

[Authentication]
long_password = correct horse battery staple
";

    #[test]
    fn parses_device_config() {
        let ini = Ini::parse(DEVICE_INI).unwrap();
        let config = DeviceConfig::from_ini(&ini).unwrap();

        assert_eq!(config.disk_name, PathBuf::from("/tmp/disk0"));
        assert_eq!(config.multicast.address, Ipv4Addr::new(239, 192, 0, 100));
        assert_eq!(config.multicast.port, 5555);
        assert_eq!(config.long_password, "correct horse battery staple");
    }

    #[test]
    fn parses_frontend_volumes() {
        let text = "
[volume0]
volume_uuid = 00112233-4455-6677-8899-aabbccddeeff
long_password = hunter2
block_count = 64

[volume1]
volume_uuid = ffeeddcc-bbaa-9988-7766-554433221100
long_password = hunter3

[MulticastGroup]
address = 239.192.0.100
port = 5555

[Authentication]
long_password = hunter2
";
        let config = FrontendConfig::from_ini(&Ini::parse(text).unwrap()).unwrap();
        assert_eq!(config.volumes.len(), 2);
        assert_eq!(config.volumes[0].block_count, 64);
        assert_eq!(config.volumes[1].block_count, DEFAULT_BLOCK_COUNT);
        assert_eq!(config.volumes[1].block_size, DEFAULT_BLOCK_SIZE);
    }

    #[test]
    fn rejects_bad_syntax() {
        assert!(Ini::parse("key_without_section = 1").is_err());
        assert!(Ini::parse("[unterminated\nkey = 1").is_err());
        assert!(Ini::parse("[s]\nno equals sign").is_err());
    }

    #[test]
    fn missing_sections_are_reported() {
        let ini = Ini::parse("[Server]\ndisk_name = /tmp/d").unwrap();
        assert!(matches!(
            DeviceConfig::from_ini(&ini),
            Err(ConfigError::MissingKey { .. })
        ));
    }
}
