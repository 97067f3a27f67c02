use crate::error::Error;
use ::config::{Config, ConfigError, File as ConfigFile, FileFormat};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

pub const DEFAULT_PADDING_PERCENT: f64 = 0.01;

/// Typed view of the YAML configuration file. Device order is planning order.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    #[serde(rename = "backuppath")]
    pub backup_path: PathBuf,
    #[serde(rename = "outputstreams", default = "default_output_streams")]
    pub output_streams: usize,
    #[serde(rename = "paddingpercent", default = "default_padding_percent")]
    pub padding_percent: f64,
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    pub name: String,
    /// Hard capacity in bytes, no units.
    pub size: u64,
    pub mount_point: PathBuf,
    #[serde(default)]
    pub uuid: Option<String>,
}

fn default_output_streams() -> usize {
    1
}

fn default_padding_percent() -> f64 {
    DEFAULT_PADDING_PERCENT
}

pub fn load_configuration(path: &Path) -> Result<SyncConfig, Error> {
    let builder = Config::builder()
        .add_source(ConfigFile::from(path.to_path_buf()).format(FileFormat::Yaml))
        .build()?;
    let cfg = builder.try_deserialize::<SyncConfig>()?;
    validate(&cfg)?;
    Ok(cfg)
}

/// One worker per device is a startup invariant, so duplicate mount points
/// are rejected here rather than detected mid-sync.
fn validate(cfg: &SyncConfig) -> Result<(), Error> {
    if cfg.devices.is_empty() {
        return Err(ConfigError::Message("at least one device is required".into()).into());
    }
    if cfg.output_streams == 0 {
        return Err(ConfigError::Message("outputStreams must be at least 1".into()).into());
    }
    if !(0.0..1.0).contains(&cfg.padding_percent) {
        return Err(ConfigError::Message(format!(
            "paddingPercent {} is out of range [0, 1)",
            cfg.padding_percent
        ))
        .into());
    }
    let mut seen = HashSet::new();
    for dev in &cfg.devices {
        if !seen.insert(&dev.mount_point) {
            return Err(ConfigError::Message(format!(
                "duplicate mount point {:?} in device list",
                dev.mount_point
            ))
            .into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Result<SyncConfig, Error> {
        let builder = Config::builder()
            .add_source(ConfigFile::from_str(yaml, FileFormat::Yaml))
            .build()?;
        let cfg = builder.try_deserialize::<SyncConfig>()?;
        validate(&cfg)?;
        Ok(cfg)
    }

    #[test]
    fn test_parse_full_config() {
        let cfg = parse(
            r#"
backupPath: "/mnt/data"
outputStreams: 2
devices:
  - name: "Drive 1"
    size: 4965185763
    mountPoint: "/mnt/b1"
    uuid: "4f56ad3c-5f37-4c0c-9dbf-a2a6ec9efc67"
  - name: "Drive 2"
    size: 4965185763
    mountPoint: "/mnt/b2"
"#,
        )
        .unwrap();
        assert_eq!(cfg.backup_path, PathBuf::from("/mnt/data"));
        assert_eq!(cfg.output_streams, 2);
        assert_eq!(cfg.padding_percent, DEFAULT_PADDING_PERCENT);
        assert_eq!(cfg.devices.len(), 2);
        assert_eq!(cfg.devices[0].size, 4965185763);
        assert!(cfg.devices[0].uuid.is_some());
        assert!(cfg.devices[1].uuid.is_none());
    }

    #[test]
    fn test_output_streams_defaults_to_one() {
        let cfg = parse(
            r#"
backupPath: "/mnt/data"
devices:
  - name: "Drive 1"
    size: 1000000
    mountPoint: "/mnt/b1"
"#,
        )
        .unwrap();
        assert_eq!(cfg.output_streams, 1);
    }

    #[test]
    fn test_duplicate_mount_point_rejected() {
        let err = parse(
            r#"
backupPath: "/mnt/data"
devices:
  - name: "Drive 1"
    size: 1000000
    mountPoint: "/mnt/b1"
  - name: "Drive 2"
    size: 1000000
    mountPoint: "/mnt/b1"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_empty_device_list_rejected() {
        let err = parse(
            r#"
backupPath: "/mnt/data"
devices: []
"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
