/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::time::Duration;

use anyhow::{anyhow, Context};
use yaml_rust::Yaml;

use super::{FtpControlConfig, FtpEngineConfig, FtpKeepaliveConfig, FtpTransferConfig};

fn as_usize(v: &Yaml) -> anyhow::Result<usize> {
    match v {
        Yaml::Integer(i) if *i >= 0 => Ok(*i as usize),
        _ => Err(anyhow!("invalid usize value")),
    }
}

fn as_bool(v: &Yaml) -> anyhow::Result<bool> {
    match v {
        Yaml::Boolean(b) => Ok(*b),
        _ => Err(anyhow!("invalid bool value")),
    }
}

fn as_duration(v: &Yaml) -> anyhow::Result<Duration> {
    match v {
        Yaml::Integer(i) if *i >= 0 => Ok(Duration::from_secs(*i as u64)),
        Yaml::Real(s) => {
            let f: f64 = s.parse().map_err(|_| anyhow!("invalid duration value"))?;
            if f < 0.0 {
                return Err(anyhow!("negative duration value"));
            }
            Ok(Duration::from_secs_f64(f))
        }
        _ => Err(anyhow!("invalid duration value")),
    }
}

fn foreach_kv<F>(map: &yaml_rust::yaml::Hash, mut f: F) -> anyhow::Result<()>
where
    F: FnMut(&str, &Yaml) -> anyhow::Result<()>,
{
    for (k, v) in map.iter() {
        let Yaml::String(key) = k else {
            return Err(anyhow!("invalid key type"));
        };
        f(key.as_str(), v)?;
    }
    Ok(())
}

impl FtpControlConfig {
    pub fn parse_yaml(value: &Yaml) -> anyhow::Result<Self> {
        if let Yaml::Hash(map) = value {
            let mut config = FtpControlConfig::default();
            foreach_kv(map, |k, v| match k {
                "max_line_len" | "max_line_length" => {
                    config.max_line_len =
                        as_usize(v).context(format!("invalid usize value for key {k}"))?;
                    Ok(())
                }
                "max_multi_lines" => {
                    config.max_multi_lines =
                        as_usize(v).context(format!("invalid usize value for key {k}"))?;
                    Ok(())
                }
                _ => Err(anyhow!("invalid key {k}")),
            })?;
            Ok(config)
        } else {
            Err(anyhow!("invalid yaml type"))
        }
    }
}

impl FtpTransferConfig {
    pub fn parse_yaml(value: &Yaml) -> anyhow::Result<Self> {
        if let Yaml::Hash(map) = value {
            let mut config = FtpTransferConfig::default();
            foreach_kv(map, |k, v| match k {
                "end_wait_timeout" => {
                    config.end_wait_timeout =
                        as_duration(v).context(format!("invalid duration value for key {k}"))?;
                    Ok(())
                }
                "io_buffer_size" => {
                    config.io_buffer_size =
                        as_usize(v).context(format!("invalid usize value for key {k}"))?;
                    Ok(())
                }
                _ => Err(anyhow!("invalid key {k}")),
            })?;
            Ok(config)
        } else {
            Err(anyhow!("invalid yaml type"))
        }
    }
}

impl FtpKeepaliveConfig {
    pub fn parse_yaml(value: &Yaml) -> anyhow::Result<Self> {
        if let Yaml::Hash(map) = value {
            let mut config = FtpKeepaliveConfig::default();
            foreach_kv(map, |k, v| match k {
                "period" => {
                    config.period =
                        as_duration(v).context(format!("invalid duration value for key {k}"))?;
                    Ok(())
                }
                "idle_limit" => {
                    let limit =
                        as_duration(v).context(format!("invalid duration value for key {k}"))?;
                    config.set_idle_limit(limit);
                    Ok(())
                }
                _ => Err(anyhow!("invalid key {k}")),
            })?;
            Ok(config)
        } else {
            Err(anyhow!("invalid yaml type"))
        }
    }
}

impl FtpEngineConfig {
    pub fn parse_yaml(value: &Yaml) -> anyhow::Result<Self> {
        if let Yaml::Hash(map) = value {
            let mut config = FtpEngineConfig::default();
            foreach_kv(map, |k, v| match k {
                "control" => {
                    config.control = FtpControlConfig::parse_yaml(v)
                        .context(format!("invalid control config value for key {k}"))?;
                    Ok(())
                }
                "transfer" => {
                    config.transfer = FtpTransferConfig::parse_yaml(v)
                        .context(format!("invalid transfer config value for key {k}"))?;
                    Ok(())
                }
                "keepalive" => {
                    config.keepalive = FtpKeepaliveConfig::parse_yaml(v)
                        .context(format!("invalid keepalive config value for key {k}"))?;
                    Ok(())
                }
                "inactivity_timeout" => {
                    config.inactivity_timeout =
                        as_duration(v).context(format!("invalid duration value for key {k}"))?;
                    Ok(())
                }
                "connect_timeout" => {
                    config.connect_timeout =
                        as_duration(v).context(format!("invalid duration value for key {k}"))?;
                    Ok(())
                }
                _ => Err(anyhow!("invalid key {k}")),
            })?;
            Ok(config)
        } else {
            Err(anyhow!("invalid yaml type"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yaml_rust::YamlLoader;

    #[test]
    fn parse_full() {
        let docs = YamlLoader::load_from_str(
            r#"
control:
  max_line_len: 4096
keepalive:
  period: 15
inactivity_timeout: 90
"#,
        )
        .unwrap();
        let config = FtpEngineConfig::parse_yaml(&docs[0]).unwrap();
        assert_eq!(config.control.max_line_len, 4096);
        assert_eq!(config.keepalive.period, Duration::from_secs(15));
        assert_eq!(config.inactivity_timeout, Duration::from_secs(90));
    }

    #[test]
    fn reject_unknown_key() {
        let docs = YamlLoader::load_from_str("no_such_key: 1").unwrap();
        assert!(FtpEngineConfig::parse_yaml(&docs[0]).is_err());
    }
}
