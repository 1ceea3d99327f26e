//! Configuration parsing and endpoint tunables.
//!
//! The process-level config is an INI-style text file named by the
//! `CCI_CONFIG` environment variable. Each `[section]` describes one device;
//! `transport` is the only mandatory key. `priority` and `default` are
//! interpreted here, everything else is passed verbatim to the transport.

use std::env;
use std::fs;
use std::path::Path;

use crate::status::{Result, Status};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "CCI_CONFIG";

/// Default device priority when the config does not specify one.
pub const DEFAULT_PRIORITY: u8 = 50;

/// One parsed `[section]` of the config file.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceProfile {
    /// Section name, e.g. `storage`.
    pub name: String,
    /// Transport tag, e.g. `sock`.
    pub transport: String,
    /// Ordering priority, 0..=100, highest first.
    pub priority: u8,
    /// Whether this device was marked `default = 1`.
    pub is_default: bool,
    /// Remaining key/value pairs, uninterpreted.
    pub args: Vec<(String, String)>,
}

impl DeviceProfile {
    /// Look up an uninterpreted key.
    pub fn arg(&self, key: &str) -> Option<&str> {
        self.args
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The `key=value` strings handed to the transport, in file order.
    pub fn conf_strings(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect()
    }
}

/// Parse config text into device profiles, ordered by descending priority.
pub fn parse_str(text: &str) -> Result<Vec<DeviceProfile>> {
    let mut profiles: Vec<DeviceProfile> = Vec::new();
    let mut current: Option<(String, Option<String>, u8, bool, Vec<(String, String)>)> = None;
    let mut saw_default = false;

    let mut finish = |entry: Option<(String, Option<String>, u8, bool, Vec<(String, String)>)>,
                      out: &mut Vec<DeviceProfile>|
     -> Result<()> {
        if let Some((name, transport, priority, is_default, args)) = entry {
            let transport = transport.ok_or(Status::Invalid)?;
            out.push(DeviceProfile {
                name,
                transport,
                priority,
                is_default,
                args,
            });
        }
        Ok(())
    };

    for raw in text.lines() {
        let line = match raw.find('#') {
            Some(pos) => &raw[..pos],
            None => raw,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(name) = line.strip_prefix('[') {
            let name = name.strip_suffix(']').ok_or(Status::Invalid)?.trim();
            if name.is_empty() {
                return Err(Status::Invalid);
            }
            finish(current.take(), &mut profiles)?;
            current = Some((name.to_string(), None, DEFAULT_PRIORITY, false, Vec::new()));
            continue;
        }

        let (key, value) = line.split_once('=').ok_or(Status::Invalid)?;
        let key = key.trim();
        let value = value.trim();
        let entry = current.as_mut().ok_or(Status::Invalid)?;

        match key {
            "transport" => entry.1 = Some(value.to_string()),
            "priority" => {
                let p: u8 = value.parse().map_err(|_| Status::Invalid)?;
                if p > 100 {
                    return Err(Status::Invalid);
                }
                entry.2 = p;
            }
            "default" => {
                let on = value == "1";
                if on {
                    if saw_default {
                        return Err(Status::Invalid);
                    }
                    saw_default = true;
                }
                entry.3 = on;
            }
            _ => entry.4.push((key.to_string(), value.to_string())),
        }
    }
    finish(current.take(), &mut profiles)?;

    profiles.sort_by(|a, b| b.priority.cmp(&a.priority));
    Ok(profiles)
}

/// Parse the config file at `path`.
pub fn parse_file(path: &Path) -> Result<Vec<DeviceProfile>> {
    let text = fs::read_to_string(path).map_err(|_| Status::NotFound)?;
    parse_str(&text)
}

/// Load the config named by `CCI_CONFIG`; absence yields `NotFound`.
pub fn load_from_env() -> Result<Vec<DeviceProfile>> {
    let path = env::var(CONFIG_ENV).map_err(|_| Status::NotFound)?;
    parse_file(Path::new(&path))
}

/// Runtime tunables of one endpoint.
///
/// Seeded with transport defaults at endpoint creation and adjusted later
/// through `set_opt`.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Number of pre-allocated send buffers.
    /// Default: 128
    pub tx_buf_count: u32,
    /// Number of pre-allocated receive buffers.
    /// Default: 256
    pub rx_buf_count: u32,
    /// Default reliable-send timeout in microseconds.
    /// Default: 8_000_000 (8s)
    pub send_timeout_us: u32,
    /// Keepalive period in microseconds, 0 disabled.
    /// Default: 0
    pub keepalive_us: u32,
    /// Connect timeout in microseconds when the caller passes none.
    /// Default: 10_000_000 (10s)
    pub connect_timeout_us: u32,
    /// Minimum gap between standalone ACKs per connection, microseconds.
    /// Default: 1000 (1ms)
    pub ack_delay_us: u32,
    /// Initial retransmit backoff in microseconds; doubles per resend.
    /// Default: 1000 (1ms)
    pub retrans_base_us: u32,
    /// Retransmit backoff ceiling in microseconds.
    /// Default: 64_000 (64ms)
    pub retrans_ceiling_us: u32,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            tx_buf_count: 128,
            rx_buf_count: 256,
            send_timeout_us: 8_000_000,
            keepalive_us: 0,
            connect_timeout_us: 10_000_000,
            ack_delay_us: 1000,
            retrans_base_us: 1000,
            retrans_ceiling_us: 64_000,
        }
    }
}

impl EndpointConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the send buffer count.
    pub fn with_tx_buf_count(mut self, count: u32) -> Self {
        self.tx_buf_count = count;
        self
    }

    /// Set the receive buffer count.
    pub fn with_rx_buf_count(mut self, count: u32) -> Self {
        self.rx_buf_count = count;
        self
    }

    /// Set the default reliable-send timeout.
    pub fn with_send_timeout_us(mut self, us: u32) -> Self {
        self.send_timeout_us = us;
        self
    }

    /// Set the keepalive period.
    pub fn with_keepalive_us(mut self, us: u32) -> Self {
        self.keepalive_us = us;
        self
    }

    /// Set the default connect timeout.
    pub fn with_connect_timeout_us(mut self, us: u32) -> Self {
        self.connect_timeout_us = us;
        self
    }
}
