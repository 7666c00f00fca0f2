//! Generic config-driven serial driver.
//!
//! Many flow devices (syringe and HPLC pumps, switching valves, heater
//! controllers) speak a line-based ASCII protocol. Instead of one driver per
//! model, [`SerialDriver`] maps each attribute to a command template:
//!
//! ```toml
//! [driver]
//! type = "serial"
//! port = "/dev/ttyUSB0"
//! baud_rate = 9600
//! terminator = "\r"
//! init = ["REMOTE"]
//! shutdown = ["STOP"]
//!
//! [[driver.commands]]
//! attribute = "rate"
//! template = "FLOW {value}"
//! unit = "mL/min"
//! precision = 3
//! ack = "^OK"
//! ```
//!
//! Templates are expanded with `strfmt`; `{value}` and `{attribute}` are
//! available. Sensors configure a `read` query whose response is matched
//! against a regex.

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::component::{StateMap, Value};
use crate::error::DriverError;
use crate::hardware::{Driver, DriverCapabilities};

/// Byte stream the driver talks over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

/// Opens the transport on `acquire`.
pub type Opener = Box<dyn Fn(&SerialConfig) -> Result<Box<dyn Transport>, DriverError> + Send + Sync>;

/// Serial line and command configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SerialConfig {
    /// Serial port path (e.g. "/dev/ttyUSB0" on Linux, "COM3" on Windows)
    pub port: String,
    /// Baud rate (default 9600)
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Appended to every command and expected at the end of every response
    #[serde(default = "default_terminator")]
    pub terminator: String,
    /// Per-response read timeout (default 1s)
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Sent in order after the port opens
    #[serde(default)]
    pub init: Vec<String>,
    /// Sent in order before the port closes
    #[serde(default)]
    pub shutdown: Vec<String>,
    /// One entry per schedulable attribute
    #[serde(default)]
    pub commands: Vec<CommandConfig>,
    /// Set for sensors
    #[serde(default)]
    pub read: Option<ReadConfig>,
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_terminator() -> String {
    "\r\n".to_string()
}

fn default_timeout() -> Duration {
    Duration::from_secs(1)
}

/// How one attribute is written to the device.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandConfig {
    /// Attribute this command writes
    pub attribute: String,
    /// e.g. `"FLOW {value}"`
    pub template: String,
    /// Unit quantities are converted to before formatting
    #[serde(default)]
    pub unit: Option<String>,
    /// Decimal places for quantities
    #[serde(default)]
    pub precision: Option<usize>,
    /// When set, a response line is read and must match this regex
    #[serde(default)]
    pub ack: Option<String>,
}

/// How a sensor reading is queried.
#[derive(Debug, Clone, Deserialize)]
pub struct ReadConfig {
    /// Command that triggers one reading
    pub query: String,
    /// Regex with a `value` capture group (or first group). Defaults to the whole line.
    #[serde(default)]
    pub pattern: Option<String>,
}

struct CompiledCommand {
    config: CommandConfig,
    ack: Option<Regex>,
}

/// Templated line-protocol driver
pub struct SerialDriver {
    config: SerialConfig,
    commands: Vec<CompiledCommand>,
    read_pattern: Option<Regex>,
    opener: Opener,
    port: Option<Box<dyn Transport>>,
}

impl SerialDriver {
    /// Driver using the system serial port.
    pub fn new(config: SerialConfig) -> Result<Self, DriverError> {
        Self::with_opener(config, Box::new(open_serial_port))
    }

    /// Driver over a custom transport (tests, TCP bridges).
    pub fn with_opener(config: SerialConfig, opener: Opener) -> Result<Self, DriverError> {
        let compile = |pattern: &str| {
            Regex::new(pattern)
                .map_err(|e| DriverError::Protocol(format!("invalid pattern '{}': {}", pattern, e)))
        };

        let commands = config
            .commands
            .iter()
            .map(|c| {
                Ok(CompiledCommand {
                    ack: c.ack.as_deref().map(compile).transpose()?,
                    config: c.clone(),
                })
            })
            .collect::<Result<Vec<_>, DriverError>>()?;
        let read_pattern = config
            .read
            .as_ref()
            .and_then(|r| r.pattern.as_deref())
            .map(compile)
            .transpose()?;

        Ok(Self {
            config,
            commands,
            read_pattern,
            opener,
            port: None,
        })
    }

    /// The configuration the driver was built from.
    pub fn config(&self) -> &SerialConfig {
        &self.config
    }

    async fn send(&mut self, command: &str) -> Result<(), DriverError> {
        let terminator = self.config.terminator.clone();
        let port = self.port.as_mut().ok_or(DriverError::NotAcquired)?;
        let payload = format!("{}{}", command, terminator);
        port.write_all(payload.as_bytes()).await?;
        port.flush().await?;
        trace!(port = %self.config.port, "sent {:?}", command);
        Ok(())
    }

    /// Reads one terminated response line.
    async fn receive(&mut self) -> Result<String, DriverError> {
        let timeout = self.config.timeout;
        let terminator = self.config.terminator.as_bytes().to_vec();
        let port = self.port.as_mut().ok_or(DriverError::NotAcquired)?;

        let mut response = Vec::with_capacity(64);
        let mut buf = [0u8; 64];
        let read_line = async {
            loop {
                let n = port.read(&mut buf).await?;
                if n == 0 {
                    return Err(DriverError::Protocol("connection closed".into()));
                }
                response.extend_from_slice(&buf[..n]);
                if response.ends_with(&terminator) {
                    return Ok(());
                }
            }
        };
        tokio::time::timeout(timeout, read_line)
            .await
            .map_err(|_| DriverError::Timeout {
                operation: "read response",
                after: timeout,
            })??;

        let text = String::from_utf8_lossy(&response).trim().to_string();
        trace!(port = %self.config.port, "received {:?}", text);
        Ok(text)
    }

    async fn transaction(&mut self, command: &str) -> Result<String, DriverError> {
        self.send(command).await?;
        self.receive().await
    }
}

/// Formats `value` for a command template.
fn format_value(value: &Value, command: &CommandConfig) -> Result<String, DriverError> {
    Ok(match value {
        Value::Quantity(q) => {
            let magnitude = match &command.unit {
                Some(unit) => q
                    .to(unit)
                    .map_err(|e| DriverError::Protocol(e.to_string()))?,
                None => q.magnitude(),
            };
            match command.precision {
                Some(p) => format!("{:.*}", p, magnitude),
                None => magnitude.to_string(),
            }
        }
        Value::Integer(i) => i.to_string(),
        Value::Bool(b) => (if *b { "1" } else { "0" }).to_string(),
        Value::Text(s) => s.clone(),
    })
}

fn parse_reading(text: &str, pattern: Option<&Regex>) -> Result<serde_json::Value, DriverError> {
    let raw = match pattern {
        Some(re) => {
            let caps = re.captures(text).ok_or_else(|| {
                DriverError::Protocol(format!("response '{}' does not match '{}'", text, re))
            })?;
            caps.name("value")
                .or_else(|| caps.get(1))
                .or_else(|| caps.get(0))
                .map(|m| m.as_str())
                .unwrap_or_default()
        }
        None => text,
    };

    Ok(match raw.trim().parse::<f64>() {
        Ok(number) => serde_json::json!(number),
        Err(_) => serde_json::Value::String(raw.trim().to_string()),
    })
}

#[cfg(feature = "instrument_serial")]
fn open_serial_port(config: &SerialConfig) -> Result<Box<dyn Transport>, DriverError> {
    use tokio_serial::SerialPortBuilderExt;

    let port = tokio_serial::new(&config.port, config.baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
        .map_err(|e| DriverError::Device(format!("failed to open {}: {}", config.port, e)))?;
    Ok(Box::new(port))
}

#[cfg(not(feature = "instrument_serial"))]
fn open_serial_port(_config: &SerialConfig) -> Result<Box<dyn Transport>, DriverError> {
    Err(DriverError::FeatureNotEnabled("instrument_serial".to_string()))
}

#[async_trait]
impl Driver for SerialDriver {
    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities {
            apply: !self.commands.is_empty(),
            read: self.config.read.is_some(),
        }
    }

    async fn acquire(&mut self) -> Result<(), DriverError> {
        self.port = Some((self.opener)(&self.config)?);
        debug!(port = %self.config.port, baud = self.config.baud_rate, "serial port opened");
        for command in self.config.init.clone() {
            self.send(&command).await?;
        }
        Ok(())
    }

    async fn release(&mut self) -> Result<(), DriverError> {
        if self.port.is_none() {
            return Err(DriverError::NotAcquired);
        }
        let mut result = Ok(());
        for command in self.config.shutdown.clone() {
            if let Err(e) = self.send(&command).await {
                result = Err(e);
                break;
            }
        }
        self.port = None;
        debug!(port = %self.config.port, "serial port closed");
        result
    }

    async fn apply(&mut self, state: &StateMap) -> Result<(), DriverError> {
        let mut lines = Vec::new();
        for command in &self.commands {
            let Some(value) = state.get(&command.config.attribute) else {
                continue;
            };
            let vars = HashMap::from([
                ("value".to_string(), format_value(value, &command.config)?),
                ("attribute".to_string(), command.config.attribute.clone()),
            ]);
            let line = strfmt::strfmt(&command.config.template, &vars)
                .map_err(|e| DriverError::Protocol(format!("bad template: {}", e)))?;
            lines.push((line, command.ack.clone()));
        }

        for (line, ack) in lines {
            match ack {
                Some(re) => {
                    let response = self.transaction(&line).await?;
                    if !re.is_match(&response) {
                        return Err(DriverError::Device(format!(
                            "'{}' was answered with '{}'",
                            line, response
                        )));
                    }
                }
                None => self.send(&line).await?,
            }
        }
        Ok(())
    }

    async fn read(&mut self) -> Result<serde_json::Value, DriverError> {
        let query = self
            .config
            .read
            .as_ref()
            .map(|r| r.query.clone())
            .ok_or(DriverError::Unsupported("read"))?;
        let response = self.transaction(&query).await?;
        parse_reading(&response, self.read_pattern.as_ref())
    }
}
