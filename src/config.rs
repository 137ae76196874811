//! Configuration management for the car service

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::camera::{FrameSize, PixelFormat};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub motors: MotorConfig,
    #[serde(default)]
    pub servo: ServoConfig,
    #[serde(default)]
    pub pca9685: Pca9685Config,
    #[serde(default)]
    pub led: LedConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_ip")]
    pub bind_ip: String,

    /// Control server port; the stream server defaults to the next port up
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub stream_port: Option<u16>,

    /// Concurrent `/stream` clients; further clients get 503
    #[serde(default = "default_max_streams")]
    pub max_streams: usize,

    /// Address advertised in the control page when the request has no Host header
    #[serde(default)]
    pub host_ip: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: default_bind_ip(),
            port: default_port(),
            stream_port: None,
            max_streams: default_max_streams(),
            host_ip: None,
        }
    }
}

impl ServerConfig {
    /// Explicit stream port, else the control port plus one
    pub fn stream_port(&self) -> Result<u16, ConfigError> {
        match self.stream_port {
            Some(port) => Ok(port),
            None => self.port.checked_add(1).ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "server.port {} leaves no room for the stream port; set server.stream_port",
                    self.port
                ))
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SensorKind {
    TestPattern,
    V4l,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    #[serde(default = "default_sensor")]
    pub sensor: SensorKind,

    /// V4L2 device path, only read by the `v4l` sensor
    #[serde(default = "default_device")]
    pub device: String,

    #[serde(default = "default_frame_size")]
    pub frame_size: FrameSize,

    #[serde(default = "default_pixel_format")]
    pub pixel_format: PixelFormat,

    /// Quality used when the sensor itself produces JPEG (1-100)
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,

    /// Number of frame buffers in the capture pool
    #[serde(default = "default_fb_count")]
    pub fb_count: usize,

    /// Capture rate limit for the test pattern
    #[serde(default = "default_fps")]
    pub fps: u32,

    /// How long a capture waits for another session to return a buffer
    #[serde(default = "default_buffer_wait_ms")]
    pub buffer_wait_ms: u64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            sensor: default_sensor(),
            device: default_device(),
            frame_size: default_frame_size(),
            pixel_format: default_pixel_format(),
            jpeg_quality: default_jpeg_quality(),
            fb_count: default_fb_count(),
            fps: default_fps(),
            buffer_wait_ms: default_buffer_wait_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Quality for raw-to-JPEG conversion
    #[serde(default = "default_convert_quality")]
    pub convert_quality: u8,

    /// Frame-time samples in the running average
    #[serde(default = "default_average_window")]
    pub average_window: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            convert_quality: default_convert_quality(),
            average_window: default_average_window(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    #[serde(default = "default_buzzer_ms")]
    pub buzzer_ms: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            buzzer_ms: default_buzzer_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotorConfig {
    /// Wheel speed in percent used for turning and straight driving
    #[serde(default = "default_turn_speed")]
    pub turn_speed: u8,

    #[serde(default = "default_left_forward")]
    pub left_forward: u8,
    #[serde(default = "default_left_backward")]
    pub left_backward: u8,
    #[serde(default = "default_right_forward")]
    pub right_forward: u8,
    #[serde(default = "default_right_backward")]
    pub right_backward: u8,

    #[serde(default = "default_buzzer_channel")]
    pub buzzer_channel: u8,
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self {
            turn_speed: default_turn_speed(),
            left_forward: default_left_forward(),
            left_backward: default_left_backward(),
            right_forward: default_right_forward(),
            right_backward: default_right_backward(),
            buzzer_channel: default_buzzer_channel(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServoConfig {
    #[serde(default = "default_servo_channel")]
    pub channel: u8,

    /// Pulse length count (out of 4096) at position 0
    #[serde(default = "default_servo_min_pulse")]
    pub min_pulse: u16,

    #[serde(default)]
    pub initial_position: u8,
}

impl Default for ServoConfig {
    fn default() -> Self {
        Self {
            channel: default_servo_channel(),
            min_pulse: default_servo_min_pulse(),
            initial_position: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pca9685Config {
    #[serde(default = "default_i2c_bus")]
    pub i2c_bus: u8,

    #[serde(default = "default_pca_address")]
    pub address: u8,

    #[serde(default = "default_oscillator_hz")]
    pub oscillator_hz: u32,

    #[serde(default = "default_pwm_hz")]
    pub pwm_hz: u32,
}

impl Default for Pca9685Config {
    fn default() -> Self {
        Self {
            i2c_bus: default_i2c_bus(),
            address: default_pca_address(),
            oscillator_hz: default_oscillator_hz(),
            pwm_hz: default_pwm_hz(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedConfig {
    #[serde(default = "default_led_pin")]
    pub gpio_pin: u8,
}

impl Default for LedConfig {
    fn default() -> Self {
        Self {
            gpio_pin: default_led_pin(),
        }
    }
}

fn default_bind_ip() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    80
}
fn default_max_streams() -> usize {
    1
}
fn default_sensor() -> SensorKind {
    SensorKind::TestPattern
}
fn default_device() -> String {
    "/dev/video0".to_string()
}
fn default_frame_size() -> FrameSize {
    FrameSize::Vga
}
fn default_pixel_format() -> PixelFormat {
    PixelFormat::Jpeg
}
fn default_jpeg_quality() -> u8 {
    90
}
fn default_fb_count() -> usize {
    2
}
fn default_fps() -> u32 {
    25
}
fn default_buffer_wait_ms() -> u64 {
    1000
}
fn default_convert_quality() -> u8 {
    80
}
fn default_average_window() -> usize {
    20
}
fn default_tick_ms() -> u64 {
    20
}
fn default_buzzer_ms() -> u64 {
    100
}
fn default_turn_speed() -> u8 {
    50
}
fn default_left_forward() -> u8 {
    2
}
fn default_left_backward() -> u8 {
    3
}
fn default_right_forward() -> u8 {
    1
}
fn default_right_backward() -> u8 {
    0
}
fn default_buzzer_channel() -> u8 {
    5
}
fn default_servo_channel() -> u8 {
    4
}
fn default_servo_min_pulse() -> u16 {
    200
}
fn default_i2c_bus() -> u8 {
    1
}
fn default_pca_address() -> u8 {
    0x40
}
fn default_oscillator_hz() -> u32 {
    27_000_000
}
fn default_pwm_hz() -> u32 {
    50
}
fn default_led_pin() -> u8 {
    4
}

impl Config {
    /// Loads configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Like [`Config::load`], but a missing file yields the defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            log::warn!("Config file {} not found, using defaults", path.display());
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        }
        Self::load(path)
    }

    /// Loads configuration from a TOML string
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.max_streams == 0 {
            return Err(ConfigError::Invalid(
                "server.max_streams must be at least 1".to_string(),
            ));
        }

        if self.server.stream_port()? == self.server.port {
            return Err(ConfigError::Invalid(format!(
                "stream port must differ from control port {}",
                self.server.port
            )));
        }

        if self.camera.fb_count == 0 {
            return Err(ConfigError::Invalid(
                "camera.fb_count must be at least 1".to_string(),
            ));
        }

        if self.camera.buffer_wait_ms == 0 {
            return Err(ConfigError::Invalid(
                "camera.buffer_wait_ms must be > 0".to_string(),
            ));
        }

        if self.camera.fps == 0 || self.camera.fps > 120 {
            return Err(ConfigError::Invalid(format!(
                "camera.fps must be between 1 and 120, got {}",
                self.camera.fps
            )));
        }

        for (name, quality) in [
            ("camera.jpeg_quality", self.camera.jpeg_quality),
            ("stream.convert_quality", self.stream.convert_quality),
        ] {
            if quality == 0 || quality > 100 {
                return Err(ConfigError::Invalid(format!(
                    "{} must be between 1 and 100, got {}",
                    name, quality
                )));
            }
        }

        if self.control.tick_ms == 0 {
            return Err(ConfigError::Invalid(
                "control.tick_ms must be > 0".to_string(),
            ));
        }

        if self.motors.turn_speed > 100 {
            return Err(ConfigError::Invalid(format!(
                "motors.turn_speed must be a percentage, got {}",
                self.motors.turn_speed
            )));
        }

        if self.servo.initial_position > 100 {
            return Err(ConfigError::Invalid(format!(
                "servo.initial_position must be between 0 and 100, got {}",
                self.servo.initial_position
            )));
        }

        let channels = [
            self.motors.left_forward,
            self.motors.left_backward,
            self.motors.right_forward,
            self.motors.right_backward,
            self.motors.buzzer_channel,
            self.servo.channel,
        ];
        for (i, ch) in channels.iter().enumerate() {
            if *ch > 15 {
                return Err(ConfigError::Invalid(format!(
                    "PWM channel {} out of range 0-15",
                    ch
                )));
            }
            if channels[i + 1..].contains(ch) {
                return Err(ConfigError::Invalid(format!(
                    "PWM channel {} assigned twice",
                    ch
                )));
            }
        }

        if self.pca9685.pwm_hz == 0 {
            return Err(ConfigError::Invalid(
                "pca9685.pwm_hz must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.port, 80);
        assert_eq!(config.server.stream_port().unwrap(), 81);
        assert_eq!(config.server.max_streams, 1);
        assert_eq!(config.stream.convert_quality, 80);
        assert_eq!(config.stream.average_window, 20);
        assert_eq!(config.motors.turn_speed, 50);
        assert_eq!(config.servo.min_pulse, 200);
        assert_eq!(config.pca9685.oscillator_hz, 27_000_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
[server]
port = 8080
max_streams = 2
host_ip = "192.168.4.1"

[camera]
sensor = "test-pattern"
frame_size = "qvga"
pixel_format = "yuyv"
fb_count = 1

[motors]
turn_speed = 70

[servo]
initial_position = 40
        "#;

        let config = Config::from_str(toml).unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.stream_port().unwrap(), 8081);
        assert_eq!(config.server.max_streams, 2);
        assert_eq!(config.server.host_ip.as_deref(), Some("192.168.4.1"));
        assert_eq!(config.camera.frame_size, FrameSize::Qvga);
        assert_eq!(config.camera.pixel_format, PixelFormat::Yuyv);
        assert_eq!(config.camera.fb_count, 1);
        assert_eq!(config.motors.turn_speed, 70);
        assert_eq!(config.servo.initial_position, 40);
        // untouched sections keep their defaults
        assert_eq!(config.control.tick_ms, 20);
    }

    #[test]
    fn test_explicit_stream_port() {
        let config = Config::from_str("[server]\nport = 9000\nstream_port = 9100\n").unwrap();
        assert_eq!(config.server.stream_port().unwrap(), 9100);
    }

    #[test]
    fn test_invalid_quality() {
        let result = Config::from_str("[stream]\nconvert_quality = 0\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_duplicate_channel_rejected() {
        let result = Config::from_str("[servo]\nchannel = 5\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_top_port_needs_explicit_stream_port() {
        let result = Config::from_str("[server]\nport = 65535\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));

        let config = Config::from_str("[server]\nport = 65535\nstream_port = 8081\n").unwrap();
        assert_eq!(config.server.stream_port().unwrap(), 8081);
    }

    #[test]
    fn test_same_ports_rejected() {
        let result = Config::from_str("[server]\nport = 9000\nstream_port = 9000\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_sensor_is_parse_error() {
        let result = Config::from_str("[camera]\nsensor = \"webcam\"\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[control]\ntick_ms = 5").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.control.tick_ms, 5);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.server.port, 80);

        assert!(matches!(
            Config::load(dir.path().join("absent.toml")),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_roundtrip() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed = Config::from_str(&toml_str).unwrap();

        assert_eq!(config.server.port, parsed.server.port);
        assert_eq!(config.camera.frame_size, parsed.camera.frame_size);
    }
}
