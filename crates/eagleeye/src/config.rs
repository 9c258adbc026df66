use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::detect::DEFAULT_CLASSES;

/// Channel name reserved for detection events (`/ws/detections`).
pub const DETECTIONS_CHANNEL: &str = "detections";

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address, e.g. `0.0.0.0:8000`
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8000".to_string()
}

/// Broadcast loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Ticks per second of the broadcast loop
    #[serde(default = "default_tick_hz")]
    pub tick_hz: f64,
    /// A subscriber whose socket write takes longer than this is dropped
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// Messages buffered per subscriber before it counts as stalled
    #[serde(default = "default_subscriber_queue")]
    pub subscriber_queue: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            tick_hz: default_tick_hz(),
            send_timeout_ms: default_send_timeout_ms(),
            subscriber_queue: default_subscriber_queue(),
        }
    }
}

fn default_tick_hz() -> f64 {
    60.0
}

fn default_send_timeout_ms() -> u64 {
    500
}

fn default_subscriber_queue() -> usize {
    4
}

/// Frame encoding for the streaming endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodingConfig {
    /// JPEG quality, 1-100
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

impl Default for EncodingConfig {
    fn default() -> Self {
        Self {
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

fn default_jpeg_quality() -> u8 {
    80
}

/// Configuration for a single capture source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Unique name for the source (used in endpoint paths)
    pub name: String,
    /// Look up a perspective transform for this source in the calibration store
    #[serde(default = "default_true")]
    pub calibrate: bool,
    /// Source kind and its parameters
    #[serde(flatten)]
    pub kind: SourceKind,
}

fn default_true() -> bool {
    true
}

/// The kinds of source the capture layer knows how to open
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceKind {
    /// Generated moving test pattern
    Synthetic {
        #[serde(default = "default_width")]
        width: u32,
        #[serde(default = "default_height")]
        height: u32,
        /// 3 for RGB, 1 for single-channel (thermal-like)
        #[serde(default = "default_channels")]
        channels: u8,
        #[serde(default = "default_fps")]
        fps: f64,
    },
    /// Replays a directory of JPEG/PNG files in name order
    Images {
        path: PathBuf,
        #[serde(default = "default_fps")]
        fps: f64,
        /// Start over after the last file instead of ending the stream
        #[serde(default)]
        repeat: bool,
    },
    /// Event camera recording as `x,y,p,t` CSV lines
    EventCsv {
        path: PathBuf,
        width: u32,
        height: u32,
        #[serde(default = "default_window_us")]
        window_us: u64,
        #[serde(default = "default_accumulation_us")]
        accumulation_us: u64,
    },
    /// Generated event stream
    SyntheticEvents {
        #[serde(default = "default_width")]
        width: u32,
        #[serde(default = "default_height")]
        height: u32,
        #[serde(default = "default_window_us")]
        window_us: u64,
        #[serde(default = "default_accumulation_us")]
        accumulation_us: u64,
        /// Events generated per window
        #[serde(default = "default_events_per_window")]
        events_per_window: u32,
    },
}

fn default_width() -> u32 {
    640
}

fn default_height() -> u32 {
    480
}

fn default_channels() -> u8 {
    3
}

fn default_fps() -> f64 {
    30.0
}

fn default_window_us() -> u64 {
    33_333
}

fn default_accumulation_us() -> u64 {
    5_000
}

fn default_events_per_window() -> u32 {
    2_000
}

/// Where the detection stage runs relative to the broadcast loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMode {
    /// Inference runs inside the tick that consumed the frame
    #[default]
    Inline,
    /// Inference runs on its own task; results are picked up on a later tick
    Offload,
}

/// Detector implementation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// No model attached; every frame yields zero boxes
    #[default]
    None,
    /// HTTP inference service
    Remote {
        /// Endpoint receiving JPEG frames by POST
        url: String,
        #[serde(default = "default_remote_timeout_ms")]
        timeout_ms: u64,
        #[serde(default = "default_min_confidence")]
        min_confidence: f32,
    },
}

fn default_remote_timeout_ms() -> u64 {
    2_000
}

fn default_min_confidence() -> f32 {
    0.25
}

/// Detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Source routed through the detector
    #[serde(default = "default_detection_source")]
    pub source: String,
    /// Class ids retained; boxes of any other class are dropped
    #[serde(default = "default_classes")]
    pub classes: Vec<u32>,
    /// Unset means offload for the remote backend and inline otherwise
    #[serde(default)]
    pub mode: Option<DetectionMode>,
    /// Time limit on one inline inference call; one tick period if unset
    #[serde(default)]
    pub inline_budget_ms: Option<u64>,
    #[serde(default)]
    pub backend: BackendConfig,
}

impl DetectionConfig {
    /// The mode the hub runs the detector in.
    pub fn effective_mode(&self) -> DetectionMode {
        match (self.mode, &self.backend) {
            (Some(mode), _) => mode,
            (None, BackendConfig::Remote { .. }) => DetectionMode::Offload,
            (None, BackendConfig::None) => DetectionMode::Inline,
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            source: default_detection_source(),
            classes: default_classes(),
            mode: None,
            inline_budget_ms: None,
            backend: BackendConfig::default(),
        }
    }
}

fn default_detection_source() -> String {
    "rgb".to_string()
}

fn default_classes() -> Vec<u32> {
    DEFAULT_CLASSES.to_vec()
}

/// Inbound upload endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Name of the virtual source uploaded frames are published as
    #[serde(default = "default_upload_source")]
    pub source: String,
    /// Process only every Nth message of a connection
    #[serde(default = "default_frame_skip")]
    pub frame_skip: u32,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            source: default_upload_source(),
            frame_skip: default_frame_skip(),
        }
    }
}

fn default_upload_source() -> String {
    "upload".to_string()
}

fn default_frame_skip() -> u32 {
    2
}

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub encoding: EncodingConfig,
    /// Directory holding `<source>.yaml` perspective transforms
    #[serde(default)]
    pub calibration_dir: Option<PathBuf>,
    /// Capture sources
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub upload: UploadConfig,
}

impl Config {
    /// Load and validate configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::parse(&contents)
    }

    /// Parse and validate configuration from a YAML string
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Names of every channel the hub serves frames on, upload source included.
    pub fn source_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sources.iter().map(|s| s.name.clone()).collect();
        if self.upload.enabled {
            names.push(self.upload.source.clone());
        }
        names
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sources.is_empty() && !self.upload.enabled {
            return Err(invalid("at least one source is required"));
        }

        let mut seen = HashSet::new();
        for name in self.source_names() {
            validate_source_name(&name).map_err(ConfigError::ValidationError)?;
            if !seen.insert(name.clone()) {
                return Err(invalid(format!("duplicate source name '{}'", name)));
            }
        }

        for source in &self.sources {
            validate_source_kind(&source.kind)
                .map_err(|e| invalid(format!("source '{}': {}", source.name, e)))?;
        }

        if !(self.hub.tick_hz > 0.0 && self.hub.tick_hz.is_finite()) {
            return Err(invalid("hub.tick_hz must be a positive number"));
        }
        if self.hub.subscriber_queue == 0 {
            return Err(invalid("hub.subscriber_queue must be at least 1"));
        }
        if !(1..=100).contains(&self.encoding.jpeg_quality) {
            return Err(invalid("encoding.jpeg_quality must be within 1-100"));
        }
        if self.upload.frame_skip == 0 {
            return Err(invalid("upload.frame_skip must be at least 1"));
        }

        if self.detection.enabled {
            if !seen.contains(&self.detection.source) {
                return Err(invalid(format!(
                    "detection.source '{}' is not a configured source",
                    self.detection.source
                )));
            }
            if self.detection.classes.is_empty() {
                return Err(invalid("detection.classes must not be empty"));
            }
            if self.detection.inline_budget_ms == Some(0) {
                return Err(invalid("detection.inline_budget_ms must be positive"));
            }
            if let BackendConfig::Remote {
                url,
                min_confidence,
                ..
            } = &self.detection.backend
            {
                if url.is_empty() {
                    return Err(invalid("detection.backend.url must not be empty"));
                }
                if !(0.0..=1.0).contains(min_confidence) {
                    return Err(invalid("detection.backend.min_confidence must be within 0-1"));
                }
            }
        }

        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(msg.into())
}

/// Validate a source name: 1-64 chars, `[a-zA-Z0-9_-]` only, not reserved.
pub fn validate_source_name(name: &str) -> Result<(), String> {
    if name.is_empty() || name.len() > 64 {
        return Err(format!(
            "Source name must be 1-64 characters, got {}",
            name.len()
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(format!(
            "Source name '{}' may only contain alphanumeric characters, hyphens, and underscores",
            name
        ));
    }
    if name == DETECTIONS_CHANNEL {
        return Err(format!("Source name '{}' is reserved", name));
    }
    Ok(())
}

fn validate_source_kind(kind: &SourceKind) -> Result<(), String> {
    match kind {
        SourceKind::Synthetic {
            width,
            height,
            channels,
            fps,
        } => {
            check_geometry(*width, *height)?;
            if *channels != 1 && *channels != 3 {
                return Err(format!("channels must be 1 or 3, got {}", channels));
            }
            check_fps(*fps)
        }
        SourceKind::Images { fps, .. } => check_fps(*fps),
        SourceKind::EventCsv {
            width,
            height,
            window_us,
            accumulation_us,
            ..
        }
        | SourceKind::SyntheticEvents {
            width,
            height,
            window_us,
            accumulation_us,
            ..
        } => {
            check_geometry(*width, *height)?;
            if *window_us == 0 || *accumulation_us == 0 {
                return Err("window_us and accumulation_us must be positive".to_string());
            }
            Ok(())
        }
    }
}

fn check_geometry(width: u32, height: u32) -> Result<(), String> {
    if width == 0 || height == 0 {
        return Err(format!("invalid geometry {}x{}", width, height));
    }
    Ok(())
}

fn check_fps(fps: f64) -> Result<(), String> {
    if fps > 0.0 && fps.is_finite() {
        Ok(())
    } else {
        Err(format!("fps must be positive, got {}", fps))
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let yaml = r#"
calibration_dir: "/media/ssd/calib"
sources:
  - name: "rgb"
    kind: synthetic
    calibrate: false
  - name: "thermal"
    kind: synthetic
    channels: 1
    fps: 9
  - name: "event"
    kind: event_csv
    path: "/data/events.csv"
    width: 1280
    height: 720
"#;
        let config = Config::parse(yaml).unwrap();
        assert_eq!(config.sources.len(), 3);
        assert_eq!(config.sources[0].name, "rgb");
        assert!(!config.sources[0].calibrate);
        assert!(config.sources[1].calibrate); // default
        assert_eq!(
            config.sources[1].kind,
            SourceKind::Synthetic {
                width: 640,
                height: 480,
                channels: 1,
                fps: 9.0
            }
        );
        match &config.sources[2].kind {
            SourceKind::EventCsv {
                window_us,
                accumulation_us,
                ..
            } => {
                assert_eq!(*window_us, 33_333);
                assert_eq!(*accumulation_us, 5_000);
            }
            other => panic!("unexpected kind {:?}", other),
        }

        // Defaults
        assert_eq!(config.server.bind, "0.0.0.0:8000");
        assert_eq!(config.hub.tick_hz, 60.0);
        assert_eq!(config.hub.send_timeout_ms, 500);
        assert_eq!(config.encoding.jpeg_quality, 80);
        assert!(config.detection.enabled);
        assert_eq!(config.detection.source, "rgb");
        assert_eq!(config.detection.classes, vec![0, 1, 2, 3, 5, 7]);
        assert_eq!(config.detection.mode, None);
        assert_eq!(config.detection.effective_mode(), DetectionMode::Inline);
        assert_eq!(config.detection.inline_budget_ms, None);
        assert_eq!(config.detection.backend, BackendConfig::None);
        assert!(!config.upload.enabled);
        assert_eq!(config.upload.frame_skip, 2);
    }

    #[test]
    fn test_parse_remote_backend() {
        let yaml = r#"
sources:
  - name: "rgb"
    kind: synthetic
detection:
  mode: offload
  backend:
    type: remote
    url: "http://127.0.0.1:9000/track"
"#;
        let config = Config::parse(yaml).unwrap();
        assert_eq!(config.detection.effective_mode(), DetectionMode::Offload);
        assert_eq!(
            config.detection.backend,
            BackendConfig::Remote {
                url: "http://127.0.0.1:9000/track".to_string(),
                timeout_ms: 2_000,
                min_confidence: 0.25,
            }
        );
    }

    #[test]
    fn test_remote_backend_defaults_to_offload() {
        let yaml = r#"
sources:
  - name: "rgb"
    kind: synthetic
detection:
  backend:
    type: remote
    url: "http://127.0.0.1:9000/track"
"#;
        let config = Config::parse(yaml).unwrap();
        assert_eq!(config.detection.mode, None);
        assert_eq!(config.detection.effective_mode(), DetectionMode::Offload);

        let yaml = r#"
sources:
  - name: "rgb"
    kind: synthetic
detection:
  mode: inline
  inline_budget_ms: 250
  backend:
    type: remote
    url: "http://127.0.0.1:9000/track"
"#;
        let config = Config::parse(yaml).unwrap();
        assert_eq!(config.detection.effective_mode(), DetectionMode::Inline);
        assert_eq!(config.detection.inline_budget_ms, Some(250));

        let yaml = r#"
sources:
  - name: "rgb"
    kind: synthetic
detection:
  inline_budget_ms: 0
"#;
        assert!(Config::parse(yaml).is_err());
    }

    #[test]
    fn test_upload_source_can_be_detection_source() {
        let yaml = r#"
sources: []
upload:
  enabled: true
detection:
  source: upload
"#;
        let config = Config::parse(yaml).unwrap();
        assert_eq!(config.source_names(), vec!["upload".to_string()]);
    }

    #[test]
    fn test_rejects_unknown_detection_source() {
        let yaml = r#"
sources:
  - name: "thermal"
    kind: synthetic
"#;
        let err = Config::parse(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
        assert!(err.to_string().contains("detection.source"));
    }

    #[test]
    fn test_rejects_duplicate_and_reserved_names() {
        let dup = r#"
sources:
  - name: "rgb"
    kind: synthetic
  - name: "rgb"
    kind: synthetic
"#;
        assert!(Config::parse(dup).unwrap_err().to_string().contains("duplicate"));

        let reserved = r#"
sources:
  - name: "detections"
    kind: synthetic
detection:
  enabled: false
"#;
        assert!(Config::parse(reserved)
            .unwrap_err()
            .to_string()
            .contains("reserved"));
    }

    #[test]
    fn test_rejects_bad_values() {
        let yaml = r#"
hub:
  tick_hz: 0
sources:
  - name: "rgb"
    kind: synthetic
"#;
        assert!(Config::parse(yaml).is_err());

        let yaml = r#"
sources:
  - name: "rgb"
    kind: synthetic
    channels: 4
"#;
        assert!(Config::parse(yaml).is_err());
    }

    #[test]
    fn test_shipped_config_loads() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config.yaml");
        let config = Config::from_file(path).unwrap();
        assert_eq!(config.source_names(), vec!["rgb", "thermal", "event"]);
        assert!(!config.sources[0].calibrate);
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file("/nonexistent/eagleeye.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::IoError(_)));
    }

    #[test]
    fn test_validate_source_name() {
        assert!(validate_source_name("rgb").is_ok());
        assert!(validate_source_name("therm-01_a").is_ok());
        assert!(validate_source_name("").is_err());
        assert!(validate_source_name("a/b").is_err());
        assert!(validate_source_name(&"x".repeat(65)).is_err());
    }
}
