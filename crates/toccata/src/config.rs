use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

use toccata_core::delta::DeltaParameters;
use toccata_core::kinematics::{CoreMode, Kinematics};
use toccata_core::platform::{FixedPlatform, DEFAULT_IDLE_TIMEOUT};
use toccata_core::{AXES, DRIVES};

/// Machine configuration for the Toccata runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Geometry selection and delta parameters
    #[serde(default)]
    pub geometry: GeometryConfig,

    /// Per-drive settings
    #[serde(default)]
    pub drives: DrivesConfig,

    /// Axis travel limits
    #[serde(default)]
    pub axes: AxesConfig,

    /// Seconds of inactivity before motors drop to idle hold
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            geometry: GeometryConfig::default(),
            drives: DrivesConfig::default(),
            axes: AxesConfig::default(),
            idle_timeout: default_idle_timeout(),
        }
    }
}

/// Geometry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeometryConfig {
    /// One of cartesian, corexy, corexz, coreyz, delta
    #[serde(default = "default_mode")]
    pub mode: String,

    /// Delta geometry, required when mode is "delta"
    pub delta: Option<DeltaConfig>,
}

impl Default for GeometryConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            delta: None,
        }
    }
}

/// Delta tower geometry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaConfig {
    pub diagonal: f64,
    pub radius: f64,

    #[serde(default = "default_print_radius")]
    pub print_radius: f64,

    #[serde(default = "default_homed_height")]
    pub homed_height: f64,

    #[serde(default)]
    pub endstop_adjustments: [f64; AXES],
}

/// Per-drive settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrivesConfig {
    #[serde(default = "default_steps_per_unit")]
    pub steps_per_unit: Vec<f64>,

    /// Maximum acceleration per drive, mm/s^2
    #[serde(default = "default_acceleration")]
    pub acceleration: Vec<f64>,

    /// Maximum instantaneous speed change per drive, mm/s
    #[serde(default = "default_instant_dv")]
    pub instant_dv: Vec<f64>,

    /// Homing feed rate per drive, mm/s
    #[serde(default = "default_home_feed_rate")]
    pub home_feed_rate: Vec<f64>,
}

impl Default for DrivesConfig {
    fn default() -> Self {
        Self {
            steps_per_unit: default_steps_per_unit(),
            acceleration: default_acceleration(),
            instant_dv: default_instant_dv(),
            home_feed_rate: default_home_feed_rate(),
        }
    }
}

/// Axis travel limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AxesConfig {
    #[serde(default)]
    pub minimum: [f64; AXES],

    #[serde(default = "default_axis_maximum")]
    pub maximum: [f64; AXES],

    #[serde(default = "default_z_probe_stop_height")]
    pub z_probe_stop_height: f64,
}

impl Default for AxesConfig {
    fn default() -> Self {
        Self {
            minimum: [0.0; AXES],
            maximum: default_axis_maximum(),
            z_probe_stop_height: default_z_probe_stop_height(),
        }
    }
}

fn default_mode() -> String {
    "cartesian".to_string()
}

fn default_idle_timeout() -> f64 {
    DEFAULT_IDLE_TIMEOUT
}

fn default_print_radius() -> f64 {
    toccata_core::delta::DEFAULT_PRINT_RADIUS
}

fn default_homed_height() -> f64 {
    toccata_core::delta::DEFAULT_DELTA_HOMED_HEIGHT
}

fn default_steps_per_unit() -> Vec<f64> {
    vec![80.0, 80.0, 80.0, 420.0, 420.0]
}

fn default_acceleration() -> Vec<f64> {
    vec![3000.0, 3000.0, 100.0, 1000.0, 1000.0]
}

fn default_instant_dv() -> Vec<f64> {
    vec![15.0, 15.0, 0.2, 2.0, 2.0]
}

fn default_home_feed_rate() -> Vec<f64> {
    vec![50.0, 50.0, 5.0, 10.0, 10.0]
}

fn default_axis_maximum() -> [f64; AXES] {
    [200.0, 200.0, 200.0]
}

fn default_z_probe_stop_height() -> f64 {
    0.7
}

impl Config {
    /// Load configuration from a file, auto-detecting TOML or JSON format
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;

        let extension = path.extension().and_then(|s| s.to_str());

        match extension {
            Some("toml") => Self::from_toml(&content),
            Some("json") => Self::from_json(&content),
            _ => {
                // Try TOML first (preferred), fall back to JSON
                Self::from_toml(&content).or_else(|_| Self::from_json(&content))
            }
        }
    }

    /// Parse configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("failed to parse config as TOML")
    }

    /// Parse configuration from JSON string
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("failed to parse config as JSON")
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        for (name, values) in [
            ("steps_per_unit", &self.drives.steps_per_unit),
            ("acceleration", &self.drives.acceleration),
            ("instant_dv", &self.drives.instant_dv),
            ("home_feed_rate", &self.drives.home_feed_rate),
        ] {
            if values.len() != DRIVES {
                bail!("drives.{} must list {} values", name, DRIVES);
            }
        }
        for &spu in &self.drives.steps_per_unit {
            if spu <= 0.0 {
                bail!("steps_per_unit values must be positive");
            }
        }
        for &accel in &self.drives.acceleration {
            if accel <= 0.0 {
                bail!("acceleration values must be positive");
            }
        }

        match self.geometry.mode.as_str() {
            "delta" => {
                let delta = self
                    .geometry
                    .delta
                    .as_ref()
                    .context("geometry.delta is required when mode is \"delta\"")?;
                if !(delta.radius > 0.0 && delta.diagonal > delta.radius) {
                    bail!(
                        "delta geometry must satisfy diagonal > radius > 0 (got diagonal {}, radius {})",
                        delta.diagonal,
                        delta.radius
                    );
                }
            }
            mode => {
                if CoreMode::parse(mode).is_none() {
                    bail!("unknown geometry mode '{}'", mode);
                }
            }
        }
        Ok(())
    }

    /// Build the kinematics described by this configuration.
    pub fn kinematics(&self) -> Kinematics {
        let mut delta = DeltaParameters::new();
        if self.geometry.mode == "delta" {
            if let Some(cfg) = &self.geometry.delta {
                delta.set_diagonal(cfg.diagonal);
                delta.set_print_radius(cfg.print_radius);
                delta.set_homed_height(cfg.homed_height);
                for (axis, adjustment) in cfg.endstop_adjustments.iter().enumerate() {
                    delta.set_endstop_adjustment(axis, *adjustment);
                }
                delta.set_radius(cfg.radius);
            }
        }
        let core_mode = CoreMode::parse(&self.geometry.mode).unwrap_or_default();
        Kinematics::new(core_mode, delta)
    }

    /// Build a simulation platform from this configuration.
    pub fn platform(&self) -> FixedPlatform {
        let mut platform = FixedPlatform::new();
        for drive in 0..DRIVES {
            platform.steps_per_unit[drive] = self.drives.steps_per_unit[drive];
            platform.acceleration[drive] = self.drives.acceleration[drive];
            platform.instant_dv[drive] = self.drives.instant_dv[drive];
            platform.home_feed_rate[drive] = self.drives.home_feed_rate[drive];
        }
        platform.axis_minimum = self.axes.minimum;
        platform.axis_maximum = self.axes.maximum;
        platform.z_probe_stop_height = self.axes.z_probe_stop_height;
        platform
    }
}
