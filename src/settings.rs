//! # Persisted stepper settings
//!
//! User-edited per-stepper values (bounds, divisions, serial, current limit)
//! and camera metadata live in a small JSON file next to the host config.
//! They are overlaid onto the TOML [`Config`] at start-up with
//! [`Settings::apply_to`].
//!
//! Loading is forgiving: steppers missing from the file are filled from
//! `stepper_1`, empty strings count as unset, numeric strings are accepted
//! for numbers, and an unreadable file falls back to defaults. Saving writes
//! a temporary file, syncs it and renames it over the target.

// src/settings.rs - JSON settings store
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::{Config, StepperConfig};
use crate::hardware::DEFAULT_CURRENT_LIMIT_CODE;
use crate::motion::{AxisId, AxisParameters, DEFAULT_MAX_SPEED};

pub const STEPPER_COUNT: u8 = 3;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Unknown stepper {0}, expected 1 to 3")]
    UnknownStepper(u8),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StepperSettings {
    pub axis: AxisId,
    #[serde(default)]
    pub serial: String,
    #[serde(default = "default_current_limit")]
    pub current_limit: u8,
    #[serde(default = "default_max_speed")]
    pub max_speed: u32,
    #[serde(default)]
    pub divisions: Option<u32>,
    #[serde(default)]
    pub min_position: Option<i32>,
    #[serde(default)]
    pub max_position: Option<i32>,
}

impl StepperSettings {
    pub fn for_axis(axis: AxisId) -> Self {
        Self {
            axis,
            serial: String::new(),
            current_limit: default_current_limit(),
            max_speed: default_max_speed(),
            divisions: None,
            min_position: None,
            max_position: None,
        }
    }

    pub fn parameters(&self) -> AxisParameters {
        AxisParameters {
            min_position: self.min_position,
            max_position: self.max_position,
            divisions: self.divisions,
        }
    }

    pub fn set_parameters(&mut self, parameters: AxisParameters) {
        self.min_position = parameters.min_position;
        self.max_position = parameters.max_position;
        self.divisions = parameters.divisions;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CameraMetadata {
    #[serde(default = "default_subject")]
    pub subject: String,
    #[serde(default = "default_owner")]
    pub owner: String,
    #[serde(default)]
    pub project_name: String,
    #[serde(default)]
    pub notes: String,
}

impl Default for CameraMetadata {
    fn default() -> Self {
        Self {
            subject: default_subject(),
            owner: default_owner(),
            project_name: String::new(),
            notes: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Settings {
    #[serde(skip)]
    path: PathBuf,
    #[serde(flatten)]
    steppers: BTreeMap<String, StepperSettings>,
    camera: CameraMetadata,
}

fn stepper_key(index: u8) -> String {
    format!("stepper_{}", index)
}

fn default_current_limit() -> u8 {
    DEFAULT_CURRENT_LIMIT_CODE
}
fn default_max_speed() -> u32 {
    DEFAULT_MAX_SPEED
}
fn default_subject() -> String {
    "Scan".to_string()
}
fn default_owner() -> String {
    "User".to_string()
}

const NUMERIC_FIELDS: [&str; 5] = [
    "current_limit",
    "max_speed",
    "divisions",
    "min_position",
    "max_position",
];

/// Drops empty strings and turns numeric strings in numeric fields into
/// numbers.
fn normalise(entry: &Map<String, Value>) -> Map<String, Value> {
    entry
        .iter()
        .filter_map(|(key, value)| match value {
            Value::Null => None,
            Value::String(s) if s.trim().is_empty() => None,
            Value::String(s) if NUMERIC_FIELDS.contains(&key.as_str()) => {
                match s.trim().parse::<i64>() {
                    Ok(n) => Some((key.clone(), Value::from(n))),
                    Err(_) => Some((key.clone(), value.clone())),
                }
            }
            _ => Some((key.clone(), value.clone())),
        })
        .collect()
}

impl Settings {
    pub fn defaults(path: impl Into<PathBuf>) -> Self {
        let steppers = (1..=STEPPER_COUNT)
            .filter_map(|index| {
                let axis = AxisId::from_index(index)?;
                Some((stepper_key(index), StepperSettings::for_axis(axis)))
            })
            .collect();
        Self {
            path: path.into(),
            steppers,
            camera: CameraMetadata::default(),
        }
    }

    /// Loads `path`, or defaults when the file is missing or unreadable.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if !path.exists() {
            tracing::info!("No settings at {}, using defaults", path.display());
            return Self::defaults(path);
        }
        match Self::read(&path) {
            Ok(settings) => {
                tracing::info!("Loaded settings from {}", path.display());
                settings
            }
            Err(e) => {
                tracing::warn!("Ignoring settings file {}: {}", path.display(), e);
                Self::defaults(path)
            }
        }
    }

    fn read(path: &Path) -> Result<Self, SettingsError> {
        let contents = fs::read_to_string(path)?;
        let root: Map<String, Value> = serde_json::from_str(&contents)?;
        let entry = |key: &str| match root.get(key) {
            Some(Value::Object(map)) => normalise(map),
            _ => Map::new(),
        };

        let template = entry(&stepper_key(1));
        let mut steppers = BTreeMap::new();
        for index in 1..=STEPPER_COUNT {
            let key = stepper_key(index);
            let mut merged = template.clone();
            // The axis is never inherited from the template.
            merged.remove("axis");
            merged.extend(entry(&key));
            if !merged.contains_key("axis") {
                if let Some(axis) = AxisId::from_index(index) {
                    merged.insert("axis".to_string(), Value::from(axis.name()));
                }
            }
            if let Some(Value::String(axis)) = merged.get_mut("axis") {
                *axis = axis.to_ascii_lowercase();
            }
            let stepper: StepperSettings = serde_json::from_value(Value::Object(merged))?;
            steppers.insert(key, stepper);
        }

        let camera = match root.get("camera") {
            Some(value) => serde_json::from_value(value.clone())?,
            None => CameraMetadata::default(),
        };
        Ok(Self {
            path: path.to_path_buf(),
            steppers,
            camera,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stepper(&self, index: u8) -> Result<&StepperSettings, SettingsError> {
        self.steppers
            .get(&stepper_key(index))
            .ok_or(SettingsError::UnknownStepper(index))
    }

    pub fn stepper_mut(&mut self, index: u8) -> Result<&mut StepperSettings, SettingsError> {
        self.steppers
            .get_mut(&stepper_key(index))
            .ok_or(SettingsError::UnknownStepper(index))
    }

    pub fn steppers(&self) -> impl Iterator<Item = (&str, &StepperSettings)> {
        self.steppers.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn camera(&self) -> &CameraMetadata {
        &self.camera
    }

    pub fn camera_mut(&mut self) -> &mut CameraMetadata {
        &mut self.camera
    }

    /// Writes the settings atomically.
    pub fn save(&self) -> Result<(), SettingsError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(json.as_bytes())?;
            file.flush()?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        tracing::debug!("Saved settings to {}", self.path.display());
        Ok(())
    }

    /// Overlays stored stepper values onto `config`, matched by stepper key.
    pub fn apply_to(&self, config: &mut Config) {
        for (key, stored) in &self.steppers {
            let stepper = config
                .steppers
                .entry(key.clone())
                .or_insert_with(|| StepperConfig::for_axis(stored.axis));
            stepper.axis = Some(stored.axis);
            if !stored.serial.is_empty() {
                stepper.serial = Some(stored.serial.clone());
            }
            stepper.current_limit = stored.current_limit;
            stepper.max_speed = stored.max_speed;
            if stored.parameters() != AxisParameters::default() {
                stepper.set_parameters(stored.parameters());
            }
        }
        config.camera.subject = self.camera.subject.clone();
        config.camera.owner = self.camera.owner.clone();
    }
}
