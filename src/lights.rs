//! Light settings and the PWM collaborator.
//!
//! Four logical lights exist in the settings model; the dimmer drives as
//! many of them as the board has wired channels. Names and enabled flags are
//! persisted, levels are runtime-only.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const LIGHT_COUNT: usize = 4;
pub const NAME_MAX_LEN: usize = 12;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightInfo {
    pub name: String,
    pub enabled: bool,
    #[serde(default)]
    pub level: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LightError {
    InvalidIndex(usize),
    NameTooLong(usize),
    TooMany(usize),
    Driver(String),
}

impl fmt::Display for LightError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LightError::InvalidIndex(i) => write!(f, "no light {}", i),
            LightError::NameTooLong(len) => {
                write!(f, "light name is {} bytes, max {}", len, NAME_MAX_LEN)
            }
            LightError::TooMany(n) => write!(f, "{} lights given, max {}", n, LIGHT_COUNT),
            LightError::Driver(msg) => write!(f, "dimmer error: {}", msg),
        }
    }
}

impl std::error::Error for LightError {}

/// PWM output stage
pub trait Dimmer {
    /// Number of physically wired channels
    fn channels(&self) -> usize;
    /// Starts a fade of `channel` towards `duty`; does not wait for it.
    fn set_duty(&mut self, channel: usize, duty: u8) -> Result<(), LightError>;
}

pub struct LightBank {
    dimmer: Box<dyn Dimmer + Send>,
    lights: [LightInfo; LIGHT_COUNT],
}

impl LightBank {
    pub fn new(dimmer: Box<dyn Dimmer + Send>, stored: [LightInfo; LIGHT_COUNT]) -> Self {
        log::info!(
            "Light bank ready: {} wired channel(s), {} light(s) enabled",
            dimmer.channels(),
            stored.iter().filter(|l| l.enabled).count()
        );
        Self {
            dimmer,
            lights: stored,
        }
    }

    pub fn set_level(&mut self, index: usize, level: u8) -> Result<(), LightError> {
        let light = self
            .lights
            .get_mut(index)
            .ok_or(LightError::InvalidIndex(index))?;
        light.level = level;
        self.drive(index)
    }

    /// Every wired channel to `level` (the `H`/`L` shortcuts)
    pub fn set_all(&mut self, level: u8) -> Result<(), LightError> {
        for light in self.lights.iter_mut() {
            light.level = level;
        }
        for index in 0..LIGHT_COUNT {
            self.drive(index)?;
        }
        Ok(())
    }

    /// Replaces the settings of the first `entries.len()` lights and drives
    /// the new levels. Validation happens before anything changes.
    pub fn apply_setup(&mut self, entries: &[LightInfo]) -> Result<(), LightError> {
        if entries.len() > LIGHT_COUNT {
            return Err(LightError::TooMany(entries.len()));
        }
        if let Some(bad) = entries.iter().find(|e| e.name.len() > NAME_MAX_LEN) {
            return Err(LightError::NameTooLong(bad.name.len()));
        }

        for (slot, entry) in self.lights.iter_mut().zip(entries) {
            *slot = entry.clone();
        }
        for index in 0..entries.len() {
            self.drive(index)?;
        }
        Ok(())
    }

    pub fn snapshot(&self) -> [LightInfo; LIGHT_COUNT] {
        self.lights.clone()
    }

    fn drive(&mut self, index: usize) -> Result<(), LightError> {
        if index >= self.dimmer.channels() {
            // Not wired on this board; the level is only recorded
            return Ok(());
        }
        let light = &self.lights[index];
        let duty = if light.enabled || light.name.is_empty() {
            light.level
        } else {
            0
        };
        log::debug!("Light {} -> duty {}", index, duty);
        self.dimmer.set_duty(index, duty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDimmer;

    fn bank(dimmer: &SimDimmer) -> LightBank {
        LightBank::new(Box::new(dimmer.clone()), Default::default())
    }

    #[test]
    fn set_all_drives_only_wired_channels() {
        let dimmer = SimDimmer::new(2);
        let mut lights = bank(&dimmer);
        lights.set_all(255).unwrap();

        assert_eq!(dimmer.duties(), vec![255, 255]);
        assert!(lights.snapshot().iter().all(|l| l.level == 255));
    }

    #[test]
    fn set_level_rejects_unknown_index() {
        let dimmer = SimDimmer::new(2);
        let mut lights = bank(&dimmer);
        assert_eq!(lights.set_level(4, 10), Err(LightError::InvalidIndex(4)));
        lights.set_level(1, 80).unwrap();
        assert_eq!(dimmer.duties(), vec![0, 80]);
    }

    #[test]
    fn disabled_named_light_is_held_dark() {
        let dimmer = SimDimmer::new(2);
        let mut lights = bank(&dimmer);
        lights
            .apply_setup(&[
                LightInfo { name: "porch".into(), enabled: true, level: 120 },
                LightInfo { name: "hall".into(), enabled: false, level: 200 },
            ])
            .unwrap();
        assert_eq!(dimmer.duties(), vec![120, 0]);
        assert_eq!(lights.snapshot()[1].level, 200);
    }

    #[test]
    fn invalid_setup_changes_nothing() {
        let dimmer = SimDimmer::new(2);
        let mut lights = bank(&dimmer);
        let long = LightInfo { name: "a-very-long-name".into(), enabled: true, level: 1 };
        assert_eq!(
            lights.apply_setup(&[LightInfo::default(), long]),
            Err(LightError::NameTooLong(16))
        );
        assert_eq!(
            lights.apply_setup(&vec![LightInfo::default(); 5]),
            Err(LightError::TooMany(5))
        );
        assert_eq!(lights.snapshot(), <[LightInfo; LIGHT_COUNT]>::default());
    }
}
