//! PWM dimming on the LEDC peripheral.

use anyhow::Result;
use esp_idf_hal::gpio::OutputPin;
use esp_idf_hal::ledc::{config::TimerConfig, LedcDriver, LedcTimerDriver, Resolution, LEDC};
use esp_idf_hal::peripheral::Peripheral;
use esp_idf_hal::prelude::*;
use esp_idf_sys::{
    esp, ledc_fade_func_install, ledc_fade_mode_t_LEDC_FADE_NO_WAIT, ledc_fade_start,
    ledc_mode_t_LEDC_LOW_SPEED_MODE, ledc_set_fade_with_time,
};

use crate::lights::{Dimmer, LightError};

const PWM_FREQUENCY_KHZ: u32 = 25;
const FADE_TIME_MS: i32 = 250;

/// Two wired channels: light 0 on the first pin, light 1 on the second
pub struct LedcDimmer {
    channels: [LedcDriver<'static>; 2],
}

impl LedcDimmer {
    pub fn new(
        ledc: LEDC,
        pin0: impl Peripheral<P = impl OutputPin> + 'static,
        pin1: impl Peripheral<P = impl OutputPin> + 'static,
    ) -> Result<Self> {
        let config = TimerConfig::new()
            .frequency(PWM_FREQUENCY_KHZ.kHz().into())
            .resolution(Resolution::Bits8);
        // The timer must outlive both channel drivers, which live forever
        let timer = Box::leak(Box::new(LedcTimerDriver::new(ledc.timer0, &config)?));

        let mut first = LedcDriver::new(ledc.channel0, &*timer, pin0)?;
        let mut second = LedcDriver::new(ledc.channel1, &*timer, pin1)?;
        first.set_duty(0)?;
        second.set_duty(0)?;

        esp!(unsafe { ledc_fade_func_install(0) })?;
        log::info!("LEDC ready: {} kHz, 8-bit, {} ms fades", PWM_FREQUENCY_KHZ, FADE_TIME_MS);
        Ok(Self {
            channels: [first, second],
        })
    }
}

impl Dimmer for LedcDimmer {
    fn channels(&self) -> usize {
        self.channels.len()
    }

    fn set_duty(&mut self, channel: usize, duty: u8) -> Result<(), LightError> {
        if channel >= self.channels.len() {
            return Err(LightError::InvalidIndex(channel));
        }
        // Channel drivers were created from channel0/channel1 in order
        let hw_channel = channel as u32;
        esp!(unsafe {
            ledc_set_fade_with_time(
                ledc_mode_t_LEDC_LOW_SPEED_MODE,
                hw_channel,
                u32::from(duty),
                FADE_TIME_MS,
            )
        })
        .and_then(|()| {
            esp!(unsafe {
                ledc_fade_start(
                    ledc_mode_t_LEDC_LOW_SPEED_MODE,
                    hw_channel,
                    ledc_fade_mode_t_LEDC_FADE_NO_WAIT,
                )
            })
        })
        .map_err(|e| LightError::Driver(format!("fade on channel {}: {}", channel, e)))
    }
}
