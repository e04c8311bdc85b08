//! Board peripherals the mesh node talks to
//!
//! Narrow traits over the distance sensor, fuel gauge, screen and the
//! indicator LEDs. Hardware backends live outside this crate; `sim` has
//! in-memory ones.

pub mod sim;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SensorError {
    #[error("Sensor read failed: {0}")]
    ReadFailed(String),

    #[error("Sensor unavailable")]
    Unavailable,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DisplayError {
    #[error("Display write failed: {0}")]
    WriteFailed(String),
}

/// Time-of-flight distance sensor.
pub trait DistanceSensor: Send {
    /// Distance in millimetres.
    fn read(&mut self) -> Result<i32, SensorError>;
}

/// Battery fuel gauge.
pub trait FuelGauge: Send {
    /// Average current draw in mA.
    fn current_average(&mut self) -> Result<f32, SensorError>;
}

/// 128 px wide text screen with an 8 px font.
pub trait Display: Send {
    fn clear(&mut self) -> Result<(), DisplayError>;
    fn draw_text(&mut self, text: &str, x: i32, y: i32) -> Result<(), DisplayError>;
    fn present(&mut self) -> Result<(), DisplayError>;
}

pub trait Indicator: Send {
    fn set(&mut self, on: bool);
}

/// Indicators addressed by code: code `i` drives the `i`-th one.
#[derive(Default)]
pub struct IndicatorBank {
    indicators: Vec<Box<dyn Indicator>>,
}

impl IndicatorBank {
    pub fn new(indicators: Vec<Box<dyn Indicator>>) -> Self {
        Self { indicators }
    }

    pub fn len(&self) -> usize {
        self.indicators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indicators.is_empty()
    }

    /// Drive the indicator for `code`. Returns false when no indicator
    /// maps to it.
    pub fn set(&mut self, code: u8, on: bool) -> bool {
        match self.indicators.get_mut(code as usize) {
            Some(indicator) => {
                indicator.set(on);
                true
            }
            None => {
                log::debug!("No indicator for code {}", code);
                false
            }
        }
    }

    pub fn all_off(&mut self) {
        for indicator in &mut self.indicators {
            indicator.set(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::sim::SimIndicator;
    use super::*;

    fn bank(n: usize) -> (IndicatorBank, Vec<SimIndicator>) {
        let leds: Vec<SimIndicator> = (0..n).map(|_| SimIndicator::new()).collect();
        let boxed = leds
            .iter()
            .map(|led| Box::new(led.clone()) as Box<dyn Indicator>)
            .collect();
        (IndicatorBank::new(boxed), leds)
    }

    #[test]
    fn test_code_selects_indicator() {
        let (mut bank, leds) = bank(3);
        assert!(bank.set(1, true));
        assert!(!leds[0].is_on());
        assert!(leds[1].is_on());
        assert!(!leds[2].is_on());

        bank.all_off();
        assert!(leds.iter().all(|led| !led.is_on()));
    }

    #[test]
    fn test_unknown_code_is_ignored() {
        let (mut bank, leds) = bank(3);
        assert!(!bank.set(7, true));
        assert!(leds.iter().all(|led| led.history().is_empty()));
    }
}
