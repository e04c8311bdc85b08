//! In-memory peripherals for tests and the simulator

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{Display, DisplayError, DistanceSensor, FuelGauge, Indicator, SensorError};

/// Replays a list of readings, then keeps returning the last one.
#[derive(Debug, Clone)]
pub struct ScriptedSensor {
    script: VecDeque<Result<i32, SensorError>>,
    last: Result<i32, SensorError>,
}

impl ScriptedSensor {
    pub fn new(script: Vec<Result<i32, SensorError>>) -> Self {
        Self {
            script: script.into(),
            last: Err(SensorError::Unavailable),
        }
    }

    /// A sensor that always reads `value`.
    pub fn constant(value: i32) -> Self {
        Self::new(vec![Ok(value)])
    }
}

impl DistanceSensor for ScriptedSensor {
    fn read(&mut self) -> Result<i32, SensorError> {
        if let Some(next) = self.script.pop_front() {
            self.last = next;
        }
        self.last.clone()
    }
}

#[derive(Debug, Clone)]
pub struct FixedGauge {
    reading: Result<f32, SensorError>,
}

impl FixedGauge {
    pub fn new(milliamps: f32) -> Self {
        Self { reading: Ok(milliamps) }
    }

    pub fn failing() -> Self {
        Self {
            reading: Err(SensorError::Unavailable),
        }
    }
}

impl FuelGauge for FixedGauge {
    fn current_average(&mut self) -> Result<f32, SensorError> {
        self.reading.clone()
    }
}

/// Text placed on a [`MemoryDisplay`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextItem {
    pub text: String,
    pub x: i32,
    pub y: i32,
}

#[derive(Debug, Default)]
struct Screen {
    pending: Vec<TextItem>,
    shown: Vec<TextItem>,
    frames: usize,
}

/// Records what would be shown. Clones share the same screen.
#[derive(Debug, Clone, Default)]
pub struct MemoryDisplay {
    screen: Arc<Mutex<Screen>>,
}

impl MemoryDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Items of the last presented frame.
    pub fn shown(&self) -> Vec<TextItem> {
        self.screen.lock().map(|s| s.shown.clone()).unwrap_or_default()
    }

    pub fn frames(&self) -> usize {
        self.screen.lock().map(|s| s.frames).unwrap_or(0)
    }

    fn with_screen(&self, f: impl FnOnce(&mut Screen)) -> Result<(), DisplayError> {
        let mut screen = self
            .screen
            .lock()
            .map_err(|_| DisplayError::WriteFailed("screen poisoned".into()))?;
        f(&mut screen);
        Ok(())
    }
}

impl Display for MemoryDisplay {
    fn clear(&mut self) -> Result<(), DisplayError> {
        self.with_screen(|s| s.pending.clear())
    }

    fn draw_text(&mut self, text: &str, x: i32, y: i32) -> Result<(), DisplayError> {
        self.with_screen(|s| {
            s.pending.push(TextItem {
                text: text.to_string(),
                x,
                y,
            })
        })
    }

    fn present(&mut self) -> Result<(), DisplayError> {
        self.with_screen(|s| {
            s.shown = s.pending.clone();
            s.frames += 1;
        })
    }
}

/// A screen that accepts drawing but fails every `present`. Clones share
/// the attempt count.
#[derive(Debug, Clone, Default)]
pub struct FailingDisplay {
    attempts: Arc<AtomicUsize>,
}

impl FailingDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Display for FailingDisplay {
    fn clear(&mut self) -> Result<(), DisplayError> {
        Ok(())
    }

    fn draw_text(&mut self, _text: &str, _x: i32, _y: i32) -> Result<(), DisplayError> {
        Ok(())
    }

    fn present(&mut self) -> Result<(), DisplayError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(DisplayError::WriteFailed("i2c bus timeout".into()))
    }
}

/// An LED whose every change is recorded. Clones share state, so a test
/// keeps one clone as a probe.
#[derive(Debug, Clone, Default)]
pub struct SimIndicator {
    changes: Arc<Mutex<Vec<bool>>>,
}

impl SimIndicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_on(&self) -> bool {
        self.changes
            .lock()
            .ok()
            .and_then(|c| c.last().copied())
            .unwrap_or(false)
    }

    /// Every `set` call so far.
    pub fn history(&self) -> Vec<bool> {
        self.changes.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Number of times it was switched on.
    pub fn times_lit(&self) -> usize {
        self.history().iter().filter(|on| **on).count()
    }
}

impl Indicator for SimIndicator {
    fn set(&mut self, on: bool) {
        if let Ok(mut changes) = self.changes.lock() {
            changes.push(on);
        }
    }
}
