//! Status screen
//!
//! Own name centred on top, then the local reading, the current draw and
//! the most recently heard peers, one per line.

use crate::codec::names::display_suffix;
use crate::hal::{Display, DisplayError};

use super::peers::PeerSnapshot;

pub const SCREEN_WIDTH: i32 = 128;
pub const CHAR_WIDTH: i32 = 8;

const TITLE_Y: i32 = 10;
const FIRST_LINE_Y: i32 = 25;
const LINE_STEP: i32 = 10;

/// X offset that centres `text` on the screen, clamped at the left edge.
pub fn text_x_center(text: &str) -> i32 {
    let width = text.chars().count() as i32 * CHAR_WIDTH;
    ((SCREEN_WIDTH - width) / 2).max(0)
}

/// Everything one refresh of the screen shows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SummaryView {
    pub name: String,
    pub own_value: Option<i32>,
    pub current_ma: Option<f32>,
    pub peers: Vec<PeerSnapshot>,
}

impl SummaryView {
    /// Text lines with their positions, top to bottom.
    pub fn lines(&self) -> Vec<(String, i32, i32)> {
        let mut lines = vec![(self.name.clone(), text_x_center(&self.name), TITLE_Y)];
        let mut y = FIRST_LINE_Y;

        if let Some(value) = self.own_value {
            // Lines are centred on a fixed template so values do not jitter.
            lines.push((format!("Me: {}", value), text_x_center("Me: XXX"), y));
            y += LINE_STEP;
        }
        if let Some(current) = self.current_ma {
            lines.push((format!("I: {:.2} mA", current), text_x_center("I: 000.00 mA"), y));
            y += LINE_STEP;
        }

        y += LINE_STEP;
        for peer in &self.peers {
            lines.push((
                format!("{}: {}", display_suffix(&peer.name), peer.value),
                text_x_center("XXXX: XXX"),
                y,
            ));
            y += LINE_STEP;
        }
        lines
    }

    pub fn render(&self, display: &mut dyn Display) -> Result<(), DisplayError> {
        display.clear()?;
        for (text, x, y) in self.lines() {
            display.draw_text(&text, x, y)?;
        }
        display.present()
    }
}
