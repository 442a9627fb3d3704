// crates/visage-pipeline/src/status.rs
//
// Shared control plane. Every worker pool consults this between handler
// invocations; nothing here blocks beyond a leaf mutex.

use std::sync::Mutex;

use log::{error, info, warn};

pub const PREVIEW_DEBUG_DENSITY_MAX: u32 = 5;

/// Where the detailed preview inset is rendered within the frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PreviewPosition {
    BottomLeft,
    BottomRight,
    TopLeft,
    TopRight,
}

/// Directional movement of the preview inset, mapped from operator input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PreviewMove {
    Left,
    Up,
    Right,
    Down,
}

struct StatusState {
    is_running:            bool,
    is_paused:             bool,
    emergency:             bool,
    preview_position:      PreviewPosition,
    preview_debug_density: u32,
}

/// Process-wide run/pause/emergency flags plus preview placement. One lock,
/// no callbacks, safe to poll from any worker.
pub struct Status {
    low_latency: bool,
    state:       Mutex<StatusState>,
}

impl Status {
    pub fn new(low_latency: bool) -> Status {
        Status {
            low_latency,
            state: Mutex::new(StatusState {
                is_running:            true,
                is_paused:             false,
                emergency:             false,
                preview_position:      PreviewPosition::BottomRight,
                preview_debug_density: 0,
            }),
        }
    }

    pub fn low_latency(&self) -> bool {
        self.low_latency
    }

    /// Sticky. Logged once; also clears `is_running` so pollers stop promptly.
    pub fn set_emergency(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.emergency {
            error!("[Status] initiated emergency stop");
        }
        state.emergency = true;
        if state.is_running {
            info!("[Status] running is set to false");
        }
        state.is_running = false;
    }

    pub fn emergency(&self) -> bool {
        self.state.lock().unwrap().emergency
    }

    pub fn set_running(&self, running: bool) {
        let mut state = self.state.lock().unwrap();
        if running != state.is_running {
            info!("[Status] running is set to {running}");
        }
        state.is_running = running;
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().is_running
    }

    /// Pausing is refused in low-latency mode — a camera cannot wait.
    pub fn set_paused(&self, paused: bool) {
        let mut state = self.state.lock().unwrap();
        if paused && self.low_latency {
            warn!("[Status] processing cannot be paused in low-latency mode");
            return;
        }
        if paused != state.is_paused {
            info!(
                "[Status] processing is {}",
                if paused { "paused" } else { "resumed" }
            );
        }
        state.is_paused = paused;
    }

    pub fn toggle_paused(&self) -> bool {
        let paused = !self.is_paused();
        self.set_paused(paused);
        self.is_paused()
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().unwrap().is_paused
    }

    pub fn set_preview_position(&self, position: PreviewPosition) {
        self.state.lock().unwrap().preview_position = position;
    }

    /// Nudge the preview inset. Left and up jump to the far corner; right and
    /// down only return from those corners to the default.
    pub fn move_preview_position(&self, direction: PreviewMove) -> PreviewPosition {
        let mut state = self.state.lock().unwrap();
        state.preview_position = match (direction, state.preview_position) {
            (PreviewMove::Left, _) => PreviewPosition::BottomLeft,
            (PreviewMove::Up, _) => PreviewPosition::TopRight,
            (PreviewMove::Right, PreviewPosition::BottomLeft) => PreviewPosition::BottomRight,
            (PreviewMove::Down, PreviewPosition::TopRight) => PreviewPosition::BottomRight,
            (_, current) => current,
        };
        state.preview_position
    }

    pub fn preview_position(&self) -> PreviewPosition {
        self.state.lock().unwrap().preview_position
    }

    pub fn set_preview_debug_density(&self, density: u32) {
        let mut state = self.state.lock().unwrap();
        state.preview_debug_density = density.min(PREVIEW_DEBUG_DENSITY_MAX);
        info!(
            "[Status] preview debug density set to {}",
            state.preview_debug_density
        );
    }

    /// Cycle the density one step, wrapping back to 0 past the maximum.
    pub fn increment_preview_debug_density(&self) -> u32 {
        let mut state = self.state.lock().unwrap();
        state.preview_debug_density += 1;
        if state.preview_debug_density > PREVIEW_DEBUG_DENSITY_MAX {
            state.preview_debug_density = 0;
        }
        info!(
            "[Status] preview debug density set to {}",
            state.preview_debug_density
        );
        state.preview_debug_density
    }

    pub fn preview_debug_density(&self) -> u32 {
        self.state.lock().unwrap().preview_debug_density
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emergency_is_sticky_and_stops_running() {
        let status = Status::new(false);
        assert!(status.is_running());
        status.set_emergency();
        assert!(status.emergency());
        assert!(!status.is_running());
        // A later set_running cannot clear the emergency flag.
        status.set_running(true);
        assert!(status.emergency());
    }

    #[test]
    fn pause_refused_in_low_latency() {
        let status = Status::new(true);
        status.set_paused(true);
        assert!(!status.is_paused());
    }

    #[test]
    fn pause_toggles_in_offline_mode() {
        let status = Status::new(false);
        assert!(status.toggle_paused());
        assert!(!status.toggle_paused());
    }

    #[test]
    fn preview_position_moves_between_corners() {
        let status = Status::new(false);
        assert_eq!(status.preview_position(), PreviewPosition::BottomRight);
        assert_eq!(
            status.move_preview_position(PreviewMove::Left),
            PreviewPosition::BottomLeft
        );
        assert_eq!(
            status.move_preview_position(PreviewMove::Right),
            PreviewPosition::BottomRight
        );
        assert_eq!(
            status.move_preview_position(PreviewMove::Up),
            PreviewPosition::TopRight
        );
        assert_eq!(
            status.move_preview_position(PreviewMove::Down),
            PreviewPosition::BottomRight
        );
    }

    #[test]
    fn debug_density_wraps_past_max() {
        let status = Status::new(false);
        for expected in 1..=PREVIEW_DEBUG_DENSITY_MAX {
            assert_eq!(status.increment_preview_debug_density(), expected);
        }
        assert_eq!(status.increment_preview_debug_density(), 0);
    }
}
