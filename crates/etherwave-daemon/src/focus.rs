use serde::{Deserialize, Serialize};

/// Audio-focus notifications from the host platform.  Injected into the
/// playback core's event queue by platform glue (desktop session hooks, a
/// udev rule for headphone unplug, ...) via the HTTP API.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "change")]
pub enum FocusChange {
    Regained,
    /// Another app took focus for good (user started other media).
    PermanentLoss,
    /// Short interruption, e.g. a call or a notification chime.
    TransientLoss,
    /// Interruption where ducking would be allowed.  For radio streaming a
    /// full pause is preferred over ducking.
    TransientLossCanDuck,
    /// Headset / output device went away.
    DeviceDisconnected,
}

/// What the playback core should do in response to a focus change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusAction {
    None,
    Pause,
    Resume,
}

/// Negotiates audio output rights and maps focus-change events to
/// pause/resume decisions.  Owns the focus flags exclusively; lives inside
/// the playback core so all transitions are serialized with playback state.
///
/// This is the manual strategy: the engine is never trusted to arbitrate
/// focus on its own, which keeps the behaviour identical across platforms.
#[derive(Debug, Default)]
pub struct FocusArbiter {
    has_focus: bool,
    resume_on_regain: bool,
}

impl FocusArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire output rights before starting playback.  Always grants in
    /// this cooperative implementation; the return value is the hook point
    /// for platforms with a real arbiter.
    pub fn request(&mut self) -> bool {
        self.has_focus = true;
        self.resume_on_regain = false;
        true
    }

    /// Release output rights (manual pause / stop).
    pub fn abandon(&mut self) {
        self.has_focus = false;
        self.resume_on_regain = false;
    }

    pub fn has_focus(&self) -> bool {
        self.has_focus
    }

    /// Applies the transition table.  `playing` is whether audio is
    /// currently flowing; losses while not playing change no flags.
    pub fn on_change(&mut self, change: FocusChange, playing: bool) -> FocusAction {
        match change {
            FocusChange::Regained => {
                self.has_focus = true;
                if self.resume_on_regain {
                    self.resume_on_regain = false;
                    FocusAction::Resume
                } else {
                    FocusAction::None
                }
            }
            FocusChange::PermanentLoss => {
                self.has_focus = false;
                self.resume_on_regain = false;
                if playing {
                    FocusAction::Pause
                } else {
                    FocusAction::None
                }
            }
            FocusChange::TransientLoss | FocusChange::TransientLossCanDuck => {
                self.has_focus = false;
                if playing {
                    self.resume_on_regain = true;
                    FocusAction::Pause
                } else {
                    FocusAction::None
                }
            }
            FocusChange::DeviceDisconnected => {
                // Unplugged headphones should never blast the speakers when
                // plugged back in.
                self.resume_on_regain = false;
                if playing {
                    FocusAction::Pause
                } else {
                    FocusAction::None
                }
            }
        }
    }
}
