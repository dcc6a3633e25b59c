//! LED feedback mapped from engine state signals.
//!
//! LED writes are cosmetic. Every failure here is logged at debug and
//! swallowed so a flaky control tool never disturbs capture.

use tracing::debug;

use crate::engine::events::{EngineListener, StateSignal};
use crate::hardware::HardwareLedControl;

/// Ring color shown while the satellite is listening for an utterance.
const LISTENING_COLOR: &str = "#00AEEF";
const LISTENING_EFFECT: u32 = 1;
const LISTENING_BRIGHTNESS: u8 = 200;
const IDLE_EFFECT: u32 = 0;

/// High-level LED states the satellite distinguishes.
pub trait LedController: Send {
    fn set_idle(&mut self);
    fn set_listening(&mut self);
    fn set_off(&mut self);
}

/// LED controller over the array's control interface.
pub struct HardwareLedController<C: HardwareLedControl> {
    control: C,
}

impl<C: HardwareLedControl> HardwareLedController<C> {
    pub fn new(control: C) -> Self {
        Self { control }
    }
}

impl<C: HardwareLedControl> HardwareLedController<C> {
    fn try_idle(&mut self) -> crate::error::Result<()> {
        self.control.set_power(true)?;
        self.control.set_effect(IDLE_EFFECT)
    }

    fn try_listening(&mut self) -> crate::error::Result<()> {
        self.control.set_power(true)?;
        self.control.set_effect(LISTENING_EFFECT)?;
        self.control.set_color(LISTENING_COLOR)?;
        self.control.set_brightness(LISTENING_BRIGHTNESS)
    }
}

impl<C: HardwareLedControl> LedController for HardwareLedController<C> {
    fn set_idle(&mut self) {
        if let Err(e) = self.try_idle() {
            debug!(error = %e, "led idle write failed");
        }
    }

    fn set_listening(&mut self) {
        if let Err(e) = self.try_listening() {
            debug!(error = %e, "led listening write failed");
        }
    }

    fn set_off(&mut self) {
        if let Err(e) = self.control.set_off() {
            debug!(error = %e, "led off write failed");
        }
    }
}

/// Engine listener that drives an LED controller from state signals.
pub struct LedStateListener<L: LedController> {
    leds: L,
}

impl<L: LedController> LedStateListener<L> {
    pub fn new(mut leds: L) -> Self {
        leds.set_idle();
        Self { leds }
    }
}

impl<L: LedController> EngineListener for LedStateListener<L> {
    fn on_state(&mut self, signal: StateSignal) {
        match signal {
            StateSignal::WakeDetected | StateSignal::CapturingUtterance => {
                self.leds.set_listening();
            }
            StateSignal::Idle
            | StateSignal::UtteranceComplete
            | StateSignal::UtteranceTimeout => {
                self.leds.set_idle();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingLeds {
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    impl LedController for RecordingLeds {
        fn set_idle(&mut self) {
            self.calls.lock().unwrap().push("idle");
        }
        fn set_listening(&mut self) {
            self.calls.lock().unwrap().push("listening");
        }
        fn set_off(&mut self) {
            self.calls.lock().unwrap().push("off");
        }
    }

    #[test]
    fn test_signals_map_to_led_states() {
        let leds = RecordingLeds::default();
        let calls = leds.calls.clone();
        let mut listener = LedStateListener::new(leds);

        listener.on_state(StateSignal::WakeDetected);
        listener.on_state(StateSignal::CapturingUtterance);
        listener.on_state(StateSignal::UtteranceComplete);
        listener.on_state(StateSignal::UtteranceTimeout);
        listener.on_state(StateSignal::Idle);

        assert_eq!(
            *calls.lock().unwrap(),
            vec!["idle", "listening", "listening", "idle", "idle", "idle"]
        );
    }

    #[test]
    fn test_hardware_controller_swallows_failures() {
        struct FailingControl;
        impl HardwareLedControl for FailingControl {
            fn set_effect(&mut self, _: u32) -> crate::error::Result<()> {
                Err(crate::error::WakefrontError::HardwareCommand {
                    message: "nope".to_string(),
                })
            }
            fn set_color(&mut self, _: &str) -> crate::error::Result<()> {
                Ok(())
            }
            fn set_brightness(&mut self, _: u8) -> crate::error::Result<()> {
                Ok(())
            }
            fn set_power(&mut self, _: bool) -> crate::error::Result<()> {
                Ok(())
            }
        }

        let mut leds = HardwareLedController::new(FailingControl);
        leds.set_idle();
        leds.set_listening();
        leds.set_off();
    }
}
