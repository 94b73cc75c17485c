//! Doorbell hardware: the gate strike, the chime and the buzzer button.
//!
//! Devices are written against the `embedded-hal` digital pin traits, so the
//! same code drives real GPIO lines or [`SimulatedPin`]s. Outputs are pulsed
//! from a background task; the caller gets the task handle back and may await
//! it (one-shot CLI commands do, so the process does not exit mid-pulse).

use embedded_hal::digital::{ErrorType, InputPin, OutputPin};
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// A pin with no hardware behind it: the level lives in memory and every
/// transition is logged. Clones share the same level.
#[derive(Debug, Clone)]
pub struct SimulatedPin {
    number: u8,
    level: Arc<AtomicBool>,
}

impl SimulatedPin {
    /// A pin that starts low.
    pub fn new(number: u8) -> Self {
        Self {
            number,
            level: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A pin that idles high, like an input with a pull-up resistor.
    pub fn pulled_up(number: u8) -> Self {
        Self {
            number,
            level: Arc::new(AtomicBool::new(true)),
        }
    }

    #[cfg(test)]
    pub fn number(&self) -> u8 {
        self.number
    }

    #[cfg(test)]
    pub fn is_set_high(&self) -> bool {
        self.level.load(Ordering::SeqCst)
    }

    /// Drive the level from outside, as a wired switch would.
    #[cfg(test)]
    pub fn drive(&self, high: bool) {
        self.level.store(high, Ordering::SeqCst);
    }
}

impl ErrorType for SimulatedPin {
    type Error = Infallible;
}

impl OutputPin for SimulatedPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        tracing::debug!(pin = self.number, "pin low");
        self.level.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        tracing::debug!(pin = self.number, "pin high");
        self.level.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl InputPin for SimulatedPin {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        Ok(self.level.load(Ordering::SeqCst))
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        Ok(!self.level.load(Ordering::SeqCst))
    }
}

/// An output driven high for a while and then released.
///
/// A newer pulse supersedes an older one: only the latest pulse drives the
/// pin low when it ends.
struct Pulse<P> {
    name: &'static str,
    pin: Arc<Mutex<P>>,
    generation: Arc<AtomicU64>,
}

impl<P> Pulse<P>
where
    P: OutputPin + Send + 'static,
{
    fn new(name: &'static str, pin: P) -> Self {
        Self {
            name,
            pin: Arc::new(Mutex::new(pin)),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    fn set(pin: &Mutex<P>, name: &'static str, high: bool) {
        let mut pin = pin.lock().unwrap_or_else(PoisonError::into_inner);
        let result = if high { pin.set_high() } else { pin.set_low() };
        if let Err(e) = result {
            tracing::warn!(device = name, high, error = ?e, "failed to drive output pin");
        }
    }

    fn fire(&self, on_time: Duration) -> JoinHandle<()> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        Self::set(&self.pin, self.name, true);

        let pin = Arc::clone(&self.pin);
        let current = Arc::clone(&self.generation);
        let name = self.name;
        tokio::spawn(async move {
            tokio::time::sleep(on_time).await;
            if current.load(Ordering::SeqCst) == generation {
                Self::set(&pin, name, false);
            }
        })
    }
}

/// Electric gate strike. Releasing it opens the gate it guards.
pub struct Strike<P> {
    pulse: Pulse<P>,
}

impl<P> Strike<P>
where
    P: OutputPin + Send + 'static,
{
    pub const DEFAULT_DURATION: Duration = Duration::from_secs(3);

    pub fn new(pin: P) -> Self {
        Self {
            pulse: Pulse::new("strike", pin),
        }
    }

    /// Hold the strike open for `duration` (default 3s), then lock it again.
    pub fn release(&self, duration: Option<Duration>) -> JoinHandle<()> {
        let on_time = duration.unwrap_or(Self::DEFAULT_DURATION);
        tracing::info!(secs = on_time.as_secs_f64(), "releasing strike");
        self.pulse.fire(on_time)
    }
}

/// Doorbell chime.
pub struct Bell<P> {
    pulse: Pulse<P>,
}

impl<P> Bell<P>
where
    P: OutputPin + Send + 'static,
{
    pub const DEFAULT_DING_DONG: Duration = Duration::from_millis(500);

    pub fn new(pin: P) -> Self {
        Self {
            pulse: Pulse::new("bell", pin),
        }
    }

    /// Ring the chime. `ding_dong` is the gap between "ding" and "dong".
    pub fn ring(&self, ding_dong: Option<Duration>) -> JoinHandle<()> {
        let gap = ding_dong.unwrap_or(Self::DEFAULT_DING_DONG);
        tracing::info!(ms = gap.as_millis() as u64, "ringing bell");
        self.pulse.fire(gap)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuzzerEvent {
    /// Held down for at least the hold time.
    Pressed,
    /// Let go after a press.
    Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuzzerState {
    Idle,
    Down { since: Instant },
    Held,
}

/// Active-low buzzer button, sampled by [`Buzzer::poll`].
///
/// Contact shorter than the hold time is treated as bounce and ignored.
pub struct Buzzer<I> {
    pin: I,
    hold_time: Duration,
    state: BuzzerState,
}

impl<I: InputPin> Buzzer<I> {
    pub fn new(pin: I, hold_time: Duration) -> Self {
        Self {
            pin,
            hold_time,
            state: BuzzerState::Idle,
        }
    }

    /// Sample the pin at `now` and advance the debounce state machine.
    pub fn poll(&mut self, now: Instant) -> Option<BuzzerEvent> {
        let down = match self.pin.is_low() {
            Ok(down) => down,
            Err(e) => {
                tracing::warn!(error = ?e, "failed to read buzzer pin");
                false
            }
        };

        match (self.state, down) {
            (BuzzerState::Idle, true) => {
                self.state = BuzzerState::Down { since: now };
                // A zero hold time fires on the first sample.
                self.poll_held(now)
            }
            (BuzzerState::Down { .. }, true) => self.poll_held(now),
            (BuzzerState::Down { .. }, false) => {
                self.state = BuzzerState::Idle;
                None
            }
            (BuzzerState::Held, false) => {
                self.state = BuzzerState::Idle;
                Some(BuzzerEvent::Released)
            }
            (BuzzerState::Idle, false) | (BuzzerState::Held, true) => None,
        }
    }

    fn poll_held(&mut self, now: Instant) -> Option<BuzzerEvent> {
        match self.state {
            BuzzerState::Down { since } if now.saturating_duration_since(since) >= self.hold_time => {
                self.state = BuzzerState::Held;
                Some(BuzzerEvent::Pressed)
            }
            _ => None,
        }
    }
}
