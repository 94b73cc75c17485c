/// Doorbell controller: turns buzzer presses into chimes and notifications
/// using whatever user settings are currently published, and opens the gate
/// on request.
use crate::hardware::{BuzzerEvent, SimulatedPin};
use crate::sync::SharedSettings;
use crate::units::UnitRegistry;
use embedded_hal::digital::{InputPin, OutputPin};
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// What the controller did in response to a buzzer press.
#[derive(Debug)]
pub struct BuzzerResponse {
    /// The chime pulse, when the unit wants the bell rung.
    pub chime: Option<JoinHandle<()>>,
    /// People to tell that someone is at the gate.
    pub recipients: Vec<String>,
}

pub struct Doorbell<O = SimulatedPin, I = SimulatedPin> {
    units: Arc<UnitRegistry<O, I>>,
    settings: SharedSettings,
}

impl<O, I> Clone for Doorbell<O, I> {
    fn clone(&self) -> Self {
        Self {
            units: Arc::clone(&self.units),
            settings: self.settings.clone(),
        }
    }
}

impl<O, I> Doorbell<O, I>
where
    O: OutputPin + Send + 'static,
    I: InputPin,
{
    pub fn new(units: Arc<UnitRegistry<O, I>>, settings: SharedSettings) -> Self {
        Self { units, settings }
    }

    /// Handle a buzzer press for `unit_id`. Returns `None` for unknown units.
    ///
    /// Without published settings the bell rings, so a visitor is never
    /// silently ignored while the store is unreachable.
    pub async fn on_buzzer(&self, unit_id: &str) -> Option<BuzzerResponse> {
        let Some(unit) = self.units.get(unit_id) else {
            tracing::warn!(unit = unit_id, "buzzer pressed for unknown unit");
            return None;
        };

        let settings = self.settings.unit(unit_id).await;
        if settings.is_none() {
            tracing::info!(unit = unit_id, "no user settings for unit, using defaults");
        }
        let should_ring_bell = settings.as_ref().map_or(true, |s| s.should_ring_bell);
        let recipients = settings.map(|s| s.recipients).unwrap_or_default();

        let chime = if should_ring_bell {
            Some(unit.bell.ring(None))
        } else {
            tracing::info!(unit = unit_id, "chime disabled by user settings");
            None
        };
        if !recipients.is_empty() {
            tracing::info!(unit = unit_id, recipients = ?recipients, "notifying recipients");
        }

        Some(BuzzerResponse { chime, recipients })
    }

    /// Release the strike guarding `unit_id`'s gate.
    pub fn open(&self, unit_id: &str, duration: Option<Duration>) -> Option<JoinHandle<()>> {
        match self.units.get(unit_id) {
            Some(unit) => {
                tracing::info!(unit = unit_id, "opening gate");
                Some(unit.strike.release(duration))
            }
            None => {
                tracing::warn!(unit = unit_id, "open requested for unknown unit");
                None
            }
        }
    }

    /// Sample every buzzer each `tick` until `token` is cancelled.
    pub async fn run_buzzers(&self, token: CancellationToken, tick: Duration) {
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(units = self.units.len(), tick_ms = tick.as_millis() as u64, "watching buzzers");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {}
            }

            let now = Instant::now();
            let pressed: Vec<String> = self
                .units
                .iter()
                .filter(|unit| {
                    let mut buzzer = unit.buzzer.lock().unwrap_or_else(PoisonError::into_inner);
                    buzzer.poll(now) == Some(BuzzerEvent::Pressed)
                })
                .map(|unit| unit.id.clone())
                .collect();

            for unit_id in pressed {
                tracing::info!(unit = %unit_id, "buzzer pressed");
                self.on_buzzer(&unit_id).await;
            }
        }
        tracing::debug!("buzzer polling stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UnitConfig;
    use crate::settings::{Revision, SettingsSnapshot};
    use serde_json::json;

    /// Registry of one unit plus handles on its simulated pins.
    fn registry() -> (Arc<UnitRegistry>, SimulatedPin, SimulatedPin, SimulatedPin) {
        let buzzer = SimulatedPin::pulled_up(17);
        let bell = SimulatedPin::new(27);
        let strike = SimulatedPin::new(22);
        let pins = [buzzer.clone(), bell.clone(), strike.clone()];
        let registry = UnitRegistry::build(
            &[UnitConfig {
                id: "1".to_string(),
                buzzer: 17,
                bell: 27,
                strike: 22,
            }],
            Duration::from_millis(10),
            |n| pins.iter().find(|p| p.number() == n).unwrap().clone(),
            |n| pins.iter().find(|p| p.number() == n).unwrap().clone(),
        );
        (Arc::new(registry), buzzer, bell, strike)
    }

    async fn publish(settings: &SharedSettings, data: serde_json::Value) {
        let serde_json::Value::Object(map) = data else {
            panic!("settings must be an object");
        };
        settings
            .publish(SettingsSnapshot::new(Revision::new("r1"), map))
            .await;
    }

    #[tokio::test]
    async fn test_buzzer_rings_by_default() {
        let (units, _buzzer, bell, _strike) = registry();
        let doorbell = Doorbell::new(units, SharedSettings::new());

        let response = doorbell.on_buzzer("1").await.unwrap();
        assert!(bell.is_set_high());
        assert!(response.recipients.is_empty());
        response.chime.unwrap().await.unwrap();
        assert!(!bell.is_set_high());
    }

    #[tokio::test]
    async fn test_buzzer_respects_chime_setting() {
        let (units, _buzzer, bell, _strike) = registry();
        let settings = SharedSettings::new();
        publish(
            &settings,
            json!({ "1": { "chime": 0, "recipients": { "alice": true } } }),
        )
        .await;
        let doorbell = Doorbell::new(units, settings);

        let response = doorbell.on_buzzer("1").await.unwrap();
        assert!(response.chime.is_none());
        assert!(!bell.is_set_high());
        assert_eq!(response.recipients, vec!["alice"]);
    }

    #[tokio::test]
    async fn test_unknown_unit_is_ignored() {
        let (units, _buzzer, bell, strike) = registry();
        let doorbell = Doorbell::new(units, SharedSettings::new());

        assert!(doorbell.on_buzzer("9").await.is_none());
        assert!(doorbell.open("9", None).is_none());
        assert!(!bell.is_set_high());
        assert!(!strike.is_set_high());
    }

    #[tokio::test]
    async fn test_open_releases_strike() {
        let (units, _buzzer, _bell, strike) = registry();
        let doorbell = Doorbell::new(units, SharedSettings::new());

        let pulse = doorbell.open("1", Some(Duration::from_millis(20))).unwrap();
        assert!(strike.is_set_high());
        pulse.await.unwrap();
        assert!(!strike.is_set_high());
    }

    #[tokio::test]
    async fn test_run_buzzers_rings_on_press() {
        let (units, buzzer, bell, _strike) = registry();
        let doorbell = Doorbell::new(units, SharedSettings::new());
        let token = CancellationToken::new();

        let poller = {
            let doorbell = doorbell.clone();
            let token = token.clone();
            tokio::spawn(async move { doorbell.run_buzzers(token, Duration::from_millis(2)).await })
        };

        buzzer.drive(false);
        tokio::time::timeout(Duration::from_secs(2), async {
            while !bell.is_set_high() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("held buzzer should ring the bell");
        buzzer.drive(true);

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), poller)
            .await
            .unwrap()
            .unwrap();
    }
}
