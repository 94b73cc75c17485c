/// Registry of the physical units wired to this controller.
///
/// Built once from config and handed to whoever needs it; there is no global
/// instance. Units that share a strike pin (one gate, several flats) share a
/// single [`Strike`], so overlapping releases cannot fight over the line.
use crate::config::UnitConfig;
use crate::hardware::{Bell, Buzzer, SimulatedPin, Strike};
use embedded_hal::digital::{InputPin, OutputPin};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One flat's buzzer, chime and gate strike.
pub struct Unit<O = SimulatedPin, I = SimulatedPin> {
    pub id: String,
    pub buzzer: Mutex<Buzzer<I>>,
    pub bell: Bell<O>,
    pub strike: Arc<Strike<O>>,
}

pub struct UnitRegistry<O = SimulatedPin, I = SimulatedPin> {
    units: Vec<Unit<O, I>>,
}

impl<O, I> UnitRegistry<O, I>
where
    O: OutputPin + Send + 'static,
    I: InputPin,
{
    /// Wire up units from config, creating pins with the given constructors.
    ///
    /// Units with an empty id are skipped.
    pub fn build(
        configs: &[UnitConfig],
        buzzer_hold: Duration,
        mut output: impl FnMut(u8) -> O,
        mut input: impl FnMut(u8) -> I,
    ) -> Self {
        let mut strikes: HashMap<u8, Arc<Strike<O>>> = HashMap::new();
        let mut units = Vec::new();

        for config in configs {
            if config.id.is_empty() {
                tracing::debug!(buzzer = config.buzzer, "skipping unit without an id");
                continue;
            }
            let strike = Arc::clone(
                strikes
                    .entry(config.strike)
                    .or_insert_with(|| Arc::new(Strike::new(output(config.strike)))),
            );
            tracing::info!(
                unit = %config.id,
                buzzer = config.buzzer,
                bell = config.bell,
                strike = config.strike,
                "unit wired"
            );
            units.push(Unit {
                id: config.id.clone(),
                buzzer: Mutex::new(Buzzer::new(input(config.buzzer), buzzer_hold)),
                bell: Bell::new(output(config.bell)),
                strike,
            });
        }

        Self { units }
    }

    /// Look up a unit by id. Unknown ids yield `None`.
    pub fn get(&self, unit_id: &str) -> Option<&Unit<O, I>> {
        self.units.iter().find(|u| u.id == unit_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Unit<O, I>> {
        self.units.iter()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.units.iter().map(|u| u.id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

impl UnitRegistry {
    /// Registry backed by [`SimulatedPin`]s (outputs idle low, buzzers idle high).
    pub fn simulated(configs: &[UnitConfig], buzzer_hold: Duration) -> Self {
        Self::build(configs, buzzer_hold, SimulatedPin::new, SimulatedPin::pulled_up)
    }
}
