//! Hardware capabilities of one connector.
//!
//! The host wires the physical outlet in as a group of sampler callbacks.
//! Samplers must be non-blocking and cheap: they are invoked from the tick
//! thread at every tick boundary and are treated as pure reads of hardware
//! state. Unused capabilities default to constant closures, so the hot path
//! never branches on an absent sampler.

/// Result of polling an asynchronous hardware action across ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollResult<T> {
    /// Still in progress; poll again next tick.
    Pending,
    /// Finished with the given outcome.
    Ready(T),
}

type Sampler<T> = Box<dyn FnMut() -> T>;

/// Sampler bundle for one connector. Build with [`ConnectorIo::builder`].
pub struct ConnectorIo {
    /// Cable plugged into the outlet.
    pub(crate) connector_plugged: Sampler<bool>,
    /// The EV asks for energy (Control Pilot state C).
    pub(crate) ev_requests_energy: Sampler<bool>,
    /// The contactor is closed and the outlet is live.
    pub(crate) connector_energized: Sampler<bool>,
    /// OCPP error code samplers; empty string or "NoError" means healthy.
    pub(crate) error_code_samplers: Vec<Sampler<String>>,
    /// Unlock actuator; polled across ticks until a terminal outcome.
    pub(crate) on_unlock: Option<Sampler<PollResult<bool>>>,
    /// Gate delaying the StartTransaction request.
    pub(crate) start_tx_ready: Sampler<bool>,
    /// Gate delaying the StopTransaction request.
    pub(crate) stop_tx_ready: Sampler<bool>,
    /// Occupied without a plugged cable (e.g. parking sensor).
    pub(crate) occupied: Sampler<bool>,
    /// Energy register in Wh.
    pub(crate) energy_meter: Option<Sampler<i32>>,
    /// Active power in W.
    pub(crate) power_meter: Option<Sampler<f64>>,
}

impl ConnectorIo {
    pub fn builder() -> ConnectorIoBuilder {
        ConnectorIoBuilder::default()
    }

    pub(crate) fn plugged(&mut self) -> bool {
        (self.connector_plugged)()
    }

    pub(crate) fn energy_wh(&mut self) -> i32 {
        match &mut self.energy_meter {
            Some(sampler) => sampler(),
            None => 0,
        }
    }
}

impl Default for ConnectorIo {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Builder with defaulted capabilities; set only what the hardware has.
#[derive(Default)]
pub struct ConnectorIoBuilder {
    connector_plugged: Option<Sampler<bool>>,
    ev_requests_energy: Option<Sampler<bool>>,
    connector_energized: Option<Sampler<bool>>,
    error_code_samplers: Vec<Sampler<String>>,
    on_unlock: Option<Sampler<PollResult<bool>>>,
    start_tx_ready: Option<Sampler<bool>>,
    stop_tx_ready: Option<Sampler<bool>>,
    occupied: Option<Sampler<bool>>,
    energy_meter: Option<Sampler<i32>>,
    power_meter: Option<Sampler<f64>>,
}

impl ConnectorIoBuilder {
    pub fn connector_plugged(mut self, f: impl FnMut() -> bool + 'static) -> Self {
        self.connector_plugged = Some(Box::new(f));
        self
    }

    pub fn ev_requests_energy(mut self, f: impl FnMut() -> bool + 'static) -> Self {
        self.ev_requests_energy = Some(Box::new(f));
        self
    }

    pub fn connector_energized(mut self, f: impl FnMut() -> bool + 'static) -> Self {
        self.connector_energized = Some(Box::new(f));
        self
    }

    /// Add an error code sampler; multiple samplers are checked in order of
    /// registration, first non-"NoError" wins.
    pub fn error_code_sampler(mut self, f: impl FnMut() -> String + 'static) -> Self {
        self.error_code_samplers.push(Box::new(f));
        self
    }

    pub fn on_unlock(mut self, f: impl FnMut() -> PollResult<bool> + 'static) -> Self {
        self.on_unlock = Some(Box::new(f));
        self
    }

    pub fn start_tx_ready(mut self, f: impl FnMut() -> bool + 'static) -> Self {
        self.start_tx_ready = Some(Box::new(f));
        self
    }

    pub fn stop_tx_ready(mut self, f: impl FnMut() -> bool + 'static) -> Self {
        self.stop_tx_ready = Some(Box::new(f));
        self
    }

    pub fn occupied(mut self, f: impl FnMut() -> bool + 'static) -> Self {
        self.occupied = Some(Box::new(f));
        self
    }

    pub fn energy_meter(mut self, f: impl FnMut() -> i32 + 'static) -> Self {
        self.energy_meter = Some(Box::new(f));
        self
    }

    pub fn power_meter(mut self, f: impl FnMut() -> f64 + 'static) -> Self {
        self.power_meter = Some(Box::new(f));
        self
    }

    pub fn build(self) -> ConnectorIo {
        ConnectorIo {
            connector_plugged: self.connector_plugged.unwrap_or_else(|| Box::new(|| false)),
            ev_requests_energy: self.ev_requests_energy.unwrap_or_else(|| Box::new(|| true)),
            connector_energized: self
                .connector_energized
                .unwrap_or_else(|| Box::new(|| true)),
            error_code_samplers: self.error_code_samplers,
            on_unlock: self.on_unlock,
            start_tx_ready: self.start_tx_ready.unwrap_or_else(|| Box::new(|| true)),
            stop_tx_ready: self.stop_tx_ready.unwrap_or_else(|| Box::new(|| true)),
            occupied: self.occupied.unwrap_or_else(|| Box::new(|| false)),
            energy_meter: self.energy_meter,
            power_meter: self.power_meter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn defaults_are_constant_closures() {
        let mut io = ConnectorIo::default();
        assert!(!io.plugged());
        assert!((io.ev_requests_energy)());
        assert!((io.connector_energized)());
        assert!((io.start_tx_ready)());
        assert!((io.stop_tx_ready)());
        assert!(!(io.occupied)());
        assert_eq!(io.energy_wh(), 0);
        assert!(io.error_code_samplers.is_empty());
        assert!(io.on_unlock.is_none());
    }

    #[test]
    fn builder_wires_stateful_samplers() {
        let plugged = Rc::new(Cell::new(false));
        let plugged_in = plugged.clone();
        let mut io = ConnectorIo::builder()
            .connector_plugged(move || plugged_in.get())
            .energy_meter(|| 1234)
            .build();

        assert!(!io.plugged());
        plugged.set(true);
        assert!(io.plugged());
        assert_eq!(io.energy_wh(), 1234);
    }
}
