//! PC/SC card driver
//!
//! Thin adapter from the `pcsc` crate onto the driver traits. Reader names
//! cross the boundary as UTF-8 strings. State masks carry the reader's event
//! counter in their upper 16 bits, read via `event_count()` and handed back
//! unchanged on the next wait. pcsclite reports a counter mismatch as a
//! change, so dropping it would make every wait return at once.

use crate::domain::{DriverError, DriverOp, EventState, ReaderObservation};
use crate::io::driver::{
    CardConnection, CardContext, CardDriver, Disposition, Protocols, ShareMode,
};
use std::ffi::CString;
use std::time::Duration;
use tracing::debug;

/// PC/SC driver, establishing user-scope contexts
#[derive(Debug, Default, Clone, Copy)]
pub struct PcscDriver;

impl PcscDriver {
    pub fn new() -> Self {
        Self
    }
}

impl CardDriver for PcscDriver {
    type Context = PcscContext;

    fn establish(&self) -> Result<PcscContext, DriverError> {
        let ctx = pcsc::Context::establish(pcsc::Scope::User)
            .map_err(|e| driver_error(DriverOp::Establish, e))?;
        debug!("pcsc_context_established");
        Ok(PcscContext { ctx })
    }
}

pub struct PcscContext {
    ctx: pcsc::Context,
}

impl CardContext for PcscContext {
    type Card = PcscCard;

    fn list_readers(&self) -> Result<Vec<String>, DriverError> {
        match self.ctx.list_readers_owned() {
            Ok(names) => Ok(names.iter().map(|n| n.to_string_lossy().into_owned()).collect()),
            Err(pcsc::Error::NoReadersAvailable) => Ok(Vec::new()),
            Err(e) => Err(driver_error(DriverOp::ListReaders, e)),
        }
    }

    fn get_status_change(
        &self,
        observations: &mut [ReaderObservation],
        timeout: Option<Duration>,
    ) -> Result<(), DriverError> {
        let mut states = observations
            .iter()
            .map(|obs| {
                let name = reader_cstring(&obs.name, DriverOp::StatusChange)?;
                Ok(pcsc::ReaderState::new(name, to_pcsc_state(obs.current_state)))
            })
            .collect::<Result<Vec<_>, DriverError>>()?;

        self.ctx
            .get_status_change(timeout, &mut states)
            .map_err(|e| driver_error(DriverOp::StatusChange, e))?;

        for (obs, state) in observations.iter_mut().zip(states.iter()) {
            obs.event_state = observed_state(state);
        }
        Ok(())
    }

    fn connect(
        &self,
        reader: &str,
        share: ShareMode,
        protocols: Protocols,
    ) -> Result<PcscCard, DriverError> {
        let name = reader_cstring(reader, DriverOp::Connect)?;
        let share = match share {
            ShareMode::Exclusive => pcsc::ShareMode::Exclusive,
            ShareMode::Shared => pcsc::ShareMode::Shared,
        };
        let protocols = match protocols {
            Protocols::T0 => pcsc::Protocols::T0,
            Protocols::T1 => pcsc::Protocols::T1,
            Protocols::Any => pcsc::Protocols::ANY,
        };
        let card = self
            .ctx
            .connect(&name, share, protocols)
            .map_err(|e| driver_error(DriverOp::Connect, e))?;
        Ok(PcscCard { card })
    }

    fn release(self) -> Result<(), DriverError> {
        self.ctx.release().map_err(|(_, e)| driver_error(DriverOp::Release, e))
    }
}

pub struct PcscCard {
    card: pcsc::Card,
}

impl CardConnection for PcscCard {
    fn transmit(&mut self, apdu: &[u8]) -> Result<Vec<u8>, DriverError> {
        let mut buf = [0u8; pcsc::MAX_BUFFER_SIZE];
        let rsp = self
            .card
            .transmit(apdu, &mut buf)
            .map_err(|e| driver_error(DriverOp::Transmit, e))?;
        Ok(rsp.to_vec())
    }

    fn disconnect(self, disposition: Disposition) -> Result<(), DriverError> {
        let disposition = match disposition {
            Disposition::LeaveCard => pcsc::Disposition::LeaveCard,
            Disposition::ResetCard => pcsc::Disposition::ResetCard,
            Disposition::UnpowerCard => pcsc::Disposition::UnpowerCard,
            Disposition::EjectCard => pcsc::Disposition::EjectCard,
        };
        self.card.disconnect(disposition).map_err(|(_, e)| driver_error(DriverOp::Disconnect, e))
    }
}

fn driver_error(operation: DriverOp, err: pcsc::Error) -> DriverError {
    DriverError::new(operation, err.to_string())
}

fn reader_cstring(name: &str, operation: DriverOp) -> Result<CString, DriverError> {
    CString::new(name)
        .map_err(|_| DriverError::new(operation, format!("reader name contains NUL: {:?}", name)))
}

/// Event state plus event counter, as the driver reported them
fn observed_state(state: &pcsc::ReaderState) -> EventState {
    from_pcsc_state(state.event_state()).with_event_count(state.event_count())
}

fn from_pcsc_state(state: pcsc::State) -> EventState {
    EventState(state.bits() as u32 & EventState::STATE_MASK)
}

/// Baseline for the next wait, counter bits included
fn to_pcsc_state(state: EventState) -> pcsc::State {
    pcsc::State::from_bits_retain(state.bits() as _)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_bits_match_pcsc() {
        assert_eq!(EventState::PRESENT.bits() as u64, pcsc::State::PRESENT.bits() as u64);
        assert_eq!(EventState::EMPTY.bits() as u64, pcsc::State::EMPTY.bits() as u64);
        assert_eq!(EventState::CHANGED.bits() as u64, pcsc::State::CHANGED.bits() as u64);
        assert_eq!(EventState::MUTE.bits() as u64, pcsc::State::MUTE.bits() as u64);
    }

    #[test]
    fn test_event_counter_survives_round_trip() {
        let observed =
            from_pcsc_state(pcsc::State::PRESENT | pcsc::State::CHANGED).with_event_count(3);
        assert_eq!(observed.bits(), 0x0003_0022);
        assert_eq!(observed.event_count(), 3);

        let baseline = to_pcsc_state(observed.acknowledged());
        assert_eq!(baseline.bits() as u64, 0x0003_0020);
    }

    #[test]
    fn test_to_pcsc_state() {
        let state = to_pcsc_state(EventState::PRESENT | EventState::INUSE);
        assert!(state.contains(pcsc::State::PRESENT));
        assert!(state.contains(pcsc::State::INUSE));
        assert!(!state.contains(pcsc::State::EMPTY));
    }

    #[test]
    fn test_reader_cstring_rejects_nul() {
        let err = reader_cstring("bad\0name", DriverOp::Connect).unwrap_err();
        assert_eq!(err.operation, DriverOp::Connect);
    }
}
