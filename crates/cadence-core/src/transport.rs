//! Transport state and timebase arbitration.
//!
//! At most one client supplies the timing reference (the timebase master). A
//! client may claim it unconditionally, replacing the current holder, or
//! conditionally, in which case the claim is denied while any other client holds it.

use crate::client::RefNum;
use crate::error::{EngineError, Result};

/// Rolling state of the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportState {
    /// Not moving.
    #[default]
    Stopped,
    /// Start requested; becomes `Rolling` at the next cycle.
    Starting,
    /// Advancing by one buffer each cycle.
    Rolling,
}

/// Transport owned by the engine control.
#[derive(Debug, Default)]
pub struct Transport {
    timebase_master: Option<RefNum>,
    conditional: bool,
    state: TransportState,
    frame: u64,
    pending_locate: Option<u64>,
}

impl Transport {
    /// Creates a stopped transport at frame zero with no timebase master.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `refnum` the timebase master.
    ///
    /// A conditional request fails with [`EngineError::TimebaseBusy`] while another
    /// client holds the timebase; if `refnum` already holds it the request succeeds
    /// without change.
    pub fn set_timebase_master(&mut self, refnum: RefNum, conditional: bool) -> Result<()> {
        match self.timebase_master {
            Some(current) if conditional && current != refnum => {
                tracing::debug!(
                    %refnum,
                    %current,
                    "conditional timebase request denied"
                );
                Err(EngineError::TimebaseBusy(current))
            }
            Some(current) if conditional && current == refnum => {
                tracing::debug!(%refnum, "client was already timebase master");
                Ok(())
            }
            _ => {
                self.timebase_master = Some(refnum);
                self.conditional = conditional;
                tracing::debug!(%refnum, conditional, "new timebase master");
                Ok(())
            }
        }
    }

    /// Releases the timebase held by `refnum`.
    pub fn reset_timebase(&mut self, refnum: RefNum) -> Result<()> {
        if self.timebase_master == Some(refnum) {
            self.timebase_master = None;
            self.conditional = false;
            Ok(())
        } else {
            Err(EngineError::NotTimebaseMaster(refnum))
        }
    }

    /// Current timebase master, if any.
    pub fn timebase_master(&self) -> Option<RefNum> {
        self.timebase_master
    }

    /// Whether the current master claimed the timebase conditionally.
    pub fn is_conditional(&self) -> bool {
        self.conditional
    }

    /// Drops any timebase claim held by a client that is going away.
    pub fn client_closed(&mut self, refnum: RefNum) {
        if self.timebase_master == Some(refnum) {
            tracing::debug!(%refnum, "timebase master closed, releasing timebase");
            self.timebase_master = None;
            self.conditional = false;
        }
    }

    /// Requests the transport to start rolling.
    pub fn start(&mut self) {
        if self.state == TransportState::Stopped {
            self.state = TransportState::Starting;
        }
    }

    /// Stops the transport.
    pub fn stop(&mut self) {
        self.state = TransportState::Stopped;
    }

    /// Requests a relocation, applied at the next cycle.
    pub fn locate(&mut self, frame: u64) {
        self.pending_locate = Some(frame);
    }

    /// Current state.
    pub fn state(&self) -> TransportState {
        self.state
    }

    /// Current frame position.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Advances the transport at the start of a cycle of `frames` frames.
    pub fn cycle_begin(&mut self, frames: u32) {
        if let Some(frame) = self.pending_locate.take() {
            self.frame = frame;
        }
        match self.state {
            TransportState::Stopped => {}
            TransportState::Starting => self.state = TransportState::Rolling,
            TransportState::Rolling => self.frame += u64::from(frames),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conditional_claim_denied_while_other_holds() {
        let mut transport = Transport::new();
        transport.set_timebase_master(RefNum::new(1), false).unwrap();
        assert_eq!(
            transport.set_timebase_master(RefNum::new(2), true),
            Err(EngineError::TimebaseBusy(RefNum::new(1)))
        );
        assert_eq!(transport.timebase_master(), Some(RefNum::new(1)));
    }

    #[test]
    fn conditional_claim_by_holder_succeeds() {
        let mut transport = Transport::new();
        transport.set_timebase_master(RefNum::new(4), true).unwrap();
        assert!(transport.set_timebase_master(RefNum::new(4), true).is_ok());
        assert!(transport.is_conditional());
    }

    #[test]
    fn unconditional_claim_replaces_holder() {
        let mut transport = Transport::new();
        transport.set_timebase_master(RefNum::new(1), true).unwrap();
        transport.set_timebase_master(RefNum::new(2), false).unwrap();
        assert_eq!(transport.timebase_master(), Some(RefNum::new(2)));
    }

    #[test]
    fn reset_requires_holder() {
        let mut transport = Transport::new();
        transport.set_timebase_master(RefNum::new(1), false).unwrap();
        assert_eq!(
            transport.reset_timebase(RefNum::new(2)),
            Err(EngineError::NotTimebaseMaster(RefNum::new(2)))
        );
        transport.reset_timebase(RefNum::new(1)).unwrap();
        assert_eq!(transport.timebase_master(), None);
    }

    #[test]
    fn rolling_advances_by_buffer() {
        let mut transport = Transport::new();
        transport.start();
        transport.cycle_begin(256);
        assert_eq!(transport.state(), TransportState::Rolling);
        assert_eq!(transport.frame(), 0);
        transport.cycle_begin(256);
        transport.cycle_begin(256);
        assert_eq!(transport.frame(), 512);

        transport.locate(10_000);
        transport.cycle_begin(256);
        assert_eq!(transport.frame(), 10_256);

        transport.stop();
        transport.cycle_begin(256);
        assert_eq!(transport.frame(), 10_256);
    }
}
