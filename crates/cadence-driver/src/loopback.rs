//! Loopback driver: feeds each playback port back into its capture port.
//!
//! Runs as a slave of the current master. Audio written to
//! `loopback:playback_N` during one cycle shows up on `loopback:capture_N` at
//! the start of the next.

use crate::driver::{Driver, DriverContext, DriverCore};
use crate::Result;
use cadence_core::{MAX_BUFFER_SIZE, PortId};
use parking_lot::Mutex;

/// Driver name.
pub const LOOPBACK_NAME: &str = "loopback";

#[derive(Debug, Default)]
struct Routing {
    pairs: Vec<(PortId, PortId)>,
    scratch: Vec<f32>,
}

/// Self-looping audio routing.
#[derive(Debug)]
pub struct LoopbackDriver {
    core: DriverCore,
    routing: Mutex<Routing>,
}

impl LoopbackDriver {
    /// Creates an unopened loopback driver.
    pub fn new(ctx: &DriverContext) -> Self {
        Self {
            core: DriverCore::new(LOOPBACK_NAME, ctx, false),
            routing: Mutex::new(Routing::default()),
        }
    }

    /// Number of playback/capture pairs being looped.
    pub fn channels(&self) -> usize {
        self.routing.lock().pairs.len()
    }
}

impl Driver for LoopbackDriver {
    fn core(&self) -> &DriverCore {
        &self.core
    }

    fn attach(&self) -> Result<()> {
        self.core.attach()?;
        let pairs: Vec<(PortId, PortId)> = self
            .core
            .playback_ports()
            .into_iter()
            .zip(self.core.capture_ports())
            .collect();
        let mut routing = self.routing.lock();
        routing.pairs = pairs;
        routing.scratch = vec![0.0; MAX_BUFFER_SIZE as usize];
        Ok(())
    }

    fn detach(&self) -> Result<()> {
        *self.routing.lock() = Routing::default();
        self.core.detach()
    }

    fn process_slave(&self) -> Result<()> {
        self.core.count_cycle();
        let Some(mut routing) = self.routing.try_lock() else {
            return Ok(());
        };
        let graph = self.core.engine().graph();
        let frames = (self.core.engine().control().buffer_size() as usize).min(routing.scratch.len());
        let Routing { pairs, scratch } = &mut *routing;
        for (playback, capture) in pairs.iter() {
            let buf = &mut scratch[..frames];
            if graph.try_mix_input(*playback, buf) {
                graph.try_write_buffer(*capture, buf);
            }
        }
        Ok(())
    }
}
