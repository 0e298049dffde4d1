//! Freewheel driver: runs cycles as fast as clients finish them.
//!
//! As a slave of the audio driver it only counts passes. When promoted to master
//! it runs a free-running cycle thread, giving clients a long deadline since
//! nothing is waiting on the hardware.

use crate::cycle::{CycleThread, Pacing};
use crate::driver::{Driver, DriverContext, DriverCore};
use crate::{DriverError, Result};
use parking_lot::Mutex;
use std::time::Duration;

/// Driver name.
pub const FREEWHEEL_NAME: &str = "freewheel";

/// Client deadline for each freewheel cycle.
pub const FREEWHEEL_TIMEOUT: Duration = Duration::from_secs(10);

/// Synthetic clock source that does not wait between cycles.
#[derive(Debug)]
pub struct FreewheelDriver {
    core: DriverCore,
    thread: Mutex<Option<CycleThread>>,
}

impl FreewheelDriver {
    /// Creates an unopened freewheel driver.
    pub fn new(ctx: &DriverContext) -> Self {
        Self {
            core: DriverCore::with_cycle_timeout(FREEWHEEL_NAME, ctx, FREEWHEEL_TIMEOUT),
            thread: Mutex::new(None),
        }
    }
}

impl Driver for FreewheelDriver {
    fn core(&self) -> &DriverCore {
        &self.core
    }

    fn start(&self) -> Result<()> {
        self.core.start()?;
        if self.core.is_master() {
            let thread = CycleThread::spawn(self.core.clone(), Pacing::FreeRunning)
                .map_err(|e| DriverError::Backend(e.to_string()))?;
            *self.thread.lock() = Some(thread);
            tracing::info!("freewheel cycles running");
        }
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let thread = self.thread.lock().take();
        if let Some(thread) = thread {
            thread.stop();
            tracing::info!("freewheel cycles stopped");
        }
        self.core.stop();
        Ok(())
    }
}
