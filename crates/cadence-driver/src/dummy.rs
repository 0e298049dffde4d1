//! Timer-paced audio driver with no hardware behind it.
//!
//! Useful for headless servers and tests: it registers the usual physical ports
//! and runs one cycle per period on a plain thread.

use crate::cycle::{CycleThread, Pacing};
use crate::driver::{Driver, DriverContext, DriverCore, DriverSettings};
use crate::Result;
use cadence_core::{ParamDescriptor, ParamValue, ResolvedParams};
use parking_lot::Mutex;
use std::time::Duration;

/// Client name used by audio drivers.
pub const SYSTEM_CLIENT: &str = "system";

/// Parameters accepted by the dummy driver.
pub fn dummy_params() -> Vec<ParamDescriptor> {
    vec![
        ParamDescriptor::new("capture", 'C', ParamValue::UInt(2), "Number of capture ports"),
        ParamDescriptor::new("playback", 'P', ParamValue::UInt(2), "Number of playback ports"),
        ParamDescriptor::new("rate", 'r', ParamValue::UInt(48000), "Sample rate"),
        ParamDescriptor::new("period", 'p', ParamValue::UInt(1024), "Frames per period"),
        ParamDescriptor::new(
            "wait",
            'w',
            ParamValue::UInt(0),
            "Microseconds between cycles (0 = one period)",
        ),
    ]
}

/// Audio driver paced by a timer thread.
#[derive(Debug)]
pub struct DummyDriver {
    core: DriverCore,
    wait: Option<Duration>,
    thread: Mutex<Option<CycleThread>>,
}

impl DummyDriver {
    /// Creates an unopened dummy driver.
    pub fn new(ctx: &DriverContext, wait: Option<Duration>) -> Self {
        Self {
            core: DriverCore::new(SYSTEM_CLIENT, ctx, true),
            wait,
            thread: Mutex::new(None),
        }
    }

    /// Builds and opens a dummy driver from resolved parameters.
    pub fn from_params(ctx: &DriverContext, params: &ResolvedParams) -> Result<Self> {
        let wait = params
            .uint("wait")
            .filter(|w| *w > 0)
            .map(Duration::from_micros);
        let driver = Self::new(ctx, wait);
        driver.open(DriverSettings {
            buffer_size: params.uint32("period").unwrap_or(1024),
            sample_rate: params.uint32("rate").unwrap_or(48000),
            capture_channels: params.uint32("capture").unwrap_or(2),
            playback_channels: params.uint32("playback").unwrap_or(2),
        })?;
        Ok(driver)
    }
}

impl Driver for DummyDriver {
    fn core(&self) -> &DriverCore {
        &self.core
    }

    fn start(&self) -> Result<()> {
        self.core.start()?;
        if self.core.is_master() {
            let pacing = self.wait.map_or(Pacing::EnginePeriod, Pacing::Fixed);
            let thread = CycleThread::spawn(self.core.clone(), pacing)
                .map_err(|e| crate::DriverError::Backend(e.to_string()))?;
            *self.thread.lock() = Some(thread);
        }
        tracing::info!(driver = self.name(), master = self.core.is_master(), "dummy driver started");
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let thread = self.thread.lock().take();
        if let Some(thread) = thread {
            thread.stop();
        }
        self.core.stop();
        tracing::info!(driver = self.name(), "dummy driver stopped");
        Ok(())
    }
}
