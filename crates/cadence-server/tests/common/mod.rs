//! Test drivers and client modules shared by the server test suites.

#![allow(dead_code)]

use cadence_config::ServerConfig;
use cadence_core::{
    ClientCallbacks, Notification, ParamDescriptor, ParamValue,
};
use cadence_driver::{
    Driver, DriverCore, DriverDescriptor, DriverError, DriverRegistry, DriverSettings,
    SYSTEM_CLIENT,
};
use cadence_server::{
    ClientModuleDescriptor, InternalClient, InternalClientRegistry, Server,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// What the test driver saw.
#[derive(Debug, Default)]
pub struct Counters {
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub dropped: AtomicUsize,
    pub finished: AtomicUsize,
    /// Makes `TestDriver::stop` fail.
    pub fail_stop: AtomicBool,
    /// Lets a `stuck` client return from `process`.
    pub released: AtomicBool,
}

impl Counters {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

/// Audio driver without a timing source; counts lifecycle calls.
pub struct TestDriver {
    core: DriverCore,
    fixed: bool,
    counters: Arc<Counters>,
}

impl Driver for TestDriver {
    fn core(&self) -> &DriverCore {
        &self.core
    }

    fn start(&self) -> cadence_driver::Result<()> {
        self.counters.starts.fetch_add(1, Ordering::SeqCst);
        self.core.start()
    }

    fn stop(&self) -> cadence_driver::Result<()> {
        self.counters.stops.fetch_add(1, Ordering::SeqCst);
        if self.counters.fail_stop.load(Ordering::SeqCst) {
            return Err(DriverError::Backend("device stuck".to_string()));
        }
        self.core.stop();
        Ok(())
    }

    fn is_fixed_buffer_size(&self) -> bool {
        self.fixed
    }
}

impl Drop for TestDriver {
    fn drop(&mut self) {
        self.counters.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

fn test_params() -> Vec<ParamDescriptor> {
    vec![
        ParamDescriptor::new("rate", 'r', ParamValue::UInt(48000), "Sample rate"),
        ParamDescriptor::new("period", 'p', ParamValue::UInt(1024), "Frames per period"),
        ParamDescriptor::new("capture", 'C', ParamValue::UInt(2), "Capture channels"),
        ParamDescriptor::new("playback", 'P', ParamValue::UInt(2), "Playback channels"),
        ParamDescriptor::new("fixed", 'f', ParamValue::Bool(false), "Fixed buffer size"),
    ]
}

/// Registry with `test` (counting driver) and `broken` (factory fails).
pub fn drivers(counters: &Arc<Counters>) -> DriverRegistry {
    let mut registry = DriverRegistry::empty();
    let counters = Arc::clone(counters);
    registry.register(
        DriverDescriptor {
            name: "test".to_string(),
            description: "Counting driver".to_string(),
            params: test_params(),
        },
        move |ctx, params| {
            let driver = TestDriver {
                core: DriverCore::new(SYSTEM_CLIENT, ctx, true),
                fixed: params.bool("fixed").unwrap_or(false),
                counters: Arc::clone(&counters),
            };
            driver.open(DriverSettings {
                buffer_size: params.uint32("period").unwrap_or(1024),
                sample_rate: params.uint32("rate").unwrap_or(48000),
                capture_channels: params.uint32("capture").unwrap_or(2),
                playback_channels: params.uint32("playback").unwrap_or(2),
            })?;
            Ok(Arc::new(driver))
        },
    );
    registry.register(
        DriverDescriptor {
            name: "broken".to_string(),
            description: "Driver whose factory fails".to_string(),
            params: Vec::new(),
        },
        |_, _| Err(DriverError::Backend("no device".to_string())),
    );
    registry
}

/// Internal client counting its finish calls.
struct Tracked {
    counters: Arc<Counters>,
}

impl InternalClient for Tracked {
    fn finish(&self) {
        self.counters.finished.fetch_add(1, Ordering::SeqCst);
    }
}

/// Internal client whose processing always overruns the cycle.
struct Sleeper;

impl InternalClient for Sleeper {
    fn has_process(&self) -> bool {
        true
    }

    fn process(&self, _frames: u32) {
        thread::sleep(Duration::from_millis(400));
    }
}

/// Internal client whose processing blocks until the test releases it.
struct Stuck {
    counters: Arc<Counters>,
}

impl InternalClient for Stuck {
    fn has_process(&self) -> bool {
        true
    }

    fn process(&self, _frames: u32) {
        let start = Instant::now();
        while !self.counters.released.load(Ordering::SeqCst)
            && start.elapsed() < Duration::from_secs(30)
        {
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn finish(&self) {
        self.counters.finished.fetch_add(1, Ordering::SeqCst);
    }
}

fn module(name: &str) -> ClientModuleDescriptor {
    ClientModuleDescriptor {
        name: name.to_string(),
        description: format!("{name} test module"),
        params: Vec::new(),
    }
}

/// Built-in modules plus `tracked`, `stuck`, `sleeper`, and `failing`.
pub fn clients(counters: &Arc<Counters>) -> InternalClientRegistry {
    let mut registry = InternalClientRegistry::new();
    let tracked = Arc::clone(counters);
    registry.register(module("tracked"), move |_, _| {
        Ok(Arc::new(Tracked {
            counters: Arc::clone(&tracked),
        }))
    });
    let stuck = Arc::clone(counters);
    registry.register(module("stuck"), move |_, _| {
        Ok(Arc::new(Stuck {
            counters: Arc::clone(&stuck),
        }))
    });
    registry.register(module("sleeper"), |_, _| Ok(Arc::new(Sleeper)));
    registry.register(module("failing"), |_, _| Err("factory failed".to_string()));
    registry
}

pub fn config(loopback: u32) -> ServerConfig {
    ServerConfig {
        loopback,
        timeout_ms: 100,
        ..ServerConfig::default()
    }
}

/// Builds a server with the test registries and opens it on the `test` driver.
pub fn open_server(loopback: u32) -> (Arc<Server>, Arc<Counters>) {
    let counters = Arc::new(Counters::default());
    let server = Server::with_registries(&config(loopback), drivers(&counters), clients(&counters));
    server.open("test", &[]).unwrap();
    (server, counters)
}

/// Client callbacks that record every notification.
#[derive(Default)]
pub struct Recorder {
    pub seen: Mutex<Vec<Notification>>,
}

impl Recorder {
    pub fn saw(&self, notification: &Notification) -> bool {
        self.seen.lock().contains(notification)
    }

    pub fn clear(&self) {
        self.seen.lock().clear();
    }
}

impl ClientCallbacks for Recorder {
    fn notify(&self, notification: &Notification) {
        self.seen.lock().push(notification.clone());
    }
}

pub fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}
