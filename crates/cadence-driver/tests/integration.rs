//! Integration tests for cadence-driver: registry, master/slave chaining, pacing.

use cadence_core::{
    DriverParam, EngineControl, EngineSettings, GraphManager, LockedEngine, MessageBuffer,
    ParamValue, SynchroTable,
};
use cadence_driver::{
    Driver, DriverContext, DriverError, DriverRegistry, DriverSettings, FreewheelDriver,
};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn context() -> DriverContext {
    let control = Arc::new(EngineControl::new(&EngineSettings::default()));
    let engine = Arc::new(LockedEngine::new(
        Arc::new(GraphManager::new(control.buffer_size())),
        control,
        Arc::new(SynchroTable::new()),
        MessageBuffer::new(),
    ));
    engine.lock().open().unwrap();
    DriverContext::new(engine)
}

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[test]
fn dummy_driver_from_registry_applies_params() {
    let ctx = context();
    let module = DriverRegistry::new().load("dummy").unwrap();
    let driver = module
        .initialize(
            &ctx,
            &[
                DriverParam::new("period", ParamValue::Int(256)),
                DriverParam::new("r", ParamValue::Int(44100)),
                DriverParam::new("capture", ParamValue::UInt(4)),
            ],
        )
        .unwrap();
    assert_eq!(driver.name(), "system");
    assert_eq!(driver.buffer_size(), 256);
    assert_eq!(ctx.engine.control().buffer_size(), 256);
    assert_eq!(ctx.engine.control().sample_rate(), 44100);
    assert!(!driver.is_fixed_buffer_size());

    driver.attach().unwrap();
    let refnum = driver.client_refnum().unwrap();
    assert_eq!(ctx.engine.graph().ports_of(refnum).len(), 6);
}

#[test]
fn unknown_parameter_rejected_by_module() {
    let ctx = context();
    let module = DriverRegistry::new().load("dummy").unwrap();
    let err = module
        .initialize(&ctx, &[DriverParam::new("bogus", ParamValue::Bool(true))])
        .unwrap_err();
    assert!(matches!(err, DriverError::InvalidParameter(_)));
}

#[test]
fn invalid_period_rejected() {
    let ctx = context();
    let module = DriverRegistry::new().load("dummy").unwrap();
    let err = module
        .initialize(&ctx, &[DriverParam::new("period", ParamValue::UInt(1000))])
        .unwrap_err();
    assert!(matches!(err, DriverError::UnsupportedBufferSize(1000)));
}

// ---------------------------------------------------------------------------
// Master/slave chaining
// ---------------------------------------------------------------------------

#[test]
fn master_dummy_drives_freewheel_slave() {
    let ctx = context();
    let audio = DriverRegistry::new()
        .load("dummy")
        .unwrap()
        .initialize(
            &ctx,
            &[
                DriverParam::new("period", ParamValue::UInt(64)),
                DriverParam::new("wait", ParamValue::UInt(500)),
            ],
        )
        .unwrap();
    let freewheel: Arc<dyn Driver> = Arc::new(FreewheelDriver::new(&ctx));
    freewheel
        .open(DriverSettings {
            buffer_size: 64,
            sample_rate: 48000,
            capture_channels: 0,
            playback_channels: 0,
        })
        .unwrap();
    freewheel.set_master(false).unwrap();
    audio.set_master(true).unwrap();
    audio.add_slave(Arc::clone(&freewheel));

    audio.start().unwrap();
    assert!(wait_for(|| freewheel.core().cycles() >= 5));
    audio.stop().unwrap();
    assert!(!audio.is_running());

    let cycles = audio.core().cycles();
    thread::sleep(Duration::from_millis(20));
    assert_eq!(audio.core().cycles(), cycles, "stopped master kept cycling");
    assert!(ctx.engine.control().frame_timer().is_initialized());
}

#[test]
fn slave_does_not_cycle_on_its_own() {
    let ctx = context();
    let audio = DriverRegistry::new()
        .load("dummy")
        .unwrap()
        .initialize(&ctx, &[DriverParam::new("period", ParamValue::UInt(64))])
        .unwrap();
    audio.set_master(false).unwrap();
    audio.start().unwrap();
    thread::sleep(Duration::from_millis(20));
    assert_eq!(audio.core().cycles(), 0);
    audio.stop().unwrap();
}

#[test]
fn freewheel_master_runs_free() {
    let ctx = context();
    let freewheel = FreewheelDriver::new(&ctx);
    freewheel
        .open(DriverSettings {
            buffer_size: 1024,
            sample_rate: 48000,
            capture_channels: 0,
            playback_channels: 0,
        })
        .unwrap();
    freewheel.set_master(true).unwrap();
    freewheel.start().unwrap();
    // 1024 frames at 48 kHz is ~21 ms; free running does far more than one
    // cycle per period.
    let started = Instant::now();
    assert!(wait_for(|| freewheel.core().cycles() >= 100));
    assert!(started.elapsed() < Duration::from_secs(2));
    freewheel.stop().unwrap();
    freewheel.close().unwrap();
}

#[test]
fn fixed_size_check_precedes_resize() {
    struct Fixed {
        core: cadence_driver::DriverCore,
    }
    impl Driver for Fixed {
        fn core(&self) -> &cadence_driver::DriverCore {
            &self.core
        }
        fn is_fixed_buffer_size(&self) -> bool {
            true
        }
    }
    let ctx = context();
    let fixed = Fixed {
        core: cadence_driver::DriverCore::new("system", &ctx, true),
    };
    assert!(matches!(
        fixed.set_buffer_size(512),
        Err(DriverError::FixedBufferSize(_))
    ));
}
