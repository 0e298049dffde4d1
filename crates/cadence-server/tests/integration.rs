//! Integration tests for cadence-server: open/close, buffer-size changes,
//! freewheel switching, internal clients, and the realtime request paths.

mod common;

use cadence_core::{
    ClientCallbacks, ClientOptions, ClientStatus, Connection, DriverParam, EngineError, NoCallbacks,
    Notification, NotifyKind, ParamValue, PortDirection, RefNum,
};
use cadence_driver::DriverRegistry;
use cadence_server::{CycleState, InitArgs, Server, ServerError};
use common::{Counters, Recorder, clients, config, drivers, open_server, wait_for};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

/// Opens client `a` (recording notifications) and `b`, and makes three
/// connections, two of them through the audio driver's ports.
fn build_topology(server: &Server) -> (RefNum, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let callbacks: Arc<dyn ClientCallbacks> = recorder.clone();
    let mut engine = server.engine().lock();
    let a = engine
        .client_external_open("a", ClientOptions::empty(), callbacks)
        .unwrap()
        .refnum;
    let b = engine
        .client_external_open("b", ClientOptions::empty(), Arc::new(NoCallbacks))
        .unwrap()
        .refnum;
    engine.port_register(a, "in", PortDirection::Input).unwrap();
    engine.port_register(a, "out", PortDirection::Output).unwrap();
    engine.port_register(b, "in", PortDirection::Input).unwrap();
    engine.port_connect_by_name("system:capture_1", "a:in").unwrap();
    engine.port_connect_by_name("a:out", "system:playback_1").unwrap();
    engine.port_connect_by_name("a:out", "b:in").unwrap();
    (a, recorder)
}

fn edges(server: &Server) -> BTreeSet<Connection> {
    server.graph().connections().into_iter().collect()
}

// ---------------------------------------------------------------------------
// Open / close
// ---------------------------------------------------------------------------

#[test]
fn open_makes_audio_master_and_freewheel_slave() {
    let (server, _) = open_server(0);
    let audio = server.audio_driver().unwrap();
    assert!(audio.is_master());
    assert!(!server.freewheel_driver().is_master());
    assert_eq!(audio.core().slave_names(), vec!["freewheel"]);
    assert!(server.loopback_driver().core().is_opened());
    assert!(server.loopback_driver().client_refnum().is_none());
    assert!(server.graph().find_port("system:capture_1").is_some());
    assert!(server.graph().find_port("loopback:capture_1").is_none());
    assert_eq!(server.control().buffer_size(), 1024);
    assert_eq!(server.freewheel_driver().buffer_size(), 1024);
    assert!(server.engine().messages().is_running());
    assert!(server.channel_client().is_some());
    assert_eq!(server.cycle_state(), CycleState::Stopped);
}

#[test]
fn loopback_is_attached_and_chained_when_enabled() {
    let (server, _) = open_server(2);
    let audio = server.audio_driver().unwrap();
    assert_eq!(audio.core().slave_names(), vec!["loopback", "freewheel"]);
    assert!(server.graph().find_port("loopback:capture_2").is_some());
    assert!(server.graph().find_port("loopback:playback_2").is_some());
    assert!(server.loopback_driver().client_refnum().is_some());
}

#[test]
fn close_releases_everything_open_acquired() {
    let (server, counters) = open_server(1);
    build_topology(&server);
    let refnum = server
        .internal_client_load("t", "tracked", &InitArgs::default(), ClientOptions::empty())
        .unwrap();
    assert!(server.engine().lock().is_active(refnum));
    server.start().unwrap();

    server.close().unwrap();

    assert!(!server.is_open());
    assert_eq!(server.engine().lock().client_count(), 0);
    assert!(!server.engine().lock().is_open());
    assert_eq!(server.graph().port_count(), 0);
    assert_eq!(server.graph().connection_count(), 0);
    assert_eq!(server.engine().synchro().allocated_count(), 0);
    assert!(!server.freewheel_driver().core().is_opened());
    assert!(!server.loopback_driver().core().is_opened());
    assert!(!server.engine().messages().is_running());
    assert!(server.channel_client().is_none());
    assert!(server.internal_clients().is_empty());
    assert_eq!(counters.dropped.load(Ordering::SeqCst), 1);
    assert_eq!(counters.finished.load(Ordering::SeqCst), 1);
}

#[test]
fn failed_open_keeps_earlier_steps_until_close() {
    let counters = Arc::default();
    let server = Server::with_registries(&config(0), drivers(&counters), clients(&counters));

    let err = server.open("no-such-driver", &[]).unwrap_err();
    assert!(matches!(err, ServerError::DriverLoad { .. }));
    assert!(server.engine().lock().is_open());
    assert!(server.channel_client().is_some());
    assert!(!server.is_open());

    let err = server.open("broken", &[]).unwrap_err();
    assert!(matches!(err, ServerError::DriverLoad { ref driver, .. } if driver == "broken"));

    server.close().unwrap();
    assert!(!server.engine().lock().is_open());
    assert!(server.channel_client().is_none());
}

#[test]
fn second_open_is_rejected() {
    let (server, _) = open_server(0);
    assert!(matches!(
        server.open("test", &[]),
        Err(ServerError::StateConflict(_))
    ));
}

#[test]
fn start_and_stop_drive_audio() {
    let (server, counters) = open_server(0);
    server.start().unwrap();
    assert!(server.audio_driver().unwrap().is_running());
    assert_eq!(server.cycle_state(), CycleState::Running);
    assert!(server.control().frame_timer().is_initialized());
    server.stop().unwrap();
    assert!(!server.audio_driver().unwrap().is_running());
    assert_eq!(server.cycle_state(), CycleState::Stopped);
    assert_eq!((counters.starts(), counters.stops()), (1, 1));
}

// ---------------------------------------------------------------------------
// Buffer size
// ---------------------------------------------------------------------------

#[test]
fn same_buffer_size_is_a_no_op() {
    let (server, counters) = open_server(0);
    server.start().unwrap();
    let before = (counters.starts(), counters.stops());
    server.set_buffer_size(1024).unwrap();
    assert_eq!((counters.starts(), counters.stops()), before);
    assert_eq!(server.control().buffer_size(), 1024);
}

#[test]
fn buffer_size_change_reaches_every_component() {
    let (server, counters) = open_server(0);
    let (_, recorder) = build_topology(&server);
    server.start().unwrap();

    server.set_buffer_size(512).unwrap();

    let audio = server.audio_driver().unwrap();
    assert_eq!(server.control().buffer_size(), 512);
    assert_eq!(audio.buffer_size(), 512);
    assert_eq!(server.freewheel_driver().buffer_size(), 512);
    assert_eq!(server.graph().buffer_size(), 512);
    assert!(recorder.saw(&Notification::BufferSize(512)));
    assert!(audio.is_running());
    assert_eq!(server.cycle_state(), CycleState::Running);
    assert_eq!((counters.starts(), counters.stops()), (2, 1));
}

#[test]
fn rejected_size_rolls_back_and_restarts() {
    let (server, counters) = open_server(0);
    server.start().unwrap();

    // The restart succeeds, so the call does too; the size is unchanged.
    server.set_buffer_size(1000).unwrap();

    assert_eq!(server.control().buffer_size(), 1024);
    assert_eq!(server.freewheel_driver().buffer_size(), 1024);
    assert_eq!(server.audio_driver().unwrap().buffer_size(), 1024);
    assert!(server.audio_driver().unwrap().is_running());
    assert_eq!((counters.starts(), counters.stops()), (2, 1));
}

#[test]
fn fixed_size_driver_rejects_resize_untouched() {
    let counters = Arc::default();
    let server = Server::with_registries(&config(0), drivers(&counters), clients(&counters));
    server
        .open("test", &[DriverParam::new("fixed", ParamValue::Bool(true))])
        .unwrap();
    server.start().unwrap();
    let before = (counters.starts(), counters.stops());

    let err = server.set_buffer_size(512).unwrap_err();

    assert!(matches!(err, ServerError::StateConflict(_)));
    assert_eq!((counters.starts(), counters.stops()), before);
    assert_eq!(server.control().buffer_size(), 1024);
    assert!(server.audio_driver().unwrap().is_running());
}

#[test]
fn buffer_size_change_refused_while_freewheeling() {
    let (server, _) = open_server(0);
    server.set_freewheel(true).unwrap();
    assert!(matches!(
        server.set_buffer_size(512),
        Err(ServerError::StateConflict(_))
    ));
    server.set_freewheel(false).unwrap();
}

// ---------------------------------------------------------------------------
// Freewheel
// ---------------------------------------------------------------------------

#[test]
fn freewheel_round_trip_restores_topology() {
    let (server, _) = open_server(0);
    let (_, recorder) = build_topology(&server);
    server.start().unwrap();
    let before = edges(&server);
    assert_eq!(before.len(), 3);

    server.set_freewheel(true).unwrap();

    let audio = server.audio_driver().unwrap();
    assert!(server.is_freewheel());
    assert!(server.freewheel_driver().is_master());
    assert!(server.freewheel_driver().is_running());
    assert!(!audio.is_master());
    assert!(!audio.is_running());
    assert!(server.has_connection_snapshot());
    assert!(!server.control().is_real_time());
    assert!(recorder.saw(&Notification::StartFreewheel));
    // Only the connection that does not touch the audio driver survives.
    assert_eq!(server.graph().connection_count(), 1);
    assert!(wait_for(|| server.freewheel_driver().core().cycles() > 10));

    server.set_freewheel(false).unwrap();

    assert_eq!(edges(&server), before);
    assert!(!server.is_freewheel());
    assert!(audio.is_master());
    assert!(audio.is_running());
    assert!(!server.freewheel_driver().is_master());
    assert!(!server.freewheel_driver().is_running());
    assert!(!server.has_connection_snapshot());
    assert!(server.control().is_real_time());
    assert!(recorder.saw(&Notification::StopFreewheel));
}

#[test]
fn freewheel_requests_are_not_idempotent() {
    let (server, _) = open_server(0);
    assert!(matches!(
        server.set_freewheel(false),
        Err(ServerError::StateConflict(_))
    ));
    server.set_freewheel(true).unwrap();
    assert!(matches!(
        server.set_freewheel(true),
        Err(ServerError::StateConflict(_))
    ));
    assert!(server.is_freewheel());
    server.set_freewheel(false).unwrap();
}

#[test]
fn start_targets_audio_even_in_freewheel() {
    let (server, _) = open_server(0);
    server.set_freewheel(true).unwrap();
    server.stop().unwrap();
    assert!(server.freewheel_driver().is_running());
    server.set_freewheel(false).unwrap();
}

#[test]
fn failed_freewheel_switch_leaves_server_stopped() {
    let (server, counters) = open_server(0);
    server.start().unwrap();
    counters.fail_stop.store(true, Ordering::SeqCst);
    assert!(server.set_freewheel(true).is_err());
    assert_eq!(server.cycle_state(), CycleState::Stopped);
    assert!(!server.is_freewheel());
    counters.fail_stop.store(false, Ordering::SeqCst);
}

#[test]
fn close_during_freewheel_restores_realtime_flag() {
    let (server, _) = open_server(0);
    server.set_freewheel(true).unwrap();
    server.close().unwrap();
    assert!(server.control().is_real_time());
    assert!(!server.freewheel_driver().is_running());
}

// ---------------------------------------------------------------------------
// Internal clients
// ---------------------------------------------------------------------------

#[test]
fn failing_factory_reports_failure_without_refnum() {
    let (server, _) = open_server(0);
    let clients_before = server.engine().lock().client_count();

    let err = server
        .internal_client_load("x", "failing", &InitArgs::default(), ClientOptions::empty())
        .unwrap_err();

    assert!(err.status.contains(ClientStatus::FAILURE));
    assert!(err.status.contains(ClientStatus::INIT_FAILURE));
    assert_eq!(server.engine().lock().client_count(), clients_before);
    assert!(server.internal_clients().is_empty());
}

#[test]
fn unknown_module_is_a_load_failure() {
    let (server, _) = open_server(0);
    let err = server
        .internal_client_load("x", "missing", &InitArgs::default(), ClientOptions::empty())
        .unwrap_err();
    assert!(err.status.contains(ClientStatus::FAILURE | ClientStatus::LOAD_FAILURE));
}

#[test]
fn exact_name_collision_fails_load() {
    let (server, _) = open_server(0);
    server
        .internal_client_load("n", "null", &InitArgs::default(), ClientOptions::empty())
        .unwrap();
    let err = server
        .internal_client_load("n", "null", &InitArgs::default(), ClientOptions::USE_EXACT_NAME)
        .unwrap_err();
    assert!(err.status.contains(ClientStatus::FAILURE | ClientStatus::NAME_NOT_UNIQUE));
    assert_eq!(server.internal_clients().len(), 1);
}

#[test]
fn inprocess_client_load_and_unload() {
    let (server, _) = open_server(0);
    let refnum = server
        .internal_client_load(
            "pass",
            "inprocess",
            &InitArgs::Blob("channels=2".to_string()),
            ClientOptions::empty(),
        )
        .unwrap();
    assert!(server.graph().find_port("pass:in_2").is_some());
    assert!(server.graph().find_port("pass:out_2").is_some());
    assert!(server.engine().lock().is_active(refnum));
    assert_eq!(server.internal_clients(), vec![refnum]);

    server.internal_client_unload(refnum).unwrap();

    assert!(server.graph().find_port("pass:in_1").is_none());
    assert!(server.internal_clients().is_empty());
    assert!(server.engine().lock().client_info(refnum).is_none());
    assert!(server.internal_client_unload(refnum).is_err());
}

#[test]
fn unload_runs_finish_hook() {
    let (server, counters) = open_server(0);
    let refnum = server
        .internal_client_load(
            "t",
            "tracked",
            &InitArgs::Params(Vec::new()),
            ClientOptions::empty(),
        )
        .unwrap();
    server.internal_client_unload(refnum).unwrap();
    assert_eq!(counters.finished.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------------
// Notify / kill
// ---------------------------------------------------------------------------

#[test]
fn notify_forwards_only_xrun_and_graph_order() {
    let (server, _) = open_server(0);
    let (a, recorder) = build_topology(&server);
    recorder.clear();
    let xruns = server.control().xrun_count();

    server.notify(a, NotifyKind::BufferSize, 256);
    server.notify(a, NotifyKind::Shutdown, 0);
    assert_eq!(server.control().xrun_count(), xruns);
    assert!(recorder.seen.lock().is_empty());

    server.notify(a, NotifyKind::XRun, 0);
    assert_eq!(server.control().xrun_count(), xruns + 1);
    assert!(recorder.saw(&Notification::XRun));

    server.notify(RefNum::ALL, NotifyKind::GraphOrder, 0);
    assert!(recorder.saw(&Notification::GraphOrder));
}

#[test]
fn client_kill_removes_client_and_tolerates_unknown_refnum() {
    let (server, _) = open_server(0);
    let (a, _) = build_topology(&server);
    server.engine().lock().client_activate(a).unwrap();

    server.client_kill(a);
    assert!(server.engine().lock().client_info(a).is_none());
    assert!(server.graph().find_port("a:out").is_none());

    // Both steps fail and are only logged.
    server.client_kill(RefNum::new(60));
}

#[test]
fn late_internal_client_is_killed_by_realtime_path() {
    let counters = Arc::default();
    let server = Server::with_registries(
        &config(0),
        DriverRegistry::new(),
        clients(&counters),
    );
    server
        .open("dummy", &[DriverParam::new("period", ParamValue::UInt(256))])
        .unwrap();
    server.start().unwrap();
    let xruns = server.control().xrun_count();

    server
        .internal_client_load("sleepy", "sleeper", &InitArgs::default(), ClientOptions::empty())
        .unwrap();

    assert!(wait_for(|| server.engine().lock().client_refnum("sleepy").is_none()));
    assert!(server.internal_clients().is_empty());
    assert!(server.control().xrun_count() > xruns);
    server.stop().unwrap();
    server.close().unwrap();
}

#[test]
fn kill_runs_internal_client_finish_hook() {
    let (server, counters) = open_server(0);
    let refnum = server
        .internal_client_load("t", "tracked", &InitArgs::default(), ClientOptions::empty())
        .unwrap();
    server.client_kill(refnum);
    assert_eq!(counters.finished.load(Ordering::SeqCst), 1);
    assert!(server.internal_clients().is_empty());
    assert!(server.engine().lock().client_info(refnum).is_none());
}

#[test]
fn killing_blocked_client_keeps_cycles_running() {
    let counters: Arc<Counters> = Arc::default();
    let server = Server::with_registries(&config(0), DriverRegistry::new(), clients(&counters));
    server
        .open("dummy", &[DriverParam::new("period", ParamValue::UInt(256))])
        .unwrap();
    server.start().unwrap();

    let loaded = Instant::now();
    server
        .internal_client_load("hung", "stuck", &InitArgs::default(), ClientOptions::empty())
        .unwrap();
    assert!(wait_for(|| server.engine().lock().client_refnum("hung").is_none()));
    // Its `process` is still blocked; removal did not wait for it.
    assert!(loaded.elapsed() < Duration::from_secs(2));
    assert_eq!(counters.finished.load(Ordering::SeqCst), 1);

    let skipped = server.control().skipped_cycle_count();
    thread::sleep(Duration::from_millis(200));
    assert!(server.control().skipped_cycle_count() < skipped + 5);

    let locking = Instant::now();
    drop(server.engine().lock());
    assert!(locking.elapsed() < Duration::from_millis(100));

    server.stop().unwrap();
    let closing = Instant::now();
    server.close().unwrap();
    assert!(closing.elapsed() < Duration::from_secs(1));
    counters.released.store(true, Ordering::SeqCst);
}

#[test]
fn temporary_server_signals_shutdown_after_last_client() {
    let counters = Arc::default();
    let config = cadence_config::ServerConfig {
        temporary: true,
        ..config(0)
    };
    let server = Server::with_registries(&config, drivers(&counters), clients(&counters));
    server.open("test", &[]).unwrap();
    let shutdown = server.shutdown_signal();

    let refnum = server
        .engine()
        .lock()
        .client_external_open("only", ClientOptions::empty(), Arc::new(NoCallbacks))
        .unwrap()
        .refnum;
    server.engine().lock().client_external_close(refnum).unwrap();

    assert!(shutdown.recv_timeout(Duration::from_secs(5)).is_ok());
}

// ---------------------------------------------------------------------------
// Timebase
// ---------------------------------------------------------------------------

#[test]
fn timebase_pass_through() {
    let (server, _) = open_server(0);
    let (a, _) = build_topology(&server);
    let b = server.engine().lock().client_refnum("b").unwrap();

    server.set_timebase_callback(a, false).unwrap();
    assert!(matches!(
        server.set_timebase_callback(b, true),
        Err(ServerError::Engine(EngineError::TimebaseBusy(_)))
    ));
    assert!(server.release_timebase(b).is_err());
    server.release_timebase(a).unwrap();
    server.set_timebase_callback(b, true).unwrap();
    assert_eq!(server.control().transport().timebase_master(), Some(b));

    assert!(matches!(
        server.set_timebase_callback(RefNum::new(60), false),
        Err(ServerError::Engine(EngineError::NoSuchClient(_)))
    ));
}

// ---------------------------------------------------------------------------
// Control channel
// ---------------------------------------------------------------------------

#[test]
fn channel_client_drives_the_server() {
    let (server, _) = open_server(0);
    let channel = server.channel_client().unwrap();

    let client = channel.client_open("remote", ClientOptions::empty()).unwrap();
    assert_eq!(client.name, "remote");
    let out = channel
        .port_register(client.refnum, "out", PortDirection::Output)
        .unwrap();
    channel.client_activate(client.refnum).unwrap();
    channel.port_connect("remote:out", "system:playback_1").unwrap();
    assert_eq!(server.graph().connection_count(), 1);

    channel.set_buffer_size(256).unwrap();
    assert_eq!(server.control().buffer_size(), 256);
    assert!(
        client
            .notifications
            .try_iter()
            .any(|n| n == Notification::BufferSize(256))
    );

    channel.port_disconnect("remote:out", "system:playback_1").unwrap();
    assert_eq!(server.graph().connection_count(), 0);
    channel.port_unregister(client.refnum, out).unwrap();

    let refnum = channel
        .internal_client_load("n", "null", InitArgs::default(), ClientOptions::empty())
        .unwrap();
    channel.internal_client_unload(refnum).unwrap();

    channel.set_freewheel(true).unwrap();
    assert!(matches!(
        channel.set_freewheel(true),
        Err(ServerError::StateConflict(_))
    ));
    channel.set_freewheel(false).unwrap();

    channel.client_close(client.refnum).unwrap();
    assert!(server.engine().lock().client_refnum("remote").is_none());

    server.close().unwrap();
    assert!(matches!(
        channel.set_buffer_size(512),
        Err(ServerError::Resource(_))
    ));
}

#[test]
fn channel_reports_client_open_failure_status() {
    let (server, _) = open_server(0);
    let channel = server.channel_client().unwrap();
    channel.client_open("dup", ClientOptions::empty()).unwrap();
    let err = channel
        .client_open("dup", ClientOptions::USE_EXACT_NAME)
        .unwrap_err();
    assert!(
        matches!(err, ServerError::ClientInit(status) if status.contains(ClientStatus::NAME_NOT_UNIQUE))
    );
}
