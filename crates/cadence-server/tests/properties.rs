//! Property tests: arbitrary sequences of control operations keep the driver
//! chain and the connection topology consistent.

mod common;

use cadence_core::{ClientOptions, Connection, NoCallbacks, PortDirection};
use cadence_server::{Server, ServerError};
use common::open_server;
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;

#[derive(Debug, Clone)]
enum Op {
    Freewheel(bool),
    BufferSize(u32),
    Start,
    Stop,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        any::<bool>().prop_map(Op::Freewheel),
        prop::sample::select(vec![64u32, 256, 512, 1000, 1024, 2048]).prop_map(Op::BufferSize),
        Just(Op::Start),
        Just(Op::Stop),
    ]
}

fn connect_clients(server: &Server) {
    let mut engine = server.engine().lock();
    let fx = engine
        .client_external_open("fx", ClientOptions::empty(), Arc::new(NoCallbacks))
        .unwrap()
        .refnum;
    engine.port_register(fx, "in", PortDirection::Input).unwrap();
    engine.port_register(fx, "out", PortDirection::Output).unwrap();
    engine.port_connect_by_name("system:capture_1", "fx:in").unwrap();
    engine.port_connect_by_name("fx:out", "system:playback_1").unwrap();
    engine.port_connect_by_name("fx:out", "system:playback_2").unwrap();
}

fn edges(server: &Server) -> BTreeSet<Connection> {
    server.graph().connections().into_iter().collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn driver_chain_stays_consistent(ops in prop::collection::vec(op(), 1..12)) {
        let (server, _) = open_server(0);
        connect_clients(&server);
        let topology = edges(&server);
        let audio = server.audio_driver().unwrap();
        let freewheel = server.freewheel_driver();
        let mut freewheeling = false;

        for op in ops {
            match op {
                Op::Freewheel(onoff) => {
                    let result = server.set_freewheel(onoff);
                    if onoff == freewheeling {
                        prop_assert!(matches!(result, Err(ServerError::StateConflict(_))));
                    } else {
                        prop_assert!(result.is_ok());
                        freewheeling = onoff;
                    }
                }
                Op::BufferSize(frames) => {
                    let before = server.control().buffer_size();
                    let result = server.set_buffer_size(frames);
                    if freewheeling && frames != before {
                        prop_assert!(result.is_err());
                    } else {
                        prop_assert!(result.is_ok());
                    }
                }
                Op::Start => prop_assert!(server.start().is_ok()),
                Op::Stop => prop_assert!(server.stop().is_ok()),
            }

            prop_assert_eq!(server.is_freewheel(), freewheeling);
            prop_assert!(audio.is_master() != freewheel.is_master());
            prop_assert_eq!(freewheel.is_master(), freewheeling);
            prop_assert_eq!(server.control().is_real_time(), !freewheeling);
            prop_assert_eq!(server.has_connection_snapshot(), freewheeling);
            let size = server.control().buffer_size();
            prop_assert_eq!(audio.buffer_size(), size);
            prop_assert_eq!(freewheel.buffer_size(), size);
            prop_assert_eq!(server.graph().buffer_size(), size);
            if !freewheeling {
                prop_assert_eq!(&edges(&server), &topology);
            }
        }

        if freewheeling {
            server.set_freewheel(false).unwrap();
        }
        prop_assert_eq!(edges(&server), topology);
        server.close().unwrap();
    }
}
