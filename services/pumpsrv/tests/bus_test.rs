//! Shared bus integration tests: ordering, pacing, fault isolation, line loss

mod support;

use std::sync::Arc;
use std::time::Duration;

use pumpsrv::bus::{DispatcherSettings, LineHealth};
use pumpsrv::protocols::new_era::simulator::SimulatorConfig;
use pumpsrv::protocols::new_era::{Address, Command, Prompt};
use pumpsrv::pump::PumpController;
use pumpsrv::PumpError;
use support::{eventually, fast_bus, pump_settings, Bench, PORT};

#[tokio::test]
async fn test_commands_sent_in_order_with_guard_interval() -> anyhow::Result<()> {
    let guard = Duration::from_millis(50);
    let bench = Bench::with(
        SimulatorConfig::default(),
        DispatcherSettings {
            guard_interval: guard,
            ..fast_bus()
        },
    );

    for command in ["01DIS\r", "02RAT\r", "03STP\r", "01RUN\r"] {
        bench.dispatcher.enqueue(command.as_bytes().to_vec())?;
    }
    eventually(|| bench.sim.commands().len() == 4).await;

    let received = bench.sim.received();
    let texts: Vec<&str> = received.iter().map(|c| c.text.as_str()).collect();
    assert_eq!(texts, vec!["01DIS", "02RAT", "03STP", "01RUN"]);
    for pair in received.windows(2) {
        let gap = pair[1].at.duration_since(pair[0].at);
        assert!(gap >= guard - Duration::from_millis(10), "gap {gap:?} too short");
    }

    bench.close().await;
    Ok(())
}

#[tokio::test]
async fn test_malformed_frames_do_not_disturb_other_slots() -> anyhow::Result<()> {
    let bench = Bench::new();
    bench
        .dispatcher
        .enqueue(Command::status().encode(Address::Unit(2)))?;
    eventually(|| bench.dispatcher.worker_state(2).updates == 1).await;
    let before = bench.dispatcher.worker_state(2);

    // Non-numeric address, out-of-range address, alarm without a code
    bench.sim.inject(&b"\x02xxS\x03"[..]);
    bench.sim.inject(&b"\x0212S\x03"[..]);
    bench.sim.inject(&b"\x0204A?\x03"[..]);
    bench
        .dispatcher
        .enqueue(Command::status().encode(Address::Unit(5)))?;
    eventually(|| bench.dispatcher.worker_state(5).updates == 1).await;

    assert_eq!(bench.dispatcher.worker_state(2), before);
    assert_eq!(bench.dispatcher.worker_state(4).updates, 0);
    assert_eq!(bench.dispatcher.worker_state(5).prompt, Some(Prompt::Stopped));
    assert_eq!(bench.dispatcher.health(), LineHealth::Healthy);

    bench.close().await;
    Ok(())
}

#[tokio::test]
async fn test_silent_unit_reports_port_unresponsive() -> anyhow::Result<()> {
    let bench = Bench::new();
    bench.sim.set_silent(3, true);
    bench
        .dispatcher
        .enqueue(Command::status().encode(Address::Unit(3)))?;

    eventually(|| bench.dispatcher.health() == LineHealth::Unresponsive).await;
    match bench.dispatcher.fault() {
        Some(PumpError::PortUnresponsive { port, timeout }) => {
            assert_eq!(port, PORT);
            assert_eq!(timeout, fast_bus().read_timeout);
        },
        other => panic!("expected PortUnresponsive, got {other:?}"),
    }

    bench.sim.set_silent(3, false);
    bench
        .dispatcher
        .enqueue(Command::status().encode(Address::Unit(3)))?;
    eventually(|| bench.dispatcher.health() == LineHealth::Healthy).await;
    assert!(bench.dispatcher.fault_count() >= 1);

    bench.close().await;
    Ok(())
}

#[tokio::test]
async fn test_registry_shares_one_dispatcher_per_port() -> anyhow::Result<()> {
    let bench = Bench::new();
    let a = bench.controller("a", Address::Unit(1));
    let b = bench.controller("b", Address::Unit(2));
    assert!(Arc::ptr_eq(a.dispatcher(), b.dispatcher()));
    assert!(Arc::ptr_eq(
        &bench.registry.get(PORT).expect("registered"),
        &bench.dispatcher
    ));
    assert_eq!(bench.registry.len(), 1);

    bench.registry.close(PORT).await;
    assert!(bench.dispatcher.is_closed());
    assert!(matches!(a.stop(), Err(PumpError::Closed(_))));
    bench.close().await;
    Ok(())
}

#[tokio::test]
async fn test_close_drops_queued_commands() -> anyhow::Result<()> {
    let bench = Bench::with(
        SimulatorConfig::default(),
        DispatcherSettings {
            guard_interval: Duration::from_millis(200),
            ..fast_bus()
        },
    );
    for _ in 0..10 {
        bench
            .dispatcher
            .enqueue(Command::status().encode(Address::Unit(1)))?;
    }
    eventually(|| !bench.sim.commands().is_empty()).await;
    bench.dispatcher.close().await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(bench.sim.commands().len() < 10);
    assert!(bench.dispatcher.enqueue(&b"01DIS\r"[..]).is_err());
    bench.close().await;
    Ok(())
}

#[tokio::test]
async fn test_answer_after_idle_stretch_is_not_unresponsive() -> anyhow::Result<()> {
    let bench = Bench::with(
        SimulatorConfig {
            response_delay: Duration::from_millis(40),
            ..Default::default()
        },
        DispatcherSettings {
            read_timeout: Duration::from_millis(300),
            ..fast_bus()
        },
    );

    // Idle almost one read timeout, then ask
    tokio::time::sleep(Duration::from_millis(280)).await;
    bench
        .dispatcher
        .enqueue(Command::status().encode(Address::Unit(1)))?;
    eventually(|| bench.dispatcher.worker_state(1).updates == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(bench.dispatcher.health(), LineHealth::Healthy);
    assert_eq!(bench.dispatcher.fault_count(), 0);
    assert!(bench.dispatcher.fault().is_none());

    bench.close().await;
    Ok(())
}

#[tokio::test]
async fn test_lost_stream_disconnects_bus() -> anyhow::Result<()> {
    let Bench {
        registry,
        dispatcher,
        sim,
        token,
    } = Bench::new();
    let pump = PumpController::new(dispatcher.clone(), pump_settings("a", Address::Unit(1)))?;

    // Far end of the pipe goes away with the simulator
    drop(sim);
    eventually(|| dispatcher.health() == LineHealth::Disconnected).await;
    assert!(dispatcher.is_closed());
    assert!(matches!(dispatcher.fault(), Some(PumpError::Transport(_))));
    assert!(matches!(pump.stop(), Err(PumpError::Closed(_))));
    // A disconnected line can be replaced
    assert!(registry.get(PORT).is_none());

    let snapshot = pump.snapshot();
    assert_eq!(snapshot.line, LineHealth::Disconnected);
    assert_eq!(
        snapshot.last_error.map(|e| e.code),
        Some("TRANSPORT_ERROR".to_string())
    );

    token.cancel();
    registry.close_all().await;
    Ok(())
}
