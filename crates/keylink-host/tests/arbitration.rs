//! End-to-end arbitration tests against the simulated key.
//!
//! Each test spawns a real connection task over a [`SimulatedKey`] and drives
//! it only through the public API.

use std::sync::Arc;

use keylink_core::apdu::command::{INS_GET_RESPONSE, INS_SELECT};
use keylink_core::{
    Aid, Capability, CapabilityRecord, CommandApdu, DeviceInfo, Generation, Interface,
    SessionKind, SessionState, StatusWord,
};
use keylink_host::application::{
    ArbiterOptions, Connection, OathSession, PivSession, SessionError, SessionHandle,
    WriteOutcome,
};
use keylink_host::infrastructure::transport::simulated::SimulatedKey;
use tokio::sync::oneshot;

const INS_ECHO: u8 = 0x01;

// ── Helpers ───────────────────────────────────────────────────────────────────

fn device() -> DeviceInfo {
    let mut info = DeviceInfo::default();
    info.capabilities
        .supported
        .insert(Interface::Usb, Capability::OATH | Capability::OTP);
    info.capabilities
        .enabled
        .insert(Interface::Usb, Capability::OATH);
    info
}

fn connect(key: SimulatedKey) -> (Arc<SimulatedKey>, Connection) {
    let key = Arc::new(key);
    let conn = Connection::spawn(key.clone(), ArbiterOptions::default());
    (key, conn)
}

fn echo(data: &[u8]) -> CommandApdu {
    CommandApdu::new(0x00, INS_ECHO, 0x00, 0x00).with_data(data.to_vec())
}

/// The AIDs of every SELECT the key received, in order.
fn selected_aids(key: &SimulatedKey) -> Vec<Vec<u8>> {
    key.frames()
        .into_iter()
        .filter(|frame| frame.get(1) == Some(&INS_SELECT))
        .map(|frame| frame[5..].to_vec())
        .collect()
}

// ── Serialisation ─────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_never_overlap_exchanges() {
    // Arrange – small response chunks so every echo needs GET RESPONSE rounds
    let (key, conn) = connect(SimulatedKey::new(device()).with_response_chunk(4));
    let kinds = [SessionKind::Oath, SessionKind::Piv, SessionKind::Fido2, SessionKind::Otp];

    // Act
    let mut tasks = Vec::new();
    for i in 0..16usize {
        let conn = conn.clone();
        let kind = kinds[i % kinds.len()];
        tasks.push(tokio::spawn(async move {
            let handle = conn.request_session(kind).await?;
            handle.transceive(echo(&[i as u8; 20])).await
        }));
    }
    let mut outcomes = Vec::new();
    for task in tasks {
        outcomes.push(task.await.expect("task panicked"));
    }

    // Assert
    assert_eq!(key.max_in_flight(), 1);
    for outcome in outcomes {
        match outcome {
            Ok(response) => assert_eq!(response.data().len(), 20),
            Err(error) => assert_eq!(error, SessionError::SessionClosed),
        }
    }
}

#[tokio::test]
async fn test_requests_are_served_in_submission_order() {
    // Arrange – hold the first exchange so the rest queue up behind it
    let (key, conn) = connect(SimulatedKey::new(device()));
    key.close_gate();

    // Act
    let first = conn.request_session(SessionKind::Oath);
    key.wait_for_frames(1).await;
    let second = conn.request_session(SessionKind::Piv);
    let third = conn.request_session(SessionKind::Management);
    key.open_gate();
    let (a, b, c) = (first.await, second.await, third.await);

    // Assert
    assert!(a.unwrap().generation() < b.as_ref().unwrap().generation());
    assert!(b.unwrap().generation() < c.unwrap().generation());
    assert_eq!(
        selected_aids(&key),
        vec![
            Aid::OATH.as_bytes().to_vec(),
            Aid::PIV.as_bytes().to_vec(),
            Aid::MANAGEMENT.as_bytes().to_vec(),
        ]
    );
}

#[tokio::test]
async fn test_commands_on_one_session_keep_their_order() {
    let (key, conn) = connect(SimulatedKey::new(device()));
    let oath: OathSession = conn.open().await.unwrap();

    let pending: Vec<_> = (0..5u8).map(|i| oath.transceive(echo(&[i]))).collect();
    let mut echoed = Vec::new();
    for completion in pending {
        echoed.push(completion.await.unwrap().data()[0]);
    }

    assert_eq!(echoed, vec![0, 1, 2, 3, 4]);
    assert_eq!(key.instructions(), vec![INS_SELECT, 1, 1, 1, 1, 1]);
}

// ── Supersession ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_same_kind_twice_supersedes_first_handle() {
    // Arrange
    let (key, conn) = connect(SimulatedKey::new(device()));

    // Act
    let first = conn.request_session(SessionKind::Piv).await.unwrap();
    let second = conn.request_session(SessionKind::Piv).await.unwrap();
    let frames_before = key.frames().len();
    let stale = first.transceive(echo(b"late")).await;

    // Assert
    assert_eq!(first.aid(), second.aid());
    assert!(second.generation() >= first.generation());
    assert_eq!(stale.unwrap_err(), SessionError::SessionClosed);
    assert_eq!(key.frames().len(), frames_before, "stale handle touched the transport");
    assert_eq!(first.state(), SessionState::Superseded);
    assert!(second.is_valid());
}

#[tokio::test]
async fn test_command_queued_before_supersession_is_rejected_at_dispatch() {
    // Arrange – the first handle's command is queued behind a held SELECT
    let (key, conn) = connect(SimulatedKey::new(device()));
    let first = conn.request_session(SessionKind::Oath).await.unwrap();
    key.close_gate();
    let sent = key.frames().len();
    let superseding = conn.request_session(SessionKind::Piv);
    key.wait_for_frames(sent + 1).await;

    // Act – still valid when queued, stale by the time it is dispatched
    let queued = first.transceive(echo(b"x"));
    key.open_gate();
    let piv = superseding.await.unwrap();

    // Assert
    assert_eq!(queued.await.unwrap_err(), SessionError::SessionClosed);
    assert!(piv.is_valid());
    assert!(!key.instructions().contains(&INS_ECHO));
}

// ── Status handling ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_continuation_fragments_are_concatenated() {
    // Arrange – 13 bytes served in chunks of 5: 61 08, 61 03, 90 00
    let (key, conn) = connect(SimulatedKey::new(device()).with_response_chunk(5));
    let oath: OathSession = conn.open().await.unwrap();
    let payload: Vec<u8> = (0..13).collect();

    // Act
    let response = oath.transceive(echo(&payload)).await.unwrap();

    // Assert
    assert_eq!(response.data(), payload.as_slice());
    assert!(response.is_success());
    let get_responses = key
        .instructions()
        .iter()
        .filter(|ins| **ins == INS_GET_RESPONSE)
        .count();
    assert_eq!(get_responses, 2);
}

#[tokio::test]
async fn test_long_command_is_chained_for_short_only_transport() {
    let (key, conn) = connect(SimulatedKey::new(device()));
    let oath: OathSession = conn.open().await.unwrap();
    let payload = vec![0x5A; 600];

    let response = oath.transceive(echo(&payload)).await.unwrap();

    assert_eq!(response.data(), payload.as_slice());
    let echo_frames = key
        .frames()
        .into_iter()
        .filter(|frame| frame[1] == INS_ECHO)
        .count();
    assert_eq!(echo_frames, 3);
}

#[tokio::test]
async fn test_long_command_uses_one_frame_when_extended_length_is_supported() {
    let (key, conn) = connect(SimulatedKey::new(device()).with_extended_length(true));
    let oath: OathSession = conn.open().await.unwrap();

    let response = oath.transceive(echo(&[0xA5; 600])).await.unwrap();

    assert_eq!(response.data().len(), 600);
    let echo_frames: Vec<_> = key
        .frames()
        .into_iter()
        .filter(|frame| frame[1] == INS_ECHO)
        .collect();
    assert_eq!(echo_frames.len(), 1);
    assert_eq!(echo_frames[0][4], 0x00, "extended length marker");
}

#[tokio::test]
async fn test_unknown_application_fails_selection_with_status() {
    let (key, conn) = connect(SimulatedKey::new(device()));
    key.script_status(INS_SELECT, StatusWord::NOT_FOUND);

    let result = conn.request_session(SessionKind::U2f).await;

    assert_eq!(
        result.unwrap_err(),
        SessionError::SelectionFailed {
            kind: SessionKind::U2f,
            status: Some(StatusWord::NOT_FOUND),
        }
    );
    assert_eq!(conn.generation(), Generation::INITIAL);
}

#[tokio::test]
async fn test_failed_select_leaves_current_session_usable() {
    // Arrange
    let (key, conn) = connect(SimulatedKey::new(device()));
    let oath: OathSession = conn.open().await.unwrap();
    key.script_status(INS_SELECT, StatusWord::NOT_FOUND);

    // Act
    let failed = conn.request_session(SessionKind::Piv).await;
    let response = oath.transceive(echo(b"still here")).await;

    // Assert
    assert!(matches!(failed, Err(SessionError::SelectionFailed { .. })));
    assert_eq!(response.unwrap().data(), b"still here");
}

// ── Disconnect ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_request_while_unplugged_is_not_connected() {
    let (key, conn) = connect(SimulatedKey::new(device()));
    key.unplug();

    let result = conn.request_session(SessionKind::Oath).await;

    assert_eq!(result.unwrap_err(), SessionError::NotConnected);
    assert!(key.frames().is_empty());
}

#[tokio::test]
async fn test_disconnect_fails_every_pending_request_once() {
    // Arrange – one SELECT held on the wire, four more requests queued
    let (key, conn) = connect(SimulatedKey::new(device()));
    key.close_gate();
    let in_flight = conn.request_session(SessionKind::Oath);
    key.wait_for_frames(1).await;
    let queued: Vec<_> = [
        SessionKind::Piv,
        SessionKind::Fido2,
        SessionKind::Oath,
        SessionKind::Management,
    ]
    .into_iter()
    .map(|kind| conn.request_session(kind))
    .collect();

    // Act
    key.unplug();

    // Assert
    assert_eq!(in_flight.await.unwrap_err(), SessionError::Disconnected);
    for completion in queued {
        assert_eq!(completion.await.unwrap_err(), SessionError::Disconnected);
    }
    assert_eq!(key.frames().len(), 1, "queued requests reached the key");
}

#[tokio::test]
async fn test_disconnect_fails_in_flight_transceive_and_retires_session() {
    // Arrange
    let (key, conn) = connect(SimulatedKey::new(device()));
    let piv: PivSession = conn.open().await.unwrap();
    key.close_gate();
    let sent = key.frames().len();
    let pending = piv.transceive(echo(b"sign me"));
    let queued = piv.transceive(echo(b"and me"));
    key.wait_for_frames(sent + 1).await;

    // Act
    key.unplug();

    // Assert
    assert_eq!(pending.await.unwrap_err(), SessionError::Disconnected);
    assert_eq!(queued.await.unwrap_err(), SessionError::Disconnected);
    assert_eq!(piv.state(), SessionState::Disconnected);
    assert!(!piv.is_valid());
}

#[tokio::test]
async fn test_bounce_during_exchange_fails_in_flight_and_retires_session() {
    // Arrange
    let (key, conn) = connect(SimulatedKey::new(device()));
    let piv: PivSession = conn.open().await.unwrap();
    key.close_gate();
    let sent = key.frames().len();
    let pending = piv.transceive(echo(b"sign me"));
    key.wait_for_frames(sent + 1).await;

    // Act – down and up again before the exchange finishes
    key.unplug();
    key.plug();
    key.open_gate();

    // Assert
    assert_eq!(pending.await.unwrap_err(), SessionError::Disconnected);
    assert_eq!(piv.state(), SessionState::Disconnected);
    assert_eq!(
        piv.transceive(echo(b"again")).await.unwrap_err(),
        SessionError::SessionClosed
    );
    let after = reconnect(&conn, SessionKind::Piv).await;
    assert!(after.generation() > piv.generation());
    assert_eq!(after.transceive(echo(b"new")).await.unwrap().data(), b"new");
}

#[tokio::test]
async fn test_reconnect_starts_clean_and_keeps_old_handles_closed() {
    // Arrange
    let (key, conn) = connect(SimulatedKey::new(device()));
    let before: OathSession = conn.open().await.unwrap();
    let old_generation = before.generation();

    // Act
    key.unplug();
    key.plug();
    let after = reconnect(&conn, SessionKind::Oath).await;

    // Assert
    assert!(after.generation() > old_generation);
    assert_eq!(
        before.transceive(echo(b"old")).await.unwrap_err(),
        SessionError::SessionClosed
    );
    assert_eq!(after.transceive(echo(b"new")).await.unwrap().data(), b"new");
    assert_eq!(key.selected(), Some(Aid::OATH));
}

/// Retries until the arbiter has processed the link coming back.
async fn reconnect(conn: &Connection, kind: SessionKind) -> SessionHandle {
    for _ in 0..50 {
        match conn.request_session(kind).await {
            Ok(handle) => return handle,
            Err(SessionError::Disconnected) => tokio::task::yield_now().await,
            Err(other) => panic!("unexpected error while reconnecting: {other}"),
        }
    }
    panic!("connection never came back");
}

// ── Management ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_read_scenario_usb_oath_and_otp() {
    let (_key, conn) = connect(SimulatedKey::new(device()));

    let record = conn.read_configuration().await.unwrap();

    assert_eq!(
        record.supported_on(Interface::Usb),
        Capability::OATH | Capability::OTP
    );
    assert_eq!(record.enabled_on(Interface::Usb), Capability::OATH);
}

#[tokio::test]
async fn test_write_scenario_success_signals_reboot() {
    // Arrange
    let (key, conn) = connect(SimulatedKey::new(device()));
    let mut record = CapabilityRecord::default();
    record
        .enabled
        .insert(Interface::Usb, Capability::OATH | Capability::OTP);

    // Act
    let outcome = conn.write_configuration(&record, true).await.unwrap();

    // Assert
    assert_eq!(outcome, WriteOutcome::RebootPending);
    assert_eq!(key.reboots(), 1);
    let reread = conn.read_configuration().await.unwrap();
    assert_eq!(
        reread.enabled_on(Interface::Usb),
        Capability::OATH | Capability::OTP
    );
}

#[tokio::test]
async fn test_write_scenario_locked_device_is_rejected() {
    let info = DeviceInfo {
        config_locked: true,
        ..device()
    };
    let (key, conn) = connect(SimulatedKey::new(info));
    let record = conn.read_configuration().await.unwrap();

    let result = conn.write_configuration(&record, false).await;

    assert_eq!(
        result.unwrap_err(),
        SessionError::DeviceRejected {
            status: StatusWord::SECURITY_STATUS_NOT_SATISFIED
        }
    );
    assert_eq!(key.reboots(), 0);
}

// ── Callback API ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_callback_is_invoked_exactly_once() {
    let (key, conn) = connect(SimulatedKey::new(device()));
    key.unplug();
    let (tx, rx) = oneshot::channel();

    conn.request_session_with(SessionKind::Piv, move |result| {
        let _ = tx.send(result.map(|handle| handle.generation()));
    })
    .await
    .unwrap();

    assert_eq!(rx.await.unwrap(), Err(SessionError::NotConnected));
}
