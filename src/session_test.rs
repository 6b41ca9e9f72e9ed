use super::*;
use crate::media::LocalAudio;
use crate::peer::state::LinkState;
use crate::peer::types::IceCandidate;
use crate::signaling::WriterCmd;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

fn test_session(
    room: &str,
    user: &str,
) -> (
    Arc<SessionInner>,
    tokio::sync::mpsc::UnboundedReceiver<WriterCmd>,
    UnboundedReceiver<RoomEvent>,
) {
    let (signal, signal_rx) = SignalTx::test_pair();
    let (events, event_rx) = EventSink::channel();
    let inner = SessionInner::new(room.into(), user.into(), None, None, signal, events);
    (inner, signal_rx, event_rx)
}

fn roster(entries: &[(&str, &str)]) -> Vec<RosterEntry> {
    entries
        .iter()
        .map(|(socket_id, username)| RosterEntry {
            socket_id: (*socket_id).into(),
            username: (*username).into(),
        })
        .collect()
}

fn joined(entries: &[(&str, &str)], username: &str, socket_id: &str) -> ServerEvent {
    ServerEvent::Joined {
        clients: roster(entries),
        username: username.into(),
        socket_id: socket_id.into(),
    }
}

fn drain_signals(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<WriterCmd>,
) -> Vec<ClientEvent> {
    let mut out = Vec::new();
    while let Ok(cmd) = rx.try_recv() {
        if let WriterCmd::Send(event) = cmd {
            out.push(event);
        }
    }
    out
}

fn drain_events(rx: &mut UnboundedReceiver<RoomEvent>) -> Vec<RoomEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

fn find_offer(events: &[ClientEvent]) -> Option<(RTCSessionDescription, String)> {
    events.iter().find_map(|event| match event {
        ClientEvent::Offer { sdp, to } => Some((sdp.clone(), to.clone())),
        _ => None,
    })
}

fn find_answer(events: &[ClientEvent]) -> Option<(RTCSessionDescription, String)> {
    events.iter().find_map(|event| match event {
        ClientEvent::Answer { sdp, to } => Some((sdp.clone(), to.clone())),
        _ => None,
    })
}

fn open_audio(inner: &Arc<SessionInner>) {
    inner
        .local_audio
        .lock()
        .unwrap()
        .replace(LocalAudio::new(true));
}

fn answer_sdp(raw: &str) -> RTCSessionDescription {
    serde_json::from_str(&format!(r#"{{"type":"answer","sdp":"{}"}}"#, raw)).unwrap()
}

#[tokio::test]
async fn joined_replaces_roster_wholesale() {
    let (inner, _signal_rx, _event_rx) = test_session("r1", "alice");

    dispatch(&inner, joined(&[("s1", "alice")], "alice", "s1")).await;
    dispatch(
        &inner,
        joined(&[("s1", "alice"), ("s2", "bob")], "bob", "s2"),
    )
    .await;
    assert_eq!(
        *inner.roster.lock().unwrap(),
        roster(&[("s1", "alice"), ("s2", "bob")])
    );

    // сервер прислал урезанный список, локальных хвостов не остаётся
    dispatch(&inner, joined(&[("s2", "bob")], "bob", "s2")).await;
    assert_eq!(*inner.roster.lock().unwrap(), roster(&[("s2", "bob")]));
}

#[tokio::test]
async fn own_join_records_socket_id_without_member_notification() {
    let (inner, mut signal_rx, mut event_rx) = test_session("r1", "alice");

    dispatch(&inner, joined(&[("s1", "alice")], "alice", "s1")).await;

    assert_eq!(inner.socket_id.lock().unwrap().as_deref(), Some("s1"));

    let events = drain_events(&mut event_rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, RoomEvent::RosterUpdated { .. })));
    assert!(!events
        .iter()
        .any(|e| matches!(e, RoomEvent::MemberJoined { .. })));

    // снимок документа уходит всегда, даже на собственный вход
    let signals = drain_signals(&mut signal_rx);
    assert!(signals
        .iter()
        .any(|e| matches!(e, ClientEvent::SyncDoc { socket_id, .. } if socket_id == "s1")));
}

#[tokio::test]
async fn remote_join_notifies_and_sends_doc_snapshot() {
    let (inner, mut signal_rx, mut event_rx) = test_session("r1", "alice");
    dispatch(&inner, joined(&[("s1", "alice")], "alice", "s1")).await;
    drain_signals(&mut signal_rx);
    drain_events(&mut event_rx);

    *inner.code.lock().unwrap() = "fn main() {}".to_string();
    dispatch(
        &inner,
        joined(&[("s1", "alice"), ("s2", "bob")], "bob", "s2"),
    )
    .await;

    let events = drain_events(&mut event_rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, RoomEvent::MemberJoined { username } if username == "bob")));

    let signals = drain_signals(&mut signal_rx);
    assert!(signals.iter().any(|e| matches!(
        e,
        ClientEvent::SyncDoc { code, socket_id } if code == "fn main() {}" && socket_id == "s2"
    )));

    // без локального аудио исходящий вызов не начинается
    assert!(inner.registry.is_empty());
}

#[tokio::test]
async fn remote_join_with_audio_sends_offer() {
    let (inner, mut signal_rx, _event_rx) = test_session("r1", "alice");
    open_audio(&inner);
    dispatch(&inner, joined(&[("s1", "alice")], "alice", "s1")).await;
    drain_signals(&mut signal_rx);

    dispatch(
        &inner,
        joined(&[("s1", "alice"), ("s2", "bob")], "bob", "s2"),
    )
    .await;

    let signals = drain_signals(&mut signal_rx);
    let (_, to) = find_offer(&signals).expect("offer must be sent to the new member");
    assert_eq!(to, "s2");

    let link = inner.registry.get("s2").expect("link must exist");
    assert_eq!(link.state(), LinkState::OfferSent);
    assert_eq!(inner.registry.len(), 1);
}

#[tokio::test]
async fn offer_and_answer_reach_connected_both_ways() {
    // alice первая в комнате и с микрофоном
    let (alice, mut alice_signals, _alice_events) = test_session("r1", "alice");
    open_audio(&alice);
    dispatch(&alice, joined(&[("s1", "alice")], "alice", "s1")).await;
    drain_signals(&mut alice_signals);

    // bob входит без микрофона
    let (bob, mut bob_signals, mut bob_events) = test_session("r1", "bob");
    dispatch(&bob, joined(&[("s1", "alice"), ("s2", "bob")], "bob", "s2")).await;
    drain_signals(&mut bob_signals);
    drain_events(&mut bob_events);

    // alice видит вход bob и звонит ему
    dispatch(&alice, joined(&[("s1", "alice"), ("s2", "bob")], "bob", "s2")).await;
    let (offer, to) = find_offer(&drain_signals(&mut alice_signals)).expect("offer expected");
    assert_eq!(to, "s2");

    // offer доезжает до bob: связь создаётся и отвечает
    dispatch(&bob, ServerEvent::Offer { sdp: offer, from: "s1".into() }).await;
    let bob_link = bob.registry.get("s1").expect("bob must have a link to alice");
    assert_eq!(bob_link.state(), LinkState::AnswerSent);
    let (answer, to) = find_answer(&drain_signals(&mut bob_signals)).expect("answer expected");
    assert_eq!(to, "s1");

    // answer доезжает до alice: переговоры завершены
    dispatch(&alice, ServerEvent::Answer { sdp: answer, from: "s2".into() }).await;
    let alice_link = alice.registry.get("s2").expect("alice must keep her link");
    assert_eq!(alice_link.state(), LinkState::Connected);

    assert_eq!(alice.registry.len(), 1);
    assert_eq!(bob.registry.len(), 1);
}

#[tokio::test]
async fn glare_never_leaves_two_links() {
    let (alice, mut alice_signals, _ae) = test_session("r1", "alice");
    let (bob, mut bob_signals, _be) = test_session("r1", "bob");
    open_audio(&alice);
    open_audio(&bob);
    dispatch(&alice, joined(&[("s1", "alice")], "alice", "s1")).await;
    dispatch(&bob, joined(&[("s2", "bob")], "bob", "s2")).await;
    drain_signals(&mut alice_signals);
    drain_signals(&mut bob_signals);

    // обе стороны звонят одновременно
    crate::peer::negotiation::initiate(&alice, "s2").await;
    crate::peer::negotiation::initiate(&bob, "s1").await;
    let alice_link = alice.registry.get("s2").unwrap();
    let bob_link = bob.registry.get("s1").unwrap();
    let (alice_offer, _) = find_offer(&drain_signals(&mut alice_signals)).unwrap();
    let (bob_offer, _) = find_offer(&drain_signals(&mut bob_signals)).unwrap();

    // встречные offer доезжают с опозданием
    dispatch(&alice, ServerEvent::Offer { sdp: bob_offer, from: "s2".into() }).await;
    dispatch(&bob, ServerEvent::Offer { sdp: alice_offer, from: "s1".into() }).await;

    // второй связи не появилось ни у кого, а исходная либо дожила,
    // либо дошла до терминального Closed
    assert!(alice.registry.len() <= 1);
    assert!(bob.registry.len() <= 1);
    for link in [alice_link, bob_link] {
        assert!(matches!(
            link.state(),
            LinkState::OfferSent | LinkState::AnswerSent | LinkState::Connected | LinkState::Closed
        ));
    }
}

#[tokio::test]
async fn stale_answer_is_dropped_quietly() {
    let (inner, _signal_rx, mut event_rx) = test_session("r1", "alice");
    dispatch(&inner, joined(&[("s1", "alice")], "alice", "s1")).await;
    drain_events(&mut event_rx);

    dispatch(
        &inner,
        ServerEvent::Answer {
            sdp: answer_sdp("v=0"),
            from: "ghost".into(),
        },
    )
    .await;

    assert!(inner.registry.is_empty());
    assert!(drain_events(&mut event_rx).is_empty());
}

#[tokio::test]
async fn candidate_for_unknown_peer_is_dropped_quietly() {
    let (inner, _signal_rx, mut event_rx) = test_session("r1", "alice");
    dispatch(&inner, joined(&[("s1", "alice")], "alice", "s1")).await;
    drain_events(&mut event_rx);

    dispatch(
        &inner,
        ServerEvent::Candidate {
            candidate: IceCandidate {
                candidate: "candidate:1 1 udp 2130706431 192.0.2.1 54400 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            },
            from: "ghost".into(),
        },
    )
    .await;

    assert!(inner.registry.is_empty());
    assert!(drain_events(&mut event_rx).is_empty());
}

#[tokio::test]
async fn disconnected_removes_roster_entry_and_link() {
    let (inner, mut signal_rx, mut event_rx) = test_session("r1", "alice");
    open_audio(&inner);
    dispatch(&inner, joined(&[("s1", "alice")], "alice", "s1")).await;
    dispatch(
        &inner,
        joined(&[("s1", "alice"), ("s2", "bob")], "bob", "s2"),
    )
    .await;
    drain_signals(&mut signal_rx);
    drain_events(&mut event_rx);
    assert!(inner.registry.get("s2").is_some());

    dispatch(
        &inner,
        ServerEvent::Disconnected {
            socket_id: "s2".into(),
            username: "bob".into(),
        },
    )
    .await;

    assert_eq!(*inner.roster.lock().unwrap(), roster(&[("s1", "alice")]));
    assert!(inner.registry.get("s2").is_none());
    assert!(drain_events(&mut event_rx)
        .iter()
        .any(|e| matches!(e, RoomEvent::MemberLeft { username } if username == "bob")));
}

#[tokio::test]
async fn mic_toggle_broadcasts_once_and_keeps_topology() {
    let (inner, mut signal_rx, _event_rx) = test_session("r1", "alice");
    open_audio(&inner);
    let session = RoomSession {
        inner: inner.clone(),
        reader: Mutex::new(None),
    };
    let links_before = inner.registry.len();

    assert!(session.toggle_mic());
    assert!(session.is_mic_on());
    let signals = drain_signals(&mut signal_rx);
    let broadcasts = signals
        .iter()
        .filter(|e| matches!(e, ClientEvent::MicToggle { .. }))
        .count();
    assert_eq!(broadcasts, 1);
    assert_eq!(inner.registry.len(), links_before);

    assert!(!session.toggle_mic());
    assert!(matches!(
        drain_signals(&mut signal_rx).as_slice(),
        [ClientEvent::MicToggle { mic_on: false, .. }]
    ));
}

#[tokio::test]
async fn view_toggle_applies_last_writer() {
    let (inner, _signal_rx, mut event_rx) = test_session("r1", "charlie");

    dispatch(
        &inner,
        ServerEvent::ViewToggleAck {
            username: "alice".into(),
            state: true,
        },
    )
    .await;
    dispatch(
        &inner,
        ServerEvent::ViewToggleAck {
            username: "bob".into(),
            state: false,
        },
    )
    .await;

    assert!(!inner.whiteboard.load(Ordering::Acquire));
    let toggles = drain_events(&mut event_rx)
        .into_iter()
        .filter(|e| matches!(e, RoomEvent::ViewToggled { .. }))
        .count();
    assert_eq!(toggles, 2);
}

#[tokio::test]
async fn sync_doc_updates_snapshot_and_notifies() {
    let (inner, _signal_rx, mut event_rx) = test_session("r1", "alice");

    dispatch(
        &inner,
        ServerEvent::SyncDoc {
            code: Some("let x = 1;".into()),
        },
    )
    .await;
    assert_eq!(*inner.code.lock().unwrap(), "let x = 1;");
    assert!(drain_events(&mut event_rx)
        .iter()
        .any(|e| matches!(e, RoomEvent::DocSync { code } if code == "let x = 1;")));

    // пустой снимок (новичок без содержимого) игнорируется
    dispatch(&inner, ServerEvent::SyncDoc { code: None }).await;
    assert_eq!(*inner.code.lock().unwrap(), "let x = 1;");
}

#[tokio::test]
async fn leave_closes_every_link_exactly_once() {
    let (inner, mut signal_rx, _event_rx) = test_session("r1", "alice");
    open_audio(&inner);
    dispatch(&inner, joined(&[("s1", "alice")], "alice", "s1")).await;
    dispatch(
        &inner,
        joined(&[("s1", "alice"), ("s2", "bob")], "bob", "s2"),
    )
    .await;
    let link = inner.registry.get("s2").unwrap();
    drain_signals(&mut signal_rx);

    let session = RoomSession {
        inner: inner.clone(),
        reader: Mutex::new(None),
    };
    session.leave().await;

    assert!(inner.registry.is_empty());
    assert_eq!(link.state(), LinkState::Closed);

    // повторный вызов ничего не делает
    session.leave().await;
    assert!(inner.registry.is_empty());
}
