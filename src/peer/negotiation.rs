use crate::logger::log;
use crate::peer::connection::new_peer;
use crate::peer::ice;
use crate::peer::state::{LinkState, PeerLink};
use crate::peer::types::IceCandidate;
use crate::session::SessionInner;
use crate::signaling::ClientEvent;
use std::sync::Arc;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::track::track_local::TrackLocal;

/// Исходящий вызов нового участника.
/// Без локального аудио-источника вызов невозможен и тихо пропускается;
/// входящую связь такой клиент всё равно примет.
pub(crate) async fn initiate(inner: &Arc<SessionInner>, remote: &str) {
    if inner.local_audio.lock().unwrap().is_none() {
        log(&format!("No local audio source, not calling {}", remote));
        return;
    }
    if inner.registry.get(remote).is_some() {
        log(&format!("Peer link for {} already exists, skip initiate", remote));
        return;
    }

    let Some((link, created)) = create_link(inner, remote).await else {
        return;
    };
    if !created {
        // другая сторона успела первой, переговоры уже идут по её связи
        return;
    }

    let offer = match link.pc.create_offer(None).await {
        Ok(offer) => offer,
        Err(e) => {
            log(&format!("Error creating offer for {}: {:?}", remote, e));
            return;
        }
    };
    if let Err(e) = link.pc.set_local_description(offer).await {
        log(&format!(
            "Error setting local description for {}: {:?}",
            remote, e
        ));
        return;
    }

    // связь могли снести, пока мы ждали
    if inner.registry.get(remote).is_none() {
        return;
    }
    if let Some(local) = link.pc.local_description().await {
        inner.signal.send(ClientEvent::Offer {
            sdp: local,
            to: remote.to_string(),
        });
        link.set_state(LinkState::OfferSent);
        log(&format!("Offer sent to {}", remote));
    }
}

/// Входящий offer. Существующая связь переиспользуется (глэр), второй
/// никогда не создаётся; выигрывает последний обработанный offer, без отката.
pub(crate) async fn handle_offer(inner: &Arc<SessionInner>, from: String, sdp: RTCSessionDescription) {
    let link = match inner.registry.get(&from) {
        Some(link) => link,
        None => match create_link(inner, &from).await {
            Some((link, _)) => link,
            None => return,
        },
    };

    if link.state() == LinkState::Closed {
        return;
    }
    if link.state() == LinkState::New {
        link.set_state(LinkState::OfferReceived);
    }

    if let Err(e) = link.pc.set_remote_description(sdp).await {
        // обе стороны позвонили друг другу одновременно либо offer битый;
        // связь уходит в Closed, никого кроме этой пары это не трогает
        log(&format!(
            "Error setting remote description from {}: {:?}",
            from, e
        ));
        close_peer(inner, &from).await;
        return;
    }
    link.mark_remote_desc_set();
    ice::flush_pending(&link).await;

    if inner.registry.get(&from).is_none() {
        return;
    }
    let answer = match link.pc.create_answer(None).await {
        Ok(answer) => answer,
        Err(e) => {
            log(&format!("Error creating answer for {}: {:?}", from, e));
            return;
        }
    };
    if let Err(e) = link.pc.set_local_description(answer).await {
        log(&format!(
            "Error setting local description for {}: {:?}",
            from, e
        ));
        return;
    }

    if inner.registry.get(&from).is_none() {
        return;
    }
    if let Some(local) = link.pc.local_description().await {
        inner.signal.send(ClientEvent::Answer {
            sdp: local,
            to: from.clone(),
        });
        link.set_state(LinkState::AnswerSent);
        log(&format!("Answer sent to {}", from));
    }
}

/// Входящий answer; без существующей связи он опоздал и выбрасывается
pub(crate) async fn handle_answer(inner: &Arc<SessionInner>, from: String, sdp: RTCSessionDescription) {
    let Some(link) = inner.registry.get(&from) else {
        log(&format!("Stale answer from {}, no peer link", from));
        return;
    };

    match link.pc.set_remote_description(sdp).await {
        Ok(()) => {
            link.mark_remote_desc_set();
            ice::flush_pending(&link).await;
            if inner.registry.get(&from).is_some() {
                link.set_state(LinkState::Connected);
                log(&format!("Peer link with {} negotiated", from));
            }
        }
        Err(e) => log(&format!(
            "Error setting remote description from {}: {:?}",
            from, e
        )),
    }
}

/// Входящий кандидат; отсутствие связи при гонках закрытия это норма
pub(crate) async fn handle_candidate(inner: &Arc<SessionInner>, from: String, candidate: IceCandidate) {
    let Some(link) = inner.registry.get(&from) else {
        log(&format!("Dropping candidate from {}: no peer link", from));
        return;
    };
    ice::apply_candidate(&link, candidate).await;
}

/// Снос одной связи: транспорт закрывается, запись уходит из реестра
pub(crate) async fn close_peer(inner: &Arc<SessionInner>, socket_id: &str) {
    let Some(link) = inner.registry.remove(socket_id) else {
        return;
    };
    teardown(&link).await;
}

/// Снос всех связей разом (уход из комнаты)
pub(crate) async fn close_all(inner: &Arc<SessionInner>) {
    for link in inner.registry.drain() {
        teardown(&link).await;
    }
}

async fn teardown(link: &Arc<PeerLink>) {
    if let Some(handle) = link.disconnect_task.lock().unwrap().take() {
        handle.abort();
    }
    link.set_state(LinkState::Closed);
    if let Err(e) = link.pc.close().await {
        log(&format!("Error closing peer {}: {:?}", link.socket_id, e));
    }
    log(&format!("Peer link with {} closed", link.socket_id));
}

/// Сборка связи: транспорт, локальные дорожки, вставка в реестр.
/// При гонке с встречным вызовом лишний транспорт закрывается, а
/// возвращается уже существующая связь и `false`.
async fn create_link(inner: &Arc<SessionInner>, remote: &str) -> Option<(Arc<PeerLink>, bool)> {
    let pc = match new_peer(inner, remote).await {
        Ok(pc) => pc,
        Err(e) => {
            log(&format!(
                "Failed to create peer connection for {}: {:?}",
                remote, e
            ));
            return None;
        }
    };

    // локальная дорожка, если источник уже открыт; иначе связь только принимает
    let local_track = inner
        .local_audio
        .lock()
        .unwrap()
        .as_ref()
        .map(|audio| audio.track());
    if let Some(track) = local_track {
        match pc
            .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
            .await
        {
            Ok(rtp_sender) => {
                // RTCP от отправителя нужно вычитывать, иначе interceptors встанут
                tokio::spawn(async move {
                    let mut rtcp_buf = vec![0u8; 1500];
                    while rtp_sender.read(&mut rtcp_buf).await.is_ok() {}
                });
            }
            Err(e) => log(&format!(
                "Failed to attach local track for {}: {:?}",
                remote, e
            )),
        }
    }

    let fresh = PeerLink::new(remote.to_string(), pc.clone());
    let (link, created) = inner.registry.get_or_insert(fresh);
    if !created {
        log(&format!(
            "Peer link for {} appeared concurrently, dropping duplicate",
            remote
        ));
        let _ = pc.close().await;
    }
    Some((link, created))
}
