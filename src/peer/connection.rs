use crate::config::DEFAULT_ICE_SERVERS;
use crate::events::RoomEvent;
use crate::logger::{dump_candidate, dump_selected_pair, log};
use crate::peer::negotiation;
use crate::peer::state::GRACE_PERIOD;
use crate::peer::types::{IceCandidate, ServerConfig};
use crate::session::SessionInner;
use crate::signaling::ClientEvent;
use crate::utils::add_ice_url_scheme;
use std::sync::Arc;
use tokio::time::sleep;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

/// Создаёт транспорт для связи с участником `remote` и вешает обработчики.
/// Обработчики держат только Weak на сессию: после сноса связи или всей
/// сессии их срабатывание превращается в no-op.
pub(crate) async fn new_peer(
    inner: &Arc<SessionInner>,
    remote: &str,
) -> Result<Arc<RTCPeerConnection>, webrtc::Error> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let config = rtc_config(inner.ice_servers.clone());
    let pc = Arc::new(api.new_peer_connection(config).await?);

    // Найденные локальные кандидаты сразу улетают адресату, по одному
    let remote_id = remote.to_string();
    let weak = Arc::downgrade(inner);
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        match cand {
            Some(c) => {
                if let Some(inner) = weak.upgrade() {
                    dump_candidate("LOCAL", &remote_id, &c);
                    if let Ok(init) = c.to_json() {
                        inner.signal.send(ClientEvent::Candidate {
                            candidate: IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                            },
                            to: remote_id.clone(),
                        });
                    }
                }
            }
            // cand == None означает конец сбора
            None => log("ICE candidate gathering completed (null candidate received)"),
        }
        Box::pin(async {})
    }));

    pc.on_ice_gathering_state_change(Box::new(move |state| {
        log(&format!("ICE gathering state changed to: {:?}", state));
        Box::pin(async {})
    }));

    // Входящее аудио: дорожка запоминается на связи и отдаётся наружу
    let remote_id = remote.to_string();
    let weak = Arc::downgrade(inner);
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let remote_id = remote_id.clone();
            let weak = weak.clone();
            Box::pin(async move {
                let Some(inner) = weak.upgrade() else { return };
                let Some(link) = inner.registry.get(&remote_id) else {
                    return;
                };
                log(&format!("Remote track from {}", remote_id));
                *link.remote_track.lock().unwrap() = Some(track.clone());
                inner.events.emit(RoomEvent::RemoteAudio {
                    socket_id: remote_id.clone(),
                });
                match inner.audio_sink.clone() {
                    // воспроизведение делает слой отображения
                    Some(sink) => sink(remote_id.clone(), track),
                    None => {
                        // дорожку никто не слушает; вычитываем пакеты,
                        // чтобы транспорт не встал
                        tokio::spawn(async move { while track.read_rtp().await.is_ok() {} });
                    }
                }
            })
        },
    ));

    let remote_id = remote.to_string();
    let weak = Arc::downgrade(inner);
    pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
        log(&format!(
            "Peer {} connection state changed to: {:?}",
            remote_id, st
        ));

        let Some(inner) = weak.upgrade() else {
            return Box::pin(async {});
        };
        let Some(link) = inner.registry.get(&remote_id) else {
            return Box::pin(async {});
        };

        match st {
            RTCPeerConnectionState::Connected => {
                // отменяем отложенный disconnect, если он был
                if let Some(handle) = link.disconnect_task.lock().unwrap().take() {
                    log("Aborting pending disconnect task");
                    handle.abort();
                }
            }

            RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed => {
                // уже ожидаем? – ничего не делаем
                if link.disconnect_task.lock().unwrap().is_some() {
                    return Box::pin(async {});
                }

                // ставим отложенную проверку
                let weak = weak.clone();
                let remote_id = remote_id.clone();
                let handle = tokio::spawn(async move {
                    log(&format!(
                        "Grace period started for {}, waiting {} s",
                        remote_id,
                        GRACE_PERIOD.as_secs()
                    ));
                    sleep(GRACE_PERIOD).await;

                    let Some(inner) = weak.upgrade() else { return };
                    let Some(link) = inner.registry.get(&remote_id) else {
                        return;
                    };
                    let state_now = link.pc.connection_state();
                    if state_now != RTCPeerConnectionState::Connected {
                        log(&format!(
                            "Grace over for {} ➜ state={:?}, closing link",
                            remote_id, state_now
                        ));
                        dump_selected_pair(&link.pc, "BEFORE-CLOSE").await;
                        negotiation::close_peer(&inner, &remote_id).await;
                    } else {
                        log("Connection recovered during grace period");
                    }
                });
                *link.disconnect_task.lock().unwrap() = Some(handle);
            }

            _ => {}
        }
        Box::pin(async {})
    }));

    Ok(pc)
}

/// Создает конфигурацию для peer connection
fn rtc_config(custom_servers: Option<Vec<ServerConfig>>) -> RTCConfiguration {
    // Пользовательские серверы, если они заданы, иначе дефолтные
    let servers = custom_servers.unwrap_or_else(|| DEFAULT_ICE_SERVERS.clone());

    RTCConfiguration {
        ice_servers: to_ice_servers(servers),
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

/// Перевод конфигурации серверов во внутренний формат webrtc
pub fn to_ice_servers(servers: Vec<ServerConfig>) -> Vec<RTCIceServer> {
    servers
        .into_iter()
        .map(|config| {
            let url = add_ice_url_scheme(&config);

            RTCIceServer {
                urls: vec![url],
                username: config.username.unwrap_or_default(),
                credential: config.credential.unwrap_or_default(),
            }
        })
        .collect()
}
