use crate::error::SessionError;
use crate::events::{EventSink, RoomEvent};
use crate::logger::log;
use crate::media::{AudioFeed, LocalAudio};
use crate::peer::negotiation;
use crate::peer::state::PeerRegistry;
use crate::peer::types::{RosterEntry, ServerConfig};
use crate::signaling::{self, ClientEvent, ServerEvent, SignalTx, WsReader};
use crate::utils::validate_ice_servers;
use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use webrtc::track::track_remote::TrackRemote;

/// Приёмник удалённых аудио-дорожек; воспроизведение живёт снаружи
pub type AudioSink = Arc<dyn Fn(String, Arc<TrackRemote>) + Send + Sync>;

/// Параметры входа в комнату
pub struct RoomConfig {
    /// Адрес сигнального сервера (ws/wss, http/https тоже принимаются)
    pub endpoint: String,
    pub room_id: String,
    pub username: String,
    /// Свои ICE серверы вместо дефолтных STUN
    pub ice_servers: Option<Vec<ServerConfig>>,
    pub audio_sink: Option<AudioSink>,
}

/// Всё владеемое сессией состояние; обработчики держат его через Arc/Weak
pub(crate) struct SessionInner {
    pub(crate) room_id: String,
    pub(crate) username: String,
    pub(crate) signal: SignalTx,
    pub(crate) events: EventSink,
    pub(crate) registry: PeerRegistry,
    pub(crate) roster: Mutex<Vec<RosterEntry>>,
    /// Текущий снимок документа; редактор обновляет его через `update_code`
    pub(crate) code: Mutex<String>,
    pub(crate) whiteboard: AtomicBool,
    pub(crate) mic_on: AtomicBool,
    pub(crate) local_audio: Mutex<Option<LocalAudio>>,
    /// Наш socket id; присваивается сервером в первом joined
    pub(crate) socket_id: Mutex<Option<String>>,
    pub(crate) ice_servers: Option<Vec<ServerConfig>>,
    pub(crate) audio_sink: Option<AudioSink>,
    pub(crate) left: AtomicBool,
}

impl SessionInner {
    pub(crate) fn new(
        room_id: String,
        username: String,
        ice_servers: Option<Vec<ServerConfig>>,
        audio_sink: Option<AudioSink>,
        signal: SignalTx,
        events: EventSink,
    ) -> Arc<Self> {
        Arc::new(SessionInner {
            room_id,
            username,
            signal,
            events,
            registry: PeerRegistry::new(),
            roster: Mutex::new(Vec::new()),
            code: Mutex::new(String::new()),
            whiteboard: AtomicBool::new(false),
            mic_on: AtomicBool::new(false),
            local_audio: Mutex::new(None),
            socket_id: Mutex::new(None),
            ice_servers,
            audio_sink,
            left: AtomicBool::new(false),
        })
    }
}

/// Членство в одной комнате на время жизни этого объекта
pub struct RoomSession {
    inner: Arc<SessionInner>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl RoomSession {
    /// Открывает сигнальный канал и входит в комнату.
    /// Ровно один join на вызов; объект повторно не входит.
    pub async fn join(
        config: RoomConfig,
    ) -> Result<(RoomSession, UnboundedReceiver<RoomEvent>), SessionError> {
        if let Some(servers) = &config.ice_servers {
            validate_ice_servers(servers)?;
        }

        let (signal, ws_read) = signaling::connect(&config.endpoint).await?;
        let (events, event_rx) = EventSink::channel();

        let inner = SessionInner::new(
            config.room_id,
            config.username,
            config.ice_servers,
            config.audio_sink,
            signal,
            events,
        );

        inner.signal.send(ClientEvent::Join {
            room_id: inner.room_id.clone(),
            username: inner.username.clone(),
        });
        log(&format!(
            "Join sent: room={} username={}",
            inner.room_id, inner.username
        ));

        let reader = tokio::spawn(run_reader(inner.clone(), ws_read));
        Ok((
            RoomSession {
                inner,
                reader: Mutex::new(Some(reader)),
            },
            event_rx,
        ))
    }

    /// Уход из комнаты: закрывает все связи, потом сигнальный канал.
    /// Повторный вызов ничего не делает.
    pub async fn leave(&self) {
        if self.inner.left.swap(true, Ordering::SeqCst) {
            return;
        }
        log(&format!("Leaving room {}", self.inner.room_id));
        if let Some(handle) = self.reader.lock().unwrap().take() {
            handle.abort();
        }
        negotiation::close_all(&self.inner).await;
        self.inner.signal.close();
    }

    /// Открывает локальный аудио-источник и возвращает ручку для захвата.
    /// Дорожка попадает в связи, создаваемые после этого вызова.
    pub fn open_microphone(&self) -> AudioFeed {
        let mut guard = self.inner.local_audio.lock().unwrap();
        let audio = guard
            .get_or_insert_with(|| LocalAudio::new(self.inner.mic_on.load(Ordering::Acquire)));
        audio.feed()
    }

    /// Переключение микрофона: глушатся кадры, топология связей не меняется
    pub fn toggle_mic(&self) -> bool {
        let mic_on = !self.inner.mic_on.load(Ordering::Acquire);
        self.inner.mic_on.store(mic_on, Ordering::Release);
        if let Some(audio) = self.inner.local_audio.lock().unwrap().as_ref() {
            audio.set_enabled(mic_on);
        }
        self.inner.signal.send(ClientEvent::MicToggle {
            room_id: self.inner.room_id.clone(),
            username: self.inner.username.clone(),
            mic_on,
        });
        mic_on
    }

    /// Переключение доски/редактора; всем уходит новое общее состояние
    pub fn toggle_view(&self) -> bool {
        let state = !self.inner.whiteboard.load(Ordering::Acquire);
        self.inner.whiteboard.store(state, Ordering::Release);
        self.inner.signal.send(ClientEvent::ViewToggle {
            room_id: self.inner.room_id.clone(),
            username: self.inner.username.clone(),
            state,
        });
        state
    }

    /// Редактор сообщает сюда каждое изменение буфера; снимок нужен
    /// для догоняющей синхронизации новичков
    pub fn update_code(&self, code: String) {
        *self.inner.code.lock().unwrap() = code;
    }

    pub fn code(&self) -> String {
        self.inner.code.lock().unwrap().clone()
    }

    pub fn roster(&self) -> Vec<RosterEntry> {
        self.inner.roster.lock().unwrap().clone()
    }

    pub fn room_id(&self) -> &str {
        &self.inner.room_id
    }

    pub fn socket_id(&self) -> Option<String> {
        self.inner.socket_id.lock().unwrap().clone()
    }

    pub fn is_mic_on(&self) -> bool {
        self.inner.mic_on.load(Ordering::Acquire)
    }

    pub fn is_whiteboard(&self) -> bool {
        self.inner.whiteboard.load(Ordering::Acquire)
    }

    /// Аудио-дорожка участника, если переговоры уже дошли до медиа
    pub fn remote_track(&self, socket_id: &str) -> Option<Arc<TrackRemote>> {
        self.inner
            .registry
            .get(socket_id)
            .and_then(|link| link.remote_track.lock().unwrap().clone())
    }
}

impl Drop for RoomSession {
    fn drop(&mut self) {
        // страховка на случай ухода без leave(): транспорт не должен пережить сессию
        if self.inner.left.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.reader.lock().unwrap().take() {
            handle.abort();
        }
        self.inner.signal.close();
        let inner = self.inner.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { negotiation::close_all(&inner).await });
        }
    }
}

/// Цикл диспетчеризации входящих сигнальных событий.
/// Обрабатывает по одному событию за раз, до конца.
pub(crate) async fn run_reader(inner: Arc<SessionInner>, mut ws_read: WsReader) {
    loop {
        let frame = match ws_read.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                log(&format!("Signal read failed: {:?}", e));
                break;
            }
            None => break,
        };

        match frame {
            Message::Text(text) => match serde_json::from_str::<ServerEvent>(text.as_str()) {
                Ok(event) => dispatch(&inner, event).await,
                Err(e) => log(&format!("Unrecognized signal frame: {:?}", e)),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    // сюда попадаем только если транспорт умер сам: для сессии это фатально
    if !inner.left.swap(true, Ordering::SeqCst) {
        log("Signal channel lost, abandoning session");
        inner.events.emit(RoomEvent::ConnectionFailed);
        negotiation::close_all(&inner).await;
        inner.signal.close();
    }
}

pub(crate) async fn dispatch(inner: &Arc<SessionInner>, event: ServerEvent) {
    match event {
        ServerEvent::Joined {
            clients,
            username,
            socket_id,
        } => handle_joined(inner, clients, username, socket_id).await,

        ServerEvent::Disconnected {
            socket_id,
            username,
        } => handle_disconnected(inner, socket_id, username).await,

        ServerEvent::Offer { sdp, from } => negotiation::handle_offer(inner, from, sdp).await,
        ServerEvent::Answer { sdp, from } => negotiation::handle_answer(inner, from, sdp).await,
        ServerEvent::Candidate { candidate, from } => {
            negotiation::handle_candidate(inner, from, candidate).await
        }

        ServerEvent::MicToggleAck { username, mic_on } => {
            // для чужого микрофона мы только зрители
            inner.events.emit(RoomEvent::MicToggled { username, mic_on });
        }

        ServerEvent::ViewToggleAck { username, state } => {
            // применяем как есть: выигрывает последнее сообщение
            inner.whiteboard.store(state, Ordering::Release);
            inner.events.emit(RoomEvent::ViewToggled {
                username,
                whiteboard: state,
            });
        }

        ServerEvent::SyncDoc { code } => {
            if let Some(code) = code {
                *inner.code.lock().unwrap() = code.clone();
                inner.events.emit(RoomEvent::DocSync { code });
            }
        }
    }
}

async fn handle_joined(
    inner: &Arc<SessionInner>,
    clients: Vec<RosterEntry>,
    username: String,
    socket_id: String,
) {
    // список сервера авторитетен; никаких локальных добавлений
    *inner.roster.lock().unwrap() = clients.clone();

    let own = {
        let mut me = inner.socket_id.lock().unwrap();
        match me.as_ref() {
            // первое joined после join подтверждает наш собственный вход
            None => {
                *me = Some(socket_id.clone());
                true
            }
            Some(id) => *id == socket_id,
        }
    };

    inner.events.emit(RoomEvent::RosterUpdated { roster: clients });

    if !own {
        log(&format!("{} joined the room", username));
        inner.events.emit(RoomEvent::MemberJoined { username });
        negotiation::initiate(inner, &socket_id).await;
    }

    // новичок всегда сразу получает текущий снимок документа
    let code = inner.code.lock().unwrap().clone();
    inner.signal.send(ClientEvent::SyncDoc { code, socket_id });
}

async fn handle_disconnected(inner: &Arc<SessionInner>, socket_id: String, username: String) {
    log(&format!("{} left the room", username));
    inner
        .roster
        .lock()
        .unwrap()
        .retain(|client| client.socket_id != socket_id);
    inner.events.emit(RoomEvent::MemberLeft { username });
    negotiation::close_peer(inner, &socket_id).await;
}

#[cfg(test)]
#[path = "session_test.rs"]
mod session_test;
