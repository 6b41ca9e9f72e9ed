use crate::logger::log;
use crate::peer::types::IceCandidate;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_remote::TrackRemote;

/// Период ожидания восстановления соединения перед сносом связи
pub const GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Этапы переговоров по одной связи
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    OfferSent,
    OfferReceived,
    AnswerSent,
    Connected,
    Closed,
}

/// Связь с одним удалённым участником: транспорт плюс состояние переговоров
pub struct PeerLink {
    pub socket_id: String,
    pub pc: Arc<RTCPeerConnection>,
    pub state: Mutex<LinkState>,
    /// Кандидаты, полученные до установки remote description
    pub pending_remote_candidates: Mutex<Vec<IceCandidate>>,
    pub remote_desc_set: AtomicBool,
    /// Аудио-дорожка удалённой стороны, когда она придёт
    pub remote_track: Mutex<Option<Arc<TrackRemote>>>,
    /// Отложенная задача для graceful disconnect
    pub disconnect_task: Mutex<Option<JoinHandle<()>>>,
}

impl PeerLink {
    pub fn new(socket_id: String, pc: Arc<RTCPeerConnection>) -> Arc<Self> {
        Arc::new(PeerLink {
            socket_id,
            pc,
            state: Mutex::new(LinkState::New),
            pending_remote_candidates: Mutex::new(Vec::new()),
            remote_desc_set: AtomicBool::new(false),
            remote_track: Mutex::new(None),
            disconnect_task: Mutex::new(None),
        })
    }

    pub fn state(&self) -> LinkState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, next: LinkState) {
        let mut st = self.state.lock().unwrap();
        log(&format!(
            "Peer {} negotiation state: {:?} -> {:?}",
            self.socket_id, *st, next
        ));
        *st = next;
    }

    pub fn remote_desc_set(&self) -> bool {
        self.remote_desc_set.load(Ordering::Acquire)
    }

    pub fn mark_remote_desc_set(&self) {
        self.remote_desc_set.store(true, Ordering::Release);
    }
}

/// Единственный владелец всех связей; только через него связи
/// создаются и уничтожаются, поэтому на каждого участника
/// существует не более одной связи
#[derive(Default)]
pub struct PeerRegistry {
    links: Mutex<HashMap<String, Arc<PeerLink>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        PeerRegistry::default()
    }

    pub fn get(&self, socket_id: &str) -> Option<Arc<PeerLink>> {
        self.links.lock().unwrap().get(socket_id).cloned()
    }

    /// Вставляет готовую связь, если для этого участника ещё нет записи.
    /// При гонке (обе стороны инициировали одновременно) возвращает уже
    /// существующую запись и `false`; лишний транспорт закрывает вызывающий.
    pub fn get_or_insert(&self, link: Arc<PeerLink>) -> (Arc<PeerLink>, bool) {
        let mut links = self.links.lock().unwrap();
        if let Some(existing) = links.get(&link.socket_id) {
            return (existing.clone(), false);
        }
        links.insert(link.socket_id.clone(), link.clone());
        (link, true)
    }

    pub fn remove(&self, socket_id: &str) -> Option<Arc<PeerLink>> {
        self.links.lock().unwrap().remove(socket_id)
    }

    /// Забирает все связи разом (уход из комнаты)
    pub fn drain(&self) -> Vec<Arc<PeerLink>> {
        let mut links = self.links.lock().unwrap();
        links.drain().map(|(_, link)| link).collect()
    }

    pub fn for_each(&self, mut f: impl FnMut(&Arc<PeerLink>)) {
        for link in self.links.lock().unwrap().values() {
            f(link);
        }
    }

    pub fn len(&self) -> usize {
        self.links.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
#[path = "state_test.rs"]
mod state_test;
