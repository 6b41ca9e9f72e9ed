use crate::logger::log;
use crate::peer::types::RosterEntry;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// События для слоя отображения; он сам решает, как их показывать
#[derive(Debug, Clone)]
pub enum RoomEvent {
    /// Сервер прислал новый полный список участников
    RosterUpdated { roster: Vec<RosterEntry> },
    MemberJoined { username: String },
    MemberLeft { username: String },
    /// Снимок документа от другого участника (догоняющая синхронизация)
    DocSync { code: String },
    MicToggled { username: String, mic_on: bool },
    ViewToggled { username: String, whiteboard: bool },
    /// От удалённого участника пришла аудио-дорожка
    RemoteAudio { socket_id: String },
    /// Сигнальный канал умер; сессия завершена, комнату нужно покинуть
    ConnectionFailed,
}

/// Канал уведомлений в сторону слоя отображения
#[derive(Clone)]
pub struct EventSink {
    tx: UnboundedSender<RoomEvent>,
}

impl EventSink {
    pub fn channel() -> (EventSink, UnboundedReceiver<RoomEvent>) {
        let (tx, rx) = unbounded_channel();
        (EventSink { tx }, rx)
    }

    /// Отправка события; закрытый приёмник не считается ошибкой
    pub fn emit(&self, event: RoomEvent) {
        log(&format!("emit: {:?}", event));
        let _ = self.tx.send(event);
    }
}
