use crate::error::SessionError;
use crate::logger::log;
use crate::peer::types::{IceCandidate, RosterEntry};
use crate::utils::normalize_ws_url;
use futures_util::stream::{SplitStream, StreamExt};
use futures_util::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use serde::{Deserialize, Serialize};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

pub type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Исходящие события в сторону сервера-ретранслятора
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
#[serde(rename_all_fields = "camelCase")]
pub enum ClientEvent {
    Join {
        room_id: String,
        username: String,
    },
    Offer {
        sdp: RTCSessionDescription,
        to: String,
    },
    Answer {
        sdp: RTCSessionDescription,
        to: String,
    },
    Candidate {
        candidate: IceCandidate,
        to: String,
    },
    MicToggle {
        room_id: String,
        username: String,
        mic_on: bool,
    },
    ViewToggle {
        room_id: String,
        username: String,
        state: bool,
    },
    SyncDoc {
        code: String,
        socket_id: String,
    },
}

/// Входящие события от сервера-ретранслятора
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
#[serde(rename_all_fields = "camelCase")]
pub enum ServerEvent {
    Joined {
        clients: Vec<RosterEntry>,
        username: String,
        socket_id: String,
    },
    Disconnected {
        socket_id: String,
        username: String,
    },
    Offer {
        sdp: RTCSessionDescription,
        from: String,
    },
    Answer {
        sdp: RTCSessionDescription,
        from: String,
    },
    Candidate {
        candidate: IceCandidate,
        from: String,
    },
    MicToggleAck {
        username: String,
        mic_on: bool,
    },
    ViewToggleAck {
        username: String,
        state: bool,
    },
    SyncDoc {
        #[serde(default)]
        code: Option<String>,
    },
}

#[derive(Debug)]
pub(crate) enum WriterCmd {
    Send(ClientEvent),
    Close,
}

/// Пишущая половина сигнального канала; клонируется во все обработчики
#[derive(Clone)]
pub struct SignalTx {
    tx: UnboundedSender<WriterCmd>,
}

impl SignalTx {
    /// Отправка события; после закрытия канала превращается в no-op
    pub fn send(&self, event: ClientEvent) {
        let _ = self.tx.send(WriterCmd::Send(event));
    }

    pub fn close(&self) {
        let _ = self.tx.send(WriterCmd::Close);
    }

    #[cfg(test)]
    pub(crate) fn test_pair() -> (SignalTx, tokio::sync::mpsc::UnboundedReceiver<WriterCmd>) {
        let (tx, rx) = unbounded_channel();
        (SignalTx { tx }, rx)
    }
}

/// Подключается к сигнальному серверу и запускает задачу-писателя.
/// Читающая половина отдаётся вызывающему: цикл диспетчеризации живёт в сессии.
pub async fn connect(endpoint: &str) -> Result<(SignalTx, WsReader), SessionError> {
    let url = normalize_ws_url(endpoint)?;
    log(&format!("Connecting to signaling server: {}", url));

    let (stream, _) = connect_async(url.as_str()).await?;
    let (mut ws_write, ws_read) = stream.split();

    let (tx, mut rx) = unbounded_channel::<WriterCmd>();
    tokio::spawn(async move {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                WriterCmd::Send(event) => match serde_json::to_string(&event) {
                    Ok(text) => {
                        if let Err(e) = ws_write.send(Message::Text(text.into())).await {
                            log(&format!("Signal send failed: {:?}", e));
                            break;
                        }
                    }
                    Err(e) => log(&format!("Failed to encode signal event: {:?}", e)),
                },
                WriterCmd::Close => {
                    let _ = ws_write.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        log("Signal writer task finished");
    });

    Ok((SignalTx { tx }, ws_read))
}

#[cfg(test)]
#[path = "signaling_test.rs"]
mod signaling_test;
