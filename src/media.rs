use crate::utils::random_id;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Локальный аудио-источник: одна дорожка, общая для всех связей.
/// Захват звука живёт снаружи и кормит дорожку через [`AudioFeed`].
pub struct LocalAudio {
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
}

impl LocalAudio {
    pub(crate) fn new(enabled: bool) -> Self {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            format!("audio-{}", random_id()),
            "codesync".to_owned(),
        ));
        LocalAudio {
            track,
            enabled: Arc::new(AtomicBool::new(enabled)),
        }
    }

    pub(crate) fn track(&self) -> Arc<TrackLocalStaticSample> {
        self.track.clone()
    }

    /// Включение/выключение микрофона без пересогласования:
    /// дорожка остаётся в соединении, глушатся только кадры
    pub(crate) fn set_enabled(&self, on: bool) {
        self.enabled.store(on, Ordering::Release);
    }

    pub fn feed(&self) -> AudioFeed {
        AudioFeed {
            track: self.track.clone(),
            enabled: self.enabled.clone(),
        }
    }
}

/// Ручка для внешнего источника захвата: сюда пишутся opus-кадры
#[derive(Clone)]
pub struct AudioFeed {
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
}

impl AudioFeed {
    /// Кадр при выключенном микрофоне молча отбрасывается
    pub async fn write(&self, data: Bytes, duration: Duration) -> Result<(), webrtc::Error> {
        if !self.enabled.load(Ordering::Acquire) {
            return Ok(());
        }
        self.track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
}

#[cfg(test)]
#[path = "media_test.rs"]
mod media_test;
