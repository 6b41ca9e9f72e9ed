use crate::logger::log;
use crate::peer::state::PeerLink;
use crate::peer::types::IceCandidate;
use std::sync::Arc;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

/// Применяет ICE кандидат от удаленной стороны
pub(crate) async fn apply_candidate(link: &Arc<PeerLink>, candidate: IceCandidate) {
    // Если remote description еще не установлен, сохраняем кандидат
    if !link.remote_desc_set() {
        log(&format!(
            "Remote description for {} not set yet, queuing candidate",
            link.socket_id
        ));
        link.pending_remote_candidates.lock().unwrap().push(candidate);
        return;
    }
    add_to_transport(link, candidate).await;
}

/// Применяет все отложенные кандидаты после установки remote description
pub(crate) async fn flush_pending(link: &Arc<PeerLink>) {
    let pending = {
        let mut queued = link.pending_remote_candidates.lock().unwrap();
        queued.drain(..).collect::<Vec<_>>()
    };

    for candidate in pending {
        log(&format!("Applying pending candidate for {}", link.socket_id));
        add_to_transport(link, candidate).await;
    }
}

async fn add_to_transport(link: &Arc<PeerLink>, candidate: IceCandidate) {
    let init = RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: None,
    };

    if let Err(e) = link.pc.add_ice_candidate(init).await {
        log(&format!(
            "Failed to add ICE candidate for {}: {:?}",
            link.socket_id, e
        ));
    }
}

#[cfg(test)]
#[path = "ice_test.rs"]
mod ice_test;
