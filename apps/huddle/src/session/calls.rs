use super::actor::Internal;
use crate::peer::{CallEvent, MediaCall};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Forwards a call's events into the session loop tagged with the call and
/// peer ids. Applied once wherever a call handle is obtained, placed or
/// answered, so both directions report identically.
pub(crate) fn instrument_call(
    call: &Arc<dyn MediaCall>,
    peer_id: &str,
    internal: &mpsc::UnboundedSender<Internal>,
) -> Option<JoinHandle<()>> {
    let Some(mut events) = call.take_events() else {
        tracing::warn!(
            target = "huddle::session",
            call_id = call.call_id(),
            peer_id,
            "call events already taken; call will not be observed"
        );
        return None;
    };
    let call_id = call.call_id().to_string();
    let peer_id = peer_id.to_string();
    let internal = internal.clone();
    Some(tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            tracing::trace!(target = "huddle::session", call_id = %call_id, peer_id = %peer_id, ?event, "call event");
            let closed = matches!(event, CallEvent::Closed);
            let forwarded = internal.send(Internal::Call {
                peer_id: peer_id.clone(),
                call_id: call_id.clone(),
                event,
            });
            if closed || forwarded.is_err() {
                return;
            }
        }
        // The transport dropped the event stream without a close notice.
        let _ = internal.send(Internal::Call {
            peer_id,
            call_id,
            event: CallEvent::Closed,
        });
    }))
}
