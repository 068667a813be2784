//! Inbound text frame handling.

use std::sync::Arc;

use metrics::counter;
use relay_core::{DecodeError, EventBus, RequestId, Response, decode_request};
use tracing::{debug, warn};

use super::connection::ClientConnection;
use crate::dispatch::RequestCache;

/// Message broadcast when a frame cannot be decoded.
pub const BAD_REQUEST_MESSAGE: &str = "Invalid request.";

/// Decode a text frame and hand the request to business logic.
///
/// The correlation is recorded before the request is published, so a
/// response can never overtake it. A frame that fails to decode produces a
/// `bad-request` notification for every client and nothing else.
pub fn handle_text(
    text: &str,
    conn: &Arc<ClientConnection>,
    cache: &RequestCache,
    bus: &EventBus,
) -> Result<RequestId, DecodeError> {
    let request = match decode_request(text) {
        Ok(request) => request,
        Err(e) => {
            warn!(conn_id = %conn.id, error = %e, len = text.len(), "undecodable request");
            counter!("relay_bad_requests_total").increment(1);
            let _ = bus.publish_response(Response::bad_request(BAD_REQUEST_MESSAGE));
            return Err(e);
        }
    };

    let request_id = request.id;
    debug!(conn_id = %conn.id, %request_id, kind = request.kind.name(), "request received");
    cache.put(request_id, Arc::clone(conn));
    let _ = bus.publish_request(request);
    Ok(request_id)
}

#[cfg(test)]
mod tests {
    use relay_core::{ConnectionId, Outbound, RequestKind, ResponseBody};
    use tokio::sync::mpsc;

    use super::*;
    use crate::config::CorrelationConfig;

    fn setup() -> (Arc<ClientConnection>, RequestCache, EventBus) {
        let (tx, _rx) = mpsc::channel(4);
        let conn = Arc::new(ClientConnection::new(ConnectionId::from_string("c1"), tx));
        let cache = RequestCache::new(&CorrelationConfig::default());
        (conn, cache, EventBus::new(16))
    }

    #[tokio::test]
    async fn valid_request_is_correlated_and_published() {
        let (conn, cache, bus) = setup();
        let mut requests = bus.subscribe_requests();

        let id = handle_text(r#"{"id":42,"kind":"ping"}"#, &conn, &cache, &bus).unwrap();

        assert_eq!(id.get(), 42);
        let cached = cache.get(id).unwrap();
        assert!(Arc::ptr_eq(&cached, &conn));
        let request = requests.recv().await.unwrap();
        assert_eq!(request.id, id);
        assert_eq!(request.kind, RequestKind::Ping);
    }

    #[tokio::test]
    async fn correlation_exists_before_subscriber_sees_request() {
        let (conn, cache, bus) = setup();
        let cache = Arc::new(cache);
        let mut requests = bus.subscribe_requests();

        let _ = handle_text(
            r#"{"id":5,"kind":"list-files","root":"/srv"}"#,
            &conn,
            &cache,
            &bus,
        )
        .unwrap();

        let request = requests.recv().await.unwrap();
        assert!(cache.get(request.id).is_some());
    }

    #[tokio::test]
    async fn malformed_frame_broadcasts_bad_request() {
        let (conn, cache, bus) = setup();
        let mut requests = bus.subscribe_requests();
        let mut outbound = bus.subscribe_outbound();

        let err = handle_text("not json", &conn, &cache, &bus).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));

        let Outbound::Text(response) = outbound.recv().await.unwrap() else {
            panic!("expected text response");
        };
        assert_eq!(response.correlation(), None);
        assert_eq!(response.request_id, Some(-1));
        assert_eq!(
            response.body,
            ResponseBody::BadRequest {
                message: BAD_REQUEST_MESSAGE.into()
            }
        );
        assert!(requests.try_recv().is_err());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn unknown_kind_is_a_bad_request() {
        let (conn, cache, bus) = setup();
        let mut outbound = bus.subscribe_outbound();

        let err = handle_text(r#"{"id":1,"kind":"reboot"}"#, &conn, &cache, &bus).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownKind(_)));
        assert!(outbound.try_recv().is_ok());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn non_positive_id_is_a_bad_request() {
        let (conn, cache, bus) = setup();
        let err = handle_text(r#"{"id":0,"kind":"ping"}"#, &conn, &cache, &bus).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidId(_)));
        assert!(cache.is_empty());
    }
}
