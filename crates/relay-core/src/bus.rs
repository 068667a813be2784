//! In-process event bus between the transport and business logic.
//!
//! Two topics, both `tokio::sync::broadcast`:
//!
//! - **requests**: decoded client requests, published by the transport and
//!   consumed by business logic
//! - **outbound**: [`Outbound`] responses, published by business logic and
//!   consumed by the dispatcher
//!
//! Every current subscriber sees every event. Ordering across different
//! publishers is not guaranteed. The bus is an ordinary value shared by
//! `Arc`; it lives as long as the process wires it.

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::messages::{BinaryResponse, Outbound, Request, Response};

/// Default per-topic buffer size.
pub const DEFAULT_BUS_CAPACITY: usize = 1024;

/// Publish/subscribe channel for requests and responses.
#[derive(Clone)]
pub struct EventBus {
    requests: broadcast::Sender<Request>,
    outbound: broadcast::Sender<Outbound>,
}

impl EventBus {
    /// Create a bus whose topics each buffer `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (requests, _) = broadcast::channel(capacity);
        let (outbound, _) = broadcast::channel(capacity);
        Self { requests, outbound }
    }

    /// Publish a decoded request to business logic.
    ///
    /// Returns the number of subscribers that received it.
    pub fn publish_request(&self, request: Request) -> usize {
        let request_id = request.id;
        let kind = request.kind.name();
        match self.requests.send(request) {
            Ok(receivers) => receivers,
            Err(_) => {
                warn!(%request_id, kind, "no request subscribers, request dropped");
                0
            }
        }
    }

    /// Publish a text response.
    pub fn publish_response(&self, response: Response) -> usize {
        self.publish(Outbound::Text(response))
    }

    /// Publish a binary response.
    pub fn publish_binary(&self, response: BinaryResponse) -> usize {
        self.publish(Outbound::Binary(response))
    }

    /// Publish any outbound event.
    ///
    /// Returns the number of subscribers that received it.
    pub fn publish(&self, event: Outbound) -> usize {
        match self.outbound.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                debug!("no outbound subscribers, response dropped");
                0
            }
        }
    }

    /// Subscribe to decoded requests.
    pub fn subscribe_requests(&self) -> broadcast::Receiver<Request> {
        self.requests.subscribe()
    }

    /// Subscribe to outbound responses.
    pub fn subscribe_outbound(&self) -> broadcast::Receiver<Outbound> {
        self.outbound.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::RequestId;
    use crate::messages::{RequestKind, ResponseBody};

    fn rid(raw: i64) -> RequestId {
        RequestId::new(raw).unwrap()
    }

    #[test]
    fn publish_without_subscribers_returns_zero() {
        let bus = EventBus::default();
        assert_eq!(bus.publish_request(Request::new(rid(1), RequestKind::Ping)), 0);
        assert_eq!(bus.publish_response(Response::broadcast(ResponseBody::Pong)), 0);
    }

    #[tokio::test]
    async fn request_reaches_every_subscriber() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe_requests();
        let mut b = bus.subscribe_requests();

        let delivered = bus.publish_request(Request::new(rid(3), RequestKind::ListWatches));
        assert_eq!(delivered, 2);
        assert_eq!(a.recv().await.unwrap().id, rid(3));
        assert_eq!(b.recv().await.unwrap().id, rid(3));
    }

    #[tokio::test]
    async fn outbound_text_and_binary_share_a_topic() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe_outbound();

        let _ = bus.publish_response(Response::reply(rid(1), ResponseBody::Pong));
        let _ = bus.publish_binary(BinaryResponse::new(rid(1), vec![0xAB]));

        assert!(matches!(rx.recv().await.unwrap(), Outbound::Text(_)));
        assert!(matches!(rx.recv().await.unwrap(), Outbound::Binary(_)));
    }

    #[tokio::test]
    async fn cloned_bus_shares_topics() {
        let bus = EventBus::new(8);
        let clone = bus.clone();
        let mut rx = bus.subscribe_outbound();
        let _ = clone.publish_response(Response::broadcast(ResponseBody::Pong));
        assert!(rx.recv().await.is_ok());
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe_outbound();
        for _ in 0..5 {
            let _ = bus.publish_response(Response::broadcast(ResponseBody::Pong));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }
}
