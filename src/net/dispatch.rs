//! Packet and message dispatch for one connection.
//!
//! Called by the connection worker, one packet at a time, in arrival order.
//! Nothing here reports failures to the peer: undecodable or unroutable units
//! are logged and dropped, and the connection carries on.

use bytes::Bytes;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use crate::node::NodeContext;
use crate::protocol::packet::{self, Packet, PacketType};
use crate::protocol::{Message, MessageKind, RouteInfo};
use crate::session::{SessionHandle, SessionStatus};
use crate::types::{Error, Result};

/// Status code of a successful handshake.
pub const HANDSHAKE_OK: u16 = 200;

#[derive(Debug, Serialize)]
struct HandshakeReply {
    code: u16,
    sys: HandshakeSys,
}

#[derive(Debug, Serialize)]
struct HandshakeSys {
    heartbeat: u64,
}

/// JSON body of the handshake reply: `{"code":200,"sys":{"heartbeat":<secs>}}`.
pub fn handshake_body(heartbeat_interval: Duration) -> Result<Bytes> {
    let reply = HandshakeReply {
        code: HANDSHAKE_OK,
        sys: HandshakeSys {
            heartbeat: heartbeat_interval.as_secs(),
        },
    };
    Ok(Bytes::from(serde_json::to_vec(&reply)?))
}

/// Handle one packet. Failures are logged, never propagated.
///
/// Failures a peer can cause at will are logged at debug so a noisy client
/// cannot flood the log.
pub async fn process_packet(ctx: &NodeContext, session: &SessionHandle, packet: Packet) {
    let kind = packet.kind;
    if let Err(e) = handle_packet(ctx, session, packet).await {
        match e {
            Error::Decode(_) | Error::Validation(_) | Error::NotFound(_) => {
                tracing::debug!("dropping {:?} packet: {}", kind, e)
            }
            _ => tracing::warn!("dropping {:?} packet: {}", kind, e),
        }
    }
}

async fn handle_packet(ctx: &NodeContext, session: &SessionHandle, packet: Packet) -> Result<()> {
    match packet.kind {
        PacketType::Handshake => {
            session.set_status(SessionStatus::Handshaking);
            tracing::debug!("handshake: {}", String::from_utf8_lossy(&packet.body));
            let body = handshake_body(ctx.config.net.heartbeat_interval)?;
            ctx.sessions
                .send(session, packet::pack(PacketType::Handshake, &body)?);
        }
        PacketType::HandshakeAck => {
            session.set_status(SessionStatus::Working);
        }
        PacketType::Heartbeat => {
            session.heartbeat();
        }
        PacketType::Data => {
            session.heartbeat();
            let message = Message::decode(&packet.body)?;
            process_message(ctx, session, message).await?;
        }
    }
    Ok(())
}

/// Resolve the message's route and dispatch it locally or hand it off.
pub async fn process_message(
    ctx: &NodeContext,
    session: &SessionHandle,
    message: Message,
) -> Result<()> {
    let route = message
        .route
        .as_ref()
        .ok_or_else(|| Error::validation(format!("{:?} message has no route", message.kind)))?;
    let info = ctx.routes.resolve(route)?;

    if ctx.is_local(&info) {
        local_process(ctx, session, &info, message)
    } else {
        ctx.forwarder.forward(session, &info, message).await
    }
}

fn local_process(
    ctx: &NodeContext,
    session: &SessionHandle,
    info: &RouteInfo,
    message: Message,
) -> Result<()> {
    match message.kind {
        MessageKind::Request => session.set_last_request_id(message.id),
        MessageKind::Notify => session.set_last_request_id(0),
        other => {
            return Err(Error::validation(format!(
                "invalid message type {:?} for {}",
                other, info
            )))
        }
    }

    let service = ctx
        .handlers
        .service(&info.service)
        .ok_or_else(|| Error::not_found(format!("service: {}", info.service)))?;
    let method = service
        .method(&info.method)
        .ok_or_else(|| Error::not_found(format!("method: {}", info.method)))?;

    if catch_unwind(AssertUnwindSafe(|| method.call(session, message.body))).is_err() {
        return Err(Error::internal(format!("handler {} panicked", info)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{Component, HandlerRegistry, MethodTable};
    use crate::net::forward::MockRemoteForwarder;
    use crate::protocol::Route;
    use crate::session::SessionLink;
    use crate::types::Config;
    use bytes::BytesMut;
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;
    use tracing_test::traced_test;

    #[derive(Default)]
    struct Bar {
        seen: Arc<Mutex<Vec<(u64, Vec<u8>)>>>,
    }

    impl Component for Bar {
        fn methods(table: &mut MethodTable<Self>) {
            table
                .method("Foo", |bar, session, body| {
                    bar.seen
                        .lock()
                        .unwrap()
                        .push((session.last_request_id(), body.to_vec()));
                })
                .method("Boom", |_, _, _| panic!("handler failure"));
        }
    }

    struct Fixture {
        ctx: NodeContext,
        session: SessionHandle,
        outbound: mpsc::Receiver<Bytes>,
        seen: Arc<Mutex<Vec<(u64, Vec<u8>)>>>,
    }

    fn fixture_with(config: Config) -> Fixture {
        let sessions = NodeContext::session_registry(&config);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut handlers = HandlerRegistry::new();
        handlers.register(Bar { seen: seen.clone() }).unwrap();
        let ctx = NodeContext::new(config, sessions, handlers).unwrap();
        let (link, outbound) = SessionLink::channel("127.0.0.1:5555".parse().unwrap(), 8);
        let session = ctx.sessions.create_session(link);
        Fixture {
            ctx,
            session,
            outbound,
            seen,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Config::default())
    }

    fn data(message: Message) -> Packet {
        Packet::new(PacketType::Data, message.encode().unwrap())
    }

    fn request(id: u64, route: &str, body: &'static [u8]) -> Packet {
        data(Message::request(id, Route::Name(route.to_string()), body))
    }

    #[test]
    fn test_handshake_body_shape() {
        let body = handshake_body(Duration::from_secs(30)).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json, serde_json::json!({"code": 200, "sys": {"heartbeat": 30}}));
    }

    #[tokio::test]
    async fn test_handshake_then_ack() {
        let mut f = fixture();
        process_packet(&f.ctx, &f.session, Packet::new(PacketType::Handshake, &b"{}"[..])).await;
        assert_eq!(f.session.status(), SessionStatus::Handshaking);

        let frame = f.outbound.recv().await.unwrap();
        let mut buf = BytesMut::from(&frame[..]);
        let reply = packet::unpack(&mut buf, packet::MAX_BODY_LEN).unwrap().unwrap();
        assert_eq!(reply.kind, PacketType::Handshake);
        let json: serde_json::Value = serde_json::from_slice(&reply.body).unwrap();
        assert_eq!(json["sys"]["heartbeat"], 30);

        process_packet(&f.ctx, &f.session, Packet::new(PacketType::HandshakeAck, Bytes::new())).await;
        assert_eq!(f.session.status(), SessionStatus::Working);
    }

    #[tokio::test]
    async fn test_local_request_invokes_handler_once() {
        let f = fixture();
        process_packet(&f.ctx, &f.session, request(12, "connector.Bar.Foo", b"payload")).await;

        let seen = f.seen.lock().unwrap().clone();
        assert_eq!(seen, vec![(12, b"payload".to_vec())]);
        assert_eq!(f.session.last_request_id(), 12);
        assert_eq!(f.ctx.handlers.lookup("Bar", "Foo").unwrap().calls(), 1);
    }

    #[tokio::test]
    async fn test_notify_clears_request_id() {
        let f = fixture();
        process_packet(&f.ctx, &f.session, request(4, "connector.Bar.Foo", b"abcd")).await;
        process_packet(
            &f.ctx,
            &f.session,
            data(Message::notify(Route::Name("connector.Bar.Foo".into()), &b"efgh"[..])),
        )
        .await;
        assert_eq!(f.session.last_request_id(), 0);
        assert_eq!(f.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_method_and_service_are_dropped() {
        let f = fixture();
        process_packet(&f.ctx, &f.session, request(1, "connector.Bar.Missing", b"xxxx")).await;
        process_packet(&f.ctx, &f.session, request(2, "connector.Nope.Foo", b"xxxx")).await;
        assert!(f.seen.lock().unwrap().is_empty());

        let err = process_message(
            &f.ctx,
            &f.session,
            Message::request(3, Route::Name("connector.Bar.Missing".into()), &b"xxxx"[..]),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::NotFound(ref m) if m == "method: Missing"));
    }

    #[tokio::test]
    async fn test_malformed_inputs_are_dropped() {
        let f = fixture();
        process_packet(&f.ctx, &f.session, Packet::new(PacketType::Data, &b"\x00\x01"[..])).await;
        process_packet(&f.ctx, &f.session, request(1, "connector.Bar", b"xxxx")).await;
        process_packet(&f.ctx, &f.session, data(Message::response(1, &b"xxxx"[..]))).await;
        assert!(f.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_peer_caused_drops_log_at_debug() {
        let f = fixture();
        process_packet(&f.ctx, &f.session, request(1, "connector.Bar.Missing", b"xxxx")).await;
        process_packet(&f.ctx, &f.session, request(2, "connector.Nope.Foo", b"xxxx")).await;
        process_packet(&f.ctx, &f.session, request(3, "connector.Bar", b"xxxx")).await;
        process_packet(&f.ctx, &f.session, request(4, "connector.Bar.Boom", b"xxxx")).await;

        logs_assert(|lines: &[&str]| {
            let dropped: Vec<_> = lines.iter().filter(|l| l.contains("dropping Data packet")).collect();
            if dropped.len() != 4 {
                return Err(format!("expected 4 drop lines, got {}", dropped.len()));
            }
            if dropped[..3].iter().any(|l| !l.contains("DEBUG")) {
                return Err("routing failures should log at debug".to_string());
            }
            if !dropped[3].contains("WARN") {
                return Err("handler failure should log at warn".to_string());
            }
            Ok(())
        });
    }

    #[tokio::test]
    async fn test_push_kind_is_not_dispatched_locally() {
        let f = fixture();
        let err = process_message(
            &f.ctx,
            &f.session,
            Message::push(Route::Name("connector.Bar.Foo".into()), &b"xxxx"[..]),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(f.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_handler_panic_is_contained() {
        let f = fixture();
        process_packet(&f.ctx, &f.session, request(1, "connector.Bar.Boom", b"xxxx")).await;
        process_packet(&f.ctx, &f.session, request(2, "connector.Bar.Foo", b"next")).await;
        assert_eq!(f.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_compressed_route_resolves_through_dictionary() {
        let mut config = Config::default();
        config.routes.insert(5, "connector.Bar.Foo".to_string());
        let f = fixture_with(config);

        process_packet(&f.ctx, &f.session, data(Message::request(8, Route::Code(5), &b"zip!"[..]))).await;
        process_packet(&f.ctx, &f.session, data(Message::request(9, Route::Code(6), &b"lost"[..]))).await;
        assert_eq!(f.seen.lock().unwrap().clone(), vec![(8, b"zip!".to_vec())]);
    }

    #[tokio::test]
    async fn test_remote_route_goes_to_forwarder() {
        let mut forwarder = MockRemoteForwarder::new();
        forwarder
            .expect_forward()
            .withf(|_, route, message| {
                route.server == "area" && route.service == "Room" && &message.body[..] == b"move"
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let mut f = fixture();
        f.ctx = f.ctx.with_forwarder(Arc::new(forwarder));
        process_packet(&f.ctx, &f.session, request(3, "area.Room.Move", b"move")).await;

        assert!(f.seen.lock().unwrap().is_empty());
        // Remote dispatch does not touch local correlation state.
        assert_eq!(f.session.last_request_id(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_and_data_refresh_deadline() {
        let f = fixture();
        let start = f.session.deadline();
        tokio::time::advance(Duration::from_secs(10)).await;
        process_packet(&f.ctx, &f.session, Packet::new(PacketType::Heartbeat, Bytes::new())).await;
        let after_heartbeat = f.session.deadline();
        assert!(after_heartbeat > start);

        tokio::time::advance(Duration::from_secs(10)).await;
        process_packet(&f.ctx, &f.session, request(1, "connector.Bar.Foo", b"xxxx")).await;
        assert!(f.session.deadline() > after_heartbeat);
    }

    #[tokio::test]
    async fn test_send_after_close_is_noop() {
        let mut f = fixture();
        f.ctx.sessions.close_session(&f.session);
        process_packet(&f.ctx, &f.session, Packet::new(PacketType::Handshake, Bytes::new())).await;
        assert!(f.outbound.try_recv().is_err());
    }
}
