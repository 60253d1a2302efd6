//! Transport tests: backoff policy and a live loopback WebSocket

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use tilespace::transport::{connection_url, ReconnectPolicy};

    #[test]
    fn default_backoff_sequence() {
        let p = ReconnectPolicy::default();
        let secs: Vec<u64> = p.schedule().iter().map(|d| d.as_secs()).collect();
        assert_eq!(secs, vec![2, 4, 8, 10, 10]);
        assert_eq!(p.next_delay(5), None);
        assert_eq!(p.next_delay(100), None);
    }

    #[test]
    fn backoff_matches_capped_doubling() {
        let p = ReconnectPolicy {
            base_delay_ms: 300,
            max_delay_ms: 5_000,
            max_attempts: 8,
        };
        for n in 0..8u32 {
            let expected = (300u64 * 2u64.pow(n)).min(5_000);
            assert_eq!(p.next_delay(n), Some(Duration::from_millis(expected)));
        }
        assert_eq!(p.next_delay(8), None);
    }

    #[test]
    fn url_for_space() {
        assert_eq!(
            connection_url("http://127.0.0.1:9000/", "s1", "abc").unwrap(),
            "ws://127.0.0.1:9000/ws/s1?token=abc"
        );
    }

    #[test]
    fn url_escapes_reserved_token_characters() {
        let url = connection_url("https://h", "s1", "k/v?x=1&y").unwrap();
        assert_eq!(url, "wss://h/ws/s1?token=k%2Fv%3Fx%3D1%26y");
        assert_eq!(url.matches('?').count(), 1);
    }
}

#[cfg(all(test, feature = "runtime"))]
mod live {
    use futures_util::{SinkExt, StreamExt};
    use std::time::Duration;
    use tilespace::{
        bus::{BusEvent, EventBus, Topic},
        protocol::Frame,
        transport::{
            LinkPhase, ReconnectPolicy, TransportConfig, TransportConnection, TransportError,
        },
    };
    use tokio::net::TcpListener;
    use tokio::sync::{mpsc, oneshot};
    use tokio_test::assert_ok;
    use tokio_tungstenite::tungstenite::Message;

    /// Forward every event on `topics` into a channel.
    fn tap(bus: &EventBus, topics: &[Topic]) -> (Vec<tilespace::Subscription>, mpsc::UnboundedReceiver<BusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subs = topics
            .iter()
            .map(|t| {
                let tx = tx.clone();
                bus.on(*t, move |ev| {
                    let _ = tx.send(ev.clone());
                })
            })
            .collect();
        (subs, rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<BusEvent>) -> BusEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for bus event")
            .expect("bus tap closed")
    }

    fn config(endpoint: String, policy: ReconnectPolicy) -> TransportConfig {
        TransportConfig {
            endpoint,
            reconnect: policy,
        }
    }

    fn fast_policy() -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay_ms: 5,
            max_delay_ms: 10,
            max_attempts: 3,
        }
    }

    /// Loopback server accepting any number of sockets. With `hang_up` each
    /// socket is closed by the server right after the handshake; otherwise
    /// it stays up until the client leaves.
    async fn serve(hang_up: bool) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    if hang_up {
                        let _ = ws.close(None).await;
                    }
                    while let Some(Ok(_)) = ws.next().await {}
                });
            }
        });
        addr
    }

    #[test]
    fn send_while_closed_is_dropped() {
        let conn = TransportConnection::new(TransportConfig::default(), EventBus::new());
        assert_eq!(conn.phase(), LinkPhase::Closed);
        assert!(!conn.send(&Frame::RequestUsers));
    }

    #[tokio::test]
    async fn round_trip_and_clean_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (seen_tx, seen_rx) = oneshot::channel();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text(
                r#"{"type":"user_left","user_id":"u7"}"#.to_string(),
            ))
            .await
            .unwrap();
            ws.send(Message::Text("not json".to_string())).await.unwrap();
            let mut seen_tx = Some(seen_tx);
            // Stay up until the client closes, so the close is client-initiated.
            while let Some(msg) = ws.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if let Some(tx) = seen_tx.take() {
                            let _ = tx.send(text);
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        });

        let bus = EventBus::new();
        let (_subs, mut rx) = tap(
            &bus,
            &[Topic::Connected, Topic::Disconnected, Topic::Message, Topic::Reconnect],
        );
        let conn = TransportConnection::new(
            config(format!("http://{}", addr), ReconnectPolicy::default()),
            bus.clone(),
        );

        assert_ok!(conn.connect("s1", "tok"));
        // Second call while opening is a no-op.
        assert_ok!(conn.connect("s1", "tok"));

        assert_eq!(
            next(&mut rx).await,
            BusEvent::Connected {
                space_id: "s1".into()
            }
        );
        assert!(conn.is_open());

        // The malformed payload is swallowed; only the valid frame arrives.
        assert_eq!(
            next(&mut rx).await,
            BusEvent::Message(Frame::UserLeft {
                user_id: "u7".into()
            })
        );

        assert!(conn.send(&Frame::RequestUsers));
        let received = tokio::time::timeout(Duration::from_secs(5), seen_rx)
            .await
            .expect("server saw no frame")
            .unwrap();
        let v: serde_json::Value = serde_json::from_str(&received).unwrap();
        assert_eq!(v["type"], "request_users");
        assert_eq!(v["v"], 1);

        conn.disconnect();
        assert_eq!(conn.phase(), LinkPhase::Closed);
        assert!(!conn.send(&Frame::RequestUsers));

        assert_eq!(
            next(&mut rx).await,
            BusEvent::Disconnected {
                space_id: "s1".into(),
                reason: "client disconnect".into()
            }
        );

        // No reconnect after a caller-initiated close.
        let extra = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
        assert!(extra.is_err(), "unexpected event {extra:?}");
        let _ = tokio::time::timeout(Duration::from_secs(5), server).await;
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        // Reserve a port, then free it so every connect is refused.
        let addr = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };

        let bus = EventBus::new();
        let (_subs, mut rx) = tap(&bus, &[Topic::Reconnect, Topic::Connected]);
        let policy = ReconnectPolicy {
            base_delay_ms: 5,
            max_delay_ms: 10,
            max_attempts: 3,
        };
        let conn = TransportConnection::new(config(format!("ws://{}", addr), policy), bus);
        assert_ok!(conn.connect("s1", "tok"));

        let mut scheduled = Vec::new();
        loop {
            match next(&mut rx).await {
                BusEvent::ReconnectScheduled { attempt, delay } => scheduled.push((attempt, delay)),
                BusEvent::ReconnectExhausted { attempts } => {
                    assert_eq!(attempts, 3);
                    break;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(
            scheduled,
            vec![
                (1, Duration::from_millis(5)),
                (2, Duration::from_millis(10)),
                (3, Duration::from_millis(10)),
            ]
        );

        // Loop has exited; give it a moment to release the slot.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(conn.phase(), LinkPhase::Closed);
        // An explicit connect is allowed again.
        assert_ok!(conn.connect("s1", "tok"));
        conn.disconnect();
    }

    #[tokio::test]
    async fn server_close_reconnects_and_resets_attempts() {
        let addr = serve(true).await;
        let bus = EventBus::new();
        let (_subs, mut rx) = tap(&bus, &[Topic::Connected, Topic::Disconnected, Topic::Reconnect]);
        let conn = TransportConnection::new(config(format!("ws://{}", addr), fast_policy()), bus);
        assert_ok!(conn.connect("s1", "tok"));

        // Two full cycles: each successful open starts the count over.
        for _ in 0..2 {
            assert_eq!(
                next(&mut rx).await,
                BusEvent::Connected {
                    space_id: "s1".into()
                }
            );
            assert!(matches!(
                next(&mut rx).await,
                BusEvent::Disconnected { space_id, .. } if space_id == "s1"
            ));
            assert_eq!(
                next(&mut rx).await,
                BusEvent::ReconnectScheduled {
                    attempt: 1,
                    delay: Duration::from_millis(5)
                }
            );
        }

        conn.disconnect();
        assert_eq!(conn.phase(), LinkPhase::Closed);
    }

    #[tokio::test]
    async fn connect_after_disconnect_opens_exactly_once() {
        let addr = serve(false).await;
        let bus = EventBus::new();
        let (_subs, mut rx) = tap(&bus, &[Topic::Connected, Topic::Disconnected, Topic::Reconnect]);
        let conn = TransportConnection::new(config(format!("ws://{}", addr), fast_policy()), bus);

        // Neither loop has run yet; the first one must not take the slot back.
        assert_ok!(conn.connect("s1", "tok"));
        conn.disconnect();
        assert_ok!(conn.connect("s1", "tok"));
        assert_eq!(conn.phase(), LinkPhase::Opening);

        assert_eq!(
            next(&mut rx).await,
            BusEvent::Connected {
                space_id: "s1".into()
            }
        );
        assert!(conn.is_open());
        let extra = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
        assert!(extra.is_err(), "unexpected event {extra:?}");

        conn.disconnect();
        assert_eq!(
            next(&mut rx).await,
            BusEvent::Disconnected {
                space_id: "s1".into(),
                reason: "client disconnect".into()
            }
        );
    }

    #[test]
    fn connect_without_runtime_fails_cleanly() {
        let conn = TransportConnection::new(TransportConfig::default(), EventBus::new());
        assert!(matches!(
            conn.connect("s1", "t"),
            Err(TransportError::NoRuntime)
        ));
        assert_eq!(conn.phase(), LinkPhase::Closed);
    }
}
