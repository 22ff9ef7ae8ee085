//! 持久连接端到端测试：真实 WebSocket 服务端 + 模拟认证端点

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use futures_util::{SinkExt, StreamExt};
    use oblivion::auth::{CredentialConfig, CredentialManager};
    use oblivion::gateway::{
        AgentStatus, ConnectionConfig, ConnectionManager, ConnectionState, EventEnvelope,
        WebSocketTransport,
    };
    use serde_json::{json, Value};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
    use tokio_tungstenite::tungstenite::Message;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Debug)]
    enum ServerEvent {
        Opened { authorization: Option<String>, path: String },
        Received(EventEnvelope),
        Closed,
    }

    enum Command {
        Send(Value),
        Close,
    }

    /// 接受任意次连接；每次连接的命令通道替换上一条
    struct FakeNexus {
        addr: String,
        events: mpsc::UnboundedReceiver<ServerEvent>,
        commands: Arc<Mutex<Option<mpsc::UnboundedSender<Command>>>>,
    }

    impl FakeNexus {
        async fn start() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap().to_string();
            let (event_tx, events) = mpsc::unbounded_channel();
            let commands: Arc<Mutex<Option<mpsc::UnboundedSender<Command>>>> = Arc::new(Mutex::new(None));
            let slot = commands.clone();

            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let event_tx = event_tx.clone();
                    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
                    *slot.lock().unwrap() = Some(cmd_tx);

                    tokio::spawn(async move {
                        let opened = event_tx.clone();
                        let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                            let authorization = req
                                .headers()
                                .get("authorization")
                                .and_then(|v| v.to_str().ok())
                                .map(str::to_string);
                            let _ = opened.send(ServerEvent::Opened {
                                authorization,
                                path: req.uri().path().to_string(),
                            });
                            Ok(resp)
                        };
                        let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
                            return;
                        };
                        let (mut sink, mut source) = ws.split();
                        loop {
                            tokio::select! {
                                cmd = cmd_rx.recv() => match cmd {
                                    Some(Command::Send(value)) => {
                                        if sink.send(Message::Text(value.to_string())).await.is_err() {
                                            break;
                                        }
                                    }
                                    Some(Command::Close) | None => {
                                        let _ = sink.send(Message::Close(None)).await;
                                        break;
                                    }
                                },
                                msg = source.next() => match msg {
                                    Some(Ok(Message::Text(text))) => {
                                        if let Ok(env) = serde_json::from_str::<EventEnvelope>(&text) {
                                            let _ = event_tx.send(ServerEvent::Received(env));
                                        }
                                    }
                                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                                    Some(Ok(_)) => {}
                                },
                            }
                        }
                        let _ = event_tx.send(ServerEvent::Closed);
                    });
                }
            });

            Self {
                addr,
                events,
                commands,
            }
        }

        fn url(&self) -> String {
            format!("http://{}", self.addr)
        }

        fn send(&self, event_type: &str, payload: Value) {
            let frame = json!({
                "type": event_type,
                "payload": payload,
                "timestamp": "2026-01-01T00:00:00.000Z"
            });
            let tx = self.commands.lock().unwrap().clone().expect("no open connection");
            tx.send(Command::Send(frame)).unwrap();
        }

        fn close(&self) {
            if let Some(tx) = self.commands.lock().unwrap().clone() {
                let _ = tx.send(Command::Close);
            }
        }

        async fn next(&mut self) -> ServerEvent {
            tokio::time::timeout(WAIT, self.events.recv())
                .await
                .expect("timed out waiting for server event")
                .expect("server stopped")
        }

        /// 跳过其他事件，直到收到指定类型的入站事件
        async fn expect_event(&mut self, event_type: &str) -> EventEnvelope {
            loop {
                if let ServerEvent::Received(env) = self.next().await {
                    if env.event_type == event_type {
                        return env;
                    }
                }
            }
        }

        async fn expect_open(&mut self) -> (Option<String>, String) {
            loop {
                if let ServerEvent::Opened { authorization, path } = self.next().await {
                    return (authorization, path);
                }
            }
        }
    }

    async fn auth_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "tok-ws",
                "token_type": "Bearer",
                "expires_in": 3600
            })))
            .mount(&server)
            .await;
        server
    }

    fn manager(auth: &MockServer, nexus: &FakeNexus, auto_reconnect: bool) -> ConnectionManager {
        let creds = Arc::new(
            CredentialManager::new(CredentialConfig::new(auth.uri(), "agent-1", "secret-1")).unwrap(),
        );
        let transport =
            Arc::new(WebSocketTransport::new(&nexus.url(), "/agents", Duration::from_secs(5)).unwrap());
        let config = ConnectionConfig {
            auto_reconnect,
            reconnect_base: Duration::from_millis(50),
            reconnect_jitter: Duration::ZERO,
            capabilities: vec!["code-review".into()],
            version: "9.9.9".into(),
            ..ConnectionConfig::default()
        };
        ConnectionManager::new(config, creds, transport)
    }

    async fn wait_for_state(conn: &ConnectionManager, wanted: ConnectionState) {
        let mut rx = conn.watch_state();
        tokio::time::timeout(WAIT, rx.wait_for(|s| *s == wanted))
            .await
            .expect("timed out waiting for state")
            .unwrap();
    }

    #[tokio::test]
    async fn test_handshake_ready_and_typed_events() {
        let auth = auth_server().await;
        let mut nexus = FakeNexus::start().await;
        let conn = manager(&auth, &nexus, false);

        let (task_tx, mut task_rx) = mpsc::unbounded_channel();
        conn.on_task_assigned(move |task| {
            let task_tx = task_tx.clone();
            async move {
                task_tx.send(task.title)?;
                Ok::<(), anyhow::Error>(())
            }
        });

        conn.connect().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);

        let (authorization, ws_path) = nexus.expect_open().await;
        assert_eq!(authorization.as_deref(), Some("Bearer tok-ws"));
        assert_eq!(ws_path, "/agents");

        let ready = nexus.expect_event("agent_ready").await;
        assert_eq!(ready.payload["capabilities"], json!(["code-review"]));
        assert_eq!(ready.payload["version"], "9.9.9");

        nexus.send(
            "connected",
            json!({ "message": "welcome", "agentId": "agent-42", "serverTime": "2026-01-01T00:00:00Z" }),
        );
        nexus.send("heartbeat", json!({ "ping": true, "serverTime": "2026-01-01T00:00:00Z" }));
        let pong = nexus.expect_event("heartbeat").await;
        assert_eq!(pong.payload["pong"], true);

        nexus.send(
            "task_assigned",
            json!({
                "taskId": "t-1",
                "projectMappingId": "pm-1",
                "clickupTaskId": "cu-1",
                "slackChannelId": "C1",
                "slackThreadTs": "1.0",
                "title": "Fix login",
                "assignedAt": "2026-01-01T00:00:00Z"
            }),
        );
        let title = tokio::time::timeout(WAIT, task_rx.recv()).await.unwrap().unwrap();
        assert_eq!(title, "Fix login");
        // 事件按序处理，connected 先于 task_assigned
        assert_eq!(conn.agent_id().as_deref(), Some("agent-42"));

        conn.update_status(AgentStatus::Working, Some("t-1".into()), None).unwrap();
        let status = nexus.expect_event("status_update").await;
        assert_eq!(status.payload["status"], "working");
        assert_eq!(status.payload["taskId"], "t-1");

        conn.disconnect();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(conn.emit(EventEnvelope::new("custom", json!({}))).is_err());
    }

    #[tokio::test]
    async fn test_tool_request_round_trip() {
        let auth = auth_server().await;
        let mut nexus = FakeNexus::start().await;
        let conn = manager(&auth, &nexus, false);
        conn.connect().await.unwrap();
        nexus.expect_event("agent_ready").await;

        let request = conn.request_tool("slack", "post_message", json!({ "text": "hi" }), WAIT);
        let server = async {
            let req = nexus.expect_event("tool_request").await;
            assert_eq!(req.payload["tool"], "slack");
            assert_eq!(req.payload["action"], "post_message");
            let request_id = req.payload["requestId"].as_str().unwrap().to_string();
            nexus.send(
                "tool_result",
                json!({ "requestId": request_id, "success": true, "result": { "ts": "2.0" } }),
            );
            request_id
        };
        let (result, request_id) = tokio::join!(request, server);
        let result = result.unwrap();
        assert_eq!(result.request_id, request_id);
        assert!(result.success);
        assert_eq!(result.result, Some(json!({ "ts": "2.0" })));
    }

    #[tokio::test]
    async fn test_server_close_triggers_reconnect() {
        let auth = auth_server().await;
        let mut nexus = FakeNexus::start().await;
        let conn = manager(&auth, &nexus, true);
        conn.connect().await.unwrap();
        nexus.expect_event("agent_ready").await;

        nexus.close();
        nexus.expect_open().await;
        nexus.expect_event("agent_ready").await;
        wait_for_state(&conn, ConnectionState::Connected).await;
        assert_eq!(conn.reconnect_attempts(), 0);

        conn.disconnect();
        conn.wait_until_disconnected().await;
    }

    #[tokio::test]
    async fn test_server_close_without_auto_reconnect_settles_disconnected() {
        let auth = auth_server().await;
        let mut nexus = FakeNexus::start().await;
        let conn = manager(&auth, &nexus, false);
        conn.connect().await.unwrap();
        nexus.expect_event("agent_ready").await;

        nexus.close();
        tokio::time::timeout(WAIT, conn.wait_until_disconnected())
            .await
            .unwrap();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }
}
