use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use rocket_ws as ws;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::bus::{Bus, Subscription, keys};
use crate::db::Db;
use crate::engine::{Engine, ROOM_LOCKED_REPLY, TextGate};
use crate::models::{ChatMessage, MessageKind};
use crate::presence::Presence;

const HEARTBEAT_PERIOD: Duration = Duration::from_secs(30);

type WsSink = SplitSink<ws::stream::DuplexStream, ws::Message>;

/// Generate a connection id: `conn_<32 hex chars>`. Unique across the
/// cluster for the lifetime of the session.
pub fn generate_connection_id() -> String {
    format!("conn_{:032x}", uuid::Uuid::new_v4().as_u128())
}

/// One accepted socket. Lives exactly as long as the connection; outbound
/// writes are serialized through the send mutex around the sink half.
pub struct Session {
    pub room_id: String,
    pub user_id: String,
    pub nickname: String,
    pub connection_id: String,
    cleaned: AtomicBool,
}

impl Session {
    pub fn new(room_id: &str, user_id: &str, nickname: &str) -> Session {
        Session {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            nickname: nickname.to_string(),
            connection_id: generate_connection_id(),
            cleaned: AtomicBool::new(false),
        }
    }

    /// Echo suppression: drop a live frame iff it came from this user AND
    /// this connection. The same user on another device still receives it.
    pub fn should_forward(&self, msg: &ChatMessage) -> bool {
        !(msg.sender_id == self.user_id
            && msg.connection_id() == Some(self.connection_id.as_str()))
    }

    /// Runs at most once; the second call is a no-op.
    pub async fn cleanup(&self, presence: &Presence, db: &Db) {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = presence.unregister(self).await {
            eprintln!("⚠️  Unregister failed for {}: {e}", self.user_id);
        }
        if let Err(e) = db.set_user_activity(&self.user_id, "offline") {
            eprintln!("⚠️  Activity update failed for {}: {e}", self.user_id);
        }
    }
}

/// Supervise one accepted socket end to end: register presence, replay,
/// then drive the inbound loop while the spawned forwarder and heartbeat
/// run, all bound to one cancellation handle. Cleanup runs on every exit
/// path.
pub async fn run(
    stream: ws::stream::DuplexStream,
    session: Arc<Session>,
    db: &Db,
    bus: &Bus,
    engine: &Engine,
    presence: &Presence,
) -> ws::result::Result<()> {
    let (sink, mut source) = stream.split();
    let sink = Arc::new(Mutex::new(sink));

    // Presence is registered before the first outbound write.
    if let Err(e) = presence.register(&session).await {
        eprintln!("⚠️  Presence registration failed for {}: {e}", session.user_id);
        return close_with_error(&sink).await;
    }
    if let Err(e) = db.set_user_activity(&session.user_id, "online") {
        eprintln!("⚠️  Activity update failed for {}: {e}", session.user_id);
    }

    let subscription = match bus.subscribe(&keys::room_topic(&session.room_id)).await {
        Ok(sub) => sub,
        Err(e) => {
            eprintln!("⚠️  Subscribe failed for room {}: {e}", session.room_id);
            session.cleanup(presence, db).await;
            return close_with_error(&sink).await;
        }
    };

    // Replay runs to completion before the forwarder starts; live frames
    // published meanwhile wait in the subscription buffer, so a new
    // subscriber never sees a live frame ahead of the replayed history.
    for msg in engine.load_replay(&session.room_id, engine.replay_count()).await {
        let payload = serde_json::to_string(&msg).unwrap();
        if sink.lock().await.send(ws::Message::Text(payload)).await.is_err() {
            session.cleanup(presence, db).await;
            return Ok(());
        }
    }

    let cancel = CancellationToken::new();
    let heartbeat = tokio::spawn(heartbeat_loop(
        presence.clone(),
        session.clone(),
        cancel.clone(),
    ));
    let forwarder = tokio::spawn(outbound_loop(
        subscription,
        sink.clone(),
        session.clone(),
        cancel.clone(),
    ));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = source.next() => {
                let Some(Ok(message)) = frame else { break };
                match message {
                    ws::Message::Text(text) => {
                        if handle_text(&text, &session, db, engine, &sink).await.is_err() {
                            break;
                        }
                    }
                    ws::Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    cancel.cancel();
    let _ = heartbeat.await;
    let _ = forwarder.await;
    session.cleanup(presence, db).await;

    let _ = sink
        .lock()
        .await
        .send(ws::Message::Close(Some(ws::frame::CloseFrame {
            code: ws::frame::CloseCode::Normal,
            reason: "".into(),
        })))
        .await;
    Ok(())
}

async fn heartbeat_loop(presence: Presence, session: Arc<Session>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(HEARTBEAT_PERIOD);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = presence.heartbeat(&session).await {
                    eprintln!("⚠️  Heartbeat failed for {}: {e}", session.user_id);
                }
            }
        }
    }
}

async fn outbound_loop(
    mut subscription: Subscription,
    sink: Arc<Mutex<WsSink>>,
    session: Arc<Session>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            payload = subscription.recv() => {
                let Some(raw) = payload else {
                    cancel.cancel();
                    break;
                };
                let Ok(msg) = serde_json::from_str::<ChatMessage>(&raw) else {
                    continue;
                };
                if !session.should_forward(&msg) {
                    continue;
                }
                // Forward the raw payload so unknown metadata keys survive
                // the re-emit.
                if sink.lock().await.send(ws::Message::Text(raw)).await.is_err() {
                    cancel.cancel();
                    break;
                }
            }
        }
    }
}

/// One inbound frame: size gate, rate limit, lock gate, stamp, broadcast.
/// Returns Err only when a reply write fails, which terminates the session.
async fn handle_text(
    text: &str,
    session: &Session,
    db: &Db,
    engine: &Engine,
    sink: &Mutex<WsSink>,
) -> ws::result::Result<()> {
    let mut msg: ChatMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(_) => {
            return send_system(sink, &session.room_id, "Invalid message frame.").await;
        }
    };

    let max = engine.max_message_len();
    if msg.content.chars().count() > max {
        return send_system(
            sink,
            &session.room_id,
            format!("Message exceeds the {max} character limit."),
        )
        .await;
    }

    let decision = engine.check_rate(&session.user_id).await;
    if !decision.allowed {
        return send_system(
            sink,
            &session.room_id,
            format!(
                "Rate limit exceeded. Wait {:.1} seconds before sending again.",
                decision.wait.as_secs_f64()
            ),
        )
        .await;
    }

    match engine
        .gate_text(db, &session.room_id, &session.user_id, &session.nickname)
        .await
    {
        Ok(TextGate::Clear) => {}
        Ok(TextGate::Refused) => {
            return send_system(sink, &session.room_id, ROOM_LOCKED_REPLY).await;
        }
        Err(e) => {
            eprintln!("⚠️  Lock check failed for room {}: {e}", session.room_id);
            return Ok(());
        }
    }

    // Inbound frames are always text; the server owns every other field.
    msg.kind = MessageKind::Text;
    msg.room_id = session.room_id.clone();
    msg.sender_id = session.user_id.clone();
    msg.nickname = session.nickname.clone();
    msg.timestamp = chrono::Utc::now().to_rfc3339();
    msg.set_connection_id(&session.connection_id);

    // Publish failure drops the frame; the connection stays up.
    if let Err(e) = engine.broadcast(db, &msg).await {
        eprintln!("⚠️  Publish failed for room {}: {e}", session.room_id);
    }
    Ok(())
}

/// Private system reply on this socket only.
async fn send_system(
    sink: &Mutex<WsSink>,
    room_id: &str,
    content: impl Into<String>,
) -> ws::result::Result<()> {
    let frame = ChatMessage::system(room_id, content);
    let payload = serde_json::to_string(&frame).unwrap();
    sink.lock().await.send(ws::Message::Text(payload)).await
}

/// 1011: post-upgrade setup failed.
async fn close_with_error(sink: &Mutex<WsSink>) -> ws::result::Result<()> {
    let _ = sink
        .lock()
        .await
        .send(ws::Message::Close(Some(ws::frame::CloseFrame {
            code: ws::frame::CloseCode::Error,
            reason: "session setup failed".into(),
        })))
        .await;
    Ok(())
}
