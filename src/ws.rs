// ===============================
// src/ws.rs (realtime WebSocket listener)
// ===============================
//
// Wire format, both directions: {"event": "<name>", "data": <payload>}
// Each connection gets a writer task (transport queue -> socket) and a
// reader loop (socket -> room joins / negotiation queue).
//
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::domain::{ClientEvent, ClientId, ServerEvent};
use crate::hub::NotificationHub;
use crate::metrics::FRAMES_REJECTED;
use crate::negotiation::{NegotiationAction, NegotiationCommand};

pub async fn serve(listener: TcpListener, hub: Arc<NotificationHub>, neg_tx: mpsc::Sender<NegotiationCommand>) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "realtime listener ready");
    }
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "tcp accepted");
                tokio::spawn(handle(stream, hub.clone(), neg_tx.clone()));
            }
            Err(e) => warn!(?e, "accept failed"),
        }
    }
}

async fn handle(stream: TcpStream, hub: Arc<NotificationHub>, neg_tx: mpsc::Sender<NegotiationCommand>) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(?e, "websocket handshake failed");
            return;
        }
    };
    let (mut sink, mut source) = ws.split();
    let (id, mut outbound) = hub.transport().connect();
    info!(client = id, "client connected");

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if sink.send(Message::Text(frame.to_string())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(msg) = source.next().await {
        match msg {
            Ok(Message::Text(text)) => route(&hub, id, &text, &neg_tx).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(client = id, ?e, "read error");
                break;
            }
        }
    }

    // dropping the registry sender ends the writer task
    hub.transport().disconnect(id);
    let _ = writer.await;
    info!(client = id, "client disconnected");
}

/// Handles one inbound text frame from client `id`.
pub async fn route(hub: &NotificationHub, id: ClientId, text: &str, neg_tx: &mpsc::Sender<NegotiationCommand>) {
    let event: ClientEvent = match serde_json::from_str(text) {
        Ok(ev) => ev,
        Err(e) => {
            FRAMES_REJECTED.inc();
            debug!(client = id, error = %e, "unparseable client frame");
            return;
        }
    };

    let action = match event {
        ClientEvent::JoinStore(store_id) => {
            let store_id = store_id.into_string();
            if let Some(room) = hub.transport().join(id, &store_id) {
                info!(client = id, %room, "joined store room");
                hub.to_client(id, ServerEvent::Joined { room });
            }
            return;
        }
        ClientEvent::ProposeFare(p) => NegotiationAction::Propose { rider_id: p.rider_id.into_string(), amount: p.amount },
        ClientEvent::DriverCounterOffer(c) => NegotiationAction::Counter {
            trip_id: c.trip_id.into_string(),
            driver_id: c.driver_id.into_string(),
            amount: c.amount,
        },
        ClientEvent::AcceptFare(a) => NegotiationAction::Accept { trip_id: a.trip_id.into_string() },
    };

    if neg_tx.send(NegotiationCommand { client: id, action }).await.is_err() {
        warn!(client = id, "negotiation task gone, command dropped");
    }
}
