use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;

use crate::coordinator::master::{Master, Outbound};
use crate::coordinator::protocol::{self, WorkerMessage};
use crate::error::Result;
use crate::registry::Registry;

type ConnId = u64;

enum Event {
    Inbound { conn: ConnId, message: WorkerMessage },
    Closed { conn: ConnId },
}

struct Connection {
    peer: SocketAddr,
    hostname: Option<String>,
    outbox: mpsc::Sender<String>,
    cancel: CancellationToken,
}

/// Routes master output to the connection each dispatcher is bound to. A
/// dispatcher is bound by its HELLO; a newer connection for the same hostname
/// replaces the older one.
#[derive(Default)]
struct Router {
    connections: HashMap<ConnId, Connection>,
    routes: HashMap<String, ConnId>,
}

impl Router {
    fn bind(&mut self, conn: ConnId, hostname: &str) {
        if let Some(previous) = self.routes.insert(hostname.to_string(), conn) {
            if previous != conn {
                tracing::info!(worker = %hostname, "Dispatcher reconnected, dropping previous connection");
                self.close(previous);
            }
        }
        if let Some(connection) = self.connections.get_mut(&conn) {
            connection.hostname = Some(hostname.to_string());
        }
    }

    /// Only an accepted handshake takes over the hostname's route. A refused
    /// one closes its own connection and leaves the bound one alone.
    fn handshake(&mut self, conn: ConnId, hostname: &str, outbound: Vec<Outbound>) {
        if outbound.iter().any(|o| matches!(o, Outbound::Refuse { .. })) {
            tracing::warn!(worker = %hostname, conn, "Handshake refused, closing connection");
            self.close(conn);
            return;
        }
        self.bind(conn, hostname);
        self.deliver(outbound);
    }

    fn close(&mut self, conn: ConnId) {
        if let Some(connection) = self.connections.remove(&conn) {
            connection.cancel.cancel();
            if let Some(hostname) = connection.hostname {
                if self.routes.get(&hostname) == Some(&conn) {
                    self.routes.remove(&hostname);
                }
            }
            tracing::debug!(peer = %connection.peer, "Connection closed");
        }
    }

    fn deliver(&mut self, outbound: Vec<Outbound>) {
        for item in outbound {
            match item {
                Outbound::Send { hostname, message } => {
                    let Some(connection) = self
                        .routes
                        .get(&hostname)
                        .and_then(|conn| self.connections.get(conn))
                    else {
                        tracing::debug!(worker = %hostname, action = message.name(), "No connection, dropping message");
                        continue;
                    };
                    let line = match protocol::encode(&message) {
                        Ok(line) => line,
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to encode message");
                            continue;
                        }
                    };
                    if connection.outbox.try_send(line).is_err() {
                        tracing::warn!(worker = %hostname, action = message.name(), "Outbox full, message dropped");
                    }
                }
                Outbound::Refuse { hostname, .. } => {
                    if let Some(conn) = self.routes.get(&hostname).copied() {
                        self.close(conn);
                    }
                }
            }
        }
    }
}

/// Serve dispatchers on `listener` until `shutdown` fires.
///
/// Every connection gets a reader and a writer task; all protocol handling
/// happens on this task, one message at a time, together with the scheduling
/// and dispatcher-check timers.
pub async fn serve<R: Registry>(
    listener: TcpListener,
    mut master: Master<R>,
    shutdown: CancellationToken,
) -> Result<()> {
    let max_frame_len = master.config().max_frame_len;
    let mut schedule_interval = tokio::time::interval(master.config().schedule_interval());
    let mut check_interval = tokio::time::interval(master.config().ping_interval());
    let (events_tx, mut events_rx) = mpsc::channel::<Event>(1024);

    let mut router = Router::default();
    let mut next_conn: ConnId = 0;

    tracing::info!(addr = %listener.local_addr()?, "Master listening");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("Master shutting down");
                break;
            }

            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept connection");
                        continue;
                    }
                };
                next_conn += 1;
                let conn = next_conn;
                let (read_half, write_half) = stream.into_split();
                let (outbox, inbox) = mpsc::channel(256);
                let cancel = shutdown.child_token();
                tokio::spawn(read_loop(conn, read_half, max_frame_len, events_tx.clone(), cancel.clone()));
                tokio::spawn(write_loop(write_half, inbox, cancel.clone()));
                router.connections.insert(conn, Connection { peer, hostname: None, outbox, cancel });
                tracing::debug!(%peer, conn, "Connection accepted");
            }

            Some(event) = events_rx.recv() => match event {
                Event::Inbound { conn, message } => {
                    let handshake = matches!(message, WorkerMessage::Hello { .. } | WorkerMessage::HelloRetry { .. });
                    let hostname = match &message {
                        WorkerMessage::Hello { hostname, .. } | WorkerMessage::HelloRetry { hostname, .. } => {
                            Some(hostname.clone())
                        }
                        _ => router.connections.get(&conn).and_then(|c| c.hostname.clone()),
                    };
                    let Some(hostname) = hostname else {
                        tracing::warn!(conn, action = message.name(), "Message before HELLO, ignoring");
                        continue;
                    };
                    match master.handle(&hostname, message, Instant::now()) {
                        Ok(outbound) if handshake => router.handshake(conn, &hostname, outbound),
                        Ok(outbound) => router.deliver(outbound),
                        Err(e) => tracing::error!(worker = %hostname, error = %e, "Failed to handle message"),
                    }
                }
                Event::Closed { conn } => router.close(conn),
            },

            _ = schedule_interval.tick() => {
                match master.schedule_tick(Utc::now()) {
                    Ok((_, outbound)) => router.deliver(outbound),
                    Err(e) => tracing::error!(error = %e, "Scheduling tick failed"),
                }
            }

            _ = check_interval.tick() => {
                if let Err(e) = master.check_dispatchers(Instant::now()) {
                    tracing::error!(error = %e, "Dispatcher check failed");
                }
            }
        }
    }

    let open: Vec<ConnId> = router.connections.keys().copied().collect();
    for conn in open {
        router.close(conn);
    }
    Ok(())
}

async fn read_loop(
    conn: ConnId,
    read_half: OwnedReadHalf,
    max_frame_len: usize,
    events: mpsc::Sender<Event>,
    cancel: CancellationToken,
) {
    let mut frames = FramedRead::new(read_half, LinesCodec::new_with_max_length(max_frame_len));
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frames.next() => frame,
        };
        match frame {
            Some(Ok(line)) if line.trim().is_empty() => continue,
            Some(Ok(line)) => match protocol::decode::<WorkerMessage>(&line) {
                Ok(message) => {
                    if events.send(Event::Inbound { conn, message }).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!(conn, error = %e, "Invalid message"),
            },
            Some(Err(e)) => {
                tracing::warn!(conn, error = %e, "Read failed");
                break;
            }
            None => break,
        }
    }
    let _ = events.send(Event::Closed { conn }).await;
}

async fn write_loop(mut write_half: OwnedWriteHalf, mut inbox: mpsc::Receiver<String>, cancel: CancellationToken) {
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = inbox.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };
        if let Err(e) = write_half.write_all(format!("{}\n", line).as_bytes()).await {
            tracing::warn!(error = %e, "Write failed");
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::protocol::MasterMessage;

    fn connect(router: &mut Router, conn: ConnId) -> (mpsc::Receiver<String>, CancellationToken) {
        let (outbox, inbox) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        router.connections.insert(
            conn,
            Connection {
                peer: SocketAddr::from(([127, 0, 0, 1], 4000 + conn as u16)),
                hostname: None,
                outbox,
                cancel: cancel.clone(),
            },
        );
        (inbox, cancel)
    }

    fn hello_ok(hostname: &str) -> Vec<Outbound> {
        vec![Outbound::Send {
            hostname: hostname.to_string(),
            message: MasterMessage::HelloOk,
        }]
    }

    #[test]
    fn accepted_handshake_replaces_previous_connection() {
        let mut router = Router::default();
        let (_old_inbox, old_cancel) = connect(&mut router, 1);
        router.handshake(1, "w1", hello_ok("w1"));
        let (mut new_inbox, _) = connect(&mut router, 2);
        router.handshake(2, "w1", hello_ok("w1"));

        assert!(old_cancel.is_cancelled());
        assert_eq!(router.routes.get("w1"), Some(&2));
        assert!(new_inbox.try_recv().unwrap().contains("HELLO_OK"));
    }

    #[test]
    fn refused_handshake_keeps_bound_connection() {
        let mut router = Router::default();
        let (mut inbox, cancel) = connect(&mut router, 1);
        router.handshake(1, "w1", hello_ok("w1"));
        assert!(inbox.try_recv().is_ok());

        let (_, stray_cancel) = connect(&mut router, 2);
        let refused = vec![Outbound::Refuse {
            hostname: "w1".to_string(),
            reason: "protocol v2 while master is using v3".to_string(),
        }];
        router.handshake(2, "w1", refused);

        assert!(stray_cancel.is_cancelled());
        assert!(!router.connections.contains_key(&2));
        assert!(!cancel.is_cancelled());
        assert_eq!(router.routes.get("w1"), Some(&1));

        router.deliver(vec![Outbound::Send {
            hostname: "w1".to_string(),
            message: MasterMessage::Pong { interval_ms: 100 },
        }]);
        assert!(inbox.try_recv().unwrap().contains("PONG"));
    }
}
