use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use stash_proto::protocol::{Broadcast, Frame, Message, PROTOCOL_VERSION};
use stash_proto::state::{StateManager, StoreEvent};

use crate::core::CoreHandle;

/// TCP server speaking the length-prefixed JSON protocol.  Each client gets
/// a `Hello` snapshot on connect, then a fresh `State` after every change.
pub fn start_server(
    bind_address: String,
    port: u16,
    state_manager: Arc<StateManager>,
    core: CoreHandle,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = format!("{}:{}", bind_address, port);

        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind TCP socket {}: {}", addr, e);
                return;
            }
        };

        info!("TCP server listening at {}", addr);

        let mut client_id = 0usize;
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    client_id += 1;
                    let id = client_id;
                    info!("Client {} connected from {}", id, peer);

                    // subscribe before the Hello snapshot so nothing falls between
                    let events = state_manager.subscribe();
                    let sm = state_manager.clone();
                    let core = core.clone();
                    tokio::spawn(async move {
                        handle_client(stream, sm, id, core, events).await;
                        info!("Client {} disconnected", id);
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    })
}

async fn handle_client(
    stream: TcpStream,
    state_manager: Arc<StateManager>,
    client_id: usize,
    core: CoreHandle,
    mut events: broadcast::Receiver<StoreEvent>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut tmp = [0u8; 4096];
    let mut read_buf: Vec<u8> = Vec::new();

    let hello = {
        let state = state_manager.snapshot().await;
        Broadcast::Hello {
            protocol_version: PROTOCOL_VERSION,
            rev: state.rev,
            state,
        }
    };
    if write_message(&mut write_half, hello).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            result = read_half.read(&mut tmp) => {
                match result {
                    Ok(0) => break,
                    Ok(n) => {
                        read_buf.extend_from_slice(&tmp[..n]);

                        loop {
                            let msg = match Message::next_frame(&read_buf) {
                                Frame::Incomplete => break,
                                Frame::Complete(msg, consumed) => {
                                    read_buf.drain(..consumed);
                                    msg
                                }
                                Frame::Invalid { error, consumed } => {
                                    read_buf.drain(..consumed);
                                    warn!("Client {} sent an invalid message: {}", client_id, error);
                                    let reply = Broadcast::Error {
                                        message: format!("Invalid message: {}", error),
                                    };
                                    if write_message(&mut write_half, reply).await.is_err() {
                                        return;
                                    }
                                    continue;
                                }
                                Frame::Oversized(len) => {
                                    warn!("Client {} sent a {} byte frame, closing", client_id, len);
                                    let reply = Broadcast::Error {
                                        message: format!("Frame of {} bytes exceeds limit", len),
                                    };
                                    let _ = write_message(&mut write_half, reply).await;
                                    return;
                                }
                            };
                            let Message::Command(cmd) = msg else {
                                continue;
                            };
                            debug!("Client {} sent command: {:?}", client_id, cmd);

                            // the state change itself reaches us as a StoreEvent
                            if let Err(e) = core.request(cmd).await {
                                let reply = Broadcast::Error { message: e.to_string() };
                                if write_message(&mut write_half, reply).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!("Read error from client {}: {}", client_id, e);
                        break;
                    }
                }
            }

            event = events.recv() => {
                let outgoing = match event {
                    Ok(StoreEvent::Notice(message)) => Broadcast::Notice { message },
                    Ok(StoreEvent::Log(message)) => Broadcast::Log { message },
                    Ok(_) => Broadcast::State { data: state_manager.snapshot().await },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Client {} missed {} updates, resending state", client_id, n);
                        Broadcast::State { data: state_manager.snapshot().await }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if write_message(&mut write_half, outgoing).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn write_message<W>(writer: &mut W, broadcast: Broadcast) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = Message::Broadcast(broadcast).encode()?;
    writer.write_all(&frame).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StashCore;
    use crate::sink::testing::FakeSink;
    use stash_proto::persistence::LocalStore;
    use stash_proto::playback::PlaybackSession;
    use stash_proto::protocol::Command;
    use stash_proto::state::AppState;
    use stash_proto::stations::{StationCollection, StationRecord, ANONYMOUS};
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    async fn read_broadcast(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Broadcast {
        let mut tmp = [0u8; 4096];
        loop {
            if let Ok((Message::Broadcast(b), consumed)) = Message::decode(buf) {
                buf.drain(..consumed);
                return b;
            }
            let n = stream.read(&mut tmp).await.unwrap();
            assert!(n > 0, "server closed the connection");
            buf.extend_from_slice(&tmp[..n]);
        }
    }

    /// A served client connection, with the Hello already read.
    async fn connect(dir: &TempDir) -> (TcpStream, Vec<u8>, Arc<StateManager>) {
        let sm = Arc::new(StateManager::new(AppState::new(
            StationCollection::with_stations(
                ANONYMOUS,
                vec![StationRecord::new("https://a/live", "", "")],
            ),
            PlaybackSession::default(),
        )));
        let (tx, rx) = mpsc::channel(16);
        let core = StashCore::new(
            sm.clone(),
            FakeSink::default(),
            LocalStore::new(dir.path()),
            None,
            Vec::new(),
            tx.clone(),
        );
        tokio::spawn(core.run(rx));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = CoreHandle::new(tx);
        let sm_server = sm.clone();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let events = sm_server.subscribe();
            handle_client(stream, sm_server, 1, handle, events).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = Vec::new();
        match read_broadcast(&mut client, &mut buf).await {
            Broadcast::Hello {
                protocol_version,
                rev,
                state,
            } => {
                assert_eq!(protocol_version, PROTOCOL_VERSION);
                assert_eq!(rev, 1);
                assert_eq!(state.collection.len(), 1);
            }
            other => panic!("expected hello, got {:?}", other),
        }
        (client, buf, sm)
    }

    fn raw_frame(body: &[u8]) -> Vec<u8> {
        let mut frame = (body.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(body);
        frame
    }

    #[tokio::test]
    async fn hello_then_state_and_errors() {
        let dir = TempDir::new().unwrap();
        let (mut client, mut buf, _sm) = connect(&dir).await;
        let add = Message::Command(Command::AddStation {
            station: StationRecord::new("https://b/live", "", ""),
        });
        client.write_all(&add.encode().unwrap()).await.unwrap();
        match read_broadcast(&mut client, &mut buf).await {
            Broadcast::State { data } => assert_eq!(data.collection.len(), 2),
            other => panic!("expected state, got {:?}", other),
        }

        // duplicate: a notice for everyone plus an error for this client
        client.write_all(&add.encode().unwrap()).await.unwrap();
        let mut got_error = false;
        for _ in 0..2 {
            if let Broadcast::Error { message } = read_broadcast(&mut client, &mut buf).await {
                assert_eq!(message, "A station with URL \"https://b/live\" already exists.");
                got_error = true;
            }
        }
        assert!(got_error);
    }

    #[tokio::test]
    async fn bad_frame_is_skipped_and_reported() {
        let dir = TempDir::new().unwrap();
        let (mut client, mut buf, sm) = connect(&dir).await;

        let mut bytes = raw_frame(br#"{"cmd":"NoSuchCommand"}"#);
        bytes.extend_from_slice(
            &Message::Command(Command::AddStation {
                station: StationRecord::new("https://b/live", "", ""),
            })
            .encode()
            .unwrap(),
        );
        client.write_all(&bytes).await.unwrap();

        match read_broadcast(&mut client, &mut buf).await {
            Broadcast::Error { message } => assert!(message.starts_with("Invalid message")),
            other => panic!("expected error, got {:?}", other),
        }
        match read_broadcast(&mut client, &mut buf).await {
            Broadcast::State { data } => assert_eq!(data.collection.len(), 2),
            other => panic!("expected state, got {:?}", other),
        }
        assert_eq!(sm.read(|s| s.collection.len()).await, 2);
    }

    #[tokio::test]
    async fn oversized_frame_closes_connection() {
        let dir = TempDir::new().unwrap();
        let (mut client, mut buf, _sm) = connect(&dir).await;

        client.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        match read_broadcast(&mut client, &mut buf).await {
            Broadcast::Error { message } => assert!(message.contains("exceeds limit")),
            other => panic!("expected error, got {:?}", other),
        }
        let mut tmp = [0u8; 16];
        assert_eq!(client.read(&mut tmp).await.unwrap(), 0);
    }
}
