//! Structured stream transport: newline-delimited JSON over TCP.
//!
//! Peers write `{"sender":..,"message":..}` lines and read stamped
//! `{"sender":..,"message":..,"timestamp":..}` lines. There is no handshake;
//! a connection is a peer from accept until its read side ends.

use std::{future::Future, io, net::SocketAddr, sync::Arc};

use anyhow::Result;
use tokio::{
    io::BufReader,
    net::{TcpListener, TcpStream, tcp::OwnedWriteHalf},
    select,
};
use tracing::{debug, info, warn};

use crate::{
    hub::{BroadcastHub, Mailbox},
    message::{InboundMessage, read_message, write_message},
};

pub struct HubListener {
    listener: TcpListener,
    hub: Arc<BroadcastHub>,
}

impl HubListener {
    pub fn new(listener: TcpListener, hub: Arc<BroadcastHub>) -> Self {
        Self { listener, hub }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let HubListener { listener, hub } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("tcp listener shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &hub);
                }
            }
        }

        Ok(())
    }
}

fn handle_accept_result(
    result: io::Result<(TcpStream, SocketAddr)>,
    hub: &Arc<BroadcastHub>,
) {
    match result {
        Ok((stream, peer)) => spawn_connection_handler(stream, peer, hub),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

/// Resets from peers that were torn down mid-flight are expected.
fn is_abrupt_close(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

fn spawn_connection_handler(stream: TcpStream, peer: SocketAddr, hub: &Arc<BroadcastHub>) {
    let hub = Arc::clone(hub);
    tokio::spawn(async move {
        match handle_connection(stream, hub).await {
            Ok(()) => {}
            Err(err) if is_abrupt_close(&err) => {
                debug!(peer = %peer, error = ?err, "tcp peer went away");
            }
            Err(err) => warn!(peer = %peer, error = ?err, "tcp connection closed with error"),
        }
    });
}

async fn handle_connection(stream: TcpStream, hub: Arc<BroadcastHub>) -> io::Result<()> {
    let peer_addr = stream.peer_addr().ok();
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let (peer, mailbox) = hub.attach();
    debug!(?peer_addr, connection = peer.id(), "tcp peer connected");
    let delivery = tokio::spawn(forward_mailbox(mailbox, writer));

    // Inbound messages are published strictly in arrival order. Any exit from
    // this loop drops `peer`, which detaches the connection.
    let outcome = loop {
        match read_message::<_, InboundMessage>(&mut reader).await {
            Ok(Some(inbound)) => {
                peer.publish(inbound);
            }
            Ok(None) => break Ok(()),
            Err(err) => break Err(err),
        }
    };

    drop(peer);
    delivery.abort();
    outcome
}

async fn forward_mailbox(mut mailbox: Mailbox, mut writer: OwnedWriteHalf) {
    while let Some(message) = mailbox.recv().await {
        if let Err(err) = write_message(&mut writer, &message).await {
            debug!(?err, "failed to deliver message to tcp peer");
            break;
        }
    }
}
