//! How a virtual user reaches the hub.
//!
//! A [`HubLink`] looks the same whatever sits behind it: probes go into an
//! outbox, broadcasts come out of a [`Mailbox`]. The pump tasks that move data
//! between those queues and the hub belong to the link and are aborted when
//! it is dropped, which tears the connection down without a graceful close.

use std::{future::Future, sync::Arc};

use anyhow::{Context, Result, anyhow};
use tokio::{
    io::BufReader,
    net::TcpStream,
    sync::mpsc,
    task::JoinHandle,
};
use tracing::debug;

use crate::{
    hub::{BroadcastHub, Mailbox},
    message::{ChatMessage, InboundMessage, read_message, write_message},
};

/// Opens links to a hub. One connector is shared by every virtual user.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> impl Future<Output = Result<HubLink>> + Send;
}

pub struct HubLink {
    outbox: mpsc::UnboundedSender<InboundMessage>,
    mailbox: Mailbox,
    pumps: Vec<JoinHandle<()>>,
}

impl HubLink {
    pub fn new(
        outbox: mpsc::UnboundedSender<InboundMessage>,
        mailbox: Mailbox,
        pumps: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            outbox,
            mailbox,
            pumps,
        }
    }

    pub fn send(&self, message: InboundMessage) -> Result<()> {
        self.outbox
            .send(message)
            .map_err(|_| anyhow!("hub link closed"))
    }

    pub fn mailbox(&mut self) -> &mut Mailbox {
        &mut self.mailbox
    }
}

impl Drop for HubLink {
    fn drop(&mut self) {
        for pump in &self.pumps {
            pump.abort();
        }
    }
}

/// Connects over the TCP JSON-lines transport.
pub struct TcpConnector {
    host: String,
    port: u16,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Connector for TcpConnector {
    async fn connect(&self) -> Result<HubLink> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .with_context(|| format!("failed to connect to {}:{}", self.host, self.port))?;
        stream.set_nodelay(true)?;
        let (reader, mut writer) = stream.into_split();

        let (outbox, mut probes) = mpsc::unbounded_channel::<InboundMessage>();
        let (deliver, mailbox) = Mailbox::channel();

        let send_pump = tokio::spawn(async move {
            while let Some(probe) = probes.recv().await {
                if let Err(err) = write_message(&mut writer, &probe).await {
                    debug!(?err, "probe write failed");
                    break;
                }
            }
        });

        let recv_pump = tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            loop {
                match read_message::<_, ChatMessage>(&mut reader).await {
                    Ok(Some(message)) => {
                        if deliver.send(message).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        debug!(?err, "broadcast read failed");
                        break;
                    }
                }
            }
        });

        Ok(HubLink::new(outbox, mailbox, vec![send_pump, recv_pump]))
    }
}

/// Attaches straight to a hub in the same process.
pub struct InProcessConnector {
    hub: Arc<BroadcastHub>,
}

impl InProcessConnector {
    pub fn new(hub: Arc<BroadcastHub>) -> Self {
        Self { hub }
    }
}

impl Connector for InProcessConnector {
    async fn connect(&self) -> Result<HubLink> {
        let (peer, mailbox) = self.hub.attach();
        let (outbox, mut probes) = mpsc::unbounded_channel::<InboundMessage>();

        // The pump owns the peer, so aborting it detaches from the hub.
        let pump = tokio::spawn(async move {
            while let Some(probe) = probes.recv().await {
                peer.publish(probe);
            }
        });

        Ok(HubLink::new(outbox, mailbox, vec![pump]))
    }
}
