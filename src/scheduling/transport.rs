//! TCP transport for the scheduling protocol.
//!
//! [`serve`] exposes a [`SchedulingService`] on a listener; [`SchedulingClient`]
//! is the processor-side implementation of [`CommandScheduling`] that talks
//! to it. Frame layout is described in [`super::protocol`].

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::processor::{Processor, ProcessorRegistration};
use super::protocol::{read_frame, write_frame, CommandRequest, CommandUpdate, RpcCall, RpcReply};
use super::service::{receiver_stream, CommandScheduling, SchedulingService};
use crate::errors::{ProtocolError, Result};
use crate::observability::sanitize_for_log;

/// A running server and the means to stop it.
pub struct ServerHandle {
    address: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ServerHandle {
    /// Bind `address` (port 0 picks a free port) and start serving.
    pub async fn bind(service: SchedulingService, address: &str) -> Result<Self> {
        let listener = TcpListener::bind(address).await?;
        let address = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(serve(service, listener, shutdown_rx));
        Ok(Self {
            address,
            shutdown_tx,
            handle,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Stop accepting connections and wait for the accept loop to end.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.handle.await;
    }
}

/// Accept loop. Runs until `shutdown_rx` signals true; each connection is
/// handled on its own task.
pub async fn serve(
    service: SchedulingService,
    listener: TcpListener,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer)) => {
                        let service = service.clone();
                        let shutdown = shutdown_rx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(service, stream, shutdown).await {
                                debug!(peer = %peer, error = %e, "Connection ended with an error");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                    }
                }
            }
        }
    }
    debug!("Scheduling server stopped");
}

async fn handle_connection(
    service: SchedulingService,
    stream: TcpStream,
    mut shutdown: watch::Receiver<bool>,
) -> std::result::Result<(), ProtocolError> {
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let Some(call) = read_frame::<_, RpcCall>(&mut reader).await? else {
        return Ok(());
    };
    debug!(method = call.method(), "RPC call");

    match call {
        RpcCall::RegisterProcessor { registration } => {
            let reply = match service.register_processor(registration).await {
                Ok(processor) => RpcReply::Processor { processor },
                Err(e) => RpcReply::Error {
                    message: e.to_string(),
                },
            };
            write_frame(&mut writer, &reply).await
        }
        RpcCall::GetCommand { id } => {
            let reply = match service.get_command(&id).await {
                Ok(request) => RpcReply::CommandRequest { request },
                Err(e) => RpcReply::Error {
                    message: e.to_string(),
                },
            };
            write_frame(&mut writer, &reply).await
        }
        RpcCall::GetCommandRequests { processor_id } => {
            let mut requests = match service.get_command_requests(&processor_id).await {
                Ok(requests) => requests,
                Err(e) => {
                    let reply = RpcReply::Error {
                        message: e.to_string(),
                    };
                    return write_frame(&mut writer, &reply).await;
                }
            };
            // Requests written to this connection that the processor has not
            // acknowledged with an update yet.
            let mut delivered: Vec<CommandRequest> = Vec::new();
            let mut discard = String::new();
            let outcome = loop {
                tokio::select! {
                    // The client sends nothing more; a read returning means
                    // it went away.
                    _ = reader.read_line(&mut discard) => break Ok(()),
                    _ = shutdown.changed() => break Ok(()),
                    next = requests.next() => match next {
                        Some(request) => {
                            service.retain_unacknowledged(&mut delivered).await;
                            delivered.push(request.clone());
                            if let Err(e) =
                                write_frame(&mut writer, &RpcReply::CommandRequest { request }).await
                            {
                                break Err(e);
                            }
                        }
                        None => break Ok(()),
                    },
                }
            };
            drop(requests);
            service.requeue_unacknowledged(&processor_id, delivered).await;
            debug!(processor = %sanitize_for_log(&processor_id), "Request stream closed");
            outcome
        }
        RpcCall::GetAndSendCommandUpdates { processor_id } => {
            let (tx, rx) = mpsc::unbounded_channel();
            let mut inbound = tokio::spawn(async move {
                loop {
                    match read_frame::<_, CommandUpdate>(&mut reader).await {
                        Ok(Some(update)) => {
                            if tx.send(update).is_err() {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "Dropping malformed update stream");
                            break;
                        }
                    }
                }
            });

            let mut outbound = match service
                .get_and_send_command_updates(&processor_id, receiver_stream(rx))
                .await
            {
                Ok(outbound) => outbound,
                Err(e) => {
                    inbound.abort();
                    let reply = RpcReply::Error {
                        message: e.to_string(),
                    };
                    return write_frame(&mut writer, &reply).await;
                }
            };
            loop {
                tokio::select! {
                    _ = &mut inbound => break,
                    _ = shutdown.changed() => break,
                    next = outbound.next() => match next {
                        Some(update) => {
                            write_frame(&mut writer, &RpcReply::CommandUpdate { update }).await?;
                        }
                        None => break,
                    },
                }
            }
            inbound.abort();
            Ok(())
        }
    }
}

/// Processor-side client of a remote scheduling service.
#[derive(Debug, Clone)]
pub struct SchedulingClient {
    address: String,
    rpc_timeout: Duration,
}

impl SchedulingClient {
    pub fn new(address: impl Into<String>, rpc_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            rpc_timeout,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn open(
        &self,
        call: &RpcCall,
    ) -> std::result::Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf), ProtocolError> {
        let connect = TcpStream::connect(&self.address);
        let stream = tokio::time::timeout(self.rpc_timeout, connect)
            .await
            .map_err(|_| ProtocolError::Timeout {
                seconds: self.rpc_timeout.as_secs(),
            })?
            .map_err(|e| ProtocolError::Connect {
                address: self.address.clone(),
                message: e.to_string(),
            })?;
        let (read_half, mut writer) = stream.into_split();
        write_frame(&mut writer, call).await?;
        Ok((BufReader::new(read_half), writer))
    }

    async fn unary(&self, call: RpcCall) -> std::result::Result<RpcReply, ProtocolError> {
        let (mut reader, _writer) = self.open(&call).await?;
        let reply = tokio::time::timeout(self.rpc_timeout, read_frame::<_, RpcReply>(&mut reader))
            .await
            .map_err(|_| ProtocolError::Timeout {
                seconds: self.rpc_timeout.as_secs(),
            })??;
        match reply {
            Some(RpcReply::Error { message }) => Err(ProtocolError::Remote(message)),
            Some(reply) => Ok(reply),
            None => Err(ProtocolError::Closed),
        }
    }
}

fn unexpected(reply: RpcReply) -> ProtocolError {
    ProtocolError::Frame(format!("unexpected reply: {reply:?}"))
}

#[async_trait]
impl CommandScheduling for SchedulingClient {
    async fn register_processor(&self, registration: ProcessorRegistration) -> Result<Processor> {
        match self
            .unary(RpcCall::RegisterProcessor { registration })
            .await?
        {
            RpcReply::Processor { processor } => Ok(processor),
            other => Err(unexpected(other).into()),
        }
    }

    async fn get_command(&self, id: &str) -> Result<CommandRequest> {
        match self.unary(RpcCall::GetCommand { id: id.to_string() }).await? {
            RpcReply::CommandRequest { request } => Ok(request),
            other => Err(unexpected(other).into()),
        }
    }

    async fn get_command_requests(
        &self,
        processor_id: &str,
    ) -> Result<BoxStream<'static, CommandRequest>> {
        let call = RpcCall::GetCommandRequests {
            processor_id: processor_id.to_string(),
        };
        // The write half stays in the stream state: dropping it would close
        // the request stream on the server side.
        let (reader, writer) = self.open(&call).await?;
        Ok(stream::unfold((reader, writer), |(mut reader, writer)| async move {
            match read_frame::<_, RpcReply>(&mut reader).await {
                Ok(Some(RpcReply::CommandRequest { request })) => Some((request, (reader, writer))),
                Ok(Some(RpcReply::Error { message })) => {
                    warn!(error = %sanitize_for_log(&message), "Request stream refused");
                    None
                }
                Ok(Some(other)) => {
                    warn!(reply = ?other, "Unexpected frame on request stream");
                    None
                }
                Ok(None) => None,
                Err(e) => {
                    warn!(error = %e, "Request stream failed");
                    None
                }
            }
        })
        .boxed())
    }

    async fn get_and_send_command_updates(
        &self,
        processor_id: &str,
        mut updates: BoxStream<'static, CommandUpdate>,
    ) -> Result<BoxStream<'static, CommandUpdate>> {
        let call = RpcCall::GetAndSendCommandUpdates {
            processor_id: processor_id.to_string(),
        };
        let (reader, mut writer) = self.open(&call).await?;
        tokio::spawn(async move {
            while let Some(update) = updates.next().await {
                if let Err(e) = write_frame(&mut writer, &update).await {
                    warn!(error = %e, "Could not send command update");
                    break;
                }
            }
        });

        Ok(stream::unfold(reader, |mut reader| async move {
            match read_frame::<_, RpcReply>(&mut reader).await {
                Ok(Some(RpcReply::CommandUpdate { update })) => Some((update, reader)),
                Ok(Some(RpcReply::Error { message })) => {
                    warn!(error = %sanitize_for_log(&message), "Update stream refused");
                    None
                }
                Ok(Some(other)) => {
                    warn!(reply = ?other, "Unexpected frame on update stream");
                    None
                }
                Ok(None) => None,
                Err(e) => {
                    warn!(error = %e, "Update stream failed");
                    None
                }
            }
        })
        .boxed())
    }
}
