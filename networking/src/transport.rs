use anyhow::{anyhow, Result};
use async_trait::async_trait;
use libp2p_identity::PeerId;
use tokio::sync::{mpsc, oneshot};

use crate::types::{LesRequest, LesResponse, RequestId, SyncRequest, SyncResponse};

/// Request/response transport used by the downloader.
///
/// Abstracts the wire layer so the sync pipeline can be driven by mocks.
/// Timeouts are enforced by the caller, so an implementation may simply wait.
#[async_trait]
pub trait SyncNetwork: Send + Sync + 'static {
    async fn request(
        &self,
        peer: PeerId,
        id: RequestId,
        request: SyncRequest,
    ) -> Result<SyncResponse>;

    /// Ask the wire layer to disconnect a misbehaving peer.
    fn disconnect(&self, peer: PeerId);
}

/// Request/response transport used for on-demand retrieval.
#[async_trait]
pub trait LesNetwork: Send + Sync + 'static {
    async fn request(
        &self,
        peer: PeerId,
        id: RequestId,
        request: LesRequest,
    ) -> Result<LesResponse>;

    fn disconnect(&self, peer: PeerId);
}

#[derive(Debug)]
pub struct OutboundRequest<Req, Resp> {
    pub peer: PeerId,
    pub id: RequestId,
    pub request: Req,
    pub respond_to: oneshot::Sender<Resp>,
}

#[derive(Debug)]
pub enum OutboundCommand<Req, Resp> {
    Request(OutboundRequest<Req, Resp>),
    Disconnect(PeerId),
}

/// Transport that forwards requests over a channel to whatever task owns the
/// actual peer connections. Dropping the responder fails the request.
#[derive(Debug)]
pub struct ChannelNetwork<Req, Resp> {
    sender: mpsc::UnboundedSender<OutboundCommand<Req, Resp>>,
}

impl<Req, Resp> Clone for ChannelNetwork<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<Req: Send + 'static, Resp: Send + 'static> ChannelNetwork<Req, Resp> {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundCommand<Req, Resp>>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    async fn send_request(&self, peer: PeerId, id: RequestId, request: Req) -> Result<Resp> {
        let (respond_to, response) = oneshot::channel();
        self.sender
            .send(OutboundCommand::Request(OutboundRequest {
                peer,
                id,
                request,
                respond_to,
            }))
            .map_err(|err| anyhow!("failed to send request to network: {err}"))?;
        response
            .await
            .map_err(|_| anyhow!("request {id} to {peer} was dropped"))
    }

    fn send_disconnect(&self, peer: PeerId) {
        // The receiver only goes away on shutdown, when there is nothing left to disconnect.
        let _ = self.sender.send(OutboundCommand::Disconnect(peer));
    }
}

pub type SyncChannel = ChannelNetwork<SyncRequest, SyncResponse>;
pub type LesChannel = ChannelNetwork<LesRequest, LesResponse>;

#[async_trait]
impl SyncNetwork for SyncChannel {
    async fn request(
        &self,
        peer: PeerId,
        id: RequestId,
        request: SyncRequest,
    ) -> Result<SyncResponse> {
        self.send_request(peer, id, request).await
    }

    fn disconnect(&self, peer: PeerId) {
        self.send_disconnect(peer);
    }
}

#[async_trait]
impl LesNetwork for LesChannel {
    async fn request(
        &self,
        peer: PeerId,
        id: RequestId,
        request: LesRequest,
    ) -> Result<LesResponse> {
        self.send_request(peer, id, request).await
    }

    fn disconnect(&self, peer: PeerId) {
        self.send_disconnect(peer);
    }
}
