use std::sync::Arc;

use anyhow::bail;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::StackConfig;
use crate::datagram::{DatagramLayer, DatagramPort};
use crate::dispatch::Dispatcher;
use crate::network::Network;
use crate::node_addr::NodeAddr;
use crate::routing::RouteController;
use crate::socket::error::SocketError;
use crate::socket::{Socket, SocketLayer};

/// One node's protocol stack on top of a [Network]. The dispatcher feeds inbound packets to
///  routing and from there to the socket and datagram layers.
pub struct Node {
    network: Arc<dyn Network>,
    router: Arc<RouteController>,
    sockets: Arc<SocketLayer>,
    datagrams: Arc<DatagramLayer>,
    dispatcher: Arc<Dispatcher>,
}

impl Node {
    pub async fn new(config: StackConfig, network: Arc<dyn Network>) -> anyhow::Result<Node> {
        config.validate()?;
        if config.max_network_packet_size > network.max_packet_size() {
            bail!("configured packet size {} exceeds the network's maximum packet size {}", config.max_network_packet_size, network.max_packet_size());
        }
        let config = Arc::new(config);

        let router = Arc::new(RouteController::new(config.clone(), network.clone()));
        let sockets = Arc::new(SocketLayer::new(config.clone(), router.clone()));
        let datagrams = Arc::new(DatagramLayer::new(&config, router.clone()));

        let dispatcher = Arc::new(Dispatcher::new(router.clone()));
        dispatcher.register(sockets.clone()).await?;
        dispatcher.register(datagrams.clone()).await?;

        Ok(Node {
            network,
            router,
            sockets,
            datagrams,
            dispatcher,
        })
    }

    pub fn addr(&self) -> NodeAddr {
        self.router.myself()
    }

    pub fn router(&self) -> &RouteController {
        &self.router
    }

    pub fn sockets(&self) -> &SocketLayer {
        &self.sockets
    }

    pub fn datagrams(&self) -> &DatagramLayer {
        &self.datagrams
    }

    /// Starts processing inbound packets. Nothing is received before this is called.
    pub fn spawn_recv_loop(&self) -> JoinHandle<anyhow::Result<()>> {
        let network = self.network.clone();
        let dispatcher = self.dispatcher.clone();
        let addr = self.addr();
        tokio::spawn(async move {
            let result = network.recv_loop(dispatcher).await;
            match &result {
                Ok(()) => info!("receive loop for {} terminated", addr),
                Err(e) => error!("receive loop for {} failed: {}", addr, e),
            }
            result
        })
    }

    pub fn shutdown(&self) {
        self.network.cancel_recv_loop();
    }

    pub async fn listen(&self, port: u16) -> Result<Socket, SocketError> {
        self.sockets.listen(port).await
    }

    pub async fn connect(&self, addr: NodeAddr, port: u16) -> Result<Socket, SocketError> {
        self.sockets.connect(addr, port).await
    }

    pub fn bind_datagram(&self, port: u16) -> Result<DatagramPort, SocketError> {
        self.datagrams.bind(port)
    }
}
