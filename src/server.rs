//! TCP accept loop: one task per connection, framed request/response over
//! the wire codec (C7/C12), modeled on `postgrustql::network::server::Server`.

use crate::dispatch::Dispatcher;
use crate::ids::{ClientId, ProxyConnId};
use crate::protocol::{self, Response};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

/// Hands out fresh client ids as connections arrive. A plain atomic
/// counter, not `get_last_client_id() + 1`: the manager's notion of
/// "last client id" tracks the highest id that ever owned a slot, which
/// lags behind connections that never began a transaction.
struct ClientIdGenerator(AtomicU32);

impl ClientIdGenerator {
    fn new() -> Self {
        ClientIdGenerator(AtomicU32::new(1))
    }

    fn next(&self) -> ClientId {
        ClientId::new(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

pub struct Server {
    dispatcher: Arc<Dispatcher>,
    client_ids: Arc<ClientIdGenerator>,
}

impl Server {
    #[must_use]
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Server { dispatcher, client_ids: Arc::new(ClientIdGenerator::new()) }
    }

    pub async fn start(&self, addr: SocketAddr) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(%addr, "gtmd listening");

        loop {
            let (socket, peer) = listener.accept().await?;
            tracing::info!(%peer, "accepted connection");

            let dispatcher = Arc::clone(&self.dispatcher);
            let client_id = self.client_ids.next();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(socket, dispatcher.as_ref(), client_id).await {
                    tracing::warn!(%peer, error = %e, "connection closed with error");
                }
            });
        }
    }
}

async fn handle_connection(
    mut socket: TcpStream,
    dispatcher: &Dispatcher,
    client_id: ClientId,
) -> std::io::Result<()> {
    let (mut read_half, mut write_half) = socket.split();
    let mut proxy_conn_id_seen = ProxyConnId::NONE;

    let result = loop {
        let (opcode, proxy_conn_id, request) = match protocol::read_request(&mut read_half).await {
            Ok(parsed) => parsed,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break Ok(()),
            Err(e) => break Err(e),
        };

        if let Some(pid) = proxy_conn_id {
            proxy_conn_id_seen = pid;
        }

        let response = dispatcher.handle(opcode, proxy_conn_id, client_id, request).await;

        if matches!(response, Response::NoReply) {
            continue;
        }

        if let Err(e) = protocol::write_response(&mut write_half, opcode, proxy_conn_id, &response).await {
            break Err(e);
        }
    };

    let removed = dispatcher.on_disconnect(client_id, proxy_conn_id_seen);
    if removed > 0 {
        tracing::debug!(%client_id, removed, "cleaned up transactions on disconnect");
    }

    result
}
