use std::sync::{Arc, RwLock};

use anyhow::Result;
use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::io::read_buf;
use tracing::{debug, warn};

use crate::dispatcher::Dispatcher;
use crate::request_parser;

// A connection buffering more unparsed bytes than this is dropped
// without a response.
const MAX_RECEIVE_BYTES: usize = 1 << 20;

/// One accepted socket, driven through exactly one request/response
/// cycle. Runs as a local task on the server's I/O thread.
pub(crate) struct Connection {
    stream: TcpStream,
    receive_buffer: BytesMut,
}

impl Connection {
    pub(crate) fn new(stream: TcpStream) -> Self {
        Self { stream, receive_buffer: BytesMut::with_capacity(1024) }
    }

    pub(crate) async fn serve(mut self, dispatcher: Arc<RwLock<Dispatcher>>) -> Result<()> {
        let request = loop {
            match request_parser::parse_request(&self.receive_buffer)? {
                Some(request) => break request,
                None => {
                    if self.receive_buffer.len() > MAX_RECEIVE_BYTES {
                        warn!(
                            buffered = self.receive_buffer.len(),
                            "request exceeded the receive limit, dropping connection"
                        );
                        return Ok(());
                    }
                    let read = read_buf(&mut self.stream, &mut self.receive_buffer).await?;
                    if read == 0 {
                        debug!("peer closed before a complete request arrived");
                        return Ok(());
                    }
                }
            }
        };

        debug!(method = ?request.method, url = %request.relative_url, "dispatching request");
        let response = dispatcher.read().unwrap().dispatch(&request);
        self.stream.write_all(&response.to_bytes()).await?;
        self.stream.flush().await?;
        Ok(())
    }
}
