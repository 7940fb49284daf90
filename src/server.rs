use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::{Arc, RwLock};
use std::thread;

use anyhow::{bail, Context, Result};
use tokio::net::TcpListener;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};
use url::Url;

use crate::connection::Connection;
use crate::dispatcher::{Dispatcher, RequestHandler};
use crate::http_object::{HttpRequest, HttpResponse};
use crate::static_files::StaticDir;

/// A minimal single-threaded HTTP/1.1 server for serving synthetic
/// responses to test harnesses.
///
/// All socket work and every handler invocation run on a dedicated I/O
/// thread; lifecycle calls from the controlling thread block on a
/// command/reply round-trip with that thread. Register handlers before
/// the first request arrives.
pub struct EmbeddedTestServer {
    dispatcher: Arc<RwLock<Dispatcher>>,
    io_thread: Option<IoThread>,
    retained_listener: Option<std::net::TcpListener>,
    local_addr: Option<SocketAddr>,
    base_url: Option<Url>,
}

struct IoThread {
    commands: UnboundedSender<Command>,
    join: thread::JoinHandle<()>,
}

enum Command {
    Shutdown { done: SyncSender<()> },
    StopThread { done: SyncSender<Result<std::net::TcpListener>> },
}

impl EmbeddedTestServer {
    pub fn new() -> Self {
        EmbeddedTestServer {
            dispatcher: Arc::new(RwLock::new(Dispatcher::new())),
            io_thread: None,
            retained_listener: None,
            local_addr: None,
            base_url: None,
        }
    }

    /// Spawns the I/O thread, binds a loopback ephemeral port on it and
    /// blocks until the bind completes. Fails if the server is already
    /// listening, the thread cannot start, or the bind fails; no partial
    /// listening state is left behind on failure.
    pub fn start(&mut self) -> Result<()> {
        if self.io_thread.is_some() {
            bail!("server is already listening");
        }
        if self.retained_listener.is_some() {
            bail!("thread was stopped with a retained socket; call restart_thread_and_listen");
        }
        self.spawn_io_thread(None)
    }

    /// Closes the listening socket and tears down every live connection,
    /// dropping in-flight requests without a reply. Safe to call on a
    /// server that was never started.
    pub fn shutdown(&mut self) -> Result<()> {
        self.retained_listener = None;
        let Some(io) = self.io_thread.take() else {
            self.local_addr = None;
            self.base_url = None;
            return Ok(());
        };

        let (done_tx, done_rx) = sync_channel(1);
        // A closed channel means the thread is already gone; that is as
        // shut down as it gets.
        if io.commands.send(Command::Shutdown { done: done_tx }).is_ok() {
            let _ = done_rx.recv();
        }
        io.join
            .join()
            .map_err(|_| anyhow::anyhow!("server I/O thread panicked"))?;

        self.local_addr = None;
        self.base_url = None;
        info!("test server stopped");
        Ok(())
    }

    /// Stops the I/O thread while keeping the bound listening socket for
    /// a later [`restart_thread_and_listen`](Self::restart_thread_and_listen).
    /// Live connections are still torn down; only the listen socket (and
    /// therefore the port) survives. Intended for fork/exec windows where
    /// no background thread may be running.
    pub fn stop_thread(&mut self) -> Result<()> {
        let io = self
            .io_thread
            .take()
            .context("server I/O thread is not running")?;

        let (done_tx, done_rx) = sync_channel(1);
        io.commands
            .send(Command::StopThread { done: done_tx })
            .map_err(|_| anyhow::anyhow!("server I/O thread is gone"))?;
        let listener = done_rx
            .recv()
            .context("server I/O thread exited without handing back its socket")??;
        io.join
            .join()
            .map_err(|_| anyhow::anyhow!("server I/O thread panicked"))?;

        self.retained_listener = Some(listener);
        Ok(())
    }

    /// Restarts the I/O thread and resumes accepting on the socket
    /// retained by [`stop_thread`](Self::stop_thread). The port, and so
    /// every previously resolved URL, is unchanged.
    pub fn restart_thread_and_listen(&mut self) -> Result<()> {
        if self.io_thread.is_some() {
            bail!("server is already listening");
        }
        let listener = self
            .retained_listener
            .take()
            .context("no retained socket; call stop_thread first")?;
        self.spawn_io_thread(Some(listener))
    }

    /// Appends a handler to the ordered handler list. Handlers run
    /// synchronously on the I/O thread; registration must complete
    /// before traffic starts.
    pub fn register_request_handler<F>(&self, handler: F)
    where
        F: Fn(&HttpRequest) -> Option<HttpResponse> + Send + Sync + 'static,
    {
        self.add_handler(Box::new(handler));
    }

    /// Registers a handler serving files from `directory`, with the
    /// sidecar-header and content-type behavior of [`StaticDir`].
    pub fn serve_files_from_directory(&self, directory: impl Into<PathBuf>) {
        let dir = StaticDir::new(directory);
        self.add_handler(Box::new(move |request| dir.handle(request)));
    }

    fn add_handler(&self, handler: RequestHandler) {
        self.dispatcher.write().unwrap().add(handler);
    }

    /// True iff the server is between a successful start and the next
    /// shutdown/stop_thread.
    pub fn started(&self) -> bool {
        self.io_thread.is_some()
    }

    /// The bound port. Panics if the server never bound.
    pub fn port(&self) -> u16 {
        self.local_addr.expect("server has not been started").port()
    }

    pub fn base_url(&self) -> &Url {
        self.base_url.as_ref().expect("server has not been started")
    }

    /// Resolves `relative_url` against the server's base URL. Panics if
    /// the server is not listening or `relative_url` does not start with
    /// `/`; both are caller bugs, not runtime conditions.
    pub fn get_url(&self, relative_url: &str) -> Url {
        assert!(self.started(), "server is not listening");
        assert!(
            relative_url.starts_with('/'),
            "relative URL must start with '/': {}",
            relative_url
        );
        self.base_url()
            .join(relative_url)
            .expect("relative URL did not resolve")
    }

    fn spawn_io_thread(&mut self, retained: Option<std::net::TcpListener>) -> Result<()> {
        let (cmd_tx, cmd_rx) = unbounded_channel();
        let (ready_tx, ready_rx) = sync_channel(1);
        let dispatcher = self.dispatcher.clone();

        let join = thread::Builder::new()
            .name("test-server-io".to_string())
            .spawn(move || io_thread_main(retained, dispatcher, cmd_rx, ready_tx))
            .context("failed to spawn server I/O thread")?;

        let addr = match ready_rx.recv() {
            Ok(Ok(addr)) => addr,
            Ok(Err(e)) => {
                let _ = join.join();
                return Err(e.context("failed to bind test server"));
            }
            Err(_) => {
                let _ = join.join();
                bail!("server I/O thread exited before binding");
            }
        };

        self.io_thread = Some(IoThread { commands: cmd_tx, join });
        self.local_addr = Some(addr);
        self.base_url = Some(Url::parse(&format!("http://{}/", addr))?);
        info!(%addr, "test server listening");
        Ok(())
    }
}

impl Default for EmbeddedTestServer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EmbeddedTestServer {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "shutdown during drop failed");
        }
    }
}

// ---- I/O thread internals ------------------------------------------------

type ConnectionTable = Rc<RefCell<HashMap<u64, JoinHandle<()>>>>;

enum Exit {
    Shutdown(SyncSender<()>),
    StopThread(SyncSender<Result<std::net::TcpListener>>, Result<std::net::TcpListener>),
    ChannelClosed,
}

// What broke the accept loop; the listener is recovered afterwards, once
// the select! borrow on the stream has ended.
enum LoopEvent {
    Shutdown(SyncSender<()>),
    StopThread(SyncSender<Result<std::net::TcpListener>>),
    Closed,
}

fn io_thread_main(
    retained: Option<std::net::TcpListener>,
    dispatcher: Arc<RwLock<Dispatcher>>,
    cmd_rx: UnboundedReceiver<Command>,
    ready_tx: SyncSender<Result<SocketAddr>>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            let _ = ready_tx.send(Err(e.into()));
            return;
        }
    };

    let local = tokio::task::LocalSet::new();
    let exit = local.block_on(&runtime, accept_loop(retained, dispatcher, cmd_rx, ready_tx));

    // Dropping the runtime destroys every remaining connection task, so
    // the reply below really does mean "all torn down".
    drop(local);
    drop(runtime);

    match exit {
        Exit::Shutdown(done) => {
            let _ = done.send(());
        }
        Exit::StopThread(done, listener) => {
            let _ = done.send(listener);
        }
        Exit::ChannelClosed => {}
    }
}

async fn accept_loop(
    retained: Option<std::net::TcpListener>,
    dispatcher: Arc<RwLock<Dispatcher>>,
    mut cmd_rx: UnboundedReceiver<Command>,
    ready_tx: SyncSender<Result<SocketAddr>>,
) -> Exit {
    let listener = match bind_listener(retained).await {
        Ok(listener) => listener,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return Exit::ChannelClosed;
        }
    };
    let addr = match listener.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            let _ = ready_tx.send(Err(e.into()));
            return Exit::ChannelClosed;
        }
    };
    let _ = ready_tx.send(Ok(addr));

    let mut incoming = TcpListenerStream::new(listener);
    let connections: ConnectionTable = Rc::new(RefCell::new(HashMap::new()));
    let mut next_id: u64 = 0;

    let event = loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Shutdown { done }) => break LoopEvent::Shutdown(done),
                Some(Command::StopThread { done }) => break LoopEvent::StopThread(done),
                None => break LoopEvent::Closed,
            },
            accepted = incoming.next() => match accepted {
                Some(Ok(stream)) => {
                    let id = next_id;
                    next_id += 1;
                    debug!(id, peer = ?stream.peer_addr().ok(), "accepted connection");

                    let dispatcher = dispatcher.clone();
                    let table = connections.clone();
                    let handle = tokio::task::spawn_local(async move {
                        if let Err(e) = Connection::new(stream).serve(dispatcher).await {
                            debug!(id, error = %e, "connection ended with error");
                        }
                        table.borrow_mut().remove(&id);
                    });
                    connections.borrow_mut().insert(id, handle);
                }
                Some(Err(e)) => warn!(error = %e, "accept failed"),
                None => break LoopEvent::Closed,
            },
        }
    };

    abort_connections(&connections);

    match event {
        LoopEvent::Shutdown(done) => Exit::Shutdown(done),
        LoopEvent::StopThread(done) => {
            let handed = incoming.into_inner().into_std().map_err(anyhow::Error::from);
            Exit::StopThread(done, handed)
        }
        LoopEvent::Closed => Exit::ChannelClosed,
    }
}

async fn bind_listener(retained: Option<std::net::TcpListener>) -> Result<TcpListener> {
    match retained {
        Some(listener) => {
            listener
                .set_nonblocking(true)
                .context("failed to reconfigure the retained listener")?;
            TcpListener::from_std(listener).context("failed to adopt the retained listener")
        }
        None => TcpListener::bind(("127.0.0.1", 0))
            .await
            .context("failed to bind a loopback ephemeral port"),
    }
}

fn abort_connections(connections: &ConnectionTable) {
    for (id, handle) in connections.borrow_mut().drain() {
        debug!(id, "aborting live connection");
        handle.abort();
    }
}
