//! A minimal embedded HTTP/1.1 server for tests: binds an ephemeral
//! loopback port on a dedicated I/O thread, dispatches each request to
//! an ordered list of registered handlers and answers 404 otherwise.
//! One request per connection, no keep-alive, no TLS.

mod connection;
pub mod dispatcher;
pub mod http_object;
pub mod http_status;
pub mod http_type;
pub mod request_parser;
pub mod server;
pub mod static_files;

pub use dispatcher::{Dispatcher, RequestHandler};
pub use http_object::{HttpRequest, HttpResponse};
pub use http_status::HttpStatus;
pub use http_type::Method;
pub use server::EmbeddedTestServer;
pub use static_files::StaticDir;
