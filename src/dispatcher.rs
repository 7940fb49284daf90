use tracing::debug;

use crate::http_object::{HttpRequest, HttpResponse};
use crate::http_status::HttpStatus;

/// A registered handler: returns `Some` to answer the request or `None`
/// to let the next handler (or the 404 default) take it.
pub type RequestHandler = Box<dyn Fn(&HttpRequest) -> Option<HttpResponse> + Send + Sync>;

/// Ordered handler registry. Handlers are tried in registration order and
/// the first one that produces a response wins.
pub struct Dispatcher {
    handlers: Vec<RequestHandler>,
}

impl Dispatcher {
    pub fn new() -> Dispatcher {
        Dispatcher { handlers: Vec::new() }
    }

    pub fn add(&mut self, handler: RequestHandler) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, request: &HttpRequest) -> HttpResponse {
        for handler in &self.handlers {
            if let Some(response) = handler(request) {
                return response;
            }
        }
        debug!(url = %request.relative_url, "no handler matched");
        HttpResponse::with_status_code(HttpStatus::NotFound)
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_type::Method;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn request(path: &str) -> HttpRequest {
        HttpRequest::new(Method::GET, path.to_string(), HashMap::new(), None)
    }

    fn respond_to(path: &'static str, body: &'static str) -> RequestHandler {
        Box::new(move |req: &HttpRequest| {
            if req.path() != path {
                return None;
            }
            let mut res = HttpResponse::new();
            res.set_content(body);
            Some(res)
        })
    }

    #[test]
    fn first_matching_handler_wins() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.add(respond_to("/a", "first"));
        dispatcher.add(respond_to("/a", "second"));
        dispatcher.add(respond_to("/b", "other"));

        let res = dispatcher.dispatch(&request("/a"));
        assert_eq!(res.get_status_code(), HttpStatus::OK);
        let wire = String::from_utf8(res.to_bytes().to_vec()).unwrap();
        assert!(wire.ends_with("first"));
    }

    #[test]
    fn later_handlers_are_not_consulted_after_a_match() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();

        let mut dispatcher = Dispatcher::new();
        dispatcher.add(respond_to("/a", "hit"));
        dispatcher.add(Box::new(move |_req| {
            counted.fetch_add(1, Ordering::SeqCst);
            None
        }));

        dispatcher.dispatch(&request("/a"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        dispatcher.dispatch(&request("/miss"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unmatched_requests_get_a_404() {
        let dispatcher = Dispatcher::new();
        let res = dispatcher.dispatch(&request("/anything"));
        assert_eq!(res.get_status_code(), HttpStatus::NotFound);
    }
}
