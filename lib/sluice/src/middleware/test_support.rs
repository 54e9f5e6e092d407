//! Mock transport shared by the middleware unit tests.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use tower::Service;

use crate::{Error, Method, Request, Response, Result};

/// Scripted outcome of one transport call.
#[derive(Clone)]
pub(crate) enum Outcome {
    Status(u16),
    Fail(Error),
}

#[derive(Default)]
struct Calls {
    seen: Vec<Request<Bytes>>,
    script: VecDeque<Outcome>,
}

/// Transport recording every request; answers from its script, then from
/// its fallback. Successful bodies read `call-{n}`.
#[derive(Clone)]
pub(crate) struct MockTransport {
    calls: Arc<Mutex<Calls>>,
    fallback: Outcome,
    latency: Option<Duration>,
}

impl MockTransport {
    fn new(fallback: Outcome) -> Self {
        Self {
            calls: Arc::default(),
            fallback,
            latency: None,
        }
    }

    pub(crate) fn ok() -> Self {
        Self::new(Outcome::Status(200))
    }

    pub(crate) fn status(status: u16) -> Self {
        Self::new(Outcome::Status(status))
    }

    pub(crate) fn failing(error: Error) -> Self {
        Self::new(Outcome::Fail(error))
    }

    /// Answer the next calls with `outcomes`, in order.
    pub(crate) fn script(self, outcomes: impl IntoIterator<Item = Outcome>) -> Self {
        self.calls
            .lock()
            .expect("mock lock")
            .script
            .extend(outcomes);
        self
    }

    pub(crate) fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().expect("mock lock").seen.len()
    }

    /// `"{METHOD} {url}"` for each call, in call order.
    pub(crate) fn requests(&self) -> Vec<String> {
        self.calls
            .lock()
            .expect("mock lock")
            .seen
            .iter()
            .map(|request| format!("{} {}", request.method(), request.url()))
            .collect()
    }

    /// Paths observed by the transport, in call order.
    pub(crate) fn paths(&self) -> Vec<String> {
        self.calls
            .lock()
            .expect("mock lock")
            .seen
            .iter()
            .map(|request| request.url().path().to_string())
            .collect()
    }
}

impl Service<Request<Bytes>> for MockTransport {
    type Response = Response<Bytes>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<Bytes>) -> Self::Future {
        let (count, outcome) = {
            let mut calls = self.calls.lock().expect("mock lock");
            calls.seen.push(request);
            let outcome = calls
                .script
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone());
            (calls.seen.len(), outcome)
        };
        let latency = self.latency;

        Box::pin(async move {
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
            match outcome {
                Outcome::Status(status) => Ok(Response::new(
                    status,
                    HashMap::new(),
                    Bytes::from(format!("call-{count}")),
                )),
                Outcome::Fail(error) => Err(error),
            }
        })
    }
}

pub(crate) fn request(method: Method, path: &str) -> Request<Bytes> {
    let url = url::Url::parse("https://example.com")
        .and_then(|base| base.join(path))
        .expect("valid url");
    Request::builder(method, url).build()
}

pub(crate) fn get(path: &str) -> Request<Bytes> {
    request(Method::Get, path)
}
