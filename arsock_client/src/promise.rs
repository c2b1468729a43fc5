use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use arsock_protocol::{Reply, ReplyStatus};
use tokio::sync::oneshot;

/// Producer half of a request's outcome. Consumed on resolution, so a
/// request can never be resolved twice.
#[derive(Debug)]
pub struct ReplyPromise {
    tx: oneshot::Sender<Reply>,
}

/// Consumer half of a request's outcome.
///
/// Resolves to [`ReplyStatus::TornDown`] if its promise is dropped without
/// being fulfilled.
#[derive(Debug)]
pub struct ReplyFuture {
    state: FutureState,
}

#[derive(Debug)]
enum FutureState {
    Ready(Option<Reply>),
    Waiting(oneshot::Receiver<Reply>),
}

pub fn pair() -> (ReplyPromise, ReplyFuture) {
    let (tx, rx) = oneshot::channel();
    (
        ReplyPromise { tx },
        ReplyFuture {
            state: FutureState::Waiting(rx),
        },
    )
}

impl ReplyPromise {
    pub fn fulfill(self, reply: Reply) {
        // the caller may have dropped its future; nothing to deliver to then
        let _ = self.tx.send(reply);
    }

    pub fn fail(self, status: ReplyStatus) {
        self.fulfill(Reply::failure(status));
    }
}

impl ReplyFuture {
    pub fn ready(reply: Reply) -> Self {
        ReplyFuture {
            state: FutureState::Ready(Some(reply)),
        }
    }
}

impl Future for ReplyFuture {
    type Output = Reply;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Reply> {
        match &mut self.state {
            FutureState::Ready(reply) => Poll::Ready(reply.take().unwrap_or_else(Reply::torn_down)),
            FutureState::Waiting(rx) => Pin::new(rx)
                .poll(cx)
                .map(|received| received.unwrap_or_else(|_| Reply::torn_down())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::FutureExt;

    #[test]
    fn pending_until_fulfilled() {
        let (promise, mut future) = pair();
        assert!((&mut future).now_or_never().is_none());

        promise.fulfill(Reply::success(vec![Bytes::from_static(b"ok")]));
        let reply = future.now_or_never().unwrap();
        assert!(reply.is_success());
        assert_eq!(vec![Bytes::from_static(b"ok")], reply.frames);
    }

    #[test]
    fn dropped_promise_reads_as_torn_down() {
        let (promise, future) = pair();
        drop(promise);
        assert_eq!(
            ReplyStatus::TornDown,
            future.now_or_never().unwrap().status
        );
    }

    #[test]
    fn ready_future_resolves_immediately() {
        let future = ReplyFuture::ready(Reply::host_unreachable());
        assert_eq!(
            ReplyStatus::HostUnreachable,
            future.now_or_never().unwrap().status
        );
    }

    #[tokio::test]
    async fn fulfilled_from_another_thread() {
        let (promise, future) = pair();
        std::thread::spawn(move || promise.fulfill(Reply::success(Vec::new())));
        assert!(future.await.is_success());
    }
}
