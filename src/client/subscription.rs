use std::{
    pin::Pin,
    sync::Weak,
    task::{Context, Poll},
};

use tokio::sync::mpsc;
use tokio_stream::Stream;
use tracing::trace;

use crate::{
    client::{ClientError, SubscriptionId, context::ContextInner},
    dbr::Dbr,
};

/// Updates from one subscription.
///
/// Yields every update the server sends, including across reconnects.
/// Dropping the monitor cancels the subscription.
pub struct Monitor {
    id: SubscriptionId,
    updates: mpsc::UnboundedReceiver<Result<Dbr, ClientError>>,
    context: Weak<ContextInner>,
}

impl Monitor {
    pub(crate) fn new(
        id: SubscriptionId,
        updates: mpsc::UnboundedReceiver<Result<Dbr, ClientError>>,
        context: Weak<ContextInner>,
    ) -> Self {
        Monitor {
            id,
            updates,
            context,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Wait for the next update. `None` once the subscription is gone.
    pub async fn recv(&mut self) -> Option<Result<Dbr, ClientError>> {
        self.updates.recv().await
    }

    /// The next update, if one is already waiting
    pub fn try_recv(&mut self) -> Option<Result<Dbr, ClientError>> {
        self.updates.try_recv().ok()
    }
}

impl Stream for Monitor {
    type Item = Result<Dbr, ClientError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.updates.poll_recv(cx)
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        if let Some(context) = self.context.upgrade() {
            trace!("Monitor dropped, cancelling subscription {}", self.id);
            context.unsubscribe(self.id);
        }
    }
}
