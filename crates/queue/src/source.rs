use futures::stream::BoxStream;
use futures::StreamExt;
use reconq_core::{Resource, WatchEvent};
use tokio::sync::mpsc;

/// Raw add/modify/delete notifications for one resource type.
pub type WatchStream<R> = BoxStream<'static, anyhow::Result<WatchEvent<R>>>;

/// In-process watch source fed through a bounded channel. The stream ends once every
/// sender is dropped.
pub fn channel_source<R: Resource>(capacity: usize) -> (mpsc::Sender<WatchEvent<R>>, WatchStream<R>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|ev| (Ok(ev), rx))
    })
    .boxed();
    (tx, stream)
}
