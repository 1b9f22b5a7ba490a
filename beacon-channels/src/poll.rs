//! Polling feeds turned into envelope streams.
//!
//! Board items and chat messages are fetched page by page after a cursor;
//! every envelope embedded in their text becomes an [`Incoming`]. The first
//! poll happens as soon as the stream is polled, later ones after the
//! configured interval.

use crate::traits::{Cursor, Incoming, IncomingStream};
use async_trait::async_trait;
use beacon_common::Result;
use beacon_core::Envelope;
use futures_util::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// One item or message from a platform feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedItem {
    pub id: String,
    pub text: String,
}

/// A platform feed readable after a cursor.
#[async_trait]
pub trait FeedSource: Send + Sync + 'static {
    /// Items newer than `cursor`.
    async fn fetch(&self, cursor: &Cursor) -> Result<Vec<FeedItem>>;
}

/// Order items oldest first when every id is numeric.
pub fn sort_by_numeric_id(items: &mut [FeedItem]) {
    if items.iter().all(|item| item.id.parse::<u64>().is_ok()) {
        items.sort_by_key(|item| item.id.parse::<u64>().unwrap_or_default());
    }
}

struct PollState {
    source: Arc<dyn FeedSource>,
    cursor: Cursor,
    interval: Duration,
    buffer: VecDeque<Incoming>,
    polled: bool,
}

impl PollState {
    async fn refill(&mut self) -> Result<()> {
        let items = self.source.fetch(&self.cursor).await?;
        for item in items {
            let cursor = Cursor::at(item.id.clone());
            for envelope in Envelope::decode_all(&item.text) {
                self.buffer.push_back(Incoming {
                    envelope,
                    source: item.id.clone(),
                    cursor: cursor.clone(),
                });
            }
            self.cursor = cursor;
        }
        Ok(())
    }
}

/// Endless stream of envelopes from `source`, starting after `cursor`.
pub fn poll_stream(source: Arc<dyn FeedSource>, cursor: Cursor, interval: Duration) -> IncomingStream {
    let state = PollState {
        source,
        cursor,
        interval,
        buffer: VecDeque::new(),
        polled: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(incoming) = state.buffer.pop_front() {
                return Some((Ok(incoming), state));
            }
            if state.polled {
                tokio::time::sleep(state.interval).await;
            }
            state.polled = true;
            if let Err(e) = state.refill().await {
                tracing::warn!(error = %e, "Feed poll failed");
                return Some((Err(e), state));
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::Kind;
    use std::sync::Mutex;

    struct Pages {
        pages: Mutex<VecDeque<Vec<FeedItem>>>,
        cursors: Mutex<Vec<Cursor>>,
    }

    #[async_trait]
    impl FeedSource for Pages {
        async fn fetch(&self, cursor: &Cursor) -> Result<Vec<FeedItem>> {
            self.cursors.lock().unwrap().push(cursor.clone());
            Ok(self.pages.lock().unwrap().pop_front().unwrap_or_default())
        }
    }

    fn item(id: &str, text: &str) -> FeedItem {
        FeedItem {
            id: id.into(),
            text: text.into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_decodes_and_advances_cursor() {
        let source = Arc::new(Pages {
            pages: Mutex::new(VecDeque::from(vec![
                vec![
                    item("1", "no envelope here"),
                    item("2", "[BEACON v1] kind=want from=alice"),
                ],
                vec![item("3", "x [BEACON v1] kind=like from=bob y [BEACON v1] kind=hello from=bob")],
            ])),
            cursors: Mutex::new(Vec::new()),
        });

        let mut stream = poll_stream(source.clone(), Cursor::start(), Duration::from_secs(30));

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.envelope.kind, Kind::Want);
        assert_eq!(first.cursor, Cursor::at("2"));

        let second = stream.next().await.unwrap().unwrap();
        let third = stream.next().await.unwrap().unwrap();
        assert_eq!(second.envelope.kind, Kind::Like);
        assert_eq!(third.envelope.kind, Kind::Hello);
        assert_eq!(third.source, "3");

        let cursors = source.cursors.lock().unwrap().clone();
        assert_eq!(cursors, vec![Cursor::start(), Cursor::at("2")]);
    }

    #[test]
    fn test_sort_numeric_ids() {
        let mut items = vec![item("10", ""), item("9", ""), item("11", "")];
        sort_by_numeric_id(&mut items);
        let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["9", "10", "11"]);
    }
}
