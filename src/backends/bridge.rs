//! Push-to-pull bridge between subprocess callbacks and a chunk consumer.
//!
//! The producer side (stdout reader, exit monitor, cancellation) pushes
//! canonical chunks; the single consumer pulls them in order with `next()`.
//! State is per request and never shared between turns.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::stream;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::types::{ChatChunk, ChunkStream};

#[derive(Default)]
struct BridgeState {
    queue: VecDeque<ChatChunk>,
    /// A `Done` or `Error` has been enqueued; later pushes are dropped.
    terminal: bool,
    /// No more chunks will ever be enqueued.
    finished: bool,
}

/// Ordered buffer of completed chunks plus a single waiter slot.
#[derive(Clone, Default)]
pub struct OutputBridge {
    state: Arc<Mutex<BridgeState>>,
    wake: Arc<Notify>,
}

impl OutputBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a chunk. Returns false if the sequence already terminated or ended.
    pub fn push(&self, chunk: ChatChunk) -> bool {
        {
            let mut state = self.state.lock();
            if state.terminal || state.finished {
                return false;
            }
            if chunk.is_terminal() {
                state.terminal = true;
            }
            state.queue.push_back(chunk);
        }
        self.wake.notify_one();
        true
    }

    /// Signals end of sequence. Buffered chunks are still delivered.
    pub fn finish(&self) {
        self.state.lock().finished = true;
        self.wake.notify_one();
    }

    /// Cancellation path: end immediately, with no synthetic error.
    pub fn close(&self) {
        self.finish();
    }

    /// Records the process exit. A non-zero exit that did not come from
    /// cancellation becomes an `Error` chunk unless the protocol already
    /// produced a terminal chunk. A clean exit with no result summary still
    /// terminates the sequence with `Done`.
    pub fn exit(&self, code: Option<i32>, cancelled: bool) {
        if !cancelled && !self.has_terminal() {
            match code {
                Some(0) => {
                    self.push(ChatChunk::done(None, None));
                }
                Some(code) => {
                    self.push(ChatChunk::error(format!("Process exited with code {}", code)));
                }
                None => {
                    self.push(ChatChunk::error("Process terminated by signal"));
                }
            }
        }
        self.finish();
    }

    pub fn has_terminal(&self) -> bool {
        self.state.lock().terminal
    }

    /// Pulls the next chunk, waiting if the buffer is empty. `None` means end of sequence.
    pub async fn next(&self) -> Option<ChatChunk> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(chunk) = state.queue.pop_front() {
                    return Some(chunk);
                }
                if state.finished {
                    return None;
                }
            }
            self.wake.notified().await;
        }
    }

    /// Consumer view of the bridge as a stream.
    pub fn into_stream(self) -> ChunkStream {
        Box::pin(stream::unfold(self, |bridge| async move {
            let chunk = bridge.next().await?;
            Some((chunk, bridge))
        }))
    }
}

/// Splits a byte stream into `\n`-terminated lines, retaining the trailing partial segment.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes and returns every completed line, without its terminator.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let rest = self.pending.split_off(pos + 1);
            let mut line = std::mem::replace(&mut self.pending, rest);
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Remainder left after the process exits, if it is not blank.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        let line = String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string();
        if line.trim().is_empty() {
            None
        } else {
            Some(line)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    #[tokio::test]
    async fn buffered_chunks_are_returned_in_order() {
        let bridge = OutputBridge::new();
        bridge.push(ChatChunk::content("a"));
        bridge.push(ChatChunk::content("b"));
        bridge.push(ChatChunk::done(None, None));
        bridge.finish();

        assert_eq!(bridge.next().await, Some(ChatChunk::content("a")));
        assert_eq!(bridge.next().await, Some(ChatChunk::content("b")));
        assert_eq!(bridge.next().await, Some(ChatChunk::done(None, None)));
        assert_eq!(bridge.next().await, None);
    }

    #[tokio::test]
    async fn waiting_consumer_is_woken_by_producer() {
        let bridge = OutputBridge::new();
        let consumer = bridge.clone();
        let handle = tokio::spawn(async move { consumer.next().await });

        tokio::task::yield_now().await;
        bridge.push(ChatChunk::content("late"));

        let got = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, Some(ChatChunk::content("late")));
    }

    #[tokio::test]
    async fn nothing_is_enqueued_after_terminal_chunk() {
        let bridge = OutputBridge::new();
        assert!(bridge.push(ChatChunk::error("first")));
        assert!(!bridge.push(ChatChunk::content("ignored")));
        assert!(!bridge.push(ChatChunk::done(None, None)));
        bridge.finish();

        let all: Vec<_> = bridge.into_stream().collect().await;
        assert_eq!(all, vec![ChatChunk::error("first")]);
    }

    #[tokio::test]
    async fn non_zero_exit_becomes_error_chunk() {
        let bridge = OutputBridge::new();
        bridge.push(ChatChunk::content("partial"));
        bridge.exit(Some(3), false);

        let all: Vec<_> = bridge.into_stream().collect().await;
        assert_eq!(all.len(), 2);
        match &all[1] {
            ChatChunk::Error { message } => assert!(message.contains("code 3")),
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn exit_after_terminal_chunk_is_ignored() {
        let bridge = OutputBridge::new();
        bridge.push(ChatChunk::done(None, None));
        bridge.exit(Some(1), false);

        let all: Vec<_> = bridge.into_stream().collect().await;
        assert_eq!(all, vec![ChatChunk::done(None, None)]);
    }

    #[tokio::test]
    async fn clean_exit_without_result_still_terminates() {
        let bridge = OutputBridge::new();
        bridge.push(ChatChunk::content("text"));
        bridge.exit(Some(0), false);

        let all: Vec<_> = bridge.into_stream().collect().await;
        assert_eq!(all, vec![ChatChunk::content("text"), ChatChunk::done(None, None)]);
    }

    #[tokio::test]
    async fn cancelled_exit_ends_without_error() {
        let bridge = OutputBridge::new();
        bridge.push(ChatChunk::content("one"));
        bridge.exit(Some(137), true);

        let all: Vec<_> = bridge.into_stream().collect().await;
        assert_eq!(all, vec![ChatChunk::content("one")]);
    }

    #[tokio::test]
    async fn close_drops_later_pushes() {
        let bridge = OutputBridge::new();
        bridge.close();
        assert!(!bridge.push(ChatChunk::content("x")));
        assert_eq!(bridge.next().await, None);
    }

    #[tokio::test]
    async fn separate_bridges_do_not_share_state() {
        let a = OutputBridge::new();
        let b = OutputBridge::new();
        a.push(ChatChunk::content("a"));
        b.push(ChatChunk::content("b"));
        a.finish();
        b.finish();
        assert_eq!(a.next().await, Some(ChatChunk::content("a")));
        assert_eq!(a.next().await, None);
        assert_eq!(b.next().await, Some(ChatChunk::content("b")));
    }

    #[test]
    fn line_buffer_retains_partial_segment() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(b"{\"a\":").is_empty());
        assert_eq!(buf.push(b"1}\n{\"b\""), vec!["{\"a\":1}".to_string()]);
        assert_eq!(buf.push(b":2}\r\n\n"), vec!["{\"b\":2}".to_string(), String::new()]);
        assert_eq!(buf.finish(), None);
    }

    #[test]
    fn line_buffer_flushes_remainder_on_finish() {
        let mut buf = LineBuffer::new();
        buf.push(b"{\"type\":\"result\"}");
        assert_eq!(buf.finish().as_deref(), Some("{\"type\":\"result\"}"));
        assert_eq!(buf.finish(), None);
    }

    #[test]
    fn line_buffer_keeps_multibyte_chars_split_across_pushes() {
        let mut buf = LineBuffer::new();
        let text = "héllo\n".as_bytes();
        buf.push(&text[..2]);
        assert_eq!(buf.push(&text[2..]), vec!["héllo".to_string()]);
    }
}
