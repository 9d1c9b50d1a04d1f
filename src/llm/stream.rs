use futures_util::Stream;
use tokio::sync::mpsc;

use super::RuntimeError;

const STREAM_BUFFER: usize = 100;

/// Pull-based sequence of generated text fragments.
///
/// Dropping the stream is the cancellation signal: producers notice the closed
/// channel on their next send and stop (blocking backends may still finish the
/// current generation, whose output is then discarded).
pub struct TokenStream {
    rx: mpsc::Receiver<String>,
}

impl TokenStream {
    pub fn channel() -> (mpsc::Sender<String>, TokenStream) {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        (tx, TokenStream { rx })
    }

    /// A stream that yields `text` as a single fragment.
    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        let (tx, stream) = Self::channel();
        if !text.is_empty() {
            // capacity is at least one, so this never fails on a fresh channel
            let _ = tx.try_send(text);
        }
        stream
    }

    pub async fn next(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    pub async fn collect_text(mut self) -> String {
        let mut text = String::new();
        while let Some(fragment) = self.next().await {
            text.push_str(&fragment);
        }
        text
    }

    pub fn into_stream(self) -> impl Stream<Item = String> + Send + 'static {
        futures_util::stream::unfold(self, |mut stream| async move {
            stream.next().await.map(|fragment| (fragment, stream))
        })
    }

    /// Forwards raw backend fragments, trimming the stream edges the same way a
    /// non-streamed answer is trimmed and turning errors into error text.
    pub fn forward(mut source: mpsc::Receiver<Result<String, RuntimeError>>) -> Self {
        let (tx, stream) = Self::channel();
        tokio::spawn(async move {
            let mut trimmer = EdgeTrimmer::default();
            while let Some(item) = source.recv().await {
                let fragment = match item {
                    Ok(fragment) => trimmer.push(&fragment),
                    Err(err) => {
                        tracing::warn!("Streaming generation failed: {}", err);
                        Some(format!("{}{}", trimmer.take_pending(), error_text(&err)))
                    }
                };
                if let Some(fragment) = fragment {
                    if tx.send(fragment).await.is_err() {
                        return;
                    }
                }
            }
        });
        stream
    }
}

pub fn error_text(err: &RuntimeError) -> String {
    format!("Error generating response: {}", err)
}

/// Removes leading whitespace of the whole stream and withholds whitespace
/// until a non-whitespace fragment follows it, so the concatenated output
/// equals `full_text.trim()`.
#[derive(Debug, Default)]
pub struct EdgeTrimmer {
    started: bool,
    pending: String,
}

impl EdgeTrimmer {
    pub fn push(&mut self, fragment: &str) -> Option<String> {
        let fragment = if self.started {
            fragment
        } else {
            fragment.trim_start()
        };
        if fragment.is_empty() {
            return None;
        }
        self.started = true;

        let body = fragment.trim_end();
        if body.is_empty() {
            self.pending.push_str(fragment);
            return None;
        }

        let mut out = std::mem::take(&mut self.pending);
        out.push_str(body);
        self.pending.push_str(&fragment[body.len()..]);
        Some(out)
    }

    fn take_pending(&mut self) -> String {
        std::mem::take(&mut self.pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trim_all(fragments: &[&str]) -> Vec<String> {
        let mut trimmer = EdgeTrimmer::default();
        fragments.iter().filter_map(|f| trimmer.push(f)).collect()
    }

    #[test]
    fn trimmer_matches_trimmed_concatenation() {
        let fragments = ["\n ", " La", " derivada", "  ", "\nmide", " el cambio.", " \n"];
        let joined: String = fragments.concat();
        let trimmed = trim_all(&fragments).concat();
        assert_eq!(trimmed, joined.trim());
    }

    #[test]
    fn trimmer_keeps_inner_whitespace_once() {
        let out = trim_all(&["a", " ", " ", "b"]);
        assert_eq!(out, vec!["a".to_string(), "  b".to_string()]);
    }

    #[tokio::test]
    async fn from_text_yields_single_fragment() {
        let mut stream = TokenStream::from_text("hola mundo");
        assert_eq!(stream.next().await.as_deref(), Some("hola mundo"));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn forward_converts_errors_to_text() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok(" Hola".to_string())).await.unwrap();
        tx.send(Err(RuntimeError::Generation("boom".to_string())))
            .await
            .unwrap();
        drop(tx);

        let text = TokenStream::forward(rx).collect_text().await;
        assert!(text.starts_with("Hola"));
        assert!(text.contains("Error generating response"));
    }
}
