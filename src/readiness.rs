//! Readiness detection for the chat server.
//!
//! The server announces that it is up by printing a line such as
//! `Running on local URL:  http://127.0.0.1:7860`. Every output line is run
//! through an ordered pattern set; the first terminal match flips the watch to
//! ready and yields the URL to publish. An HTTP probe can stand in for log
//! scraping when the upstream wording is not reliable.

use regex::Regex;
use std::io::{self, BufRead, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::ReadinessPattern;

const FOLLOW_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
struct CompiledPattern {
    regex: Regex,
    terminal: bool,
}

#[derive(Debug, Clone)]
pub struct ReadinessMatcher {
    patterns: Vec<CompiledPattern>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineMatch {
    /// A terminal pattern matched; carries the `url` capture when present.
    Terminal { url: Option<String> },
    Informational { pattern: String },
}

impl ReadinessMatcher {
    /// Compiles the pattern set, substituting `{port}` with the escaped port.
    pub fn compile(patterns: &[ReadinessPattern], port: u16) -> Result<Self, regex::Error> {
        let port_text = regex::escape(&port.to_string());
        let mut compiled = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            let source = pattern.pattern.replace("{port}", &port_text);
            compiled.push(CompiledPattern {
                regex: Regex::new(&source)?,
                terminal: pattern.done,
            });
        }
        Ok(Self { patterns: compiled })
    }

    pub fn has_terminal(&self) -> bool {
        self.patterns.iter().any(|p| p.terminal)
    }

    /// First terminal match wins over any informational one on the same line.
    pub fn observe(&self, line: &str) -> Option<LineMatch> {
        let mut informational = None;
        for pattern in &self.patterns {
            let Some(captures) = pattern.regex.captures(line) else {
                continue;
            };
            if pattern.terminal {
                let url = captures.name("url").map(|m| m.as_str().to_string());
                return Some(LineMatch::Terminal { url });
            }
            if informational.is_none() {
                informational = Some(LineMatch::Informational {
                    pattern: pattern.regex.as_str().to_string(),
                });
            }
        }
        informational
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOutcome {
    Ignored,
    Progress,
    Ready(String),
    /// Lines seen after readiness no longer change anything.
    AlreadyReady,
}

/// Line-by-line readiness state. Ready is sticky; it never flips back.
#[derive(Debug)]
pub struct ReadinessWatch {
    matcher: ReadinessMatcher,
    fallback_url: String,
    url_host: String,
    url: Option<String>,
    lines_seen: u64,
}

impl ReadinessWatch {
    pub fn new(matcher: ReadinessMatcher, fallback_url: String, url_host: String) -> Self {
        Self {
            matcher,
            fallback_url,
            url_host,
            url: None,
            lines_seen: 0,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.url.is_some()
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn lines_seen(&self) -> u64 {
        self.lines_seen
    }

    pub fn feed(&mut self, line: &str) -> LineOutcome {
        self.lines_seen += 1;
        if self.url.is_some() {
            return LineOutcome::AlreadyReady;
        }
        match self.matcher.observe(line) {
            Some(LineMatch::Terminal { url }) => {
                let url = url
                    .map(|captured| publishable_url(&captured, &self.url_host))
                    .unwrap_or_else(|| self.fallback_url.clone());
                self.url = Some(url.clone());
                LineOutcome::Ready(url)
            }
            Some(LineMatch::Informational { .. }) => LineOutcome::Progress,
            None => LineOutcome::Ignored,
        }
    }
}

/// Rewrites a wildcard bind address so the URL is browsable.
pub fn publishable_url(url: &str, url_host: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    trimmed.replacen("://0.0.0.0:", &format!("://{url_host}:"), 1)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Progress(String),
    Ready(String),
    Line(String),
}

/// A `Read` over a growing file: at EOF it waits for more data until stopped.
pub struct FollowReader<R> {
    inner: R,
    stop: Arc<AtomicBool>,
}

impl<R: Read> FollowReader<R> {
    pub fn new(inner: R, stop: Arc<AtomicBool>) -> Self {
        Self { inner, stop }
    }
}

impl<R: Read> Read for FollowReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let n = self.inner.read(buf)?;
            if n > 0 || buf.is_empty() {
                return Ok(n);
            }
            if self.stop.load(Ordering::SeqCst) {
                return Ok(0);
            }
            thread::sleep(FOLLOW_POLL);
        }
    }
}

/// Feeds lines from `reader` into `watch` in arrival order, reporting through `tx`.
/// Returns once the stream ends, the receiver is gone, or readiness is reached
/// and `echo` is off.
pub fn watch_stream<B: BufRead>(
    reader: B,
    mut watch: ReadinessWatch,
    echo: bool,
    tx: &Sender<WatchEvent>,
) -> ReadinessWatch {
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) if err.kind() == io::ErrorKind::InvalidData => continue,
            Err(err) => {
                tracing::warn!(error = %err, "server log read failed");
                break;
            }
        };
        let event = match watch.feed(&line) {
            LineOutcome::Ready(url) => Some(WatchEvent::Ready(url)),
            LineOutcome::Progress => Some(WatchEvent::Progress(line.clone())),
            LineOutcome::Ignored | LineOutcome::AlreadyReady => None,
        };
        if echo && tx.send(WatchEvent::Line(line)).is_err() {
            break;
        }
        if let Some(event) = event {
            let ready = matches!(event, WatchEvent::Ready(_));
            if tx.send(event).is_err() {
                break;
            }
            if ready && !echo {
                break;
            }
        }
    }
    watch
}

pub struct Watcher {
    pub events: Receiver<WatchEvent>,
    pub stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Watcher {
    pub fn spawn<R>(reader: R, watch: ReadinessWatch, echo: bool) -> Self
    where
        R: Read + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, events) = mpsc::channel();
        let follow = FollowReader::new(reader, stop.clone());
        let handle = thread::spawn(move || {
            let watch = watch_stream(io::BufReader::new(follow), watch, echo, &tx);
            tracing::debug!(
                lines = watch.lines_seen(),
                ready = watch.is_ready(),
                url = ?watch.url(),
                "server log watcher finished"
            );
        });
        Self {
            events,
            stop,
            handle,
        }
    }

    /// Stops following and passes every event still in flight to `sink`,
    /// up to the end of the log, before joining the thread.
    pub fn drain(self, mut sink: impl FnMut(WatchEvent)) {
        self.stop.store(true, Ordering::SeqCst);
        for event in self.events.iter() {
            sink(event);
        }
        let _ = self.handle.join();
    }

    /// Stops following at the next EOF and joins the thread.
    pub fn finish(self) {
        self.stop.store(true, Ordering::SeqCst);
        drop(self.events);
        let _ = self.handle.join();
    }
}

/// True when `GET http://127.0.0.1:<port><path>` answers 2xx.
pub fn probe_health(client: &reqwest::blocking::Client, port: u16, path: &str) -> bool {
    let url = format!("http://127.0.0.1:{port}{path}");
    match client.get(&url).send() {
        Ok(response) => response.status().is_success(),
        Err(err) => {
            tracing::trace!(%url, error = %err, "health probe not ready");
            false
        }
    }
}
