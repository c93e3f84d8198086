//! Pipeline elements that sit between a [`crate::source::LineStream`] and a
//! consumer: the timestamp/tail/since filter clients ask for via query
//! parameters, and the Docker chunk-boundary timestamp reformatter that
//! must run upstream of everything else.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::LogError;
use crate::source::{parse_leading_timestamp, LineStream};

/// Docker injects a fresh `RFC3339Nano ` timestamp at every 16KiB chunk
/// boundary of a multiplexed stream frame, regardless of whether that
/// boundary falls on a line break. A single long line spanning several
/// chunks therefore picks up extra timestamps embedded mid-line that don't
/// belong to any line start and must be stripped before the line is usable.
pub const DOCKER_CHUNK_SIZE: usize = 16384;

/// `2024-01-01T00:00:00.000000000Z ` — RFC3339 with nanosecond precision,
/// plus the trailing space Docker always emits after it.
pub const TIMESTAMP_PREFIX_LEN: usize = 31;

/// Strips the spurious mid-line timestamps Docker injects at 16KiB chunk
/// boundaries, leaving only the one genuine leading timestamp per line.
/// Operates byte-by-byte rather than line-by-line because the artifact
/// doesn't respect line boundaries: a 50,000-byte line crossing three
/// 16KiB boundaries picks up three extra embedded timestamps that must be
/// dropped while the one real leading timestamp is kept.
pub struct DockerTimestampedLogReformatter {
    bytes_since_boundary: usize,
}

impl Default for DockerTimestampedLogReformatter {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerTimestampedLogReformatter {
    pub fn new() -> Self {
        Self { bytes_since_boundary: 0 }
    }

    /// Feeds the next chunk of raw backend bytes (as read from the docker
    /// daemon's multiplexed stream, already demultiplexed into a single
    /// stdout/stderr byte sequence) and returns the cleaned bytes.
    pub fn process(&mut self, input: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(input.len());
        let mut i = 0;
        while i < input.len() {
            // A chunk boundary beyond the very start of the stream is
            // where Docker injects its artifact timestamp; the genuine
            // leading timestamp at the start of the line is left alone.
            if self.bytes_since_boundary == 0 && i > 0 {
                if let Some(rest) = input.get(i..i + TIMESTAMP_PREFIX_LEN) {
                    if looks_like_docker_timestamp(rest) {
                        i += TIMESTAMP_PREFIX_LEN;
                        self.bytes_since_boundary = 0;
                        continue;
                    }
                }
            }

            let remaining_in_chunk = DOCKER_CHUNK_SIZE - self.bytes_since_boundary;
            let take = remaining_in_chunk.min(input.len() - i);
            out.extend_from_slice(&input[i..i + take]);
            i += take;
            self.bytes_since_boundary += take;
            if self.bytes_since_boundary >= DOCKER_CHUNK_SIZE {
                self.bytes_since_boundary = 0;
            }
        }
        out
    }
}

fn looks_like_docker_timestamp(bytes: &[u8]) -> bool {
    if bytes.len() != TIMESTAMP_PREFIX_LEN || bytes[TIMESTAMP_PREFIX_LEN - 1] != b' ' {
        return false;
    }
    let Ok(s) = std::str::from_utf8(&bytes[..TIMESTAMP_PREFIX_LEN - 1]) else {
        return false;
    };
    DateTime::parse_from_rfc3339(s).is_ok()
}

/// Line-level filtering applied to an already-split log stream: trimming
/// timestamps the caller didn't ask to see, returning only the tail N
/// lines, or only lines at/after a given instant.
#[derive(Debug, Clone, Default)]
pub struct LogFilterOptions {
    pub include_timestamps: bool,
    pub tail_lines: Option<u64>,
    pub since: Option<DateTime<Utc>>,
}

pub struct LogFilter {
    options: LogFilterOptions,
}

impl LogFilter {
    pub fn new(options: LogFilterOptions) -> Self {
        Self { options }
    }

    /// Applies the filter to a line stream whose total line count is known
    /// up front (an archive): `tail_lines` can then be implemented as a
    /// precise skip instead of a buffered ring.
    pub fn apply_with_known_total(&self, lines: LineStream, total_lines: u64) -> LineStream {
        let skip = match self.options.tail_lines {
            Some(tail) => total_lines.saturating_sub(tail),
            None => 0,
        };
        self.finish(Box::pin(lines.skip(skip as usize)))
    }

    /// Applies the filter to a line stream whose length isn't known ahead
    /// of time (a live tail): `tail_lines` is approximated with a
    /// fixed-size ring buffer that is drained once the source completes.
    /// This is a deliberate divergence from the archive path above, since a
    /// live source has no way to know in advance how many lines it will
    /// ultimately produce.
    pub fn apply_live(&self, lines: LineStream) -> LineStream {
        let since = self.options.since;
        let include_timestamps = self.options.include_timestamps;
        let mut past_threshold = since.is_none();

        let filtered = Box::pin(lines.filter_map(move |line| {
            let res = line.map(|l| apply_since_and_timestamp(l, since, include_timestamps, &mut past_threshold));
            async move { res.transpose() }
        })) as LineStream;

        match self.options.tail_lines {
            None => filtered,
            Some(tail) => Box::pin(ring_buffer_tail(filtered, tail as usize)),
        }
    }

    fn finish(&self, lines: LineStream) -> LineStream {
        let since = self.options.since;
        let include_timestamps = self.options.include_timestamps;
        let mut past_threshold = since.is_none();
        Box::pin(lines.filter_map(move |line| {
            let res = line.map(|l| apply_since_and_timestamp(l, since, include_timestamps, &mut past_threshold));
            async move { res.transpose() }
        }))
    }
}

/// `past_threshold` starts `true` when there's no `since` to enforce, and is
/// flipped permanently the first time a parsed timestamp clears it — per
/// spec.md §4.E, once a timestamp passes the threshold, timestamp parsing
/// (and the since-comparison) is disabled for the remainder of the stream.
fn apply_since_and_timestamp(
    line: String,
    since: Option<DateTime<Utc>>,
    include_timestamps: bool,
    past_threshold: &mut bool,
) -> Option<String> {
    if !*past_threshold {
        let threshold = since.expect("past_threshold starts true when since is None");
        match parse_leading_timestamp(&line) {
            // spec.md §8 invariant 9: since=T keeps only timestamps strictly
            // greater than T (S5: since=t=950 excludes the t=950 line itself).
            Some(ts) if ts <= threshold => return None,
            Some(_) => *past_threshold = true,
            None => {}
        }
    }
    if include_timestamps {
        Some(line)
    } else {
        Some(strip_timestamp(&line).to_string())
    }
}

fn strip_timestamp(line: &str) -> &str {
    match line.split_once(' ') {
        Some((ts, rest)) if DateTime::parse_from_rfc3339(ts).is_ok() => rest,
        _ => line,
    }
}

fn ring_buffer_tail(lines: LineStream, tail: usize) -> impl futures::Stream<Item = Result<String, LogError>> {
    stream::unfold((lines, None::<VecDeque<String>>), move |(mut lines, mut buf)| async move {
        loop {
            match lines.next().await {
                Some(Ok(line)) => {
                    let buf = buf.get_or_insert_with(VecDeque::new);
                    buf.push_back(line);
                    if buf.len() > tail {
                        buf.pop_front();
                    }
                }
                Some(Err(e)) => return Some((Err(e), (lines, buf))),
                None => {
                    let mut buf = buf.unwrap_or_default();
                    return match buf.pop_front() {
                        Some(line) => Some((Ok(line), (lines, Some(buf)))),
                        None => None,
                    };
                }
            }
        }
    })
}

/// Cooperative stop signal for a long-lived streaming task (the sidecar's
/// pipe forwarder, a server-side SSE handler), set from outside the task
/// that owns the stream.
#[derive(Clone)]
pub struct TerminateHandle {
    flag: Arc<AtomicBool>,
}

impl TerminateHandle {
    pub fn new() -> (Self, Terminable) {
        let flag = Arc::new(AtomicBool::new(false));
        (Self { flag: flag.clone() }, Terminable { flag })
    }

    pub fn terminate(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

pub struct Terminable {
    flag: Arc<AtomicBool>,
}

impl Terminable {
    pub fn is_terminated(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream::StreamExt;

    fn lines(v: Vec<&str>) -> LineStream {
        Box::pin(stream::iter(v.into_iter().map(|s| Ok(s.to_string()))))
    }

    #[tokio::test]
    async fn apply_with_known_total_skips_to_exact_tail() {
        let filter = LogFilter::new(LogFilterOptions { tail_lines: Some(2), ..Default::default() });
        let out: Vec<String> = filter
            .apply_with_known_total(lines(vec!["a", "b", "c", "d"]), 4)
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(out, vec!["c", "d"]);
    }

    #[tokio::test]
    async fn apply_live_ring_buffer_keeps_only_last_n() {
        let filter = LogFilter::new(LogFilterOptions { tail_lines: Some(2), ..Default::default() });
        let out: Vec<String> = filter.apply_live(lines(vec!["a", "b", "c"])).map(|r| r.unwrap()).collect().await;
        assert_eq!(out, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn strips_timestamp_by_default() {
        let filter = LogFilter::new(LogFilterOptions::default());
        let out: Vec<String> = filter
            .apply_live(lines(vec!["2024-01-01T00:00:00.000000000Z hello"]))
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(out, vec!["hello"]);
    }

    #[tokio::test]
    async fn keeps_timestamp_when_requested() {
        let filter = LogFilter::new(LogFilterOptions { include_timestamps: true, ..Default::default() });
        let out: Vec<String> = filter
            .apply_live(lines(vec!["2024-01-01T00:00:00.000000000Z hello"]))
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(out, vec!["2024-01-01T00:00:00.000000000Z hello"]);
    }

    #[tokio::test]
    async fn since_filter_drops_lines_at_or_before_threshold() {
        // spec.md §8 invariant 9: "returns only lines with timestamp > T" —
        // a line exactly at the threshold is excluded, not kept.
        let threshold: DateTime<Utc> = "2024-01-01T00:00:01.000000000Z".parse().unwrap();
        let filter = LogFilter::new(LogFilterOptions { since: Some(threshold), include_timestamps: true, ..Default::default() });
        let out: Vec<String> = filter
            .apply_live(lines(vec![
                "2024-01-01T00:00:00.000000000Z too-early",
                "2024-01-01T00:00:01.000000000Z at-threshold",
                "2024-01-01T00:00:02.000000000Z later",
            ]))
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(out, vec!["2024-01-01T00:00:02.000000000Z later"]);
    }

    #[tokio::test]
    async fn since_filter_stops_parsing_once_threshold_passed() {
        // spec.md §4.E: once a timestamp clears `since`, parsing is disabled
        // for the rest of the stream, so a later out-of-order timestamp that
        // would otherwise fail the threshold check is kept anyway.
        let threshold: DateTime<Utc> = "2024-01-01T00:00:01.000000000Z".parse().unwrap();
        let filter = LogFilter::new(LogFilterOptions { since: Some(threshold), include_timestamps: true, ..Default::default() });
        let out: Vec<String> = filter
            .apply_live(lines(vec![
                "2024-01-01T00:00:02.000000000Z later",
                "2024-01-01T00:00:00.000000000Z out-of-order-early",
            ]))
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(out, vec!["2024-01-01T00:00:02.000000000Z later", "2024-01-01T00:00:00.000000000Z out-of-order-early"]);
    }

    #[test]
    fn reformatter_strips_timestamp_injected_exactly_at_chunk_boundary() {
        let mut reformatter = DockerTimestampedLogReformatter::new();
        let line_byte = b'x';
        let first_chunk_payload = DOCKER_CHUNK_SIZE;
        let mut input = vec![line_byte; first_chunk_payload];
        let injected = b"2024-01-01T00:00:00.000000000Z ";
        assert_eq!(injected.len(), TIMESTAMP_PREFIX_LEN);
        input.extend_from_slice(injected);
        input.extend_from_slice(&vec![line_byte; 100]);

        let out = reformatter.process(&input);
        assert_eq!(out.len(), first_chunk_payload + 100);
        assert!(out.iter().all(|&b| b == line_byte));
    }

    #[test]
    fn reformatter_passes_through_short_input_untouched() {
        let mut reformatter = DockerTimestampedLogReformatter::new();
        let out = reformatter.process(b"short line\n");
        assert_eq!(out, b"short line\n");
    }
}
