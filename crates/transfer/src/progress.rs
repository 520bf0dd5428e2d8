use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Window used by [`Throughput::recent_rate`].
const RECENT_WINDOW: Duration = Duration::from_secs(10);

/// Upload throughput of one file.
///
/// Chunks finish out of order and from many workers, so every completed
/// chunk is recorded as a single sample.
pub struct Throughput {
    inner: Mutex<Inner>,
}

struct Inner {
    started_at: Instant,
    bytes: u64,
    recent: VecDeque<(Instant, u64)>,
}

impl Default for Throughput {
    fn default() -> Self {
        Self::new()
    }
}

impl Throughput {
    /// Starts measuring now.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                started_at: Instant::now(),
                bytes: 0,
                recent: VecDeque::new(),
            }),
        }
    }

    /// Records a finished chunk of `bytes`.
    pub fn record(&self, bytes: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        inner.bytes += bytes;
        inner.recent.push_back((now, bytes));
        while inner
            .recent
            .front()
            .is_some_and(|(at, _)| now.duration_since(*at) > RECENT_WINDOW)
        {
            inner.recent.pop_front();
        }
    }

    /// Bytes recorded so far.
    pub fn bytes(&self) -> u64 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).bytes
    }

    /// Average bytes per second since [`new`](Self::new).
    pub fn rate(&self) -> f64 {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let elapsed = inner.started_at.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        inner.bytes as f64 / elapsed
    }

    /// Bytes per second over the last few seconds; 0 until two chunks
    /// have finished inside the window.
    pub fn recent_rate(&self) -> f64 {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let (Some((first, _)), Some((last, _))) = (inner.recent.front(), inner.recent.back())
        else {
            return 0.0;
        };
        let span = last.duration_since(*first).as_secs_f64();
        if inner.recent.len() < 2 || span <= 0.0 {
            return 0.0;
        }
        // The first sample marks the start of the span; its bytes precede it.
        let bytes: u64 = inner.recent.iter().skip(1).map(|(_, b)| b).sum();
        bytes as f64 / span
    }
}

/// Formats a byte rate for log output, e.g. `12.5 MiB/s`.
pub fn format_rate(bytes_per_second: f64) -> String {
    const UNITS: [&str; 4] = ["B/s", "KiB/s", "MiB/s", "GiB/s"];
    let mut value = bytes_per_second.max(0.0);
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn empty_meter() {
        let t = Throughput::new();
        assert_eq!(t.bytes(), 0);
        assert_eq!(t.recent_rate(), 0.0);
    }

    #[test]
    fn single_chunk_has_no_recent_rate() {
        let t = Throughput::new();
        t.record(100);
        assert_eq!(t.bytes(), 100);
        assert_eq!(t.recent_rate(), 0.0);
    }

    #[test]
    fn rates_after_several_chunks() {
        let t = Throughput::new();
        t.record(500);
        std::thread::sleep(Duration::from_millis(50));
        t.record(500);

        assert!(t.recent_rate() > 0.0);
        assert!(t.rate() > 0.0);
        assert_eq!(t.bytes(), 1000);
    }

    #[test]
    fn concurrent_records() {
        let t = Arc::new(Throughput::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let t = Arc::clone(&t);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        t.record(1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(t.bytes(), 800);
    }

    #[test]
    fn format_rate_picks_unit() {
        assert_eq!(format_rate(0.0), "0.0 B/s");
        assert_eq!(format_rate(512.0), "512.0 B/s");
        assert_eq!(format_rate(1536.0), "1.5 KiB/s");
        assert_eq!(format_rate(50.0 * 1024.0 * 1024.0), "50.0 MiB/s");
        assert_eq!(format_rate(-3.0), "0.0 B/s");
    }
}
