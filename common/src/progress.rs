use std::sync::Arc;
use tracing::{Level, event, instrument};

#[derive(Debug)]
pub struct TlsCounter {
    // mutex is used primarily from one thread, so it's not a bottleneck
    count: thread_local::ThreadLocal<std::sync::Mutex<u64>>,
}

impl TlsCounter {
    pub fn new() -> Self {
        Self {
            count: thread_local::ThreadLocal::new(),
        }
    }

    pub fn add(&self, value: u64) {
        let mutex = self.count.get_or(|| std::sync::Mutex::new(0));
        let mut guard = mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard += value;
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn get(&self) -> u64 {
        self.count.iter().fold(0, |x, y| {
            x + *y.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
        })
    }
}

impl Default for TlsCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct ProgressCounter {
    started: TlsCounter,
    finished: TlsCounter,
}

impl Default for ProgressCounter {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ProgressGuard<'a> {
    progress: &'a ProgressCounter,
}

impl<'a> ProgressGuard<'a> {
    pub fn new(progress: &'a ProgressCounter) -> Self {
        progress.started.inc();
        Self { progress }
    }
}

impl Drop for ProgressGuard<'_> {
    fn drop(&mut self) {
        self.progress.finished.inc();
    }
}

pub struct Status {
    pub started: u64,
    pub finished: u64,
}

impl ProgressCounter {
    pub fn new() -> Self {
        Self {
            started: TlsCounter::new(),
            finished: TlsCounter::new(),
        }
    }

    pub fn guard(&self) -> ProgressGuard<'_> {
        ProgressGuard::new(self)
    }

    #[instrument]
    pub fn get(&self) -> Status {
        let mut status = Status {
            started: self.started.get(),
            finished: self.finished.get(),
        };
        if status.finished > status.started {
            event!(
                Level::DEBUG,
                "Progress inversion - started: {}, finished {}",
                status.started,
                status.finished
            );
            status.started = status.finished;
        }
        status
    }
}

/// Run-wide counters, shared by every sync invocation and transfer of one process
#[derive(Debug)]
pub struct Progress {
    pub transfers: ProgressCounter,
    pub bytes_copied: TlsCounter,
    pub files_copied: TlsCounter,
    pub files_unchanged: TlsCounter,
    pub files_filtered: TlsCounter,
    pub files_failed: TlsCounter,
    pub directories_created: TlsCounter,
    pub directories_unchanged: TlsCounter,
    pub events_received: TlsCounter,
    start_time: std::time::Instant,
}

impl Progress {
    pub fn new() -> Self {
        Self {
            transfers: Default::default(),
            bytes_copied: Default::default(),
            files_copied: Default::default(),
            files_unchanged: Default::default(),
            files_filtered: Default::default(),
            files_failed: Default::default(),
            directories_created: Default::default(),
            directories_unchanged: Default::default(),
            events_received: Default::default(),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn get_duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ProgressPrinter<'a> {
    progress: &'a Progress,
    last_bytes: u64,
    last_update: std::time::Instant,
}

impl<'a> ProgressPrinter<'a> {
    pub fn new(progress: &'a Progress) -> Self {
        Self {
            progress,
            last_bytes: progress.bytes_copied.get(),
            last_update: std::time::Instant::now(),
        }
    }

    pub fn print(&mut self) -> String {
        let time_now = std::time::Instant::now();
        let transfers = self.progress.transfers.get();
        let total_duration_secs = self.progress.get_duration().as_secs_f64();
        let curr_duration_secs = (time_now - self.last_update).as_secs_f64();
        let bytes = self.progress.bytes_copied.get();
        let average_bytes_rate = rate(bytes, total_duration_secs);
        let current_bytes_rate = rate(bytes.saturating_sub(self.last_bytes), curr_duration_secs);
        self.last_bytes = bytes;
        self.last_update = time_now;
        format!(
            "---------------------\n\
            TRANSFERS:\n\
            in flight: {:>10}\n\
            finished:  {:>10}\n\
            -----------------------\n\
            COPIED:\n\
            average: {:>10}/s\n\
            current: {:>10}/s\n\
            total:   {:>10}\n\
            \n\
            files:       {:>10}\n\
            directories: {:>10}\n\
            -----------------------\n\
            SKIPPED:\n\
            unchanged:   {:>10}\n\
            filtered:    {:>10}\n\
            failed:      {:>10}\n\
            -----------------------\n\
            CHANGE EVENTS:\n\
            received:    {:>10}",
            transfers.started - transfers.finished,
            transfers.finished,
            bytesize::ByteSize(average_bytes_rate as u64),
            bytesize::ByteSize(current_bytes_rate as u64),
            bytesize::ByteSize(bytes),
            self.progress.files_copied.get(),
            self.progress.directories_created.get(),
            self.progress.files_unchanged.get(),
            self.progress.files_filtered.get(),
            self.progress.files_failed.get(),
            self.progress.events_received.get(),
        )
    }
}

fn rate(bytes: u64, secs: f64) -> f64 {
    if secs > 0.0 { bytes as f64 / secs } else { 0.0 }
}

/// Receiver of per-file progress. Implementations decide how (and whether) to render it.
pub trait ProgressSink: Send + Sync + std::fmt::Debug {
    /// Announce a transfer of `total` bytes.
    fn start(&self, name: &str, total: u64) -> Box<dyn TransferProgress>;
}

/// Progress of one transfer
pub trait TransferProgress: Send {
    /// Bytes copied so far; never decreases.
    fn update(&mut self, bytes: u64);
    /// Transfer finished, `line` is the human-readable completion report.
    fn finish(&mut self, line: &str);
    /// Transfer failed part way.
    fn abandon(&mut self);
}

/// Limits how often byte counts are forwarded to a sink.
#[derive(Debug)]
pub struct UpdateThrottle {
    interval: std::time::Duration,
    last: Option<std::time::Instant>,
}

impl UpdateThrottle {
    /// At most 10 updates per second
    pub const DEFAULT_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);

    pub fn new(interval: std::time::Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// Whether an update may be emitted now; records the emission if so.
    pub fn ready(&mut self) -> bool {
        let now = std::time::Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

impl Default for UpdateThrottle {
    fn default() -> Self {
        Self::new(Self::DEFAULT_INTERVAL)
    }
}

/// Sink that only logs completion lines
#[derive(Debug, Default)]
pub struct LogSink;

struct LogProgress {
    name: String,
}

impl TransferProgress for LogProgress {
    fn update(&mut self, bytes: u64) {
        tracing::trace!("{}: {} bytes", self.name, bytes);
    }

    fn finish(&mut self, line: &str) {
        tracing::info!("{}", line);
    }

    fn abandon(&mut self) {
        tracing::debug!("{}: transfer abandoned", self.name);
    }
}

impl ProgressSink for LogSink {
    fn start(&self, name: &str, _total: u64) -> Box<dyn TransferProgress> {
        Box::new(LogProgress {
            name: name.to_string(),
        })
    }
}

/// Sink rendering one `indicatif` bar per transfer
pub struct BarSink {
    multi: indicatif::MultiProgress,
    style: indicatif::ProgressStyle,
}

impl std::fmt::Debug for BarSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BarSink").finish_non_exhaustive()
    }
}

impl BarSink {
    pub fn new(refresh_delay: std::time::Duration) -> Self {
        let refresh_hz = (1.0 / refresh_delay.as_secs_f64().max(0.001)).clamp(1.0, 20.0) as u8;
        let multi = indicatif::MultiProgress::with_draw_target(
            indicatif::ProgressDrawTarget::stderr_with_hz(refresh_hz),
        );
        let style = indicatif::ProgressStyle::with_template(
            "Copying {msg} {percent:>3}% |{bar:20}| {bytes}/{total_bytes} ({binary_bytes_per_sec}, {eta})",
        )
        .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar());
        Self { multi, style }
    }
}

struct BarProgress {
    multi: indicatif::MultiProgress,
    bar: indicatif::ProgressBar,
}

impl TransferProgress for BarProgress {
    fn update(&mut self, bytes: u64) {
        self.bar.set_position(bytes);
    }

    fn finish(&mut self, line: &str) {
        self.bar.finish_and_clear();
        self.multi.remove(&self.bar);
        if self.multi.println(line).is_err() {
            tracing::info!("{}", line);
        }
    }

    fn abandon(&mut self) {
        self.bar.abandon();
        self.multi.remove(&self.bar);
    }
}

impl ProgressSink for BarSink {
    fn start(&self, name: &str, total: u64) -> Box<dyn TransferProgress> {
        let bar = self.multi.add(indicatif::ProgressBar::new(total));
        bar.set_style(self.style.clone());
        bar.set_message(name.to_string());
        Box::new(BarProgress {
            multi: self.multi.clone(),
            bar,
        })
    }
}

/// How progress is displayed
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ProgressType {
    /// `ProgressBar` when stderr is a terminal, `TextUpdates` otherwise
    #[default]
    Auto,
    /// animated per-file bars
    ProgressBar,
    /// periodic plain-text status, appropriate for logging
    TextUpdates,
}

impl std::str::FromStr for ProgressType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Auto" | "auto" => Ok(ProgressType::Auto),
            "ProgressBar" | "progress-bar" => Ok(ProgressType::ProgressBar),
            "TextUpdates" | "text-updates" => Ok(ProgressType::TextUpdates),
            _ => Err(format!(
                "invalid progress type: '{s}', expected one of: Auto, ProgressBar, TextUpdates"
            )),
        }
    }
}

impl ProgressType {
    /// Resolve `Auto` against the attached terminal.
    pub fn resolve(self) -> Self {
        match self {
            ProgressType::Auto => {
                use std::io::IsTerminal;
                if std::io::stderr().is_terminal() {
                    ProgressType::ProgressBar
                } else {
                    ProgressType::TextUpdates
                }
            }
            other => other,
        }
    }

    pub fn default_delay(self) -> std::time::Duration {
        match self {
            ProgressType::TextUpdates => std::time::Duration::from_secs(10),
            _ => std::time::Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProgressSettings {
    pub progress_type: ProgressType,
    pub progress_delay: Option<String>,
}

impl ProgressSettings {
    pub fn delay(&self) -> anyhow::Result<std::time::Duration> {
        match &self.progress_delay {
            Some(delay) => humantime::parse_duration(delay)
                .map_err(|err| anyhow::anyhow!("invalid progress delay '{delay}': {err}")),
            None => Ok(self.progress_type.resolve().default_delay()),
        }
    }
}

/// Per-file sink matching `settings`; no settings means completion lines are only logged.
pub fn make_sink(settings: Option<&ProgressSettings>) -> anyhow::Result<Arc<dyn ProgressSink>> {
    let Some(settings) = settings else {
        return Ok(Arc::new(LogSink));
    };
    let delay = settings.delay()?;
    Ok(match settings.progress_type.resolve() {
        ProgressType::ProgressBar => Arc::new(BarSink::new(delay)),
        _ => Arc::new(LogSink),
    })
}
