//! Progress bars for `downloader run`, fed by engine events.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use downloader_engine::{Event, EventSink, ProgressUpdate, RecordSnapshot};
use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

const BAR_TEMPLATE: &str = "{spinner:.cyan} [{bar:30.cyan/blue}] {bytes}/{total_bytes} {msg}";
const SPINNER_TEMPLATE: &str = "{spinner:.cyan} {bytes} {msg}";

/// Event sink drawing one bar per active download.
pub(crate) struct TerminalSink {
    multi: MultiProgress,
    bars: Mutex<HashMap<String, ProgressBar>>,
}

impl TerminalSink {
    /// Creates a sink; `hidden` draws nothing (quiet mode, non-tty).
    pub(crate) fn new(hidden: bool) -> Self {
        let multi = if hidden {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        } else {
            MultiProgress::new()
        };
        Self {
            multi,
            bars: Mutex::new(HashMap::new()),
        }
    }

    fn bar_for(&self, bars: &mut HashMap<String, ProgressBar>, url: &str, total: Option<u64>) -> ProgressBar {
        let bar = bars
            .entry(url.to_string())
            .or_insert_with(|| self.multi.add(ProgressBar::new(0)))
            .clone();
        match total {
            Some(total) if bar.length() != Some(total) => {
                bar.set_length(total);
                bar.set_style(style(BAR_TEMPLATE));
            }
            None if bar.length() == Some(0) => bar.set_style(style(SPINNER_TEMPLATE)),
            _ => {}
        }
        bar
    }

    fn on_progress(&self, update: &ProgressUpdate) {
        let mut bars = self.bars.lock().unwrap_or_else(PoisonError::into_inner);
        let bar = self.bar_for(&mut bars, &update.url, update.total);
        bar.set_position(update.downloaded);
        bar.set_message(format!(
            "{}/s {}",
            HumanBytes(update.bytes_per_second),
            label(&update.url)
        ));
    }

    fn on_done(&self, url: &str) {
        let bars = self.bars.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(bar) = bars.get(url) {
            bar.finish_with_message(format!("done {}", label(url)));
        }
    }

    fn on_registry(&self, records: &[RecordSnapshot]) {
        let mut bars = self.bars.lock().unwrap_or_else(PoisonError::into_inner);
        bars.retain(|url, bar| {
            let keep = records.iter().any(|r| &r.url == url);
            if !keep {
                bar.finish_and_clear();
            }
            keep
        });
        for record in records.iter().filter(|r| !r.paused && !r.complete) {
            let bar = self.bar_for(&mut bars, &record.url, record.total_bytes);
            bar.set_position(record.downloaded_bytes);
            if let Some(error) = &record.last_error {
                bar.set_message(format!("retrying {} ({error})", label(&record.url)));
            }
        }
    }
}

impl EventSink for TerminalSink {
    fn emit(&self, event: Event) {
        match event {
            Event::Progress(update) => self.on_progress(&update),
            Event::Done { url, .. } => self.on_done(&url),
            Event::RegistryChanged(records) => self.on_registry(&records),
        }
    }
}

fn style(template: &str) -> ProgressStyle {
    ProgressStyle::with_template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("━━╌")
}

/// Last path segment of a URL, or the URL itself.
fn label(url: &str) -> String {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(url)
        .to_string()
}
