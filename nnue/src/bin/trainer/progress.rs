use indicatif::{ProgressBar, ProgressStyle};
use nnue::training::{EpochReport, LogObserver, TrainingObserver, WindowReport};

/// Progress bar over the batches of the running epoch.
///
/// Window and epoch summaries still go to the log, printed above the bar.
pub struct TrainingProgressBar {
    bar: Option<ProgressBar>,
    style: ProgressStyle,
    log: LogObserver,
}

impl TrainingProgressBar {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let style = ProgressStyle::default_bar().template(
            "{spinner:.cyan} {pos}/{len} [{wide_bar:.cyan/blue}] {eta_precise} | {msg}",
        )?;
        Ok(Self {
            bar: None,
            style,
            log: LogObserver,
        })
    }
}

impl TrainingObserver for TrainingProgressBar {
    fn on_epoch_start(&mut self, _epoch: usize, num_batches: usize) {
        let bar = ProgressBar::new(num_batches as u64);
        bar.set_style(self.style.clone());
        self.bar = Some(bar);
    }

    fn on_batch(&mut self, _loss: f64) {
        if let Some(bar) = &self.bar {
            bar.inc(1);
        }
    }

    fn on_window(&mut self, report: &WindowReport) {
        match &self.bar {
            Some(bar) => {
                bar.set_message(format!("loss: {:.6}", report.loss));
                bar.suspend(|| self.log.on_window(report));
            }
            None => self.log.on_window(report),
        }
    }

    fn on_epoch_end(&mut self, report: &EpochReport) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
        self.log.on_epoch_end(report);
    }
}
