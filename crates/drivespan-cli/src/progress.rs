use console::style;
use drivespan_core::{MountPrompt, ProgressStream};
use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashSet;
use std::io::BufRead;
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// Console rendering of the sync progress fan-out: one overall bar plus one
/// bar per device, with mount prompts printed above the bars. An Enter on
/// stdin retries every device currently waiting on its gate.
pub struct ConsoleProgress {
    handles: Vec<JoinHandle<()>>,
}

impl ConsoleProgress {
    pub fn spawn(
        stream: ProgressStream,
        devices: Vec<(String, u64)>,
        total_bytes: u64,
        retries: Vec<SyncSender<()>>,
    ) -> Self {
        let multi = MultiProgress::new();

        let overall = multi.add(ProgressBar::new(total_bytes));
        overall.set_style(bar_style());
        overall.set_prefix("Overall");

        let mut device_bars = Vec::with_capacity(devices.len());
        for (name, planned) in &devices {
            let bar = multi.add(ProgressBar::new(*planned));
            bar.set_style(bar_style());
            bar.set_prefix(name.clone());
            device_bars.push(bar);
        }

        let mut handles = Vec::new();

        {
            let overall = overall.clone();
            handles.push(thread::spawn(move || {
                for point in stream.overall {
                    overall.set_position(point.size_writn);
                    overall.set_message(format!("{}/s", HumanBytes(point.bytes_per_second)));
                }
                overall.finish();
            }));
        }

        for (rx, bar) in stream.devices.into_iter().zip(device_bars.iter().cloned()) {
            handles.push(thread::spawn(move || {
                let mut written = 0u64;
                for point in rx {
                    written += point.device_size_writn;
                    bar.set_position(written);
                    bar.set_message(format!(
                        "{} ({}/s)",
                        point.file_name,
                        HumanBytes(point.device_bytes_per_second)
                    ));
                }
                bar.finish();
            }));
        }

        // Mount prompts and the operator's Enter-to-retry loop share the set
        // of devices currently waiting on their gates.
        let waiting = Arc::new(Mutex::new(HashSet::new()));
        {
            let waiting = Arc::clone(&waiting);
            let multi = multi.clone();
            let names: Vec<String> = devices.iter().map(|(name, _)| name.clone()).collect();
            handles.push(thread::spawn(move || {
                for prompt in stream.prompts {
                    match prompt {
                        MountPrompt::Waiting { device, message } => {
                            let fresh = waiting.lock().unwrap().insert(device);
                            if fresh {
                                let name = names.get(device).cloned().unwrap_or_default();
                                let _ = multi
                                    .println(format!("[{name}] {}", style(message).yellow()));
                            }
                        }
                        MountPrompt::Ready { device } => {
                            waiting.lock().unwrap().remove(&device);
                            let name = names.get(device).cloned().unwrap_or_default();
                            let _ = multi.println(format!(
                                "[{name}] {}",
                                style("device ready, writing...").green()
                            ));
                        }
                    }
                }
            }));
        }

        // stdin reader is detached: it blocks in read_line and dies with the
        // process.
        thread::spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                if line.is_err() {
                    break;
                }
                let snapshot: Vec<usize> = waiting.lock().unwrap().iter().copied().collect();
                for device in snapshot {
                    if let Some(retry) = retries.get(device) {
                        let _ = retry.try_send(());
                    }
                }
            }
        });

        ConsoleProgress { handles }
    }

    /// Waits for the channel-driven threads; they end when the session
    /// closes its progress channels.
    pub fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "{prefix:>12.cyan} [{bar:30.cyan/dim}] {bytes}/{total_bytes} {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("━╸─")
    .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
}
