use crate::context::{manifest_json, Context, SYNC_CONTEXT_FILE_NAME};
use crate::device::Device;
use crate::error::Error;
use crate::gate::{self, WorkerGate};
use crate::index::FileType;
use crate::io::{sha1_of_file, HashingWriter};
use crate::metadata::apply_metadata;
use crate::progress::{self, FileProgress, ProgressSender, ProgressStream};
use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Instant, SystemTime};
use tracing::{debug, info, warn};

const COPY_BUFFER: usize = 128 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    /// Serialize the final catalog onto the last device.
    pub save_sync_context: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        SyncOptions {
            save_sync_context: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Waiting,
    Mounted,
    Writing,
    Done,
    Failed,
}

/// Owned snapshot of one planned fragment, handed to a worker so workers
/// never borrow from the shared context.
#[derive(Debug, Clone)]
struct WorkItem {
    file_idx: usize,
    frag_idx: usize,
    file_type: FileType,
    source: PathBuf,
    dest: PathBuf,
    /// Content bytes for regular fragments.
    size: u64,
    start_byte: u64,
    end_byte: u64,
    whole_file: bool,
    file_size: u64,
    file_name: String,
    mode: u32,
    owner: u32,
    group: u32,
    mod_time: SystemTime,
    symlink_target: Option<PathBuf>,
}

#[derive(Debug)]
struct WorkResult {
    file_idx: usize,
    frag_idx: usize,
    sha1: String,
    whole_file: bool,
}

#[derive(Debug)]
struct DeviceReport {
    state: WorkerState,
    results: Vec<WorkResult>,
}

enum FragOutcome {
    Done(WorkResult),
    Skipped,
    DeviceFailed(io::Error),
}

/// Counting semaphore bounding how many workers are un-gated at once.
struct Slots {
    available: Mutex<usize>,
    cv: Condvar,
}

impl Slots {
    fn new(count: usize) -> Arc<Self> {
        Arc::new(Slots {
            available: Mutex::new(count),
            cv: Condvar::new(),
        })
    }

    fn acquire(self: &Arc<Self>) -> SlotGuard {
        let mut available = self.available.lock().unwrap();
        while *available == 0 {
            available = self.cv.wait(available).unwrap();
        }
        *available -= 1;
        SlotGuard {
            slots: Arc::clone(self),
        }
    }
}

struct SlotGuard {
    slots: Arc<Slots>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        *self.slots.available.lock().unwrap() += 1;
        self.slots.cv.notify_one();
    }
}

/// Live handle to a running sync. The caller drains the progress, prompt,
/// and error channels; `wait` joins the orchestrator and returns the
/// finalized context.
pub struct SyncSession {
    progress: Option<ProgressStream>,
    pub errors: Receiver<Error>,
    retries: Vec<SyncSender<()>>,
    exit: Arc<AtomicBool>,
    handle: JoinHandle<Context>,
}

impl SyncSession {
    /// Hands the progress fan-out to a consumer. Dropping it is fine; sends
    /// to a disconnected consumer are discarded.
    pub fn take_progress(&mut self) -> Option<ProgressStream> {
        self.progress.take()
    }

    /// One retry trigger per device; an operator action forces an immediate
    /// gate re-check instead of waiting out the poll interval.
    pub fn retry_senders(&self) -> Vec<SyncSender<()>> {
        self.retries.clone()
    }

    /// Asks every worker to finish its current fragment and stop.
    pub fn request_stop(&self) {
        self.exit.store(true, Ordering::Relaxed);
    }

    pub fn wait(self) -> Result<Context, Error> {
        self.handle
            .join()
            .map_err(|_| io::Error::other("sync orchestrator panicked").into())
    }
}

/// Spawns one gate keeper and one worker per device and returns immediately.
/// Planning must already have happened; the index and catalog are immutable
/// from here on and workers only report results back.
pub fn run(mut ctx: Context, opts: SyncOptions) -> SyncSession {
    let device_count = ctx.devices.len();
    let exit = ctx.exit.clone();
    let (progress_senders, prompt_tx, progress_stream) = progress::channels(device_count);
    let (error_tx, error_rx) = mpsc::channel::<Error>();

    let mut worker_gates = Vec::with_capacity(device_count);
    let mut retries = Vec::with_capacity(device_count);
    for (index, device) in ctx.devices.iter().enumerate() {
        let (worker_gate, keeper_gate) = gate::gate();
        worker_gates.push(worker_gate);
        let (retry_tx, retry_rx) = mpsc::sync_channel(1);
        retries.push(retry_tx);

        let device = device.clone();
        let prompts = prompt_tx.clone();
        let exit = exit.clone();
        thread::spawn(move || gate::keep(device, index, keeper_gate, prompts, retry_rx, exit));
    }
    drop(prompt_tx);

    let work = build_work_items(&ctx);
    let slots = Slots::new(ctx.output_streams);
    let exit_handle = exit.clone();

    let handle = thread::spawn(move || {
        let mut handles = Vec::with_capacity(device_count);
        let workers = work
            .into_iter()
            .zip(worker_gates)
            .zip(progress_senders)
            .enumerate();
        for (index, ((items, worker_gate), progress_sender)) in workers {
            let device = ctx.devices[index].clone();
            let errors = error_tx.clone();
            let exit = exit.clone();
            let slots = Arc::clone(&slots);
            handles.push(thread::spawn(move || {
                run_device(device, items, worker_gate, progress_sender, errors, exit, slots)
            }));
        }

        let mut reports = Vec::with_capacity(device_count);
        for handle in handles {
            match handle.join() {
                Ok(report) => reports.push(report),
                Err(_) => {
                    let _ = error_tx.send(io::Error::other("device worker panicked").into());
                }
            }
        }

        finalize(&mut ctx, reports, opts, &error_tx);
        ctx.exit.store(true, Ordering::Relaxed);
        info!("sync complete");
        ctx
    });

    SyncSession {
        progress: Some(progress_stream),
        errors: error_rx,
        retries,
        exit: exit_handle,
        handle,
    }
}

fn build_work_items(ctx: &Context) -> Vec<Vec<WorkItem>> {
    let mut per_device: Vec<Vec<WorkItem>> = vec![Vec::new(); ctx.devices.len()];
    for (file_idx, file) in ctx.file_index.iter().enumerate() {
        for (frag_idx, dest) in file.dest_files.iter().enumerate() {
            per_device[dest.device].push(WorkItem {
                file_idx,
                frag_idx,
                file_type: file.file_type,
                source: file.path.clone(),
                dest: dest.path.clone(),
                size: dest.byte_len(),
                start_byte: dest.start_byte,
                end_byte: dest.end_byte,
                whole_file: file.file_type == FileType::Regular && dest.is_whole_file(),
                file_size: file.size,
                file_name: file.name.clone(),
                mode: file.mode,
                owner: file.owner,
                group: file.group,
                mod_time: file.mod_time,
                symlink_target: file.symlink_target.clone(),
            });
        }
    }
    per_device
}

fn run_device(
    device: Device,
    items: Vec<WorkItem>,
    gate: WorkerGate,
    progress: ProgressSender,
    errors: Sender<Error>,
    exit: Arc<AtomicBool>,
    slots: Arc<Slots>,
) -> DeviceReport {
    let mut state = WorkerState::Waiting;
    let mut results = Vec::with_capacity(items.len());

    if exit.load(Ordering::Relaxed) {
        let _ = errors.send(Error::Done);
        return DeviceReport { state, results };
    }

    let _slot = slots.acquire();
    if let Err(err) = gate.wait_open() {
        let _ = errors.send(err);
        return DeviceReport { state, results };
    }
    // The keeper just confirmed the device, but the operator may have swapped
    // it since; a UUID mismatch here fails the worker rather than writing to
    // the wrong disk.
    if let Err(err) = gate::ensure_device_ready(&device) {
        let _ = errors.send(err);
        return DeviceReport {
            state: WorkerState::Failed,
            results,
        };
    }
    state = WorkerState::Mounted;
    debug!(device = %device.name, fragments = items.len(), "device mounted, starting");

    let started = Instant::now();
    let mut device_written = 0u64;
    for item in &items {
        if exit.load(Ordering::Relaxed) {
            let _ = errors.send(Error::Done);
            break;
        }
        state = WorkerState::Writing;
        match item.file_type {
            FileType::Directory => sync_directory(item, &errors),
            FileType::Symlink => sync_symlink(item, &errors),
            FileType::Regular => {
                match sync_regular(item, &progress, &errors, &mut device_written, started) {
                    FragOutcome::Done(result) => results.push(result),
                    FragOutcome::Skipped => {}
                    FragOutcome::DeviceFailed(source) => {
                        let _ = errors.send(Error::DeviceFailed {
                            device: device.name.clone(),
                            source,
                        });
                        state = WorkerState::Failed;
                        break;
                    }
                }
            }
        }
    }

    if state != WorkerState::Failed {
        state = WorkerState::Done;
    }
    debug!(device = %device.name, ?state, bytes = device_written, "device worker finished");
    DeviceReport { state, results }
}

fn sync_directory(item: &WorkItem, errors: &Sender<Error>) {
    if let Err(source) = fs::create_dir_all(&item.dest) {
        let _ = errors.send(Error::DestinationOpen {
            path: item.dest.clone(),
            source,
        });
        return;
    }
    for err in apply_metadata(
        &item.dest,
        item.mode,
        item.owner,
        item.group,
        item.mod_time,
        false,
    ) {
        let _ = errors.send(err);
    }
}

fn sync_symlink(item: &WorkItem, errors: &Sender<Error>) {
    let Some(target) = &item.symlink_target else {
        let _ = errors.send(Error::BadMetadata {
            path: item.source.clone(),
            reason: "symlink entry without a target".into(),
        });
        return;
    };
    if let Some(parent) = item.dest.parent() {
        if let Err(source) = fs::create_dir_all(parent) {
            let _ = errors.send(Error::DestinationOpen {
                path: item.dest.clone(),
                source,
            });
            return;
        }
    }
    if let Err(source) = std::os::unix::fs::symlink(target, &item.dest) {
        let _ = errors.send(Error::DestinationOpen {
            path: item.dest.clone(),
            source,
        });
        return;
    }
    for err in apply_metadata(
        &item.dest,
        item.mode,
        item.owner,
        item.group,
        item.mod_time,
        true,
    ) {
        let _ = errors.send(err);
    }
}

fn sync_regular(
    item: &WorkItem,
    progress: &ProgressSender,
    errors: &Sender<Error>,
    device_written: &mut u64,
    worker_started: Instant,
) -> FragOutcome {
    let mut src = match fs::File::open(&item.source) {
        Ok(src) => src,
        Err(source) => {
            let _ = errors.send(Error::SourceNotReadable {
                path: item.source.clone(),
                source,
            });
            return FragOutcome::Skipped;
        }
    };
    if item.start_byte > 0 {
        if let Err(source) = src.seek(SeekFrom::Start(item.start_byte)) {
            let _ = errors.send(Error::SourceNotReadable {
                path: item.source.clone(),
                source,
            });
            return FragOutcome::Skipped;
        }
    }

    // A fragment can land on a device that holds none of its ancestor
    // directories, so the parents are created here as well.
    if let Some(parent) = item.dest.parent() {
        if let Err(source) = fs::create_dir_all(parent) {
            let _ = errors.send(Error::DestinationOpen {
                path: item.dest.clone(),
                source,
            });
            return FragOutcome::Skipped;
        }
    }
    let dest = match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&item.dest)
    {
        Ok(dest) => dest,
        Err(source) => {
            let _ = errors.send(Error::DestinationOpen {
                path: item.dest.clone(),
                source,
            });
            return FragOutcome::Skipped;
        }
    };

    let mut fragment_written = 0u64;
    let report = |delta: u64| {
        fragment_written += delta;
        *device_written += delta;
        let elapsed = worker_started.elapsed().as_secs_f64();
        let device_bytes_per_second = if elapsed > 0.0 {
            (*device_written as f64 / elapsed) as u64
        } else {
            *device_written
        };
        progress.report(
            delta,
            FileProgress {
                file_name: item.file_name.clone(),
                file_path: item.source.clone(),
                file_size: item.file_size,
                fragment_size: item.size,
                fragment_size_writn: fragment_written,
                file_total_size_writn: item.start_byte + fragment_written,
                device_size_writn: delta,
                device_bytes_per_second,
            },
        );
    };
    let mut writer = HashingWriter::new(dest, report);

    let mut remaining = if item.end_byte == 0 {
        u64::MAX
    } else {
        item.end_byte - item.start_byte
    };
    let mut buf = vec![0u8; COPY_BUFFER];
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = match src.read(&mut buf[..want]) {
            Ok(0) => break,
            Ok(n) => n,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(source) => {
                let _ = errors.send(Error::SourceNotReadable {
                    path: item.source.clone(),
                    source,
                });
                return FragOutcome::Skipped;
            }
        };
        if let Err(source) = writer.write_all(&buf[..n]) {
            return FragOutcome::DeviceFailed(source);
        }
        remaining -= n as u64;
    }
    if let Err(source) = writer.flush() {
        return FragOutcome::DeviceFailed(source);
    }
    let (sha1, bytes) = writer.finish();
    if bytes != item.size {
        warn!(
            file = %item.source.display(),
            expected = item.size,
            written = bytes,
            "source changed size during sync"
        );
    }

    for err in apply_metadata(
        &item.dest,
        item.mode,
        item.owner,
        item.group,
        item.mod_time,
        false,
    ) {
        let _ = errors.send(err);
    }

    FragOutcome::Done(WorkResult {
        file_idx: item.file_idx,
        frag_idx: item.frag_idx,
        sha1,
        whole_file: item.whole_file,
    })
}

/// Folds worker results back into the context, fills file-level digests for
/// split files, and persists the manifest on the last device when enabled.
fn finalize(ctx: &mut Context, reports: Vec<DeviceReport>, opts: SyncOptions, errors: &Sender<Error>) {
    for report in reports {
        for result in report.results {
            let file = &mut ctx.file_index[result.file_idx];
            if result.whole_file {
                file.sha1 = Some(result.sha1.clone());
            }
            file.dest_files[result.frag_idx].sha1 = Some(result.sha1);
        }
    }

    // Fragment digests cannot be combined into a file digest, so split
    // files get one more streaming read of the source.
    for file in ctx.file_index.iter_mut() {
        if file.file_type == FileType::Regular && file.is_split() && file.sha1.is_none() {
            match sha1_of_file(&file.path) {
                Ok(digest) => file.sha1 = Some(digest),
                Err(source) => {
                    let _ = errors.send(Error::SourceNotReadable {
                        path: file.path.clone(),
                        source,
                    });
                }
            }
        }
    }

    if opts.save_sync_context {
        let mut soft_errors = Vec::new();
        match manifest_json(&mut ctx.file_index, &mut soft_errors) {
            Ok(json) => {
                if let Some(last) = ctx.devices.last() {
                    let path = last.mount_point.join(SYNC_CONTEXT_FILE_NAME);
                    match fs::write(&path, &json) {
                        Ok(()) => {
                            info!(path = %path.display(), bytes = json.len(), "sync context saved")
                        }
                        Err(source) => {
                            let _ = errors.send(Error::DeviceFailed {
                                device: last.name.clone(),
                                source,
                            });
                        }
                    }
                }
            }
            Err(err) => {
                let _ = errors.send(err);
            }
        }
        for err in soft_errors {
            let _ = errors.send(err);
        }
    }
}
