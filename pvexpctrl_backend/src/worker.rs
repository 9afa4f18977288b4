//! Runs a [`MeasurementAggregator`] on its own thread so a UI stays responsive during a series.
//!
//! The worker owns the aggregator (and with it the card). Commands go in over one `crossbeam`
//! channel, events come back over another, and a small shared [`WorkerStatus`] can be polled at
//! any time without waiting for an event.
//!
//! Every command is stamped with the cancel epoch current when it was sent.
//! [`cancel`](MeasurementWorker::cancel) bumps the epoch, so a series or calibration still waiting
//! in the channel behind the running one is dropped with a `Failed` event instead of being played.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use pvcompiler_backend::ExperimentSettings;

use crate::aggregator::{CancelToken, MeasurementAggregator};
use crate::daq::HardwareChannel;
use crate::error::{Error, Result};
use crate::record::{MeasurementRecord, PcCalibration};

#[derive(Debug, Clone)]
pub enum WorkerCmd {
    Enqueue(ExperimentSettings),
    RunSeries,
    Calibrate(ExperimentSettings),
    ClearQueue,
    Close,
}

#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Record {
        index: usize,
        record: MeasurementRecord,
    },
    SeriesDone {
        count: usize,
    },
    Calibrated {
        record: MeasurementRecord,
        calibration: PcCalibration,
    },
    Failed(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStatus {
    pub busy: bool,
    pub queued: usize,
    /// Records delivered since the worker started.
    pub completed: usize,
}

/// Cancel generation a command was sent in.
type Epoch = u64;

pub struct MeasurementWorker {
    cmd_send: Sender<(Epoch, WorkerCmd)>,
    event_recv: Receiver<WorkerEvent>,
    status: Arc<Mutex<WorkerStatus>>,
    cancel: CancelToken,
    epoch: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl MeasurementWorker {
    pub fn spawn<H>(aggregator: MeasurementAggregator<H>) -> Result<Self>
    where
        H: HardwareChannel + Send + 'static,
    {
        let (cmd_send, cmd_recv) = unbounded();
        let (event_send, event_recv) = unbounded();
        let status = Arc::new(Mutex::new(WorkerStatus {
            queued: aggregator.queue_len(),
            ..WorkerStatus::default()
        }));
        let cancel = aggregator.cancel_token();
        let epoch = Arc::new(AtomicU64::new(0));

        let worker_status = status.clone();
        let worker_epoch = epoch.clone();
        let handle = thread::Builder::new()
            .name("measurement-worker".to_string())
            .spawn(move || {
                worker_loop(aggregator, cmd_recv, event_send, worker_status, worker_epoch)
            })
            .map_err(|err| Error::Worker(format!("Failed to spawn worker thread: {}", err)))?;

        Ok(Self {
            cmd_send,
            event_recv,
            status,
            cancel,
            epoch,
            handle: Some(handle),
        })
    }

    pub fn send(&self, cmd: WorkerCmd) -> Result<()> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        self.cmd_send
            .send((epoch, cmd))
            .map_err(|_| Error::Worker("Worker thread has exited".to_string()))
    }

    pub fn enqueue(&self, settings: ExperimentSettings) -> Result<()> {
        self.send(WorkerCmd::Enqueue(settings))
    }

    pub fn run_series(&self) -> Result<()> {
        self.send(WorkerCmd::RunSeries)
    }

    pub fn calibrate(&self, settings: ExperimentSettings) -> Result<()> {
        self.send(WorkerCmd::Calibrate(settings))
    }

    pub fn clear_queue(&self) -> Result<()> {
        self.send(WorkerCmd::ClearQueue)
    }

    /// Blocks until the next event.
    pub fn recv(&self) -> Result<WorkerEvent> {
        self.event_recv
            .recv()
            .map_err(|_| Error::Worker("Worker thread has exited".to_string()))
    }

    /// `Ok(None)` when nothing arrived within `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<WorkerEvent>> {
        match self.event_recv.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::Worker("Worker thread has exited".to_string()))
            }
        }
    }

    pub fn try_recv(&self) -> Option<WorkerEvent> {
        match self.event_recv.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    pub fn status(&self) -> WorkerStatus {
        *self.status.lock()
    }

    /// Stops a running series before its next hardware cycle and drops every series or
    /// calibration sent before this call. Commands sent afterwards run normally.
    pub fn cancel(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.cancel.cancel();
    }

    /// Asks the worker to exit and waits for it. Commands queued before this are still processed.
    pub fn close(&mut self) -> Result<()> {
        let handle = match self.handle.take() {
            Some(handle) => handle,
            None => return Ok(()),
        };
        // the thread may already be gone, joining tells us how it ended
        let _ = self.send(WorkerCmd::Close);
        handle
            .join()
            .map_err(|_| Error::Worker("Worker thread panicked".to_string()))
    }
}

impl Drop for MeasurementWorker {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::error!("{}", err);
        }
    }
}

fn worker_loop<H: HardwareChannel>(
    mut aggregator: MeasurementAggregator<H>,
    cmd_recv: Receiver<(Epoch, WorkerCmd)>,
    event_send: Sender<WorkerEvent>,
    status: Arc<Mutex<WorkerStatus>>,
    epoch: Arc<AtomicU64>,
) {
    log::debug!("Measurement worker started");
    // a dropped event receiver only means nobody is listening any more
    let emit = |event: WorkerEvent| {
        let _ = event_send.send(event);
    };
    let set_busy = |busy: bool, queued: usize| {
        let mut status = status.lock();
        status.busy = busy;
        status.queued = queued;
    };
    let cancel = aggregator.cancel_token();
    // The token is cleared before the epoch is read: a cancel racing with this check either marks
    // the command stale or leaves the token set for the measurement to see.
    let is_current = |sent: Epoch| {
        cancel.reset();
        sent == epoch.load(Ordering::SeqCst)
    };

    while let Ok((sent, cmd)) = cmd_recv.recv() {
        let measures = matches!(cmd, WorkerCmd::RunSeries | WorkerCmd::Calibrate(_));
        if measures && !is_current(sent) {
            log::info!("Dropping {:?} sent before a cancel", cmd);
            emit(WorkerEvent::Failed(Error::Cancelled.to_string()));
            set_busy(false, aggregator.queue_len());
            continue;
        }
        match cmd {
            WorkerCmd::Enqueue(settings) => {
                if let Err(err) = aggregator.enqueue(settings) {
                    emit(WorkerEvent::Failed(err.to_string()));
                }
                set_busy(false, aggregator.queue_len());
            }
            WorkerCmd::ClearQueue => {
                aggregator.clear_queue();
                set_busy(false, 0);
            }
            WorkerCmd::RunSeries => {
                set_busy(true, aggregator.queue_len());
                let result = aggregator.series_measurement_with(|index, record| {
                    status.lock().completed += 1;
                    emit(WorkerEvent::Record { index, record });
                });
                match result {
                    Ok(count) => emit(WorkerEvent::SeriesDone { count }),
                    Err(err) => {
                        log::error!("Series aborted: {}", err);
                        emit(WorkerEvent::Failed(err.to_string()));
                    }
                }
                set_busy(false, aggregator.queue_len());
            }
            WorkerCmd::Calibrate(settings) => {
                set_busy(true, aggregator.queue_len());
                match aggregator.pc_calibration_measurement(&settings) {
                    Ok((record, calibration)) => emit(WorkerEvent::Calibrated {
                        record,
                        calibration,
                    }),
                    Err(err) => {
                        log::error!("Calibration failed: {}", err);
                        emit(WorkerEvent::Failed(err.to_string()));
                    }
                }
                set_busy(false, aggregator.queue_len());
            }
            WorkerCmd::Close => break,
        }
    }
    log::debug!("Measurement worker stopped");
}
