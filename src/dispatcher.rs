//! Serialized command writes to the control characteristic.
//!
//! Commands are numbered at submission and handed to a single worker task.
//! The worker waits for a ready connection, encodes, paces, writes, and only
//! then moves on to the next command, so at most one control write is ever in
//! flight.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, instrument, trace, warn};

use crate::context::Current;
use crate::events::{CommandOutcome, Event};
use crate::frame::{self, Command};
use crate::gatt::GattDevice;
use crate::{Error, Result};

/// A submitted command waiting for its turn
struct Queued {
    sequence: u8,
    command: Command,
    submitted_at: DateTime<Local>,
    reply: oneshot::Sender<CommandOutcome>,
}

/// Handle to the outcome of one submitted command
#[derive(Debug)]
pub struct CommandTicket {
    sequence: u8,
    outcome: oneshot::Receiver<CommandOutcome>,
}

impl CommandTicket {
    /// Sequence number assigned at submission
    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    /// Waits until the command has been written, or the write failed
    pub async fn outcome(self) -> Result<CommandOutcome> {
        self.outcome.await.map_err(|_| Error::DispatcherClosed)
    }
}

struct Submitter {
    next_sequence: u8,
    queue: mpsc::UnboundedSender<Queued>,
}

/// Ensures a minimum spacing between consecutive writes
struct WritePacer {
    min_delay: Duration,
    last_write: Option<Instant>,
}

impl WritePacer {
    fn new(min_delay: Duration) -> Self {
        Self {
            min_delay,
            last_write: None,
        }
    }

    async fn wait(&mut self) {
        if let Some(last) = self.last_write {
            let elapsed = last.elapsed();
            if elapsed < self.min_delay {
                let wait_time = self.min_delay - elapsed;
                trace!("Rate limiting: waiting {:?} before next write", wait_time);
                time::sleep(wait_time).await;
            }
        }
    }

    fn mark(&mut self) {
        self.last_write = Some(Instant::now());
    }
}

/// Owns the command queue and its worker task
pub struct Dispatcher {
    submitter: Mutex<Submitter>,
    worker: JoinHandle<()>,
}

impl Dispatcher {
    /// Spawns the worker on the current tokio runtime
    pub fn spawn<G: GattDevice>(
        device: Arc<G>,
        contexts: watch::Receiver<Option<Current<G>>>,
        events: broadcast::Sender<Event>,
        write_interval: Duration,
    ) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            device,
            contexts,
            events,
            pacer: WritePacer::new(write_interval),
            queue: rx,
        };

        Self {
            submitter: Mutex::new(Submitter {
                next_sequence: 0,
                queue,
            }),
            worker: tokio::spawn(worker.run()),
        }
    }

    /// Numbers and enqueues a command without waiting for it to be written
    ///
    /// The sequence counter advances for every submission, connected or not.
    pub fn submit(&self, command: Command) -> Result<CommandTicket> {
        let (reply, outcome) = oneshot::channel();
        let mut submitter = self.submitter.lock();

        let sequence = submitter.next_sequence;
        debug!(
            "Queueing command {} (cid {:#04x}) as sequence {}",
            command.label().unwrap_or("unlabelled"),
            command.command_id(),
            sequence
        );
        submitter
            .queue
            .send(Queued {
                sequence,
                command,
                submitted_at: Local::now(),
                reply,
            })
            .map_err(|_| Error::DispatcherClosed)?;
        submitter.next_sequence = sequence.wrapping_add(1);

        Ok(CommandTicket { sequence, outcome })
    }

    /// Sequence number the next submitted command will get
    pub fn next_sequence(&self) -> u8 {
        self.submitter.lock().next_sequence
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

struct Worker<G: GattDevice> {
    device: Arc<G>,
    contexts: watch::Receiver<Option<Current<G>>>,
    events: broadcast::Sender<Event>,
    pacer: WritePacer,
    queue: mpsc::UnboundedReceiver<Queued>,
}

impl<G: GattDevice> Worker<G> {
    async fn run(mut self) {
        while let Some(job) = self.queue.recv().await {
            if self.process(job).await.is_err() {
                break;
            }
        }
        debug!("Command dispatcher stopped");
    }

    /// Writes one command; `Err` only when no context can ever arrive
    #[instrument(skip(self, job), fields(sequence = job.sequence))]
    async fn process(&mut self, job: Queued) -> std::result::Result<(), ()> {
        let frame = frame::encode(&job.command, job.sequence);

        let result = loop {
            let current = self.ready_context().await?;

            self.pacer.wait().await;
            trace!("Writing frame {:02x?}", frame.as_bytes());
            let result = self
                .device
                .write_value(&current.context.control, frame.as_bytes())
                .await;
            self.pacer.mark();

            let Err(e) = result else {
                break Ok(());
            };
            if self.is_stale(&current) {
                warn!(
                    "Connection changed while writing sequence {}: {}; requeueing",
                    job.sequence, e
                );
                continue;
            }
            if !self.link_alive(&current).await {
                warn!(
                    "Link lost while writing sequence {}: {}; waiting for a new connection",
                    job.sequence, e
                );
                self.next_context(&current).await?;
                continue;
            }
            break Err(e);
        };

        let error = match result {
            Ok(()) => {
                debug!(
                    "Command performed: {} {}",
                    job.sequence,
                    job.command.label().unwrap_or("unlabelled")
                );
                None
            }
            Err(e) => {
                warn!("Command {} failed: {}", job.sequence, e);
                Some(e.to_string())
            }
        };

        let outcome = CommandOutcome {
            sequence: job.sequence,
            label: job.command.label().map(str::to_owned),
            submitted_at: job.submitted_at,
            completed_at: Local::now(),
            error,
        };
        trace!("  elapsed time: {}ms", outcome.elapsed().num_milliseconds());

        let _ = self.events.send(Event::CommandCompleted(outcome.clone()));
        // The caller may have dropped its ticket
        let _ = job.reply.send(outcome);
        Ok(())
    }

    async fn ready_context(&mut self) -> std::result::Result<Current<G>, ()> {
        loop {
            let current = self
                .contexts
                .wait_for(Option::is_some)
                .await
                .map_err(|_| ())?
                .clone();
            if let Some(current) = current {
                return Ok(current);
            }
        }
    }

    async fn link_alive(&self, current: &Current<G>) -> bool {
        match self.device.is_connected(&current.context.session).await {
            Ok(alive) => alive,
            Err(e) => {
                warn!("Could not query link state: {}", e);
                false
            }
        }
    }

    /// Waits until `current` has been replaced or dropped
    async fn next_context(&mut self, current: &Current<G>) -> std::result::Result<(), ()> {
        let version = current.version;
        self.contexts
            .wait_for(|latest| latest.as_ref().map_or(true, |c| c.version != version))
            .await
            .map(|_| ())
            .map_err(|_| ())
    }

    fn is_stale(&self, current: &Current<G>) -> bool {
        self.contexts
            .borrow()
            .as_ref()
            .map_or(true, |latest| latest.version != current.version)
    }
}

impl<G: GattDevice> Drop for Worker<G> {
    fn drop(&mut self) {
        let pending = self.queue.len();
        if pending > 0 {
            info!("Dropping {} pending commands", pending);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::context::{ConnectionContext, ContextCell, PowerCharacteristics};
    use crate::gatt::mock::{Call, MockGatt};

    struct Harness {
        gatt: MockGatt,
        cell: ContextCell<MockGatt>,
        dispatcher: Dispatcher,
        events: broadcast::Receiver<Event>,
        control: uuid::Uuid,
    }

    fn harness() -> Harness {
        paced_harness(Duration::ZERO)
    }

    fn paced_harness(write_interval: Duration) -> Harness {
        let gatt = MockGatt::new();
        let cell = ContextCell::new();
        let (tx, events) = broadcast::channel(64);
        let dispatcher = Dispatcher::spawn(
            Arc::new(gatt.clone()),
            cell.subscribe(),
            tx,
            write_interval,
        );
        Harness {
            gatt,
            cell,
            dispatcher,
            events,
            control: DeviceConfig::default().control_uuid,
        }
    }

    fn context(session: u32) -> Arc<ConnectionContext<MockGatt>> {
        let config = DeviceConfig::default();
        Arc::new(ConnectionContext {
            session,
            radio_service: config.radio_service_uuid,
            robot_service: config.robot_service_uuid,
            control: config.control_uuid,
            power: PowerCharacteristics {
                anti_dos: None,
                tx_power: None,
                wake_cpu: None,
            },
        })
    }

    fn color(r: u8) -> Command {
        Command::new(0x02, 0x20, vec![r, 0, 0, 0])
            .unwrap()
            .with_label("setColor")
    }

    #[tokio::test]
    async fn commands_before_ready_flush_in_order() {
        let h = harness();
        let tickets: Vec<_> = (0..3)
            .map(|i| h.dispatcher.submit(color(i)).unwrap())
            .collect();
        assert_eq!(
            tickets.iter().map(CommandTicket::sequence).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );

        tokio::task::yield_now().await;
        assert!(h.gatt.written_to(h.control).is_empty());

        h.cell.publish(context(1));
        for ticket in tickets {
            assert!(ticket.outcome().await.unwrap().is_success());
        }

        let sequences: Vec<u8> = h.gatt.written_to(h.control).iter().map(|f| f[4]).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn sequence_numbers_follow_submission_and_wrap() {
        let h = harness();
        h.cell.publish(context(1));

        let mut last = None;
        for i in 0..300u32 {
            let ticket = h.dispatcher.submit(color(i as u8)).unwrap();
            assert_eq!(ticket.sequence(), (i % 256) as u8);
            last = Some(ticket);
        }
        last.unwrap().outcome().await.unwrap();

        let frames = h.gatt.written_to(h.control);
        assert_eq!(frames.len(), 300);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame[4], (i % 256) as u8);
            assert!(frame::verify(frame));
        }
        assert_eq!(h.dispatcher.next_sequence(), (300 % 256) as u8);
    }

    #[tokio::test]
    async fn delayed_write_blocks_the_next_one() {
        let h = harness();
        h.gatt.delay_sequence(0, Duration::from_millis(50));
        h.cell.publish(context(1));

        let first = h.dispatcher.submit(color(1)).unwrap();
        let second = h.dispatcher.submit(color(2)).unwrap();
        second.outcome().await.unwrap();
        first.outcome().await.unwrap();

        let writes: Vec<_> = h
            .gatt
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::WriteStarted(_, f) => Some(("start", f[4])),
                Call::WriteFinished(_, f) => Some(("finish", f[4])),
                _ => None,
            })
            .collect();
        assert_eq!(
            writes,
            vec![("start", 0), ("finish", 0), ("start", 1), ("finish", 1)]
        );
        assert_eq!(h.gatt.max_in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn control_writes_are_spaced_by_the_write_interval() {
        let interval = DeviceConfig::default().write_interval;
        let h = paced_harness(interval);
        h.cell.publish(context(1));

        let started = Instant::now();
        let tickets: Vec<_> = (0..3)
            .map(|i| h.dispatcher.submit(color(i)).unwrap())
            .collect();
        for ticket in tickets {
            assert!(ticket.outcome().await.unwrap().is_success());
        }

        let starts = h.gatt.control_write_starts();
        assert_eq!(starts.len(), 3);
        // First write goes out immediately
        assert!(starts[0] - started < interval);
        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= interval);
        }
    }

    #[tokio::test]
    async fn write_on_a_dropped_link_waits_for_the_next_context() {
        let mut h = harness();
        let session = h.gatt.connect().await.unwrap();
        h.cell.publish(context(session));
        h.gatt.drop_link();

        let ticket = h.dispatcher.submit(color(3)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(h.gatt.written_to(h.control).is_empty());
        assert!(h.events.try_recv().is_err());

        // A new session replaces the dead one
        h.cell.invalidate();
        let session = h.gatt.connect().await.unwrap();
        h.cell.publish(context(session));

        let outcome = ticket.outcome().await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.sequence, 0);
        assert_eq!(h.gatt.written_to(h.control).len(), 1);
    }

    #[tokio::test]
    async fn failed_write_is_recorded_and_pipeline_continues() {
        let mut h = harness();
        h.gatt.fail_sequence(1);
        h.cell.publish(context(1));

        let tickets: Vec<_> = (0..3)
            .map(|i| h.dispatcher.submit(color(i)).unwrap())
            .collect();
        let mut outcomes = Vec::new();
        for ticket in tickets {
            outcomes.push(ticket.outcome().await.unwrap());
        }

        assert!(outcomes[0].is_success());
        assert!(!outcomes[1].is_success());
        assert!(outcomes[2].is_success());
        assert_eq!(outcomes[1].label.as_deref(), Some("setColor"));

        let sequences: Vec<u8> = h.gatt.written_to(h.control).iter().map(|f| f[4]).collect();
        assert_eq!(sequences, vec![0, 2]);

        let mut published = Vec::new();
        while let Ok(event) = h.events.try_recv() {
            if let Event::CommandCompleted(outcome) = event {
                published.push(outcome.sequence);
            }
        }
        assert_eq!(published, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn commands_wait_for_the_next_context_after_invalidation() {
        let h = harness();
        h.cell.publish(context(1));
        h.dispatcher.submit(color(1)).unwrap().outcome().await.unwrap();

        h.cell.invalidate();
        let pending = h.dispatcher.submit(color(2)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.gatt.written_to(h.control).len(), 1);

        h.cell.publish(context(2));
        let outcome = pending.outcome().await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.sequence, 1);
        assert_eq!(h.gatt.written_to(h.control).len(), 2);
    }

    #[tokio::test]
    async fn write_interrupted_by_disconnect_is_requeued() {
        let h = harness();
        h.gatt.delay_sequence(0, Duration::from_millis(30));
        h.gatt.fail_sequence(0);
        h.cell.publish(context(1));

        let ticket = h.dispatcher.submit(color(9)).unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        h.cell.invalidate();
        tokio::time::sleep(Duration::from_millis(40)).await;

        h.gatt.heal();
        h.cell.publish(context(2));
        let outcome = ticket.outcome().await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(h.gatt.written_to(h.control).len(), 1);
    }
}
