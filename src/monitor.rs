//! Asynchronous frame monitor on the tokio runtime.
//!
//! A producer task sends frames at a fixed cadence, a blocking receive loop
//! polls the transport and hands every received frame to a [`FanOut`]. Each
//! listener owns a task and an unbounded queue, so a slow listener never
//! holds back the receive loop or the other listeners.

use crate::error::TransportError;
use crate::frame::Frame;
use crate::listener::Listener;
use crate::transport::Transport;
use crate::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub type SharedTransport = Arc<Mutex<Box<dyn Transport>>>;

/// Listener side of a bounded frame queue, see [`buffered_reader`].
pub struct BufferedReader {
    sender: Option<mpsc::Sender<Frame>>,
}

/// Consumer side of a bounded frame queue.
pub struct BufferedMessages {
    receiver: mpsc::Receiver<Frame>,
}

/// Creates a queue holding at most `capacity` frames. Frames arriving while
/// the queue is full are dropped with a warning.
pub fn buffered_reader(capacity: usize) -> (BufferedReader, BufferedMessages) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (
        BufferedReader {
            sender: Some(sender),
        },
        BufferedMessages { receiver },
    )
}

impl Listener for BufferedReader {
    fn name(&self) -> &str {
        "buffered-reader"
    }

    fn handle(&mut self, frame: &Frame) -> Result<(), Error> {
        let Some(sender) = &self.sender else {
            return Err(TransportError::Closed.into());
        };
        match sender.try_send(*frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(frame)) => {
                log::warn!("Reader buffer full, dropping {frame:?}");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TransportError::Closed.into()),
        }
    }

    fn stop(&mut self) -> Result<(), Error> {
        self.sender = None;
        Ok(())
    }
}

impl BufferedMessages {
    /// Waits for the next frame; `None` once the reader stopped and the
    /// queue is empty.
    pub async fn get_message(&mut self) -> Option<Frame> {
        self.receiver.recv().await
    }

    pub async fn get_message_timeout(&mut self, timeout: Duration) -> Option<Frame> {
        tokio::time::timeout(timeout, self.receiver.recv())
            .await
            .ok()
            .flatten()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenerStats {
    pub name: String,
    pub handled: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct FanOutHandle {
    senders: Vec<(String, mpsc::UnboundedSender<Frame>)>,
}

impl FanOutHandle {
    /// Queues `frame` for every listener. Never waits.
    pub fn publish(&self, frame: &Frame) {
        for (name, sender) in &self.senders {
            if sender.send(*frame).is_err() {
                log::error!("Listener '{name}' is gone, frame {frame:?} not delivered");
            }
        }
    }
}

/// One task per listener, fed in emission order.
pub struct FanOut {
    handle: FanOutHandle,
    tasks: Vec<(String, JoinHandle<ListenerStats>)>,
}

impl FanOut {
    pub fn spawn(listeners: Vec<Box<dyn Listener>>) -> Self {
        let mut senders = Vec::with_capacity(listeners.len());
        let mut tasks = Vec::with_capacity(listeners.len());
        for mut listener in listeners {
            let name = listener.name().to_string();
            let (sender, mut receiver) = mpsc::unbounded_channel::<Frame>();
            let task_name = name.clone();
            let task = tokio::spawn(async move {
                let mut stats = ListenerStats {
                    name: task_name,
                    ..Default::default()
                };
                while let Some(frame) = receiver.recv().await {
                    match listener.handle(&frame) {
                        Ok(()) => stats.handled += 1,
                        Err(err) => {
                            stats.failed += 1;
                            log::error!("Listener '{}' failed on {frame:?}: {err}", stats.name);
                        }
                    }
                }
                if let Err(err) = listener.stop() {
                    log::error!("Listener '{}' failed to stop: {err}", stats.name);
                }
                stats
            });
            senders.push((name.clone(), sender));
            tasks.push((name, task));
        }
        Self {
            handle: FanOutHandle { senders },
            tasks,
        }
    }

    pub fn handle(&self) -> FanOutHandle {
        self.handle.clone()
    }

    pub fn publish(&self, frame: &Frame) {
        self.handle.publish(frame);
    }

    /// Closes every queue and waits until each listener drained and stopped.
    /// Handles given out by [`FanOut::handle`] must be dropped before.
    pub async fn close(self) -> Vec<ListenerStats> {
        drop(self.handle);
        let mut stats = Vec::with_capacity(self.tasks.len());
        for (name, task) in self.tasks {
            match task.await {
                Ok(listener_stats) => stats.push(listener_stats),
                Err(err) => {
                    log::error!("Listener task '{name}' aborted: {err}");
                    stats.push(ListenerStats {
                        name,
                        ..Default::default()
                    });
                }
            }
        }
        stats
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerStats {
    pub sent: usize,
    pub send_failures: usize,
}

fn lock(transport: &SharedTransport) -> std::sync::MutexGuard<'_, Box<dyn Transport>> {
    transport.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sends `frames` one per `cadence` until exhausted or `stop` turns true.
/// Send failures are logged and counted.
pub async fn run_producer<I>(
    frames: I,
    transport: SharedTransport,
    cadence: Duration,
    mut stop: watch::Receiver<bool>,
) -> ProducerStats
where
    I: IntoIterator<Item = Frame>,
{
    let mut stats = ProducerStats::default();
    for frame in frames {
        if *stop.borrow() {
            break;
        }
        let bus = transport.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut guard = lock(&bus);
            guard.send(&frame)
        })
        .await;
        match result {
            Ok(Ok(())) => {
                stats.sent += 1;
                log::debug!("Sent {frame}");
            }
            Ok(Err(err)) => {
                stats.send_failures += 1;
                log::error!("Failed to send {frame}: {err}");
            }
            Err(err) => {
                stats.send_failures += 1;
                log::error!("Send task for {frame} aborted: {err}");
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(cadence) => {}
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }
    stats
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiveStats {
    pub received: usize,
    pub errors: usize,
}

/// Blocking poll loop. After `stop` is set it keeps reading until the
/// transport has nothing pending.
///
/// When the producer sends on the same handle, the transport is only polled
/// under the lock and the wait for the next poll happens without it.
fn receive_loop(
    transport: SharedTransport,
    fan_out: FanOutHandle,
    stop: Arc<AtomicBool>,
    poll_interval: Duration,
    shared_with_producer: bool,
) -> ReceiveStats {
    let mut stats = ReceiveStats::default();
    let timeout = if shared_with_producer {
        Duration::ZERO
    } else {
        poll_interval
    };
    loop {
        let received = lock(&transport).receive(timeout);
        match received {
            Ok(Some(frame)) => {
                stats.received += 1;
                log::trace!("Received {frame:?}");
                fan_out.publish(&frame);
            }
            Ok(None) => {
                if stop.load(Ordering::Acquire) {
                    break;
                }
                if shared_with_producer {
                    std::thread::sleep(poll_interval);
                }
            }
            Err(TransportError::Closed) => {
                log::debug!("Transport closed, leaving receive loop");
                break;
            }
            Err(err) => {
                stats.errors += 1;
                log::error!("Receive failed: {err}");
                if stop.load(Ordering::Acquire) {
                    break;
                }
                // keep a failing transport from spinning
                std::thread::sleep(poll_interval);
            }
        }
    }
    stats
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorSummary {
    pub sent: usize,
    pub send_failures: usize,
    pub received: usize,
    pub receive_errors: usize,
    pub listeners: Vec<ListenerStats>,
}

struct Producer {
    stop: watch::Sender<bool>,
    task: JoinHandle<ProducerStats>,
}

/// Producer, transport, receive loop and listeners wired together.
pub struct Monitor {
    transport: SharedTransport,
    /// Handle the producer sends on; the receiving transport itself when the
    /// bus offers no separate send handle.
    sender: SharedTransport,
    producer: Option<Producer>,
    producer_stats: ProducerStats,
    receive_stop: Arc<AtomicBool>,
    receive_task: JoinHandle<ReceiveStats>,
    fan_out: FanOut,
}

impl Monitor {
    /// Starts receiving on `transport` and dispatching to `listeners`.
    pub fn start(
        transport: Box<dyn Transport>,
        listeners: Vec<Box<dyn Listener>>,
        poll_interval: Duration,
    ) -> Self {
        log::info!("Monitoring {}", transport.channel_info());
        let send_handle = transport.send_handle();
        let transport: SharedTransport = Arc::new(Mutex::new(transport));
        let shared_with_producer = send_handle.is_none();
        let sender = match send_handle {
            Some(handle) => Arc::new(Mutex::new(handle)),
            None => {
                log::debug!("No separate send handle, producer and receiver share the bus");
                transport.clone()
            }
        };
        let fan_out = FanOut::spawn(listeners);
        let receive_stop = Arc::new(AtomicBool::new(false));
        let receive_task = {
            let transport = transport.clone();
            let handle = fan_out.handle();
            let stop = receive_stop.clone();
            tokio::task::spawn_blocking(move || {
                receive_loop(transport, handle, stop, poll_interval, shared_with_producer)
            })
        };
        Self {
            transport,
            sender,
            producer: None,
            producer_stats: ProducerStats::default(),
            receive_stop,
            receive_task,
            fan_out,
        }
    }

    /// Sends `frames` in the background. A running producer is stopped first.
    pub async fn spawn_producer<I>(&mut self, frames: I, cadence: Duration)
    where
        I: IntoIterator<Item = Frame> + Send + 'static,
        I::IntoIter: Send,
    {
        self.stop_producer().await;
        let (stop, stop_rx) = watch::channel(false);
        let sender = self.sender.clone();
        let task = tokio::spawn(run_producer(frames, sender, cadence, stop_rx));
        self.producer = Some(Producer { stop, task });
    }

    /// Waits until the producer sent all of its frames. Cancelling the wait
    /// leaves the producer running.
    pub async fn wait_producer(&mut self) {
        if let Some(producer) = self.producer.as_mut() {
            let result = (&mut producer.task).await;
            self.producer = None;
            self.record_producer(result);
        }
    }

    async fn stop_producer(&mut self) {
        if let Some(producer) = self.producer.take() {
            // the task may have finished already, then nobody listens
            let _ = producer.stop.send(true);
            let result = producer.task.await;
            self.record_producer(result);
        }
    }

    fn record_producer(&mut self, result: Result<ProducerStats, tokio::task::JoinError>) {
        match result {
            Ok(stats) => {
                self.producer_stats.sent += stats.sent;
                self.producer_stats.send_failures += stats.send_failures;
            }
            Err(err) => log::error!("Producer task aborted: {err}"),
        }
    }

    /// Stops the producer, drains the receive loop and the listeners, then
    /// shuts the transport down.
    pub async fn shutdown(mut self) -> Result<MonitorSummary, Error> {
        self.stop_producer().await;

        self.receive_stop.store(true, Ordering::Release);
        let receive_stats = match self.receive_task.await {
            Ok(stats) => stats,
            Err(err) => {
                log::error!("Receive task aborted: {err}");
                ReceiveStats::default()
            }
        };

        let listeners = self.fan_out.close().await;

        if !Arc::ptr_eq(&self.sender, &self.transport) {
            if let Err(err) = lock(&self.sender).shutdown() {
                log::warn!("Failed to close send handle: {err}");
            }
        }
        lock(&self.transport).shutdown()?;

        let summary = MonitorSummary {
            sent: self.producer_stats.sent,
            send_failures: self.producer_stats.send_failures,
            received: receive_stats.received,
            receive_errors: receive_stats.errors,
            listeners,
        };
        log::info!(
            "Monitor stopped: {} sent, {} received",
            summary.sent,
            summary.received
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{NullTransport, VirtualChannel};
    use std::collections::VecDeque;
    use std::time::Instant;

    struct Recorder {
        seen: Arc<Mutex<Vec<u16>>>,
        stopped: Arc<AtomicBool>,
    }

    impl Listener for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn handle(&mut self, frame: &Frame) -> Result<(), Error> {
            self.seen.lock().unwrap().push(frame.id());
            Ok(())
        }

        fn stop(&mut self) -> Result<(), Error> {
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Flaky;

    impl Listener for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        fn handle(&mut self, frame: &Frame) -> Result<(), Error> {
            if frame.id() % 2 == 0 {
                Err(Error::UnknownFrame(frame.id()))
            } else {
                Ok(())
            }
        }
    }

    fn frames(ids: std::ops::Range<u16>) -> Vec<Frame> {
        ids.map(|id| Frame::new(id, &[id as u8]).unwrap()).collect()
    }

    #[tokio::test]
    async fn loopback_reaches_every_listener() {
        let channel = VirtualChannel::new("monitor");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let stopped = Arc::new(AtomicBool::new(false));
        let (reader, mut messages) = buffered_reader(16);
        let listeners: Vec<Box<dyn Listener>> = vec![
            Box::new(Recorder {
                seen: seen.clone(),
                stopped: stopped.clone(),
            }),
            Box::new(Flaky),
            Box::new(reader),
        ];
        let mut monitor = Monitor::start(
            Box::new(channel.connect(true)),
            listeners,
            Duration::from_millis(5),
        );
        monitor
            .spawn_producer(frames(0x101..0x107), Duration::from_millis(1))
            .await;
        monitor.wait_producer().await;
        let summary = monitor.shutdown().await.unwrap();

        assert_eq!(summary.sent, 6);
        assert_eq!(summary.send_failures, 0);
        assert_eq!(summary.received, 6);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![0x101, 0x102, 0x103, 0x104, 0x105, 0x106]
        );
        assert!(stopped.load(Ordering::SeqCst));
        assert_eq!(
            summary.listeners[1],
            ListenerStats {
                name: "flaky".to_string(),
                handled: 3,
                failed: 3
            }
        );

        let mut buffered = Vec::new();
        while let Some(frame) = messages.get_message().await {
            buffered.push(frame.id());
        }
        assert_eq!(buffered.len(), 6);
    }

    #[tokio::test]
    async fn shutdown_stops_producer_and_drains() {
        let channel = VirtualChannel::new("drain");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let listeners: Vec<Box<dyn Listener>> = vec![Box::new(Recorder {
            seen: seen.clone(),
            stopped: Arc::new(AtomicBool::new(false)),
        })];
        let mut monitor = Monitor::start(
            Box::new(channel.connect(true)),
            listeners,
            Duration::from_millis(5),
        );
        monitor
            .spawn_producer(frames(0x100..0x400), Duration::from_millis(20))
            .await;
        tokio::time::sleep(Duration::from_millis(70)).await;
        let summary = monitor.shutdown().await.unwrap();

        assert!(summary.sent > 0);
        assert!(summary.sent < 0x300);
        assert_eq!(summary.received, summary.sent);
        assert_eq!(seen.lock().unwrap().len(), summary.sent);
    }

    #[tokio::test]
    async fn mock_bus_receives_nothing() {
        let mut monitor = Monitor::start(Box::new(NullTransport), Vec::new(), Duration::from_millis(2));
        monitor
            .spawn_producer(frames(0x200..0x203), Duration::from_millis(1))
            .await;
        monitor.wait_producer().await;
        let summary = monitor.shutdown().await.unwrap();
        assert_eq!(summary.sent, 3);
        assert_eq!(summary.received, 0);
        assert!(summary.listeners.is_empty());
    }

    #[tokio::test]
    async fn full_buffer_drops_frames() {
        let (mut reader, mut messages) = buffered_reader(2);
        for frame in frames(0x10..0x14) {
            reader.handle(&frame).unwrap();
        }
        reader.stop().unwrap();
        assert!(reader.handle(&frames(0x20..0x21)[0]).is_err());
        assert_eq!(messages.get_message().await.map(|f| f.id()), Some(0x10));
        assert_eq!(messages.get_message().await.map(|f| f.id()), Some(0x11));
        assert_eq!(messages.get_message().await, None);
        assert_eq!(
            messages.get_message_timeout(Duration::from_millis(1)).await,
            None
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn producer_keeps_its_cadence_while_receive_waits() {
        let channel = VirtualChannel::new("cadence");
        let mut peer = channel.connect(false);
        let mut monitor = Monitor::start(
            Box::new(channel.connect(false)),
            Vec::new(),
            Duration::from_millis(200),
        );
        let started = Instant::now();
        monitor
            .spawn_producer(frames(0x201..0x206), Duration::from_millis(1))
            .await;
        monitor.wait_producer().await;
        let elapsed = started.elapsed();
        let summary = monitor.shutdown().await.unwrap();

        assert_eq!(summary.sent, 5);
        assert!(elapsed < Duration::from_millis(100), "{elapsed:?}");
        let mut forwarded = 0;
        while peer.receive(Duration::from_millis(10)).unwrap().is_some() {
            forwarded += 1;
        }
        assert_eq!(forwarded, 5);
    }

    /// Bus without a send handle: odd identifiers fail to send and every
    /// scripted receive error is followed by a frame.
    struct ScriptedBus {
        incoming: VecDeque<Result<Frame, TransportError>>,
    }

    impl Transport for ScriptedBus {
        fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
            if frame.id() % 2 == 1 {
                Err(TransportError::Timeout)
            } else {
                Ok(())
            }
        }

        fn receive(&mut self, timeout: Duration) -> Result<Option<Frame>, TransportError> {
            match self.incoming.pop_front() {
                Some(next) => next.map(Some),
                None => {
                    std::thread::sleep(timeout);
                    Ok(None)
                }
            }
        }

        fn channel_info(&self) -> String {
            "scripted bus".to_string()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn transport_failures_are_counted_and_skipped() {
        let incoming = VecDeque::from(vec![
            Err(TransportError::Protocol("garbage".to_string())),
            Ok(Frame::new(0x200, &[1]).unwrap()),
            Err(TransportError::Timeout),
            Ok(Frame::new(0x202, &[2]).unwrap()),
        ]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let listeners: Vec<Box<dyn Listener>> = vec![Box::new(Recorder {
            seen: seen.clone(),
            stopped: Arc::new(AtomicBool::new(false)),
        })];
        let mut monitor = Monitor::start(
            Box::new(ScriptedBus { incoming }),
            listeners,
            Duration::from_millis(20),
        );
        let started = Instant::now();
        monitor
            .spawn_producer(frames(0x100..0x106), Duration::from_millis(1))
            .await;
        monitor.wait_producer().await;
        assert!(started.elapsed() < Duration::from_millis(100));

        tokio::time::timeout(Duration::from_secs(2), async {
            while seen.lock().unwrap().len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let summary = monitor.shutdown().await.unwrap();

        assert_eq!(summary.sent, 3);
        assert_eq!(summary.send_failures, 3);
        assert_eq!(summary.received, 2);
        assert_eq!(summary.receive_errors, 2);
        assert_eq!(*seen.lock().unwrap(), vec![0x200, 0x202]);
    }
}
