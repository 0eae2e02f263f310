//! Bus access used by the simulation tools.
//!
//! The core never talks to a bus directly; everything goes through
//! [`Transport`]. [`NullTransport`] is the mock bus used when no adapter is
//! available, [`VirtualBus`] is an in-process loopback channel shared by any
//! number of participants.

use crate::error::TransportError;
use crate::frame::Frame;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

pub trait Transport: Send {
    fn send(&mut self, frame: &Frame) -> Result<(), TransportError>;

    /// Waits up to `timeout` for the next frame.
    fn receive(&mut self, timeout: Duration) -> Result<Option<Frame>, TransportError>;

    fn shutdown(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    fn channel_info(&self) -> String;

    /// Second handle on the same bus for sending while another thread waits
    /// in [`Transport::receive`]. Shutting the handle down leaves the bus open.
    fn send_handle(&self) -> Option<Box<dyn Transport>> {
        None
    }
}

impl Transport for Box<dyn Transport> {
    fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        (**self).send(frame)
    }

    fn receive(&mut self, timeout: Duration) -> Result<Option<Frame>, TransportError> {
        (**self).receive(timeout)
    }

    fn shutdown(&mut self) -> Result<(), TransportError> {
        (**self).shutdown()
    }

    fn channel_info(&self) -> String {
        (**self).channel_info()
    }

    fn send_handle(&self) -> Option<Box<dyn Transport>> {
        (**self).send_handle()
    }
}

/// Mock bus: accepts everything, never receives anything.
#[derive(Debug, Default)]
pub struct NullTransport;

impl Transport for NullTransport {
    fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        log::debug!("mock bus drop {frame:?}");
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> Result<Option<Frame>, TransportError> {
        std::thread::sleep(timeout);
        Ok(None)
    }

    fn channel_info(&self) -> String {
        "mock bus".to_string()
    }

    fn send_handle(&self) -> Option<Box<dyn Transport>> {
        Some(Box::new(NullTransport))
    }
}

/// Uses the opened transport, or the mock bus when opening failed.
pub fn connect_or_mock<T>(opened: Result<T, TransportError>) -> Box<dyn Transport>
where
    T: Transport + 'static,
{
    match opened {
        Ok(transport) => {
            log::info!("Connected to {}", transport.channel_info());
            Box::new(transport)
        }
        Err(err) => {
            log::warn!("Failed to connect to CAN bus ({err}), using mock bus");
            Box::new(NullTransport)
        }
    }
}

#[derive(Debug, Default)]
struct ChannelState {
    next_id: usize,
    queues: Vec<(usize, VecDeque<Frame>)>,
}

impl ChannelState {
    fn queue_mut(&mut self, id: usize) -> Option<&mut VecDeque<Frame>> {
        self.queues
            .iter_mut()
            .find(|(queue_id, _)| *queue_id == id)
            .map(|(_, queue)| queue)
    }
}

/// In-process CAN channel. Every connected [`VirtualBus`] sees the frames
/// sent by the others.
#[derive(Debug, Clone)]
pub struct VirtualChannel {
    name: String,
    inner: Arc<(Mutex<ChannelState>, Condvar)>,
}

impl VirtualChannel {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            inner: Arc::new((Mutex::new(ChannelState::default()), Condvar::new())),
        }
    }

    pub fn connect(&self, receive_own_messages: bool) -> VirtualBus {
        let (lock, _) = &*self.inner;
        let mut state = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let id = state.next_id;
        state.next_id += 1;
        state.queues.push((id, VecDeque::new()));
        log::trace!("bus #{id} connected to virtual channel '{}'", self.name);
        VirtualBus {
            channel: self.clone(),
            id,
            receive_own_messages,
            open: true,
            owner: true,
        }
    }
}

#[derive(Debug)]
pub struct VirtualBus {
    channel: VirtualChannel,
    id: usize,
    receive_own_messages: bool,
    open: bool,
    /// Send handles share the participant and never remove its queue.
    owner: bool,
}

impl Transport for VirtualBus {
    fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }
        let (lock, condvar) = &*self.channel.inner;
        let mut state = lock.lock().unwrap_or_else(PoisonError::into_inner);
        for (id, queue) in state.queues.iter_mut() {
            if *id != self.id || self.receive_own_messages {
                queue.push_back(*frame);
            }
        }
        condvar.notify_all();
        log::trace!("virtual bus #{} sent {frame:?}", self.id);
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> Result<Option<Frame>, TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }
        let id = self.id;
        let (lock, condvar) = &*self.channel.inner;
        let state = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut state, _) = condvar
            .wait_timeout_while(state, timeout, |state| {
                state.queue_mut(id).is_some_and(|queue| queue.is_empty())
            })
            .unwrap_or_else(PoisonError::into_inner);
        Ok(state.queue_mut(id).and_then(VecDeque::pop_front))
    }

    fn shutdown(&mut self) -> Result<(), TransportError> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        if self.owner {
            let (lock, _) = &*self.channel.inner;
            let mut state = lock.lock().unwrap_or_else(PoisonError::into_inner);
            state.queues.retain(|(id, _)| *id != self.id);
            log::trace!("virtual bus #{} shut down", self.id);
        }
        Ok(())
    }

    fn channel_info(&self) -> String {
        format!("virtual channel '{}'", self.channel.name)
    }

    fn send_handle(&self) -> Option<Box<dyn Transport>> {
        Some(Box::new(VirtualBus {
            channel: self.channel.clone(),
            id: self.id,
            receive_own_messages: self.receive_own_messages,
            open: self.open,
            owner: false,
        }))
    }
}

impl Drop for VirtualBus {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(id: u16) -> Frame {
        Frame::new(id, &[id as u8]).unwrap()
    }

    #[test]
    fn frames_reach_other_participants_in_order() {
        let channel = VirtualChannel::new("test");
        let mut sender = channel.connect(false);
        let mut receiver = channel.connect(false);
        for id in [0x101, 0x102, 0x103] {
            sender.send(&frame(id)).unwrap();
        }
        let timeout = Duration::from_millis(10);
        for id in [0x101, 0x102, 0x103] {
            assert_eq!(receiver.receive(timeout).unwrap(), Some(frame(id)));
        }
        assert_eq!(receiver.receive(timeout).unwrap(), None);
        assert_eq!(sender.receive(timeout).unwrap(), None);
    }

    #[test]
    fn own_messages_on_request() {
        let channel = VirtualChannel::new("loop");
        let mut bus = channel.connect(true);
        bus.send(&frame(0x200)).unwrap();
        assert_eq!(
            bus.receive(Duration::from_millis(10)).unwrap(),
            Some(frame(0x200))
        );
    }

    #[test]
    fn closed_bus_reports_errors() {
        let channel = VirtualChannel::new("closed");
        let mut bus = channel.connect(true);
        bus.shutdown().unwrap();
        assert!(matches!(bus.send(&frame(1)), Err(TransportError::Closed)));
        assert!(matches!(
            bus.receive(Duration::ZERO),
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn receive_wakes_on_send_from_other_thread() {
        let channel = VirtualChannel::new("threads");
        let mut receiver = channel.connect(false);
        let mut sender = channel.connect(false);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            sender.send(&frame(0x123)).unwrap();
        });
        let received = receiver.receive(Duration::from_secs(5)).unwrap();
        handle.join().unwrap();
        assert_eq!(received, Some(frame(0x123)));
    }

    #[test]
    fn send_handle_shares_the_participant() {
        let channel = VirtualChannel::new("handles");
        let mut bus = channel.connect(false);
        let mut peer = channel.connect(false);
        let mut handle = bus.send_handle().unwrap();
        handle.send(&frame(0x204)).unwrap();
        handle.shutdown().unwrap();
        drop(handle);

        let timeout = Duration::from_millis(10);
        assert_eq!(peer.receive(timeout).unwrap(), Some(frame(0x204)));
        assert_eq!(bus.receive(timeout).unwrap(), None);
        peer.send(&frame(0x202)).unwrap();
        assert_eq!(bus.receive(timeout).unwrap(), Some(frame(0x202)));
    }

    #[test]
    fn unavailable_bus_falls_back_to_mock() {
        let mut bus = connect_or_mock::<VirtualBus>(Err(TransportError::Timeout));
        assert_eq!(bus.channel_info(), "mock bus");
        assert!(bus.send(&frame(0x201)).is_ok());
        assert_eq!(bus.receive(Duration::ZERO).unwrap(), None);
    }
}
