//! Bounded FIFO handing packets between the UDP pumps and the tunnel loops.

use crate::udp::UdpPacket;
use std::collections::VecDeque;
use std::sync::Mutex as StdMutex;
use tokio::sync::{mpsc, watch, Mutex, Notify};

/// A fixed-capacity multi-producer, multi-consumer packet queue.
///
/// `push` suspends while the queue is full, which is how backpressure
/// reaches the UDP socket. Consumers take turns on the shared receiver.
///
/// Packets whose delivery failed go through [`RelayQueue::requeue`]; they
/// land in a side lane that consumers drain first and that never blocks, so a
/// failing sender cannot deadlock on a full queue it is the only reader of.
///
/// After [`RelayQueue::close`], pushes drop the packet (back to the buffer
/// pool) and pops drain what is left before returning `None`.
pub struct RelayQueue {
    tx: mpsc::Sender<UdpPacket>,
    rx: Mutex<mpsc::Receiver<UdpPacket>>,
    requeued: StdMutex<VecDeque<UdpPacket>>,
    requeue_notify: Notify,
    closed: watch::Sender<bool>,
}

impl RelayQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (closed, _) = watch::channel(false);
        RelayQueue {
            tx,
            rx: Mutex::new(rx),
            requeued: StdMutex::new(VecDeque::new()),
            requeue_notify: Notify::new(),
            closed,
        }
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Number of queued packets, including re-queued ones.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity() + self.requeued_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Appends a packet, waiting for room. Returns `false` if the queue was
    /// closed, in which case the packet has been dropped.
    pub async fn push(&self, packet: UdpPacket) -> bool {
        if self.is_closed() {
            return false;
        }

        let mut closed = self.closed.subscribe();
        tokio::select! {
            result = self.tx.send(packet) => result.is_ok(),
            _ = closed.wait_for(|closed| *closed) => false,
        }
    }

    /// Puts back a packet whose delivery failed. Never blocks; re-queued
    /// packets are handed out before anything in the main queue.
    pub fn requeue(&self, packet: UdpPacket) -> bool {
        if self.is_closed() {
            return false;
        }

        match self.requeued.lock() {
            Ok(mut requeued) => requeued.push_back(packet),
            Err(poisoned) => poisoned.into_inner().push_back(packet),
        }
        self.requeue_notify.notify_one();
        true
    }

    /// Takes the oldest packet, waiting while the queue is empty. Returns
    /// `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<UdpPacket> {
        let mut closed = self.closed.subscribe();
        loop {
            if let Some(packet) = self.take_requeued() {
                return Some(packet);
            }

            let mut rx = tokio::select! {
                rx = self.rx.lock() => rx,
                _ = closed.wait_for(|closed| *closed) => return self.drain_one(),
            };

            tokio::select! {
                biased;
                packet = rx.recv() => return packet,
                _ = self.requeue_notify.notified() => continue,
                _ = closed.wait_for(|closed| *closed) => {
                    return self.take_requeued().or_else(|| rx.try_recv().ok());
                }
            }
        }
    }

    /// Marks the queue closed and wakes every waiting producer and consumer.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    fn take_requeued(&self) -> Option<UdpPacket> {
        match self.requeued.lock() {
            Ok(mut requeued) => requeued.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        }
    }

    fn requeued_len(&self) -> usize {
        match self.requeued.lock() {
            Ok(requeued) => requeued.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    fn drain_one(&self) -> Option<UdpPacket> {
        self.take_requeued().or_else(|| {
            self.rx
                .try_lock()
                .ok()
                .and_then(|mut rx| rx.try_recv().ok())
        })
    }
}
