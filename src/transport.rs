//! Packet scheduling seam and delivery receipts.

use crate::error::{LinkError, Result};
use crate::protocol::OutgoingPacket;
use crossbeam_channel::Sender;
use std::collections::VecDeque;

/// Identifies one sent packet in its delivery notification.
pub type Ticket = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryEvent {
    Acked(Ticket),
    Failed(Ticket),
}

impl DeliveryEvent {
    pub fn ticket(&self) -> Ticket {
        match self {
            DeliveryEvent::Acked(ticket) | DeliveryEvent::Failed(ticket) => *ticket,
        }
    }
}

/// Single-shot delivery notification handed to the scheduler with a packet.
///
/// A receipt dropped without being resolved reports the packet as lost, so
/// every ticket handed out is eventually answered exactly once.
#[derive(Debug)]
pub struct DeliveryReceipt {
    ticket: Ticket,
    events: Option<Sender<DeliveryEvent>>,
}

impl DeliveryReceipt {
    pub fn new(ticket: Ticket, events: Sender<DeliveryEvent>) -> Self {
        Self {
            ticket,
            events: Some(events),
        }
    }

    pub fn ticket(&self) -> Ticket {
        self.ticket
    }

    pub fn ack(mut self) {
        self.resolve(DeliveryEvent::Acked(self.ticket));
    }

    pub fn fail(mut self) {
        self.resolve(DeliveryEvent::Failed(self.ticket));
    }

    fn resolve(&mut self, event: DeliveryEvent) {
        if let Some(events) = self.events.take() {
            let _ = events.send(event);
        }
    }
}

impl Drop for DeliveryReceipt {
    fn drop(&mut self) {
        self.resolve(DeliveryEvent::Failed(self.ticket));
    }
}

/// Reliable/unreliable packet delivery with per-category throttling.
pub trait PacketScheduler {
    /// Queues a packet. `receipt` is resolved on acknowledgement or loss.
    fn send(&mut self, packet: OutgoingPacket, reliable: bool, receipt: Option<DeliveryReceipt>) -> Result<()>;
    fn close(&mut self) -> Result<()>;
    fn is_connected(&self) -> bool;
}

struct SentPacket {
    packet: OutgoingPacket,
    reliable: bool,
    receipt: Option<DeliveryReceipt>,
}

/// Records packets instead of sending them; tests resolve receipts by hand.
pub struct MemoryScheduler {
    sent: VecDeque<SentPacket>,
    connected: bool,
}

impl Default for MemoryScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryScheduler {
    pub fn new() -> Self {
        Self {
            sent: VecDeque::new(),
            connected: true,
        }
    }

    pub fn len(&self) -> usize {
        self.sent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sent.is_empty()
    }

    pub fn packets(&self) -> impl Iterator<Item = &OutgoingPacket> {
        self.sent.iter().map(|s| &s.packet)
    }

    pub fn is_reliable(&self, index: usize) -> Option<bool> {
        self.sent.get(index).map(|s| s.reliable)
    }

    /// Removes every recorded packet; their receipts report a loss.
    pub fn take_packets(&mut self) -> Vec<OutgoingPacket> {
        self.sent.drain(..).map(|s| s.packet).collect()
    }

    /// Acknowledges the oldest outstanding packet.
    pub fn ack_next(&mut self) -> Option<OutgoingPacket> {
        let sent = self.sent.pop_front()?;
        if let Some(receipt) = sent.receipt {
            receipt.ack();
        }
        Some(sent.packet)
    }

    /// Reports the oldest outstanding packet as lost.
    pub fn fail_next(&mut self) -> Option<OutgoingPacket> {
        let sent = self.sent.pop_front()?;
        if let Some(receipt) = sent.receipt {
            receipt.fail();
        }
        Some(sent.packet)
    }

    pub fn ack_all(&mut self) -> usize {
        let mut count = 0;
        while self.ack_next().is_some() {
            count += 1;
        }
        count
    }
}

impl PacketScheduler for MemoryScheduler {
    fn send(&mut self, packet: OutgoingPacket, reliable: bool, receipt: Option<DeliveryReceipt>) -> Result<()> {
        if !self.connected {
            return Err(LinkError::ConnectionClosed);
        }

        self.sent.push_back(SentPacket { packet, reliable, receipt });
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.connected = false;
        self.sent.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}
