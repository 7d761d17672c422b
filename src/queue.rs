//! Queues connect adjacent pipeline stages
//!
//! All queues of a single request live in a `QueueSet` and refer to each
//! other by `QueueId`. The connection keeps a `ServiceRing` of queues that
//! have work pending; the ring is drained by `Ctx::service_queues` after
//! every I/O event until the pipeline reaches quiescence.
use std::any::Any;
use std::cmp::min;
use std::collections::VecDeque;
use std::ops::{Index, IndexMut};
use std::sync::Arc;

use crate::conn::ConnCore;
use crate::error::Error;
use crate::packet::Packet;
use crate::request::Request;
use crate::response::Response;
use crate::stage::Stage;


/// Fraction (in percent) of `max` below which a full queue is reopened
pub const LOW_WATER_PERCENT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(usize);

pub struct Queue {
    pub(crate) stage: Arc<dyn Stage>,
    pub direction: Direction,
    packets: VecDeque<Packet>,
    count: usize,
    /// Backpressure ceiling in bytes
    pub max: usize,
    /// A full queue reopens its producer after draining below this mark
    pub low: usize,
    /// Largest packet the queue accepts in one piece
    pub packet_size: usize,
    pub(crate) disabled: bool,
    pub(crate) full: bool,
    pub(crate) open: bool,
    pub(crate) started: bool,
    pub(crate) eof: bool,
    pub(crate) scheduled: bool,
    pub(crate) next: Option<QueueId>,
    pub(crate) prev: Option<QueueId>,
    pub(crate) pair: Option<QueueId>,
    data: Option<Box<dyn Any + Send>>,
}

impl Queue {
    fn new(stage: Arc<dyn Stage>, direction: Direction,
           max: usize, packet_size: usize)
        -> Queue
    {
        Queue {
            stage,
            direction,
            packets: VecDeque::new(),
            count: 0,
            max,
            low: max * LOW_WATER_PERCENT / 100,
            packet_size,
            disabled: false,
            full: false,
            open: false,
            started: false,
            eof: false,
            scheduled: false,
            next: None,
            prev: None,
            pair: None,
            data: None,
        }
    }
    pub fn stage(&self) -> &Arc<dyn Stage> {
        &self.stage
    }
    /// Number of bytes buffered
    pub fn count(&self) -> usize {
        self.count
    }
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }
    pub fn is_full(&self) -> bool {
        self.full
    }
    pub fn is_scheduled(&self) -> bool {
        self.scheduled
    }
    pub fn packets(&self) -> impl Iterator<Item=&Packet> {
        self.packets.iter()
    }
    pub fn first(&self) -> Option<&Packet> {
        self.packets.front()
    }
    /// Recomputes the byte count from the packets themselves
    pub fn measured_count(&self) -> usize {
        self.packets.iter().map(|p| p.len()).sum()
    }
    fn push_back(&mut self, packet: Packet) {
        self.count += packet.len();
        self.packets.push_back(packet);
    }
    fn push_front(&mut self, packet: Packet) {
        self.count += packet.len();
        self.packets.push_front(packet);
    }
    fn pop_front(&mut self) -> Option<Packet> {
        let packet = self.packets.pop_front()?;
        self.count -= packet.len();
        Some(packet)
    }
    /// Drops body data, keeping header and end markers
    pub(crate) fn discard_data(&mut self) {
        self.packets.retain(|p| !p.is_data());
        self.count = self.packets.iter().map(|p| p.len()).sum();
    }
}

/// Queues of a single request, both directions
#[derive(Default)]
pub struct QueueSet {
    queues: Vec<Queue>,
    send: Vec<QueueId>,
    receive: Vec<QueueId>,
}

impl QueueSet {
    pub fn new() -> QueueSet {
        QueueSet::default()
    }
    /// Creates a queue for `stage` linked after the last one of the
    /// direction
    pub(crate) fn add(&mut self, stage: Arc<dyn Stage>, direction: Direction,
                      max: usize, packet_size: usize)
        -> QueueId
    {
        let id = QueueId(self.queues.len());
        let mut q = Queue::new(stage, direction, max, packet_size);
        let chain = match direction {
            Direction::Send => &mut self.send,
            Direction::Receive => &mut self.receive,
        };
        if let Some(&prev) = chain.last() {
            q.prev = Some(prev);
            self.queues[prev.0].next = Some(id);
        }
        chain.push(id);
        self.queues.push(q);
        id
    }
    /// Pairs queues of the opposite directions that share a stage
    pub(crate) fn pair_up(&mut self) {
        for &s in &self.send {
            for &r in &self.receive {
                if Arc::ptr_eq(&self.queues[s.0].stage,
                               &self.queues[r.0].stage)
                {
                    self.queues[s.0].pair = Some(r);
                    self.queues[r.0].pair = Some(s);
                }
            }
        }
    }
    pub fn chain(&self, direction: Direction) -> &[QueueId] {
        match direction {
            Direction::Send => &self.send,
            Direction::Receive => &self.receive,
        }
    }
    /// First queue of the direction
    ///
    /// That is the handler for `Send` and the connector for `Receive`.
    pub fn head(&self, direction: Direction) -> Option<QueueId> {
        self.chain(direction).first().cloned()
    }
    pub fn tail(&self, direction: Direction) -> Option<QueueId> {
        self.chain(direction).last().cloned()
    }
    pub fn ids(&self) -> impl Iterator<Item=QueueId> {
        (0..self.queues.len()).map(QueueId)
    }
    pub fn len(&self) -> usize {
        self.queues.len()
    }
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
    /// Removes pending body data from every queue of the direction
    pub fn discard_data(&mut self, direction: Direction) {
        for idx in 0..self.chain(direction).len() {
            let id = self.chain(direction)[idx];
            self.queues[id.0].discard_data();
        }
    }
    /// Removes all packets from the queue, markers included
    pub fn clean(&mut self, id: QueueId) {
        let q = &mut self.queues[id.0];
        q.packets.clear();
        q.count = 0;
    }
}

impl Index<QueueId> for QueueSet {
    type Output = Queue;
    fn index(&self, id: QueueId) -> &Queue {
        &self.queues[id.0]
    }
}

impl IndexMut<QueueId> for QueueSet {
    fn index_mut(&mut self, id: QueueId) -> &mut Queue {
        &mut self.queues[id.0]
    }
}

/// Queues waiting to be serviced, in FIFO order
///
/// Membership is tracked by `Queue::scheduled`, so a queue is never in the
/// ring twice.
#[derive(Debug, Default)]
pub struct ServiceRing {
    ring: VecDeque<QueueId>,
}

impl ServiceRing {
    pub fn len(&self) -> usize {
        self.ring.len()
    }
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
    pub fn contains(&self, id: QueueId) -> bool {
        self.ring.contains(&id)
    }
    pub(crate) fn clear(&mut self) {
        self.ring.clear();
    }
    fn push(&mut self, id: QueueId) {
        self.ring.push_back(id);
    }
    fn pop(&mut self) -> Option<QueueId> {
        self.ring.pop_front()
    }
}

/// View of the pipeline from one queue, passed to every stage callback
pub struct Ctx<'a> {
    qid: QueueId,
    pub(crate) queues: &'a mut QueueSet,
    pub req: &'a mut Request,
    pub resp: &'a mut Response,
    pub conn: &'a mut ConnCore,
}

impl<'a> Ctx<'a> {
    pub(crate) fn new(qid: QueueId, queues: &'a mut QueueSet,
                      req: &'a mut Request, resp: &'a mut Response,
                      conn: &'a mut ConnCore)
        -> Ctx<'a>
    {
        Ctx { qid, queues, req, resp, conn }
    }
    /// Same context seen from another queue
    pub fn at(&mut self, qid: QueueId) -> Ctx<'_> {
        Ctx {
            qid,
            queues: &mut *self.queues,
            req: &mut *self.req,
            resp: &mut *self.resp,
            conn: &mut *self.conn,
        }
    }
    pub fn id(&self) -> QueueId {
        self.qid
    }
    pub fn queue(&self) -> &Queue {
        &self.queues[self.qid]
    }
    pub fn queue_mut(&mut self) -> &mut Queue {
        &mut self.queues[self.qid]
    }
    pub fn queues(&self) -> &QueueSet {
        self.queues
    }
    pub fn next(&self) -> Option<QueueId> {
        self.queue().next
    }
    pub fn pair(&self) -> Option<QueueId> {
        self.queue().pair
    }

    /// Stage private state of this queue
    pub fn set_data<T: Any + Send>(&mut self, value: T) {
        self.queue_mut().data = Some(Box::new(value));
    }
    pub fn data<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.queue_mut().data.as_mut().and_then(|d| d.downcast_mut())
    }
    /// Moves stage state out of the queue, use `set_data` to put it back
    pub fn take_data<T: Any + Send>(&mut self) -> Option<T> {
        let data = self.queue_mut().data.take()?;
        match data.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(other) => {
                self.queue_mut().data = Some(other);
                None
            }
        }
    }

    /// Removes the first packet of the queue
    ///
    /// When the queue was full and drains below the low water mark, the
    /// nearest disabled producer upstream is re-enabled.
    pub fn get(&mut self) -> Option<Packet> {
        let qid = self.qid;
        let packet = self.queues[qid].pop_front()?;
        let q = &mut self.queues[qid];
        if q.full && q.count < q.low.max(1) {
            q.full = false;
            let mut upstream = q.prev;
            while let Some(id) = upstream {
                if self.queues[id].disabled {
                    debug!("queue {:?} drained, enabling {:?}", qid, id);
                    self.enable(id);
                    break;
                }
                upstream = self.queues[id].prev;
            }
        }
        Some(packet)
    }
    /// Returns a packet to the head of the queue
    pub fn put_back(&mut self, packet: Packet) {
        let qid = self.qid;
        self.queues[qid].push_front(packet);
    }
    /// Appends a packet to the queue, scheduling it if `service_now`
    pub fn put_for_service(&mut self, packet: Packet, service_now: bool) {
        let qid = self.qid;
        self.queues[qid].push_back(packet);
        if service_now && !self.queues[qid].disabled {
            self.schedule(qid);
        }
    }
    /// Hands a packet over to the stage owning `qid`
    pub fn put(&mut self, qid: QueueId, packet: Packet) {
        let (stage, direction) = {
            let q = &self.queues[qid];
            (q.stage.clone(), q.direction)
        };
        let mut cx = self.at(qid);
        match direction {
            Direction::Send => stage.outgoing_data(&mut cx, packet),
            Direction::Receive => stage.incoming_data(&mut cx, packet),
        }
    }
    /// Hands a packet over to the next stage
    pub fn put_next(&mut self, packet: Packet) {
        match self.next() {
            Some(next) => self.put(next, packet),
            None => {
                warn!("packet {:?} dropped at the end of the pipeline",
                      packet);
            }
        }
    }
    pub fn schedule(&mut self, qid: QueueId) {
        let q = &mut self.queues[qid];
        if !q.scheduled {
            q.scheduled = true;
            self.conn.serviceq.push(qid);
        }
    }
    pub fn enable(&mut self, qid: QueueId) {
        self.queues[qid].disabled = false;
        self.schedule(qid);
    }
    pub fn disable(&mut self, qid: QueueId) {
        self.queues[qid].disabled = true;
    }
    /// Checks that the next queue has room for the packet
    ///
    /// The packet is split down to the room available if needed, the
    /// remainder is put back to the head of this queue. When there is no
    /// room at all, this queue is disabled and the next one is marked full
    /// and scheduled so it drains.
    pub fn will_next_accept(&mut self, packet: &mut Packet) -> bool {
        let next = match self.next() {
            Some(next) => next,
            None => return true,
        };
        let size = packet.len();
        let (max, count, packet_size) = {
            let n = &self.queues[next];
            (n.max, n.count, n.packet_size)
        };
        if size <= packet_size && size + count <= max {
            return true;
        }
        let room = min(max.saturating_sub(count), packet_size);
        if room > 0 && packet.is_data() && size > room {
            let tail = packet.split(room);
            self.put_back(tail);
            return true;
        }
        debug!("queue {:?} is full, disabling {:?}", next, self.qid);
        let qid = self.qid;
        self.disable(qid);
        self.queues[next].full = true;
        self.schedule(next);
        false
    }
    /// Shrinks a packet to what the next queue accepts in one piece
    ///
    /// A `size` of zero means no limit other than the next queue's. The
    /// remainder goes back to the head of this queue.
    pub fn resize_packet(&mut self, packet: &mut Packet, size: usize) {
        let mut size = if size == 0 { usize::max_value() } else { size };
        if let Some(next) = self.next() {
            let n = &self.queues[next];
            size = min(size, min(n.max, n.packet_size));
        }
        if size > 0 && packet.is_data() && packet.len() > size {
            let tail = packet.split(size);
            self.put_back(tail);
        }
    }
    /// Passes all packets to the next queue while it accepts them
    ///
    /// The last queue of a chain keeps its packets for its stage.
    pub fn forward_all(&mut self) {
        if self.next().is_none() {
            return;
        }
        while let Some(mut packet) = self.get() {
            if !self.will_next_accept(&mut packet) {
                self.put_back(packet);
                return;
            }
            self.put_next(packet);
        }
    }

    /// Runs service routines of scheduled queues until nothing is left
    pub fn service_queues(&mut self) {
        while !self.conn.disconnected {
            let qid = match self.conn.serviceq.pop() {
                Some(qid) => qid,
                None => break,
            };
            let q = &mut self.queues[qid];
            q.scheduled = false;
            if q.disabled {
                continue;
            }
            let (stage, direction) = (q.stage.clone(), q.direction);
            let mut cx = self.at(qid);
            match direction {
                Direction::Send => stage.outgoing_service(&mut cx),
                Direction::Receive => stage.incoming_service(&mut cx),
            }
        }
    }

    /// Writes body data from a handler
    ///
    /// Data is split into packets of the response chunk size (or the
    /// queue maximum). When the queue is over its maximum the pipeline is
    /// serviced to make room. With `block` set the socket is switched to
    /// blocking mode for that, otherwise writing stops at the first full
    /// queue and the number of bytes accepted so far is returned.
    pub fn write(&mut self, buf: &[u8], block: bool) -> Result<usize, Error> {
        let mut written = 0;
        while written < buf.len() {
            if self.conn.disconnected {
                return Err(Error::PrematureEndOfStream);
            }
            if self.queue().count >= self.queue().max
                && !self.drain(block)
            {
                break;
            }
            let limit = if self.resp.chunk_size > 0 {
                self.resp.chunk_size
            } else {
                self.queue().max
            };
            let size = min(limit, buf.len() - written);
            let packet = Packet::data(&buf[written..written+size]);
            self.put_for_service(packet, false);
            written += size;
        }
        let qid = self.qid;
        if !self.queues[qid].disabled {
            self.schedule(qid);
        }
        Ok(written)
    }
    /// Signals end of the response body
    pub fn put_end(&mut self) {
        let qid = self.qid;
        self.queues[qid].eof = true;
        self.put_for_service(Packet::end(), true);
    }
    fn drain(&mut self, block: bool) -> bool {
        let switched = block && !self.conn.is_blocking();
        if switched {
            self.conn.set_blocking(true);
        }
        loop {
            let before = self.queue().count;
            let mut cur = Some(self.qid);
            while let Some(id) = cur {
                if !self.queues[id].disabled {
                    self.schedule(id);
                }
                cur = self.queues[id].next;
            }
            self.service_queues();
            let q = self.queue();
            if q.count < q.max || !block || self.conn.disconnected {
                break;
            }
            if q.count == before && self.conn.write_blocked {
                // blocking socket timed out or refuses writes
                break;
            }
        }
        if switched {
            self.conn.set_blocking(false);
        }
        self.queue().count < self.queue().max
    }
}

/// Service routine used by stages that don't transform data
pub fn default_service(cx: &mut Ctx) {
    cx.forward_all();
}
