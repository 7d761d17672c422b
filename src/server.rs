//! Event loop serving connections
//!
//! Sockets are plain `std::net` ones in non-blocking mode, registered in a
//! `mio::Poll` by file descriptor. That keeps them usable in blocking mode
//! too, when a handler writes with `block` set.
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;

use crate::config::ServerContext;
use crate::conn::{Conn, Transport};


const LISTENER: Token = Token(usize::MAX);
/// Timeouts are checked at least this often
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const EVENTS_CAPACITY: usize = 1024;

struct Socket(TcpStream);

impl Transport for Socket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }
    fn set_blocking(&mut self, blocking: bool, timeout: Duration)
        -> io::Result<()>
    {
        self.0.set_nonblocking(!blocking)?;
        let timeout = Some(timeout).filter(|t| blocking && !t.is_zero());
        self.0.set_write_timeout(timeout)
    }
    fn peer_addr(&self) -> Option<SocketAddr> {
        self.0.peer_addr().ok()
    }
}

struct Entry {
    fd: RawFd,
    conn: Conn,
}

/// Listening socket with the configuration it serves
pub struct Server {
    listener: TcpListener,
    ctx: Arc<ServerContext>,
}

impl Server {
    pub fn bind<A: ToSocketAddrs>(addr: A, ctx: Arc<ServerContext>)
        -> io::Result<Server>
    {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(Server { listener, ctx })
    }
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }
    /// Serves connections in the current thread, never returns on success
    pub fn run(&self) -> io::Result<()> {
        EventLoop::new(self.listener.try_clone()?, self.ctx.clone())?.run()
    }
    /// Runs `threads` independent event loops sharing the listener
    pub fn run_threads(&self, threads: usize) -> io::Result<()> {
        let mut children = Vec::new();
        for _ in 0..threads {
            let listener = self.listener.try_clone()?;
            let ctx = self.ctx.clone();
            children.push(thread::spawn(move || {
                EventLoop::new(listener, ctx)?.run()
            }));
        }
        for child in children {
            match child.join() {
                Ok(result) => result?,
                Err(_) => {
                    return Err(io::Error::new(io::ErrorKind::Other,
                                              "event loop thread panicked"));
                }
            }
        }
        Ok(())
    }
}

struct EventLoop {
    poll: Poll,
    listener: TcpListener,
    conns: Slab<Entry>,
    ctx: Arc<ServerContext>,
}

impl EventLoop {
    fn new(listener: TcpListener, ctx: Arc<ServerContext>)
        -> io::Result<EventLoop>
    {
        let poll = Poll::new()?;
        poll.registry().register(&mut SourceFd(&listener.as_raw_fd()),
                                 LISTENER, Interest::READABLE)?;
        Ok(EventLoop {
            poll,
            listener,
            conns: Slab::with_capacity(EVENTS_CAPACITY),
            ctx,
        })
    }

    fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        let mut next_sweep = Instant::now() + SWEEP_INTERVAL;
        loop {
            match self.poll.poll(&mut events, Some(SWEEP_INTERVAL)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
            for event in &events {
                match event.token() {
                    LISTENER => self.accept(),
                    Token(key) => {
                        let entry = match self.conns.get_mut(key) {
                            Some(entry) => entry,
                            None => continue,
                        };
                        if event.is_readable() || event.is_read_closed() {
                            entry.conn.process_read_event();
                        }
                        if event.is_writable() && entry.conn.wants_write() {
                            entry.conn.process_write_event();
                        }
                        if entry.conn.is_closed() {
                            self.remove(key);
                        }
                    }
                }
            }
            let now = Instant::now();
            if now >= next_sweep {
                next_sweep = now + SWEEP_INTERVAL;
                self.sweep(now);
            }
        }
    }

    fn accept(&mut self) {
        loop {
            let (stream, addr) = match self.listener.accept() {
                Ok(pair) => pair,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                    continue;
                }
                Err(e) => {
                    error!("error accepting connection: {}", e);
                    return;
                }
            };
            if let Err(e) = self.add(stream) {
                warn!("can't serve connection from {}: {}", addr, e);
            }
        }
    }

    fn add(&mut self, stream: TcpStream) -> io::Result<()> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let fd = stream.as_raw_fd();
        let entry = self.conns.vacant_entry();
        self.poll.registry().register(&mut SourceFd(&fd),
            Token(entry.key()), Interest::READABLE | Interest::WRITABLE)?;
        let conn = Conn::new(self.ctx.clone(), Box::new(Socket(stream)));
        debug!("accepted connection {:?} as {}",
               conn.core().peer, entry.key());
        entry.insert(Entry { fd, conn });
        Ok(())
    }

    fn remove(&mut self, key: usize) {
        let entry = self.conns.remove(key);
        if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&entry.fd))
        {
            debug!("error deregistering connection {}: {}", key, e);
        }
    }

    fn sweep(&mut self, now: Instant) {
        let expired: Vec<usize> = self.conns.iter_mut()
            .filter_map(|(key, entry)| {
                if entry.conn.check_timeout(now) || entry.conn.is_closed() {
                    Some(key)
                } else {
                    None
                }
            })
            .collect();
        for key in expired {
            self.remove(key);
        }
    }
}
