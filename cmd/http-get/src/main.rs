//! One-shot HTTP GET
//!
//! A single resumable operation drives the whole exchange on one stepio
//! service: resolve-and-connect with the request piggy-backed, send whatever
//! did not fit, half-close, read to EOF, disconnect, stop the service.
//!
//! Usage:
//!     cargo build --release -p http-get
//!     ./target/release/http-get [host] [port] [path]
//!
//! Defaults to `example.com http /`. The response goes to stdout, progress
//! to stderr (`STEPIO_LOG_LEVEL=debug` for more).

use stepio::connect::connect_and_send;
use stepio::{ResolveAndConnect, Service, Socket};

use stepio_core::context::OpContext;
use stepio_core::descriptor::Next;
use stepio_core::error::{Error, Result};
use stepio_core::resumable::{as_resumable, Bound, Resumable};
use stepio_core::{kerror, kinfo, kprintln};

use std::io::Write;

const RECVBUF_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    OnConnect,
    Send,
    OnSend,
    Receive,
    OnReceive,
    Finished,
}

struct HttpGet {
    state: State,
    svc: Service,
    host: String,
    port: String,
    request: Vec<u8>,
    sent: usize,
    received: usize,
    connect_ctx: Bound<ResolveAndConnect>,
    io: Bound<OpContext>,
    sock: Option<Socket>,
    recvbuf: Box<[u8; RECVBUF_LEN]>,
    out: Box<dyn Write>,
    error: Option<Error>,
}

impl HttpGet {
    fn new(svc: &Service, host: &str, port: &str, path: &str, out: Box<dyn Write>) -> Box<Self> {
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            path, host
        );
        let mut op = Box::new(Self {
            state: State::Start,
            svc: svc.clone(),
            host: host.to_string(),
            port: port.to_string(),
            request: request.into_bytes(),
            sent: 0,
            received: 0,
            connect_ctx: Bound::new(ResolveAndConnect::new()),
            io: Bound::new(OpContext::new()),
            sock: None,
            recvbuf: Box::new([0u8; RECVBUF_LEN]),
            out,
            error: None,
        });
        let me = as_resumable(&mut *op);
        op.connect_ctx.bind(me);
        op.io.bind(me);
        op
    }

    /// Record the failure and stop the service.
    fn fail(&mut self, e: Error) -> Next {
        kerror!("http-get: {}", e);
        self.error = Some(e);
        self.finish()
    }

    fn finish(&mut self) -> Next {
        self.state = State::Finished;
        if let Some(mut sock) = self.sock.take() {
            sock.close();
        }
        if let Err(e) = self.svc.shutdown() {
            kerror!("http-get: posting shutdown failed: {}", e);
        }
        Next::Done
    }
}

impl Resumable for HttpGet {
    fn step(&mut self) -> Next {
        loop {
            match self.state {
                State::Start => {
                    kinfo!("connecting to {}:{}...", self.host, self.port);
                    self.state = State::OnConnect;
                    let ok = unsafe {
                        connect_and_send(&self.svc, &self.host, &self.port, &self.request, &mut self.connect_ctx)
                    };
                    if !ok {
                        return Next::Done;
                    }
                }
                State::OnConnect => {
                    if let Err(e) = self.connect_ctx.check_error() {
                        return self.fail(e);
                    }
                    self.sock = self.connect_ctx.take_socket();
                    self.sent = self.connect_ctx.transferred();
                    kinfo!(
                        "connected after {} attempt(s), sent {} bytes",
                        self.connect_ctx.attempts(),
                        self.sent
                    );
                    self.state = State::Send;
                }
                State::Send => {
                    if self.sent == self.request.len() {
                        let Some(sock) = self.sock.as_ref() else {
                            return self.fail(Error::Os(libc::ENOTCONN));
                        };
                        if let Err(e) = sock.shutdown(libc::SHUT_WR) {
                            return self.fail(e);
                        }
                        self.state = State::Receive;
                        continue;
                    }
                    kinfo!("sending {} bytes...", self.request.len() - self.sent);
                    self.state = State::OnSend;
                    let Some(sock) = self.sock.as_ref() else {
                        return self.fail(Error::Os(libc::ENOTCONN));
                    };
                    if !unsafe { sock.send(&self.request[self.sent..], 0, &mut self.io) } {
                        return Next::Done;
                    }
                }
                State::OnSend => {
                    if let Err(e) = self.io.check_error() {
                        return self.fail(e);
                    }
                    self.sent += self.io.transferred();
                    self.state = State::Send;
                }
                State::Receive => {
                    self.state = State::OnReceive;
                    let Some(sock) = self.sock.as_ref() else {
                        return self.fail(Error::Os(libc::ENOTCONN));
                    };
                    if !unsafe { sock.receive(&mut self.recvbuf[..], 0, &mut self.io) } {
                        return Next::Done;
                    }
                }
                State::OnReceive => {
                    if let Err(e) = self.io.check_error() {
                        return self.fail(e);
                    }
                    let n = self.io.transferred();
                    if n > 0 {
                        self.received += n;
                        if let Err(e) = self.out.write_all(&self.recvbuf[..n]) {
                            return self.fail(Error::Os(e.raw_os_error().unwrap_or(libc::EIO)));
                        }
                        self.state = State::Receive;
                        continue;
                    }

                    kinfo!("received {} bytes, disconnecting...", self.received);
                    let Some(sock) = self.sock.as_ref() else {
                        return self.fail(Error::Os(libc::ENOTCONN));
                    };
                    // The server may already have torn the connection down.
                    match sock.shutdown(libc::SHUT_RD) {
                        Ok(()) | Err(Error::Os(libc::ENOTCONN)) => {}
                        Err(e) => return self.fail(e),
                    }
                    sock.disconnect(&mut self.io);
                    if let Err(e) = self.io.check_error() {
                        return self.fail(e);
                    }
                    kinfo!("socket disconnected");
                    return self.finish();
                }
                State::Finished => return Next::Done,
            }
        }
    }
}

/// Dispatch completions until the service is shut down.
fn drain(svc: &Service) -> Result<()> {
    while svc.run_batch()? {}
    Ok(())
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let host = args.get(1).map(String::as_str).unwrap_or("example.com");
    let port = args.get(2).map(String::as_str).unwrap_or("http");
    let path = args.get(3).map(String::as_str).unwrap_or("/");

    let svc = match Service::new() {
        Ok(s) => s,
        Err(e) => {
            kerror!("http-get: cannot create service: {}", e);
            std::process::exit(1);
        }
    };

    let mut op = HttpGet::new(&svc, host, port, path, Box::new(std::io::stdout()));
    op.step();

    if let Err(e) = drain(&svc) {
        kerror!("http-get: service failed: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = op.out.flush() {
        kerror!("http-get: flushing output failed: {}", e);
        std::process::exit(1);
    }
    match op.error {
        Some(_) => std::process::exit(1),
        None => kprintln!("done: sent {} bytes, received {} bytes", op.sent, op.received),
    }
}
