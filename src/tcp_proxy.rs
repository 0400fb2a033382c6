use log::{debug, info, trace, warn};

use std::{
    io::{self, BufReader, Write},
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::cwmp::{error::CwmpError, CwmpMessage, RewriteOutcome};
use crate::http::{read_request_with_continue, should_rewrite_content};

/// Relays CWMP sessions from CPEs to the ACS, rewriting the
/// ConnectionRequestURL of every request on the way.
pub struct CwmpProxy {
    cwmp: CwmpMessage,
    acs_addr: SocketAddr,
    acs_host: String,
    connect_timeout: Duration,
    stream_timeout: Duration,
    max_body_size: usize,
}

impl CwmpProxy {
    pub fn new(
        cwmp: CwmpMessage,
        acs_addr: SocketAddr,
        acs_host: String,
        connect_timeout: Duration,
        stream_timeout: Duration,
        max_body_size: usize,
    ) -> Self {
        CwmpProxy {
            cwmp,
            acs_addr,
            acs_host,
            connect_timeout,
            stream_timeout,
            max_body_size,
        }
    }

    pub fn bind(addr: SocketAddr) -> io::Result<TcpListener> {
        TcpListener::bind(addr)
    }

    pub fn start(self, listener: TcpListener) -> JoinHandle<()> {
        match listener.local_addr() {
            Ok(from) => info!(target: "cwmpproxy", "Proxying CWMP sessions from {} to {} (connection requests via {})", from, self.acs_addr, self.cwmp.proxy_host_port()),
            Err(e) => warn!(target: "cwmpproxy", "Failed to get listen address: {}", e),
        }

        thread::spawn(self.listen_loop(listener))
    }

    fn listen_loop(self, listener: TcpListener) -> impl FnOnce() {
        let proxy = Arc::new(self);

        move || {
            for incoming_stream in listener.incoming() {
                let cpe_stream = match incoming_stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(target: "cwmpproxy", "Failed to accept incoming connection: {}", e);
                        continue;
                    }
                };

                let peer_addr = match cpe_stream.peer_addr() {
                    Ok(addr) => addr,
                    Err(e) => {
                        warn!(target: "cwmpproxy", "Failed to get peer address: {}", e);
                        continue;
                    }
                };

                set_stream_timeouts(&cpe_stream, proxy.stream_timeout, "CPE");

                let acs_stream = match TcpStream::connect_timeout(&proxy.acs_addr, proxy.connect_timeout) {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(target: "cwmpproxy", "Failed to connect to ACS {}: {}", proxy.acs_addr, e);
                        continue;
                    }
                };

                set_stream_timeouts(&acs_stream, proxy.stream_timeout, "ACS");

                let proxy = proxy.clone();

                thread::spawn(move || handle_conn(cpe_stream, acs_stream, peer_addr, proxy));

                debug!(target: "cwmpproxy", "Successfully established a session with CPE: {}", peer_addr);
            }
        }
    }
}

fn set_stream_timeouts(stream: &TcpStream, timeout: Duration, side: &str) {
    if let Err(e) = stream.set_read_timeout(Some(timeout)) {
        warn!(target: "cwmpproxy", "Failed to set read timeout on {} stream: {}", side, e);
    }
    if let Err(e) = stream.set_write_timeout(Some(timeout)) {
        warn!(target: "cwmpproxy", "Failed to set write timeout on {} stream: {}", side, e);
    }
}

fn handle_conn(
    cpe_stream: TcpStream,
    acs_stream: TcpStream,
    peer_addr: SocketAddr,
    proxy: Arc<CwmpProxy>,
) {
    let cpe_read = match cpe_stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            warn!(target: "cwmpproxy", "Failed to clone CPE stream for {}: {}", peer_addr, e);
            return;
        }
    };
    let cpe_write = cpe_stream;

    let acs_read = match acs_stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            warn!(target: "cwmpproxy", "Failed to clone ACS stream for {}: {}", peer_addr, e);
            return;
        }
    };
    let acs_write = acs_stream;

    // ACS -> CPE: responses carry the ACS's RPCs, forwarded untouched
    let acs_to_cpe = thread::spawn(move || {
        let mut acs_read = acs_read;
        let mut cpe_write = cpe_write;
        match io::copy(&mut acs_read, &mut cpe_write) {
            Ok(bytes) => {
                trace!(target: "cwmpproxy", "Copied {} bytes ACS->CPE for {}", bytes, peer_addr)
            }
            Err(e) => {
                trace!(target: "cwmpproxy", "Copy ACS->CPE ended for {}: {}", peer_addr, e)
            }
        }
        let _ = cpe_write.shutdown(Shutdown::Both);
    });

    // CPE -> ACS: one request at a time, rewritten
    if let Err(e) = forward_requests(cpe_read, acs_write, &proxy, peer_addr) {
        debug!(target: "cwmpproxy", "Request forwarding ended for {}: {}", peer_addr, e);
    }

    if let Err(e) = acs_to_cpe.join() {
        warn!(target: "cwmpproxy", "ACS->CPE thread panicked for {}: {:?}", peer_addr, e);
    }

    trace!(target: "cwmpproxy", "Closed session with: {}", peer_addr);
}

fn forward_requests(
    cpe_read: TcpStream,
    mut acs_write: TcpStream,
    proxy: &CwmpProxy,
    peer_addr: SocketAddr,
) -> io::Result<()> {
    let mut cpe_interim = cpe_read.try_clone()?;
    let mut reader = BufReader::new(cpe_read);

    let result = loop {
        let mut request = match read_request_with_continue(&mut reader, &mut cpe_interim, proxy.max_body_size) {
            Ok(Some(request)) => request,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        };

        trace!(target: "cwmpproxy", "{} {} from {}", request.method, request.target, peer_addr);

        if should_rewrite_content(&request) {
            match proxy.cwmp.replace_connection_url(&mut request) {
                Ok(RewriteOutcome::Rewritten { origin, replacement }) => {
                    info!(target: "cwmpproxy", "Rewrote ConnectionRequestURL of {}: '{}' -> '{}'", peer_addr, origin, replacement);
                }
                Ok(RewriteOutcome::Unchanged) => {
                    trace!(target: "cwmpproxy", "No ConnectionRequestURL in request from {}", peer_addr);
                }
                Err(CwmpError::Io(e)) => break Err(e),
                Err(e) => break Err(io::Error::new(io::ErrorKind::InvalidData, e)),
            }
        }

        request.set_header("Host", proxy.acs_host.as_str());

        if let Err(e) = request.write_to(&mut acs_write).and_then(|_| acs_write.flush()) {
            break Err(e);
        }

        trace!(target: "cwmpproxy", "Forwarded request from {} ({} bytes of body)", peer_addr, request.content_length.unwrap_or(0));
    };

    let _ = acs_write.shutdown(Shutdown::Write);

    result
}
