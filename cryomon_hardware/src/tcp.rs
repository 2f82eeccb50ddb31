//! Socket transport for instruments behind a terminal server or with their
//! own Ethernet port (Lakeshore 336, Moxa-attached compressors).

use std::io::Read;
use std::io::Write;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use cryomon_traits::Transport;

use crate::error::{HwError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// No instrument we speak to replies with more than this in one line.
const MAX_REPLY: usize = 4096;

#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
    peer: String,
}

impl TcpTransport {
    /// Connect to `host:port`.
    pub fn connect(hostport: &str) -> Result<Self> {
        let addr = hostport
            .to_socket_addrs()
            .map_err(|e| HwError::Connect {
                address: hostport.to_string(),
                reason: e.to_string(),
            })?
            .next()
            .ok_or_else(|| HwError::Connect {
                address: hostport.to_string(),
                reason: "does not resolve".into(),
            })?;
        let stream =
            TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).map_err(|e| HwError::Connect {
                address: hostport.to_string(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true)?;
        tracing::debug!(peer = %hostport, "instrument socket open");
        Ok(Self {
            stream,
            peer: hostport.to_string(),
        })
    }

    fn read_some(&mut self, buf: &mut [u8], deadline: Instant) -> Result<usize> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(HwError::Timeout);
            }
            self.stream.set_read_timeout(Some(remaining))?;
            match self.stream.read(buf) {
                Ok(0) => {
                    return Err(HwError::Connect {
                        address: self.peer.clone(),
                        reason: "connection closed".into(),
                    });
                }
                Ok(n) => return Ok(n),
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn recv_exact_inner(&mut self, n: usize, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut buf = vec![0u8; n];
        let mut got = 0;
        while got < n {
            got += self.read_some(&mut buf[got..], deadline)?;
        }
        Ok(buf)
    }

    fn recv_until_inner(&mut self, terminator: u8, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut out = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            self.read_some(&mut byte, deadline)?;
            out.push(byte[0]);
            if byte[0] == terminator {
                return Ok(out);
            }
            if out.len() >= MAX_REPLY {
                return Err(HwError::Overflow(MAX_REPLY));
            }
        }
    }
}

impl Transport for TcpTransport {
    fn send(
        &mut self,
        bytes: &[u8],
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.stream.write_all(bytes)?;
        self.stream.flush()?;
        Ok(())
    }

    fn recv_exact(
        &mut self,
        n: usize,
        timeout: Duration,
    ) -> std::result::Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>> {
        self.recv_exact_inner(n, timeout).map_err(Into::into)
    }

    fn recv_until(
        &mut self,
        terminator: u8,
        timeout: Duration,
    ) -> std::result::Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>> {
        self.recv_until_inner(terminator, timeout).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn line_reads_stop_at_the_terminator() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = [0u8; 64];
            let n = conn.read(&mut buf).unwrap();
            assert_eq!(&buf[..n], b"*IDN?\n");
            conn.write_all(b"LSCI,MODEL336,fake,1.0\r\nextra").unwrap();
        });

        let mut t = TcpTransport::connect(&addr.to_string()).unwrap();
        t.send(b"*IDN?\n").unwrap();
        let line = t.recv_until(b'\n', Duration::from_secs(2)).unwrap();
        assert_eq!(line, b"LSCI,MODEL336,fake,1.0\r\n");
        let rest = t.recv_exact(5, Duration::from_secs(2)).unwrap();
        assert_eq!(rest, b"extra");
        server.join().unwrap();
    }

    #[test]
    fn empty_reads_time_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (conn, _) = listener.accept().unwrap();
            // Hold the connection open but say nothing.
            thread::sleep(Duration::from_millis(300));
            drop(conn);
        });

        let mut t = TcpTransport::connect(&addr.to_string()).unwrap();
        let err = t.recv_until(b'\n', Duration::from_millis(50)).unwrap_err();
        assert!(err.to_string().contains("timed out"), "{err}");
        server.join().unwrap();
    }

    #[test]
    fn refused_connection_reports_the_address() {
        // Bind then drop to get a port nothing listens on.
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let err = TcpTransport::connect(&format!("127.0.0.1:{port}")).unwrap_err();
        assert!(err.to_string().contains(&port.to_string()), "{err}");
    }
}
