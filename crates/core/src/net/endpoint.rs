use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;

use super::protocol::MAX_PACKET_SIZE;

#[derive(Debug, Clone, Default)]
pub struct EndpointStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Non-blocking UDP socket shared between the tick loop and the packet
/// scheduler's sender thread.
pub struct Endpoint {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    recv_buffer: [u8; 2048],
    stats: EndpointStats,
}

impl Endpoint {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            recv_buffer: [0u8; 2048],
            stats: EndpointStats::default(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared socket handle for deferred sends on the scheduler thread.
    pub fn socket(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.socket)
    }

    pub fn stats(&self) -> &EndpointStats {
        &self.stats
    }

    pub fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        if data.len() > MAX_PACKET_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "datagram exceeds MTU",
            ));
        }

        let bytes = self.socket.send_to(data, addr)?;
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += bytes as u64;
        Ok(bytes)
    }

    /// Drains every datagram currently queued on the socket.
    pub fn recv(&mut self) -> io::Result<Vec<(Vec<u8>, SocketAddr)>> {
        let mut datagrams = Vec::new();

        loop {
            match self.socket.recv_from(&mut self.recv_buffer) {
                Ok((size, addr)) => {
                    if size < 8 {
                        // Too short to carry any header; drop silently.
                        continue;
                    }
                    self.stats.packets_received += 1;
                    self.stats.bytes_received += size as u64;
                    datagrams.push((self.recv_buffer[..size].to_vec(), addr));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }

        Ok(datagrams)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_send_recv() {
        let mut a = Endpoint::bind("127.0.0.1:0").unwrap();
        let mut b = Endpoint::bind("127.0.0.1:0").unwrap();

        a.send_to(b"hello castnet", b.local_addr()).unwrap();

        let start = std::time::Instant::now();
        loop {
            let datagrams = b.recv().unwrap();
            if !datagrams.is_empty() {
                assert_eq!(datagrams[0].0, b"hello castnet");
                assert_eq!(datagrams[0].1, a.local_addr());
                break;
            }
            assert!(start.elapsed().as_millis() < 500, "no datagram received");
            std::thread::sleep(std::time::Duration::from_millis(1));
        }

        assert_eq!(a.stats().packets_sent, 1);
        assert_eq!(b.stats().packets_received, 1);
    }

    #[test]
    fn test_oversize_send_rejected() {
        let mut a = Endpoint::bind("127.0.0.1:0").unwrap();
        let dest = a.local_addr();
        let big = vec![0u8; MAX_PACKET_SIZE + 1];
        assert!(a.send_to(&big, dest).is_err());
    }
}
