use std::{
    fmt,
    io::{self, Read},
    marker::PhantomData,
    net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4},
    os::unix::io::{AsRawFd, RawFd},
    path::Path,
};

use anyhow::{anyhow, Result};
pub use logging_macro::Logging;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::{
    fs::File,
    io::{unix::AsyncFd, AsyncWriteExt, BufWriter},
};

// Strong type for raw ICMPv4 sockets
pub struct ICMPSocket(Socket);

impl ICMPSocket {
    /// Opens a non-blocking `SOCK_RAW`/`IPPROTO_ICMP` socket.
    ///
    /// With `header_included` set the socket expects callers to hand it a
    /// complete IPv4 datagram (`IP_HDRINCL`), otherwise the kernel builds the
    /// IP header. Errors are returned as plain `io::Error` so callers can
    /// inspect the kind (`PermissionDenied` without `CAP_NET_RAW`).
    pub fn new(
        bind_interface: Option<&str>,
        header_included: bool,
    ) -> io::Result<ICMPSocket> {
        let socket =
            Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))?;
        socket.set_nonblocking(true)?;
        if header_included {
            socket.set_header_included(true)?;
        }

        let socket = match bind_interface {
            Some(bi) => bind_to_device(socket, bi)?,
            None => socket,
        };

        Ok(ICMPSocket(socket))
    }
    pub fn get_mut(&mut self) -> &mut Socket {
        &mut self.0
    }
    pub fn get_ref(&self) -> &Socket {
        &self.0
    }
}

impl AsRawFd for ICMPSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

pub struct AsyncICMPSocket {
    inner: AsyncFd<ICMPSocket>,
}

impl AsyncICMPSocket {
    pub fn new(socket: ICMPSocket) -> io::Result<Self> {
        Ok(Self {
            inner: AsyncFd::new(socket)?,
        })
    }

    pub async fn send_to(
        &self,
        packet: &[u8],
        addr: Ipv4Addr,
    ) -> io::Result<usize> {
        let addr = SockAddr::from(SocketAddr::V4(SocketAddrV4::new(addr, 0)));
        loop {
            let mut guard = self.inner.writable().await?;
            match guard
                .try_io(|inner| inner.get_ref().get_ref().send_to(packet, &addr))
            {
                Ok(res) => return res,
                Err(_would_block) => continue,
            }
        }
    }

    /// Reads one datagram (IPv4 header included) into `buf`.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.inner.readable().await?;
            match guard.try_io(|inner| {
                let mut socket: &Socket = inner.get_ref().get_ref();
                socket.read(buf)
            }) {
                Ok(res) => return res,
                Err(_would_block) => continue,
            }
        }
    }
}

pub fn bind_to_device(
    socket: Socket,
    bind_interface: &str,
) -> Result<Socket, std::io::Error> {
    // Socket2 bind_device does not have nice error types, so we have to handle
    // the libc errors. In case, we get an error when binding, map it into a
    // more friendly std::io::Error. Permission errors keep their kind.
    if let Err(err) = socket.bind_device(Some(bind_interface.as_bytes())) {
        return match err.raw_os_error() {
            Some(libc::ENODEV) => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("error binding to device (`{}`): {}", bind_interface, err),
            )),
            Some(libc::EPERM) | Some(libc::EACCES) => Err(err),
            _ => Err(io::Error::new(
                io::ErrorKind::Other,
                format!("unexpected error binding device: {}", err),
            )),
        };
    }

    Ok(socket)
}

// IPv4 address of the named interface, used as the source shown when the
// client is bound with --iface.
pub fn interface_to_ipaddr(interface: &str) -> Result<IpAddr> {
    let interfaces = pnet_datalink::interfaces();
    let interface = interfaces
        .into_iter()
        .find(|iface| iface.name == interface)
        .ok_or_else(|| anyhow!("interface not found"))?;

    let ipaddr = interface
        .ips
        .into_iter()
        .find(|ip| ip.is_ipv4())
        .ok_or_else(|| anyhow!("interface has no IPv4 address"))?;

    Ok(ipaddr.ip())
}

/// A record that can be written as one CSV line. The header line is produced
/// by `#[derive(Logging)]`, the data line by the derived `Display`.
pub trait Logging {
    fn header(&self) -> String;
}

/// Appends `Logging` records to a CSV file, writing the header before the
/// first record.
pub struct Logger<T> {
    writer: BufWriter<File>,
    header_written: bool,
    _record: PhantomData<T>,
}

impl<T> Logger<T>
where
    T: Logging + fmt::Display,
{
    pub fn new(file_name: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::create(file_name.as_ref()).map_err(|e| {
            anyhow!("could not create {}: {}", file_name.as_ref().display(), e)
        })?;
        Ok(Self {
            writer: BufWriter::new(File::from_std(file)),
            header_written: false,
            _record: PhantomData,
        })
    }

    pub async fn log(&mut self, record: &T) -> Result<()> {
        if !self.header_written {
            self.writer.write_all(record.header().as_bytes()).await?;
            self.header_written = true;
        }
        self.writer.write_all(record.to_string().as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

pub struct Statistics {
    mean: f64,
    variance: f64,
    min: f64,
    max: f64,
    samples: usize,
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "mean: {:.2} variance: {:.2} standard deviation: {:.2} min: {:.2} \
             max: {:.2} samples: {}",
            self.mean(),
            self.variance(),
            self.standard_deviation(),
            self.min(),
            self.max(),
            self.samples()
        )
    }
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

impl Statistics {
    pub fn new() -> Self {
        Self {
            mean: f64::NAN,
            variance: f64::NAN,
            min: f64::NAN,
            max: f64::NAN,
            samples: 0,
        }
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }
    pub fn variance(&self) -> f64 {
        self.variance / ((self.samples) as f64)
    }
    pub fn standard_deviation(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }
    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn update(&mut self, value: f64) {
        self.samples += 1;
        if self.samples == 1 {
            self.mean = value;
            self.variance = 0.0;
            self.min = value;
            self.max = value;
        } else {
            let old_mean = self.mean;
            self.mean = old_mean + (value - old_mean) / self.samples as f64;
            self.variance =
                self.variance + (value - old_mean) * (value - self.mean);
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
    }
}
