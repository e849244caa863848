//! Kernel TCP statistics for interval enrichment.

/// Subset of `TCP_INFO` reported per interval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpStats {
    /// Smoothed round-trip time in microseconds.
    pub rtt_us: u32,
    /// Retransmitted segments over the life of the connection.
    pub total_retrans: u32,
    pub snd_cwnd: u32,
}

#[cfg(unix)]
pub type RawSocket = std::os::unix::io::RawFd;
#[cfg(not(unix))]
pub type RawSocket = ();

#[cfg(unix)]
pub fn raw_socket(stream: &tokio::net::TcpStream) -> Option<RawSocket> {
    use std::os::unix::io::AsRawFd;
    Some(stream.as_raw_fd())
}

#[cfg(not(unix))]
pub fn raw_socket(_stream: &tokio::net::TcpStream) -> Option<RawSocket> {
    None
}

/// Reads `TCP_INFO` from an open socket. The caller guarantees the socket has
/// not been closed.
#[cfg(target_os = "linux")]
pub fn read(fd: RawSocket) -> Option<TcpStats> {
    use std::mem;

    let mut info: libc::tcp_info = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::tcp_info>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_TCP,
            libc::TCP_INFO,
            &mut info as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return None;
    }
    Some(TcpStats {
        rtt_us: info.tcpi_rtt,
        total_retrans: info.tcpi_total_retrans,
        snd_cwnd: info.tcpi_snd_cwnd,
    })
}

#[cfg(not(target_os = "linux"))]
pub fn read(_fd: RawSocket) -> Option<TcpStats> {
    None
}
