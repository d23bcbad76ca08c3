
use super::packet;
use crate::interface::InterfaceId;

use socket2::{Domain, Protocol, Socket, Type};

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

use std::ffi::c_int;
use std::os::fd::AsRawFd;
use std::sync::Arc;

/// control message buffer, aligned for `cmsghdr`
type CmsgBuffer = [u64; 64];

#[derive(Debug)]
pub struct RawIcmp6Socket {
    socket: Socket,
}

impl RawIcmp6Socket {
    pub fn new() -> Result<Self, std::io::Error> {
        let socket = Socket::new(Domain::IPV6, Type::RAW, Some(Protocol::ICMPV6))?;
        Ok(Self { socket })
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<(), std::io::Error> {
        self.socket.set_nonblocking(nonblocking)
    }

    fn setsockopt<T: Sized>(&self, opt: Ipv6Opt, optval: &T) -> Result<(), std::io::Error> {
        let code = unsafe {
            libc::setsockopt(
                self.socket.as_raw_fd(),
                opt.level(),
                opt.optname(),
                optval as *const _ as *const libc::c_void,
                std::mem::size_of::<T>() as libc::socklen_t,
            )
        };
        if code < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    fn set_flag(&self, opt: Ipv6Opt, flag: bool) -> Result<(), std::io::Error> {
        let flag: c_int = if flag { 1 } else { 0 };
        self.setsockopt(opt, &flag)
    }

    pub fn join_multicast(&self, group: std::net::Ipv6Addr, if_index: InterfaceId) -> Result<(), std::io::Error> {
        self.socket.join_multicast_v6(&group, if_index.inner_unchecked())
    }

    pub fn leave_multicast(&self, group: std::net::Ipv6Addr, if_index: InterfaceId) -> Result<(), std::io::Error> {
        self.socket.leave_multicast_v6(&group, if_index.inner_unchecked())
    }

    pub fn set_multicast_hops(&self, hops: u32) -> Result<(), std::io::Error> {
        self.socket.set_multicast_hops_v6(hops)
    }

    pub fn set_multicast_loop(&self, loopback: bool) -> Result<(), std::io::Error> {
        self.socket.set_multicast_loop_v6(loopback)
    }

    pub fn set_recv_pktinfo(&self, recv_pktinfo: bool) -> Result<(), std::io::Error> {
        self.set_flag(Ipv6Opt::IPV6_RECVPKTINFO, recv_pktinfo)
    }

    pub fn set_recv_hopopts(&self, recv_hopopts: bool) -> Result<(), std::io::Error> {
        self.set_flag(Ipv6Opt::IPV6_RECVHOPOPTS, recv_hopopts)
    }

    pub fn set_recv_hoplimit(&self, recv_hoplimit: bool) -> Result<(), std::io::Error> {
        self.set_flag(Ipv6Opt::IPV6_RECVHOPLIMIT, recv_hoplimit)
    }

    /// Registers as the multicast routing socket, which makes the kernel hand
    /// every MLD message to us regardless of group membership.
    pub fn set_mrt_flag(&self, flag: bool) -> Result<(), std::io::Error> {
        let opt = if flag { Ipv6Opt::MRT6_INIT } else { Ipv6Opt::MRT6_DONE };
        let flag: c_int = 1;
        self.setsockopt(opt, &flag)
    }

    /// Applies every option a host-side MLD listener needs.
    pub fn setup_mld_listener(&self) -> Result<(), std::io::Error> {
        self.set_recv_hoplimit(true)?;
        self.set_recv_hopopts(true)?;
        self.set_recv_pktinfo(true)?;
        self.set_multicast_hops(1)?;
        self.set_multicast_loop(false)
    }

    pub fn recv(&self, packet: &mut packet::Packet) -> Result<(), std::io::Error> {
        packet.data.resize(packet::Packet::MAX_LEN, 0);
        let mut cmsg: CmsgBuffer = [0; 64];
        let mut src: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
        let mut info: libc::msghdr = unsafe { std::mem::zeroed() };

        info.msg_name = &mut src as *mut _ as *mut libc::c_void;
        info.msg_namelen = std::mem::size_of_val(&src) as libc::socklen_t;

        let mut iov = [libc::iovec {
            iov_base: packet.data.as_mut_ptr() as *mut libc::c_void,
            iov_len: packet.data.len(),
        }];
        info.msg_iov = iov.as_mut_ptr();
        info.msg_iovlen = iov.len() as _;

        info.msg_control = cmsg.as_mut_ptr() as *mut libc::c_void;
        info.msg_controllen = std::mem::size_of_val(&cmsg) as _;

        let len = unsafe { libc::recvmsg(self.socket.as_raw_fd(), &mut info, 0) };
        if len < 0 {
            packet.data.clear();
            return Err(std::io::Error::last_os_error());
        }
        packet.data.truncate(len as usize);

        packet.target_addr = src.sin6_addr.s6_addr.into();
        packet.info = None;
        packet.hop_limit = None;
        packet.hop_by_hop = None;

        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&info as *const libc::msghdr).as_ref();

            #[allow(clippy::cast_ptr_alignment)]
            while let Some(chdr) = cmsg {
                let data = libc::CMSG_DATA(chdr as *const _);
                match (chdr.cmsg_level, chdr.cmsg_type) {
                    (libc::IPPROTO_IPV6, libc::IPV6_PKTINFO) => {
                        let pktinfo = std::ptr::read_unaligned(data as *const libc::in6_pktinfo);
                        let dst: std::net::Ipv6Addr = pktinfo.ipi6_addr.s6_addr.into();
                        let if_index = InterfaceId::new(pktinfo.ipi6_ifindex as libc::c_uint);
                        packet.info = Some(packet::PacketInfo { addr: dst, if_index });
                    }

                    (libc::IPPROTO_IPV6, libc::IPV6_HOPOPTS) => {
                        let len = (chdr.cmsg_len as usize).saturating_sub(libc::CMSG_LEN(0) as usize);
                        let hbh = std::slice::from_raw_parts(data, len);
                        packet.hop_by_hop = Some(packet::PacketHopByHop { hop_by_hop: hbh.to_vec() });
                    }

                    (libc::IPPROTO_IPV6, libc::IPV6_HOPLIMIT) => {
                        let hoplimit = std::ptr::read_unaligned(data as *const libc::c_int);
                        packet.hop_limit = Some(packet::PacketHopLimit { hop_limit: hoplimit as u8 });
                    }

                    _ => {
                        log::debug!("unknown control message: level={}, type={}", chdr.cmsg_level, chdr.cmsg_type);
                    }
                }

                cmsg = libc::CMSG_NXTHDR(&info as *const libc::msghdr, chdr as *const _).as_ref();
            }
        }

        Ok(())
    }

    pub fn recv_parser(&self, parser: &mut super::Icmp6Parser) -> Result<(), std::io::Error> {
        self.recv(&mut parser.packet)
    }

    pub fn send(&self, packet: &packet::Packet) -> Result<(), std::io::Error> {
        let scope_id = packet.info.map(|info| info.if_index.inner_unchecked()).unwrap_or(0);
        let dst = libc::sockaddr_in6 {
            sin6_family: libc::AF_INET6 as libc::sa_family_t,
            sin6_port: 0,
            sin6_flowinfo: 0,
            sin6_addr: libc::in6_addr { s6_addr: packet.target_addr.octets() },
            sin6_scope_id: scope_id,
        };

        let mut info: libc::msghdr = unsafe { std::mem::zeroed() };
        info.msg_name = &dst as *const _ as *mut _;
        info.msg_namelen = std::mem::size_of_val(&dst) as libc::socklen_t;

        let mut iov = [libc::iovec {
            iov_base: packet.data.as_ptr() as *mut _,
            iov_len: packet.data.len() as libc::size_t,
        }];
        info.msg_iov = iov.as_mut_ptr();
        info.msg_iovlen = iov.len() as _;

        let mut cmsg_buf: CmsgBuffer = [0; 64];
        info.msg_control = cmsg_buf.as_mut_ptr() as *mut _;
        info.msg_controllen = std::mem::size_of_val(&cmsg_buf) as _;

        let mut controls: Vec<(c_int, Vec<u8>)> = Vec::new();
        if let Some(pktinfo) = &packet.info {
            let mut raw: libc::in6_pktinfo = unsafe { std::mem::zeroed() };
            raw.ipi6_addr = libc::in6_addr { s6_addr: pktinfo.addr.octets() };
            raw.ipi6_ifindex = pktinfo.if_index.inner_unchecked() as _;
            let bytes = unsafe {
                std::slice::from_raw_parts(&raw as *const _ as *const u8, std::mem::size_of::<libc::in6_pktinfo>())
            };
            controls.push((libc::IPV6_PKTINFO, bytes.to_vec()));
        }
        if let Some(hop_limit) = &packet.hop_limit {
            controls.push((libc::IPV6_HOPLIMIT, (hop_limit.hop_limit as c_int).to_ne_bytes().to_vec()));
        }
        if let Some(hop_by_hop) = &packet.hop_by_hop {
            controls.push((libc::IPV6_HOPOPTS, hop_by_hop.hop_by_hop.clone()));
        }

        let mut cmsg_len: usize = 0;
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&info);
            for (cmsg_type, payload) in controls.iter() {
                let hdr = cmsg.as_mut().ok_or_else(|| std::io::Error::other("control buffer exhausted"))?;
                hdr.cmsg_level = libc::IPPROTO_IPV6;
                hdr.cmsg_type = *cmsg_type;
                hdr.cmsg_len = libc::CMSG_LEN(payload.len() as libc::c_uint) as _;
                std::ptr::copy_nonoverlapping(payload.as_ptr(), libc::CMSG_DATA(hdr), payload.len());
                cmsg_len += libc::CMSG_SPACE(payload.len() as libc::c_uint) as usize;
                cmsg = libc::CMSG_NXTHDR(&info, hdr);
            }
        }

        if cmsg_len == 0 {
            info.msg_control = std::ptr::null_mut();
        }
        info.msg_controllen = cmsg_len as _;

        let code = unsafe { libc::sendmsg(self.socket.as_raw_fd(), &info, 0) };
        if code < 0 {
            return Err(std::io::Error::last_os_error());
        }

        Ok(())
    }

    pub fn send_writer(&self, writer: &super::Icmp6Writer) -> Result<(), std::io::Error> {
        self.send(&writer.packet)
    }

    pub fn into_async(self) -> Result<AsyncIcmp6Socket, std::io::Error> {
        AsyncIcmp6Socket::new(self)
    }
}

impl AsRawFd for RawIcmp6Socket {
    fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        self.socket.as_raw_fd()
    }
}

#[derive(Debug, Clone)]
pub struct AsyncIcmp6Socket {
    inner: Arc<AsyncFd<RawIcmp6Socket>>,
}

impl AsyncIcmp6Socket {
    pub(crate) fn new(socket: RawIcmp6Socket) -> Result<Self, std::io::Error> {
        socket.set_nonblocking(true)?;
        let inner = Arc::new(AsyncFd::with_interest(socket, Interest::READABLE | Interest::WRITABLE)?);
        Ok(Self { inner })
    }

    pub fn get_ref(&self) -> &RawIcmp6Socket {
        self.inner.get_ref()
    }

    pub async fn recv(&self, packet: &mut packet::Packet) -> Result<(), std::io::Error> {
        loop {
            let mut guard = self.inner.readable().await?;
            match guard.try_io(|inner| inner.get_ref().recv(packet)) {
                Ok(res) => {
                    return res;
                }

                Err(_) => continue,
            }
        }
    }

    pub async fn recv_parser(&self, parser: &mut super::Icmp6Parser) -> Result<(), std::io::Error> {
        self.recv(&mut parser.packet).await
    }

    /// Sends without waiting; a full socket buffer is reported as an error.
    pub fn try_send(&self, packet: &packet::Packet) -> Result<(), std::io::Error> {
        self.inner.get_ref().send(packet)
    }

    pub async fn send(&self, packet: &packet::Packet) -> Result<(), std::io::Error> {
        loop {
            let mut guard = self.inner.writable().await?;
            match guard.try_io(|inner| inner.get_ref().send(packet)) {
                Ok(res) => {
                    return res;
                }

                Err(_) => continue,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv6Opt(c_int);

impl Ipv6Opt {
    pub const IPV6_RECVPKTINFO: Self = Self(libc::IPV6_RECVPKTINFO);
    pub const IPV6_RECVHOPOPTS: Self = Self(libc::IPV6_RECVHOPOPTS);
    pub const IPV6_RECVHOPLIMIT: Self = Self(libc::IPV6_RECVHOPLIMIT);

    const MRT6_BASE: c_int = 200;
    pub const MRT6_INIT: Self = Self(Self::MRT6_BASE);
    pub const MRT6_DONE: Self = Self(Self::MRT6_BASE + 1);

    fn level(&self) -> c_int {
        libc::IPPROTO_IPV6
    }

    fn optname(&self) -> c_int {
        self.0
    }
}
