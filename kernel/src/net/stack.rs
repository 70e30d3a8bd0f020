/// TCP/IP interface bring-up on smoltcp.
///
/// DHCP configures the interface when a server answers; otherwise the
/// QEMU user-mode defaults apply (guest 10.0.2.15/24, gateway 10.0.2.2).
/// All stack entry points go through the `NET_STACK` lock — receive
/// completions only touch the device RX queue, never the stack itself.
use alloc::vec;
use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::socket::dhcpv4;
use smoltcp::socket::tcp::{self, Socket as TcpSocket};
use smoltcp::time::Instant;
use smoltcp::wire::{EthernetAddress, IpAddress, IpCidr, Ipv4Address, Ipv4Cidr};
use spin::Mutex;

use super::device::VirtioNetDevice;
use crate::time;

pub struct NetStack {
    device: VirtioNetDevice,
    iface: Interface,
    sockets: SocketSet<'static>,
    dhcp: SocketHandle,
    configured: bool,
}

/// Global stack instance; this lock is the stack lock.
pub static NET_STACK: Mutex<Option<NetStack>> = Mutex::new(None);

impl NetStack {
    /// Bring up the interface. Requires an attached virtio-net driver.
    pub fn new() -> Option<Self> {
        let mut device = VirtioNetDevice::new();
        let mac = device.mac()?;

        let config = Config::new(EthernetAddress(mac).into());
        let mut iface = Interface::new(config, &mut device, Self::now());

        // Static fallback: QEMU user-mode defaults.
        iface.update_ip_addrs(|addrs| {
            addrs
                .push(IpCidr::Ipv4(Ipv4Cidr::new(Ipv4Address::new(10, 0, 2, 15), 24)))
                .ok();
        });
        iface
            .routes_mut()
            .add_default_ipv4_route(Ipv4Address::new(10, 0, 2, 2))
            .ok();

        let mut sockets = SocketSet::new(vec![]);
        let dhcp = sockets.add(dhcpv4::Socket::new());

        log::info!(
            "{}0: mac {:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}, mtu {}, host {}",
            super::IFACE_PREFIX,
            mac[0], mac[1], mac[2], mac[3], mac[4], mac[5],
            super::MTU,
            super::HOSTNAME,
        );

        Some(Self { device, iface, sockets, dhcp, configured: false })
    }

    fn now() -> Instant {
        Instant::from_millis((time::now_ns() / time::NANOS_PER_MS) as i64)
    }

    /// Process queued frames, advance socket state machines, and apply
    /// DHCP results. Called from the kernel poll loop.
    pub fn poll(&mut self) {
        let timestamp = Self::now();
        self.iface.poll(timestamp, &mut self.device, &mut self.sockets);

        let event = self.sockets.get_mut::<dhcpv4::Socket>(self.dhcp).poll();
        match event {
            None => {}
            Some(dhcpv4::Event::Configured(config)) => {
                self.iface.update_ip_addrs(|addrs| {
                    addrs.clear();
                    addrs.push(IpCidr::Ipv4(config.address)).ok();
                });
                if let Some(router) = config.router {
                    self.iface.routes_mut().add_default_ipv4_route(router).ok();
                }
                if !self.configured {
                    log::info!("dhcp: {}", config.address);
                    self.configured = true;
                }
            }
            Some(dhcpv4::Event::Deconfigured) => {
                self.configured = false;
            }
        }
    }

    /// Open a TCP connection; returns a handle for send/recv.
    pub fn tcp_connect(&mut self, remote_ip: Ipv4Address, remote_port: u16) -> Option<SocketHandle> {
        let rx_buf = tcp::SocketBuffer::new(vec![0u8; 65536]);
        let tx_buf = tcp::SocketBuffer::new(vec![0u8; 65536]);
        let handle = self.sockets.add(TcpSocket::new(rx_buf, tx_buf));

        let local_port = 49152 + ((time::now_ns() / time::NANOS_PER_MS) as u16 % 16384);
        let socket = self.sockets.get_mut::<TcpSocket>(handle);
        socket
            .connect(self.iface.context(), (IpAddress::Ipv4(remote_ip), remote_port), local_port)
            .ok()?;
        Some(handle)
    }

    pub fn tcp_send(&mut self, handle: SocketHandle, data: &[u8]) -> usize {
        self.sockets
            .get_mut::<TcpSocket>(handle)
            .send_slice(data)
            .unwrap_or(0)
    }

    pub fn tcp_recv(&mut self, handle: SocketHandle, buf: &mut [u8]) -> usize {
        self.sockets
            .get_mut::<TcpSocket>(handle)
            .recv_slice(buf)
            .unwrap_or(0)
    }

    pub fn tcp_is_active(&mut self, handle: SocketHandle) -> bool {
        self.sockets.get_mut::<TcpSocket>(handle).is_active()
    }

    pub fn tcp_close(&mut self, handle: SocketHandle) {
        self.sockets.get_mut::<TcpSocket>(handle).close();
    }
}

/// Initialize the global stack once the driver is attached.
pub fn init() -> bool {
    match NetStack::new() {
        Some(stack) => {
            *NET_STACK.lock() = Some(stack);
            true
        }
        None => false,
    }
}

/// Poll the global stack if it is up.
pub fn poll() {
    if let Some(stack) = NET_STACK.lock().as_mut() {
        stack.poll();
    }
}
