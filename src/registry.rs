use std::{
    io,
    net::{SocketAddr, TcpListener as StdTcpListener, ToSocketAddrs},
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
};

use socket2::{Domain, SockRef, Socket, Type};

use crate::utils::{clone_fd_above, is_socket, set_cloexec, FIRST_INHERITED_FD};

const LISTEN_BACKLOG: i32 = 1024;

/// The supervisor's listening sockets, in configured address order.
///
/// The registry holds duplicates parked above the `3..3+n` range; index `i` is handed to each
/// worker as descriptor `3 + i`. Nothing in the supervisor ever accepts on them.
#[derive(Debug)]
pub(crate) struct ListenerRegistry {
    listeners: Vec<(String, OwnedFd)>,
}

impl ListenerRegistry {
    /// Bind every address. Fails on the first address that cannot be bound.
    pub(crate) fn bind(addresses: &[String]) -> io::Result<Self> {
        let min_fd = FIRST_INHERITED_FD + addresses.len() as RawFd;
        let mut listeners = Vec::with_capacity(addresses.len());
        for address in addresses {
            let addr = resolve(address)?;
            log::debug!("Binding listener {address} ({addr})");
            let listener = bind_tcp(addr)?;
            listeners.push((address.clone(), clone_fd_above(listener.as_raw_fd(), min_fd)?));
        }
        Ok(Self { listeners })
    }

    /// Take ownership of descriptors `3..3+n`, handed over by whoever exec'd this process.
    pub(crate) fn adopt(addresses: &[String], count: usize) -> io::Result<Self> {
        if count != addresses.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "inherited {count} listeners but {} addresses are configured",
                    addresses.len()
                ),
            ));
        }
        let min_fd = FIRST_INHERITED_FD + count as RawFd;
        let mut listeners = Vec::with_capacity(count);
        for (i, address) in addresses.iter().enumerate() {
            let fd = FIRST_INHERITED_FD + i as RawFd;
            if !is_socket(fd) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("inherited fd {fd} for {address} is not a socket"),
                ));
            }
            set_cloexec(fd)?;
            // SAFETY: the descriptor was handed to us for exactly this purpose and is a socket
            let inherited = unsafe { OwnedFd::from_raw_fd(fd) };
            log::debug!("Adopted inherited fd {fd} for {address}");
            listeners.push((address.clone(), clone_fd_above(inherited.as_raw_fd(), min_fd)?));
        }
        Ok(Self { listeners })
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.len()
    }

    pub(crate) fn fds_for_worker(&self) -> Vec<RawFd> {
        self.listeners.iter().map(|(_, fd)| fd.as_raw_fd()).collect()
    }

    pub(crate) fn local_addrs(&self) -> Vec<Option<SocketAddr>> {
        self.listeners
            .iter()
            .map(|(_, fd)| SockRef::from(fd).local_addr().ok()?.as_socket())
            .collect()
    }

    /// Independent copies for serving in this process, used when workers are unavailable.
    pub(crate) fn std_listeners(&self) -> io::Result<Vec<StdTcpListener>> {
        self.listeners
            .iter()
            .map(|(_, fd)| Ok(StdTcpListener::from(fd.try_clone()?)))
            .collect()
    }
}

/// Accepts `host:port` and the `:port` shorthand for all interfaces.
pub(crate) fn resolve(address: &str) -> io::Result<SocketAddr> {
    let address = match address.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => address.to_owned(),
    };
    address.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{address} did not resolve to any address"),
        )
    })
}

pub(crate) fn bind_tcp(addr: SocketAddr) -> io::Result<StdTcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::is_cloexec;

    #[test]
    fn bind_keeps_address_order_and_parks_fds_high() {
        let addresses = vec![
            "127.0.0.1:0".to_owned(),
            "127.0.0.1:0".to_owned(),
            "127.0.0.1:0".to_owned(),
        ];
        let registry = ListenerRegistry::bind(&addresses).unwrap();
        assert_eq!(registry.len(), 3);

        for fd in registry.fds_for_worker() {
            assert!(fd >= FIRST_INHERITED_FD + 3);
            assert!(is_cloexec(fd).unwrap());
        }

        // every copy we would serve from is the same socket as the registry entry
        let addrs = registry.local_addrs();
        let served: Vec<_> = registry
            .std_listeners()
            .unwrap()
            .iter()
            .map(|l| l.local_addr().ok())
            .collect();
        assert_eq!(addrs, served);
        assert!(addrs.iter().all(Option::is_some));
    }

    #[test]
    fn resolve_port_shorthand() {
        assert_eq!(
            resolve(":8080").unwrap(),
            "0.0.0.0:8080".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            resolve("127.0.0.1:9001").unwrap(),
            "127.0.0.1:9001".parse::<SocketAddr>().unwrap()
        );
        assert!(resolve("not an address").is_err());
    }

    #[test]
    fn adopt_rejects_count_mismatch() {
        let err = ListenerRegistry::adopt(&["127.0.0.1:0".to_owned()], 2).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn bind_fails_on_taken_port() {
        let taken = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap().to_string();
        // SO_REUSEADDR does not allow two listeners on one port
        assert!(ListenerRegistry::bind(&[addr]).is_err());
    }
}
