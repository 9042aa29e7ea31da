use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::socket::error::SocketError;

pub const MAX_LISTENER_PORT: u16 = 32767;
pub const MIN_CLIENT_PORT: u16 = 32768;
pub const MAX_CLIENT_PORT: u16 = u16::MAX;

const NUM_CLIENT_PORTS: u32 = MAX_CLIENT_PORT as u32 - MIN_CLIENT_PORT as u32 + 1;

pub fn is_listener_port(port: u16) -> bool {
    port <= MAX_LISTENER_PORT
}

/// Maps local port numbers to whatever is bound to them. Ports are split in two ranges: listener
///  ports are chosen by the application, and client ports are allocated by probing from a
///  cursor that advances with every allocation so that recently freed ports are not reused
///  right away.
pub struct PortTable<S> {
    bound: FxHashMap<u16, Arc<S>>,
    client_cursor: u32,
}

impl<S> Default for PortTable<S> {
    fn default() -> Self {
        PortTable {
            bound: FxHashMap::default(),
            client_cursor: 0,
        }
    }
}

impl<S> PortTable<S> {
    pub fn get(&self, port: u16) -> Option<Arc<S>> {
        self.bound.get(&port).cloned()
    }

    pub fn len(&self) -> usize {
        self.bound.len()
    }

    pub fn bind_listener(&mut self, port: u16, create: impl FnOnce(u16) -> Arc<S>) -> Result<Arc<S>, SocketError> {
        if !is_listener_port(port) {
            return Err(SocketError::InvalidParams);
        }
        if self.bound.contains_key(&port) {
            return Err(SocketError::PortInUse);
        }
        let bound = create(port);
        self.bound.insert(port, bound.clone());
        Ok(bound)
    }

    pub fn allocate_client(&mut self, create: impl FnOnce(u16) -> Arc<S>) -> Result<Arc<S>, SocketError> {
        for i in 0..NUM_CLIENT_PORTS {
            let offset = (self.client_cursor + i) % NUM_CLIENT_PORTS;
            let port = (MIN_CLIENT_PORT as u32 + offset) as u16;
            if self.bound.contains_key(&port) {
                continue;
            }

            self.client_cursor = (offset + 1) % NUM_CLIENT_PORTS;
            let bound = create(port);
            self.bound.insert(port, bound.clone());
            return Ok(bound);
        }
        Err(SocketError::NoMorePorts)
    }

    /// Frees `port` if it is still bound to `bound`, returning whether it was
    pub fn release(&mut self, port: u16, bound: &Arc<S>) -> bool {
        match self.bound.get(&port) {
            Some(b) if Arc::ptr_eq(b, bound) => {
                self.bound.remove(&port);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::lowest(0, Ok(()))]
    #[case::highest(MAX_LISTENER_PORT, Ok(()))]
    #[case::client_range(MIN_CLIENT_PORT, Err(SocketError::InvalidParams))]
    #[case::max(MAX_CLIENT_PORT, Err(SocketError::InvalidParams))]
    fn test_bind_listener_range(#[case] port: u16, #[case] expected: Result<(), SocketError>) {
        let mut table = PortTable::<u16>::default();
        assert_eq!(table.bind_listener(port, Arc::new).map(|_| ()), expected);
    }

    #[test]
    fn test_bind_listener_exclusive() {
        let mut table = PortTable::<u16>::default();
        let first = table.bind_listener(7, Arc::new).unwrap();
        assert_eq!(table.bind_listener(7, Arc::new).err(), Some(SocketError::PortInUse));

        assert!(table.release(7, &first));
        assert!(!table.release(7, &first));
        table.bind_listener(7, Arc::new).unwrap();
    }

    #[test]
    fn test_release_requires_same_binding() {
        let mut table = PortTable::<u16>::default();
        let _first = table.bind_listener(7, Arc::new).unwrap();
        assert!(!table.release(7, &Arc::new(7)));
        assert!(table.get(7).is_some());
    }

    #[test]
    fn test_allocate_client_rotates() {
        let mut table = PortTable::<u16>::default();
        let a = table.allocate_client(Arc::new).unwrap();
        let b = table.allocate_client(Arc::new).unwrap();
        assert_eq!((*a, *b), (32768, 32769));

        assert!(table.release(32768, &a));
        assert_eq!(*table.allocate_client(Arc::new).unwrap(), 32770);
    }

    #[test]
    fn test_allocate_client_wraps_and_skips_bound() {
        let mut table = PortTable::<u16>::default();
        table.client_cursor = NUM_CLIENT_PORTS - 1;
        let _ = table.bind_listener(0, Arc::new).unwrap();

        assert_eq!(*table.allocate_client(Arc::new).unwrap(), 65535);
        let _ = table.allocate_client(Arc::new).unwrap();
        assert_eq!(table.client_cursor, 1);

        table.client_cursor = 0;
        assert_eq!(*table.allocate_client(Arc::new).unwrap(), 32769);
    }

    #[test]
    fn test_no_more_ports() {
        let mut table = PortTable::<u16>::default();
        for _ in 0..NUM_CLIENT_PORTS {
            table.allocate_client(Arc::new).unwrap();
        }
        assert_eq!(table.allocate_client(Arc::new).err(), Some(SocketError::NoMorePorts));
        table.bind_listener(5, Arc::new).unwrap();
    }
}
