//! Client Registry
//!
//! Insertion-ordered set of client endpoints known to a relay server.

use std::net::SocketAddr;

/// Peer identity: address and port, compared by value.
pub type Endpoint = SocketAddr;

/// Outcome of presenting a sender to the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Already registered
    Known,
    /// Newly added
    Admitted,
    /// Not registered and the registry is full
    Rejected,
}

/// Ordered, duplicate-free list of client endpoints with an optional cap.
#[derive(Debug, Clone, Default)]
pub struct ClientRegistry {
    clients: Vec<Endpoint>,
    capacity: Option<usize>,
}

impl ClientRegistry {
    /// `None` means unbounded.
    pub fn new(capacity: Option<usize>) -> Self {
        ClientRegistry {
            clients: Vec::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.capacity.is_some_and(|cap| self.clients.len() >= cap)
    }

    pub fn contains(&self, endpoint: &Endpoint) -> bool {
        self.clients.contains(endpoint)
    }

    /// Endpoints in connection order
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.clients
    }

    pub fn admit(&mut self, endpoint: Endpoint) -> Admission {
        if self.contains(&endpoint) {
            Admission::Known
        } else if self.is_full() {
            Admission::Rejected
        } else {
            self.clients.push(endpoint);
            Admission::Admitted
        }
    }

    /// Returns whether the endpoint was present.
    pub fn remove(&mut self, endpoint: &Endpoint) -> bool {
        match self.clients.iter().position(|c| c == endpoint) {
            Some(index) => {
                self.clients.remove(index);
                true
            }
            None => false,
        }
    }

    /// Every registered endpoint except `sender`, in connection order.
    pub fn peers_of(&self, sender: &Endpoint) -> Vec<Endpoint> {
        self.clients
            .iter()
            .filter(|c| *c != sender)
            .copied()
            .collect()
    }
}
