use std::collections::HashMap;

use parking_lot::RwLock;

/// Source SSRC → client SSRC.
///
/// A route says "packets from this source leg go out on that client leg".
/// Reads happen on every dispatched packet, writes only on SETUP/TEARDOWN,
/// hence the `RwLock`.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: RwLock<HashMap<u32, u32>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a route; returns the client SSRC it replaced.
    pub fn insert(&self, source_ssrc: u32, client_ssrc: u32) -> Option<u32> {
        let previous = self.routes.write().insert(source_ssrc, client_ssrc);
        tracing::debug!(
            source_ssrc = format_args!("{:#010X}", source_ssrc),
            client_ssrc = format_args!("{:#010X}", client_ssrc),
            "route added"
        );
        previous
    }

    pub fn remove(&self, source_ssrc: u32) -> Option<u32> {
        let removed = self.routes.write().remove(&source_ssrc);
        if removed.is_some() {
            tracing::debug!(
                source_ssrc = format_args!("{:#010X}", source_ssrc),
                "route removed"
            );
        }
        removed
    }

    pub fn get(&self, source_ssrc: u32) -> Option<u32> {
        self.routes.read().get(&source_ssrc).copied()
    }

    pub fn contains(&self, source_ssrc: u32) -> bool {
        self.routes.read().contains_key(&source_ssrc)
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }

    pub fn clear(&self) {
        self.routes.write().clear();
    }
}
