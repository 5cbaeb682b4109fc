//! Volume resolution over `mem://` URLs.

use std::collections::HashSet;
use std::sync::Mutex;

use stevedore_core::{Entry, VolumeId, VolumeResolver};

use crate::memory::parse_url;

/// Resolves an entry's volume from its `mem://volume/...` URL.
///
/// Individual volumes (or all of them) can be marked unavailable to simulate
/// unmounted or vanished destinations.
#[derive(Debug, Default)]
pub struct UrlVolumeResolver {
    unavailable: Mutex<HashSet<VolumeId>>,
    all_unavailable: Mutex<bool>,
}

impl UrlVolumeResolver {
    /// Create a resolver with every volume available.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make lookups for `volume` fail.
    pub fn mark_unavailable(&self, volume: impl Into<VolumeId>) {
        self.unavailable
            .lock()
            .expect("unavailable set poisoned")
            .insert(volume.into());
    }

    /// Make every lookup fail.
    pub fn set_all_unavailable(&self, unavailable: bool) {
        *self.all_unavailable.lock().expect("flag poisoned") = unavailable;
    }
}

impl VolumeResolver for UrlVolumeResolver {
    fn volume_id(&self, entry: &Entry) -> Option<VolumeId> {
        if *self.all_unavailable.lock().expect("flag poisoned") {
            return None;
        }
        let (volume, _) = parse_url(&entry.url)?;
        if self
            .unavailable
            .lock()
            .expect("unavailable set poisoned")
            .contains(&volume)
        {
            return None;
        }
        Some(volume)
    }
}
