use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

/// Logical owner of a materialized blob. Each slot holds at most one live handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceSlot {
    Reference,
    Result,
}

impl ResourceSlot {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reference => "reference",
            Self::Result => "result",
        }
    }
}

/// Stays comparable after release; `resolve` no longer dereferences it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ResourceHandle {
    id: u64,
    slot: ResourceSlot,
    uri: String,
    len: usize,
    mime_type: &'static str,
}

impl ResourceHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn slot(&self) -> ResourceSlot {
        self.slot
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn mime_type(&self) -> &'static str {
        self.mime_type
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    SlotOccupied {
        slot: ResourceSlot,
        live: ResourceHandle,
    },
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SlotOccupied { slot, live } => write!(
                f,
                "{} slot still holds {}; release it before materializing again",
                slot.as_str(),
                live.uri
            ),
        }
    }
}

impl std::error::Error for ResourceError {}

#[derive(Debug)]
struct Entry {
    handle: ResourceHandle,
    bytes: Vec<u8>,
}

#[derive(Debug)]
pub struct ResourceStore {
    namespace: String,
    next_id: u64,
    live: HashMap<ResourceSlot, Entry>,
}

impl ResourceStore {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            next_id: 1,
            live: HashMap::new(),
        }
    }

    pub fn materialize(
        &mut self,
        slot: ResourceSlot,
        bytes: Vec<u8>,
    ) -> Result<ResourceHandle, ResourceError> {
        if let Some(entry) = self.live.get(&slot) {
            return Err(ResourceError::SlotOccupied {
                slot,
                live: entry.handle.clone(),
            });
        }
        let id = self.next_id;
        self.next_id += 1;
        let handle = ResourceHandle {
            id,
            slot,
            uri: format!("blob:{}/{}/{id}", self.namespace, slot.as_str()),
            len: bytes.len(),
            mime_type: sniff_mime_type(&bytes),
        };
        self.live.insert(
            slot,
            Entry {
                handle: handle.clone(),
                bytes,
            },
        );
        Ok(handle)
    }

    /// Frees the buffer behind `handle`. Returns `false` when it was already released.
    pub fn release(&mut self, handle: &ResourceHandle) -> bool {
        let matches = self
            .live
            .get(&handle.slot)
            .map(|entry| entry.handle == *handle)
            .unwrap_or(false);
        if matches {
            self.live.remove(&handle.slot);
        }
        matches
    }

    pub fn release_all(&mut self) -> Vec<ResourceHandle> {
        let mut released = self
            .live
            .drain()
            .map(|(_, entry)| entry.handle)
            .collect::<Vec<ResourceHandle>>();
        released.sort_by_key(ResourceHandle::id);
        released
    }

    pub fn resolve(&self, handle: &ResourceHandle) -> Option<&[u8]> {
        self.live
            .get(&handle.slot)
            .filter(|entry| entry.handle == *handle)
            .map(|entry| entry.bytes.as_slice())
    }

    pub fn is_live(&self, handle: &ResourceHandle) -> bool {
        self.resolve(handle).is_some()
    }

    pub fn live_handle(&self, slot: ResourceSlot) -> Option<&ResourceHandle> {
        self.live.get(&slot).map(|entry| &entry.handle)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }
}

fn sniff_mime_type(bytes: &[u8]) -> &'static str {
    match image::guess_format(bytes) {
        Ok(image::ImageFormat::Jpeg) => "image/jpeg",
        Ok(image::ImageFormat::Png) => "image/png",
        Ok(image::ImageFormat::WebP) => "image/webp",
        Ok(image::ImageFormat::Gif) => "image/gif",
        Ok(image::ImageFormat::Bmp) => "image/bmp",
        _ => "application/octet-stream",
    }
}
