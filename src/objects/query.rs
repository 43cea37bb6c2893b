use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU32, Ordering};

use ash::vk;

use crate::device::backend::DeviceBackend;
use crate::objects::manager::ResourceKind;
use crate::objects::resource::{Resource, ResourcePayload};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum QueryKind {
    Occlusion,

    /// Elapsed time measured by a pair of timestamps.
    Timestamp,
}

impl QueryKind {
    /// Number of pool slots used by one query segment.
    pub fn slot_count(&self) -> u32 {
        match self {
            QueryKind::Occlusion => 1,
            QueryKind::Timestamp => 2,
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct QueryPoolDesc {
    pub handle: vk::QueryPool,
    pub kind: QueryKind,
    pub count: u32,
    pub owned: bool,
}

impl QueryPoolDesc {
    pub fn new(handle: vk::QueryPool, kind: QueryKind, count: u32) -> Self {
        Self {
            handle,
            kind,
            count,
            owned: true,
        }
    }

    pub fn external(mut self) -> Self {
        self.owned = false;
        self
    }
}

pub struct QueryPoolData {
    handle: vk::QueryPool,
    kind: QueryKind,
    count: u32,
    owned: bool,
    next: AtomicU32,
}

impl QueryPoolData {
    pub(crate) unsafe fn destroy(&self, backend: &dyn DeviceBackend) {
        if self.owned {
            backend.destroy_query_pool(self.handle);
        }
    }
}

/// A native query pool. Slots are handed out linearly to [`Query`] segments.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct QueryPool(Resource);

impl QueryPool {
    fn data(&self) -> &QueryPoolData {
        match self.0.get_payload() {
            ResourcePayload::QueryPool(data) => data,
            _ => unreachable!(),
        }
    }

    pub fn get_handle(&self) -> vk::QueryPool {
        self.data().handle
    }

    pub fn get_kind(&self) -> QueryKind {
        self.data().kind
    }

    pub fn get_count(&self) -> u32 {
        self.data().count
    }

    /// Number of slots handed out so far.
    pub fn get_allocated(&self) -> u32 {
        self.data().next.load(Ordering::Acquire)
    }

    pub fn as_resource(&self) -> &Resource {
        &self.0
    }

    /// Reserves `slots` consecutive slots and returns the index of the first one.
    fn allocate(&self, slots: u32) -> u32 {
        let data = self.data();
        let first = data.next.fetch_add(slots, Ordering::AcqRel);
        assert!(first + slots <= data.count, "Query pool exhausted ({} slots)", data.count);
        first
    }
}

impl ResourceKind for QueryPool {
    type Desc = QueryPoolDesc;

    fn into_payload(desc: QueryPoolDesc) -> ResourcePayload {
        ResourcePayload::QueryPool(QueryPoolData {
            handle: desc.handle,
            kind: desc.kind,
            count: desc.count,
            owned: desc.owned,
            next: AtomicU32::new(0),
        })
    }

    fn from_resource(resource: Resource) -> Self {
        Self(resource)
    }
}

struct QueryState {
    segments: Vec<u32>,
    in_progress: bool,
}

/// An occlusion or timestamp query.
///
/// A query that is in progress when its command buffer is submitted gets interrupted and resumed
/// on the next command buffer. Every resume starts a new segment in the pool, the result of the
/// query is the combination of all segments.
#[derive(Clone)]
pub struct Query {
    pool: QueryPool,
    state: Arc<Mutex<QueryState>>,
}

impl Query {
    pub fn new(pool: QueryPool) -> Self {
        let first = pool.allocate(pool.get_kind().slot_count());
        Self {
            pool,
            state: Arc::new(Mutex::new(QueryState {
                segments: vec![first],
                in_progress: false,
            })),
        }
    }

    pub fn get_pool(&self) -> &QueryPool {
        &self.pool
    }

    pub fn get_kind(&self) -> QueryKind {
        self.pool.get_kind()
    }

    pub fn is_in_progress(&self) -> bool {
        self.state.lock().unwrap().in_progress
    }

    /// First slot of every segment, oldest first.
    pub fn get_segments(&self) -> Vec<u32> {
        self.state.lock().unwrap().segments.clone()
    }

    /// First slot of the segment currently being recorded.
    pub fn current_slot(&self) -> u32 {
        let guard = self.state.lock().unwrap();
        guard.segments[guard.segments.len() - 1]
    }

    pub(crate) fn set_in_progress(&self, in_progress: bool) {
        self.state.lock().unwrap().in_progress = in_progress;
    }

    /// Starts a new segment and returns its first slot.
    pub(crate) fn next_segment(&self) -> u32 {
        let slot = self.pool.allocate(self.get_kind().slot_count());
        self.state.lock().unwrap().segments.push(slot);
        slot
    }

    pub fn ptr_eq(&self, other: &Query) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}
