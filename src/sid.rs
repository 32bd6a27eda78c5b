use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// How long a timed-out id stays quarantined before it can be leased again
pub const TIMED_OUT_SID_GRACE: Duration = Duration::from_secs(600);

/// Per-endpoint lease pool of 16-bit stream ids.
///
/// An id released normally goes straight back to the free list. An id
/// whose request expired is parked in quarantine instead, so a late reply
/// still in flight cannot be matched against a fresh request reusing the
/// same id; the periodic sweep frees it once the grace interval passed,
/// and a session restart frees the whole quarantine at once.
///
/// Distinct from the per-stream session id.
#[derive(Debug)]
pub struct SidManager {
    inner: Mutex<SidInner>,
}

#[derive(Debug)]
struct SidInner {
    free: VecDeque<u16>,
    ceiling: u16,
    max: u16,
    in_use: HashSet<u16>,
    timed_out: HashMap<u16, Instant>,
}

impl SidManager {
    pub fn new() -> Self {
        Self::with_capacity(u16::MAX)
    }

    /// A pool with a reduced id space, used to exercise exhaustion.
    pub fn with_capacity(max: u16) -> Self {
        Self {
            inner: Mutex::new(SidInner {
                free: VecDeque::new(),
                ceiling: 1,
                max,
                in_use: HashSet::new(),
                timed_out: HashMap::new(),
            }),
        }
    }

    /// Lease an unused id.
    pub fn allocate(&self) -> Result<u16> {
        let mut inner = self.inner.lock().unwrap();
        let sid = match inner.free.pop_front() {
            Some(sid) => sid,
            None => {
                if inner.ceiling == inner.max {
                    return Err(Error::NoFreeSids);
                }
                let sid = inner.ceiling;
                inner.ceiling += 1;
                sid
            }
        };
        inner.in_use.insert(sid);
        Ok(sid)
    }

    /// Return an id to the free pool.
    pub fn release(&self, sid: u16) {
        let mut inner = self.inner.lock().unwrap();
        if inner.in_use.remove(&sid) {
            inner.free.push_back(sid);
        }
    }

    /// Park an id whose request timed out.
    pub fn time_out(&self, sid: u16) {
        let mut inner = self.inner.lock().unwrap();
        if inner.in_use.remove(&sid) {
            inner.timed_out.insert(sid, Instant::now());
        }
    }

    pub fn is_timed_out(&self, sid: u16) -> bool {
        self.inner.lock().unwrap().timed_out.contains_key(&sid)
    }

    pub fn is_in_use(&self, sid: u16) -> bool {
        self.inner.lock().unwrap().in_use.contains(&sid)
    }

    /// Free quarantined ids older than the grace interval. Driven by the
    /// channel tick.
    pub fn sweep_timed_out(&self, now: Instant) {
        let mut inner = self.inner.lock().unwrap();
        let expired: Vec<u16> = inner
            .timed_out
            .iter()
            .filter(|(_, since)| now.duration_since(**since) >= TIMED_OUT_SID_GRACE)
            .map(|(sid, _)| *sid)
            .collect();
        for sid in expired {
            inner.timed_out.remove(&sid);
            inner.free.push_back(sid);
        }
    }

    /// Free the entire quarantine. Called when the session restarts,
    /// since replies from the dead session can no longer arrive.
    pub fn release_all_timed_out(&self) {
        let mut inner = self.inner.lock().unwrap();
        let sids: Vec<u16> = inner.timed_out.keys().copied().collect();
        for sid in sids {
            inner.timed_out.remove(&sid);
            inner.free.push_back(sid);
        }
    }

    pub fn allocated_count(&self) -> usize {
        self.inner.lock().unwrap().in_use.len()
    }
}

impl Default for SidManager {
    fn default() -> Self {
        Self::new()
    }
}
