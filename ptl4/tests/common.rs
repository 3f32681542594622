//! Shared helpers for the integration tests.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ptl4::{
    Error, Event, EventKind, EqHandle, Ni, NiConfig, NiOptions, ProcessId, Sge, SoftFabric,
};

/// A registered memory region kept alive for the test's duration.
pub struct Region {
    pub mem: Box<[u8]>,
    pub cookie: u32,
}

impl Region {
    pub fn new(ni: &Ni, len: usize) -> Region {
        let mut mem = vec![0u8; len].into_boxed_slice();
        let cookie = unsafe { ni.register_region(mem.as_mut_ptr(), len) };
        Region { mem, cookie }
    }

    pub fn sge(&self) -> Sge {
        Sge {
            cookie: self.cookie,
            offset: 0,
            len: self.mem.len() as u64,
        }
    }
}

/// Bring up a physical interface on the fabric.
pub fn phys_ni(fabric: &Arc<SoftFabric>, nid: u32, pid: u32, matching: bool) -> Ni {
    let _ = env_logger::builder().is_test(true).try_init();
    let options = if matching {
        NiOptions::MATCHING
    } else {
        NiOptions::empty()
    };
    Ni::init(NiConfig::new(
        fabric.clone(),
        ProcessId::new(nid, pid),
        options,
    ))
    .expect("ni init")
}

/// Wait until an event of `kind` shows up, skipping others.
pub fn wait_kind(ni: &Ni, eq: EqHandle, kind: EventKind) -> Event {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match ni.eq_wait_timeout(eq, Duration::from_millis(100)) {
            Ok(ev) if ev.kind == kind => return ev,
            Ok(_) => continue,
            Err(Error::EqEmpty) | Err(Error::EqDropped) => {
                if Instant::now() > deadline {
                    panic!("timed out waiting for {:?}", kind);
                }
            }
            Err(e) => panic!("eq error while waiting for {:?}: {}", kind, e),
        }
    }
}

/// Fill a buffer with a deterministic pattern.
pub fn fill_pattern(buf: &mut [u8], seed: u8) {
    for (i, b) in buf.iter_mut().enumerate() {
        *b = seed.wrapping_add(i as u8).wrapping_mul(31);
    }
}
