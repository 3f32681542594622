//! Interface configuration and tunable parameters.

use std::sync::Arc;

use crate::shmem::ShmemJob;
use crate::soft::SoftFabric;
use crate::types::{NiOptions, ProcessId};

/// Enumerated runtime parameters, overridable from the environment.
/// Additions require touching this enum; there is no string registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
    /// Work completions polled per progress iteration.
    WcCount,
    /// Receive buffers reposted per refill batch.
    SrqRepostSize,
    /// Connection-manager step timeout in milliseconds.
    RdmaTimeout,
    /// Largest payload carried in-band with the request header.
    MaxInline,
    /// Log verbosity applied to the logger at interface init.
    LogLevel,
}

impl Param {
    fn env_name(self) -> &'static str {
        match self {
            Param::WcCount => "PTL_WC_COUNT",
            Param::SrqRepostSize => "PTL_SRQ_REPOST_SIZE",
            Param::RdmaTimeout => "PTL_RDMA_TIMEOUT",
            Param::MaxInline => "PTL_MAX_INLINE",
            Param::LogLevel => "PTL_LOG_LEVEL",
        }
    }

    fn default_value(self) -> u64 {
        match self {
            Param::WcCount => 16,
            Param::SrqRepostSize => 16,
            Param::RdmaTimeout => 2000,
            Param::MaxInline => 512,
            Param::LogLevel => 0,
        }
    }

    /// Resolve the parameter: environment override, else the default.
    pub fn get(self) -> u64 {
        std::env::var(self.env_name())
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| self.default_value())
    }
}

/// Resolve `PTL_LOG_LEVEL` into a logger level filter.
pub fn log_level_filter() -> log::LevelFilter {
    match Param::LogLevel.get() {
        0 => log::LevelFilter::Error,
        1 => log::LevelFilter::Warn,
        2 => log::LevelFilter::Info,
        3 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

/// Implementation limits advertised by an interface.
#[derive(Debug, Clone, Copy)]
pub struct NiLimits {
    pub max_pt_index: u32,
    pub max_msg_size: u64,
    pub max_atomic_size: u64,
    pub max_entries: usize,
    pub max_mds: usize,
    pub max_cts: usize,
    pub max_eqs: usize,
    pub max_unexpected: usize,
}

impl Default for NiLimits {
    fn default() -> Self {
        Self {
            max_pt_index: 63,
            max_msg_size: 1 << 30,
            max_atomic_size: 512,
            max_entries: 1024,
            max_mds: 1024,
            max_cts: 256,
            max_eqs: 64,
            max_unexpected: 1024,
        }
    }
}

/// Shared-memory attachment for co-located peers.
#[derive(Clone)]
pub struct ShmemAttach {
    pub job: Arc<ShmemJob>,
    pub local_rank: u32,
}

/// Configuration for one network interface.
#[derive(Clone)]
pub struct NiConfig {
    pub options: NiOptions,
    pub id: ProcessId,
    pub uid: u32,
    pub limits: NiLimits,
    pub fabric: Arc<SoftFabric>,
    pub shmem: Option<ShmemAttach>,
    /// Replace blocking waits with pause-instruction polling.
    pub hard_polling: bool,
    /// Message buffers preallocated per interface.
    pub num_buffers: usize,
    /// Receive buffers kept posted with the transport.
    pub srq_depth: usize,
}

impl NiConfig {
    pub fn new(fabric: Arc<SoftFabric>, id: ProcessId, options: NiOptions) -> Self {
        Self {
            options,
            id,
            uid: 0,
            limits: NiLimits::default(),
            fabric,
            shmem: None,
            hard_polling: false,
            num_buffers: 256,
            srq_depth: 64,
        }
    }

    pub fn with_uid(mut self, uid: u32) -> Self {
        self.uid = uid;
        self
    }

    pub fn with_limits(mut self, limits: NiLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_shmem(mut self, job: Arc<ShmemJob>, local_rank: u32) -> Self {
        self.shmem = Some(ShmemAttach { job, local_rank });
        self
    }

    pub fn with_hard_polling(mut self, on: bool) -> Self {
        self.hard_polling = on;
        self
    }

    pub fn with_num_buffers(mut self, n: usize) -> Self {
        self.num_buffers = n;
        self
    }

    pub fn with_srq_depth(mut self, n: usize) -> Self {
        self.srq_depth = n;
        self
    }
}
