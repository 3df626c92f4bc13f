//! Stream-based accelerator provider module.
//!
//! Emulates a device with FIFO execution streams and bounded memory so that
//! asynchronous dispatch and cross-provider synchronization are exercised
//! without accelerator hardware.

pub mod provider;
pub mod worker;

pub use provider::{
    create_stream_provider_with_config, StreamExecutionProvider, StreamStatistics,
    STREAM_PROVIDER_TYPE,
};
pub use worker::{DeviceStream, StreamCounters};
