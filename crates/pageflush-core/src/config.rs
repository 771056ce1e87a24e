//! Configuration management for pageflush
//!
//! Provides presets for different hardware classes. Loading values from a
//! file or the environment is left to the embedding process.

use std::time::Duration;

use crate::checksum::CHECKSUM_STRIDE;
use crate::page::PAGE_HEADER_SIZE;

/// Flush engine configuration with hardware-class presets
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of writer threads draining the dirty page queue
    pub writer_threads: usize,
    /// Fixed capacity of the dirty page queue (slots)
    pub queue_capacity: usize,
    /// Pages staged per double-write batch before a durable flush
    pub staging_pages: usize,
    /// Page size in bytes
    pub page_size: usize,
    /// Maximum pages flushed per second outside of drains
    pub max_flush_rate: u64,
    /// Time between background flush rounds
    pub round_interval: Duration,
    /// Sleep used by poll loops (writer idle wait, round completion wait)
    pub poll_interval: Duration,
    /// Queue fill ratio above which the rate limit is ignored
    pub high_water_ratio: f64,
}

impl Config {
    /// Server-class: many cores, fast NVMe
    pub fn server() -> Self {
        Self {
            writer_threads: 4,
            queue_capacity: 64 * 1024,
            staging_pages: 64,
            page_size: 8192,
            max_flush_rate: 40_000,
            round_interval: Duration::from_millis(100),
            poll_interval: Duration::from_millis(1),
            high_water_ratio: 0.9,
        }
    }

    /// Desktop-class: a few cores, consumer SSD
    pub fn desktop() -> Self {
        Self {
            writer_threads: 2,
            queue_capacity: 16 * 1024,
            staging_pages: 32,
            page_size: 8192,
            max_flush_rate: 10_000,
            round_interval: Duration::from_millis(200),
            poll_interval: Duration::from_millis(2),
            high_water_ratio: 0.85,
        }
    }

    /// Small devices: single writer, small queue
    pub fn small() -> Self {
        Self {
            writer_threads: 1,
            queue_capacity: 1024,
            staging_pages: 16,
            page_size: 4096,
            max_flush_rate: 2_000,
            round_interval: Duration::from_millis(500),
            poll_interval: Duration::from_millis(5),
            high_water_ratio: 0.8,
        }
    }

    /// Pages one background round may flush under the rate limit.
    pub fn pages_per_round(&self) -> usize {
        let per_round = self.max_flush_rate as u128 * self.round_interval.as_millis() / 1000;
        (per_round as usize).max(1)
    }

    /// Queue depth at which the rate limit is ignored.
    pub fn high_water_depth(&self) -> usize {
        ((self.queue_capacity as f64) * self.high_water_ratio).ceil() as usize
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.writer_threads == 0 || self.writer_threads > 64 {
            return Err("writer_threads must be in [1, 64]".into());
        }
        if self.queue_capacity == 0 {
            return Err("queue_capacity must be > 0".into());
        }
        if self.staging_pages == 0 {
            return Err("staging_pages must be > 0".into());
        }
        if self.page_size < PAGE_HEADER_SIZE || self.page_size % CHECKSUM_STRIDE != 0 {
            return Err(format!(
                "page_size must be a multiple of {} and at least {}",
                CHECKSUM_STRIDE, PAGE_HEADER_SIZE
            ));
        }
        if self.page_size > 64 * 1024 {
            return Err("page_size must be <= 64KB".into());
        }
        if self.max_flush_rate == 0 {
            return Err("max_flush_rate must be > 0".into());
        }
        if self.round_interval.as_millis() == 0 {
            return Err("round_interval must be > 0".into());
        }
        if self.poll_interval.is_zero() || self.poll_interval > self.round_interval {
            return Err("poll_interval must be > 0 and <= round_interval".into());
        }
        if self.high_water_ratio <= 0.0 || self.high_water_ratio > 1.0 {
            return Err("high_water_ratio must be in (0.0, 1.0]".into());
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self { Self::server() }
}
