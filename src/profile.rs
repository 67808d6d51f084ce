//! Resident memory sampling around a single phase of work.
//!
//! The phase runs on the calling thread while a scoped sampler thread
//! records the process resident set size every `interval`. One sample is
//! taken right before and right after the phase, so even a phase shorter
//! than the interval yields a usable peak.

use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use tracing::trace;

const KB_PER_MB: f64 = 1024.0;

/// Runs `phase` and returns its output together with the resident memory
/// samples (in MB) taken while it ran.
pub fn memory_usage<T>(interval: Duration, phase: impl FnOnce() -> T) -> Result<(T, Vec<f64>)> {
    let done = AtomicBool::new(false);
    let mut samples = vec![resident_memory_mb()?];

    let (output, sampled) = std::thread::scope(|scope| {
        let sampler = scope.spawn(|| {
            let mut samples = Vec::new();
            while !done.load(Ordering::Acquire) {
                // A failed read only loses one sample
                if let Ok(mb) = resident_memory_mb() {
                    samples.push(mb);
                }
                std::thread::park_timeout(interval);
            }
            samples
        });

        let output = phase();

        done.store(true, Ordering::Release);
        sampler.thread().unpark();
        (output, sampler.join())
    });

    samples.extend(sampled.map_err(|_| anyhow!("memory sampler thread panicked"))?);
    samples.push(resident_memory_mb()?);
    trace!("collected {} memory samples", samples.len());

    Ok((output, samples))
}

/// Largest sample, or zero when there are none
pub fn peak(samples: &[f64]) -> f64 {
    samples.iter().copied().fold(0.0, f64::max)
}

/// Current resident set size of this process in MB
#[cfg(target_os = "linux")]
pub fn resident_memory_mb() -> Result<f64> {
    let status =
        std::fs::read_to_string("/proc/self/status").context("failed to read /proc/self/status")?;
    let line = status
        .lines()
        .find(|line| line.starts_with("VmRSS:"))
        .ok_or_else(|| anyhow!("VmRSS missing from /proc/self/status"))?;

    // Format: "VmRSS:     123456 kB"
    let rss_kb: f64 = line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| anyhow!("malformed VmRSS line {line:?}"))?
        .parse()
        .with_context(|| format!("malformed VmRSS line {line:?}"))?;
    Ok(rss_kb / KB_PER_MB)
}

/// Current resident set size of this process in MB
#[cfg(not(target_os = "linux"))]
pub fn resident_memory_mb() -> Result<f64> {
    let pid = std::process::id();

    // ps -o rss= -p <pid> prints the RSS in KB
    let output = std::process::Command::new("ps")
        .args(["-o", "rss=", "-p", &pid.to_string()])
        .output()
        .context("failed to run ps")?;
    let rss_kb: f64 = String::from_utf8(output.stdout)
        .context("ps output is not utf-8")?
        .trim()
        .parse()
        .context("failed to parse ps output")?;
    Ok(rss_kb / KB_PER_MB)
}

#[test]
fn test_resident_memory_is_positive() {
    let mb = resident_memory_mb().unwrap();
    assert!(mb > 0.0);
    assert!(mb < 1_000_000.0);
}

#[test]
fn test_memory_usage_returns_output_and_samples() {
    let (sum, samples) = memory_usage(Duration::from_millis(5), || {
        std::thread::sleep(Duration::from_millis(30));
        (1..=10).sum::<i32>()
    })
    .unwrap();
    assert_eq!(sum, 55);
    assert!(samples.len() >= 2);
    assert!(samples.iter().all(|&mb| mb > 0.0));
}

#[test]
fn test_memory_usage_sees_allocation() {
    const BYTES: usize = 64 * 1024 * 1024;
    let (_, samples) = memory_usage(Duration::from_millis(1), || {
        let buffer = vec![1u8; BYTES];
        std::thread::sleep(Duration::from_millis(20));
        buffer.iter().map(|&b| b as usize).sum::<usize>()
    })
    .unwrap();
    let growth = peak(&samples) - samples[0];
    assert!(growth > 32.0, "expected growth above 32 MB, saw {growth}");
}

#[test]
fn test_peak() {
    assert_eq!(peak(&[]), 0.0);
    assert_eq!(peak(&[1.0, 3.5, 2.0]), 3.5);
}
