//! Guest CPU topology resolution.
//!
//! Turns the optional cores-per-socket / threads-per-core hints of a VM
//! into a concrete `sockets x cores x threads` split of its vCPUs. Bad
//! hints never fail a request; they fall back to a safe decomposition.

use serde::Serialize;
use std::fmt;

/// Extra-configuration key carrying the cores-per-socket hint.
pub const CORES_PER_SOCKET_KEY: &str = "cpu.corespersocket";

/// Extra-configuration key carrying the threads-per-core hint.
pub const THREADS_PER_CORE_KEY: &str = "cpu.threadspercore";

/// How a topology was arrived at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TopologySource {
    /// The supplied hints divided the vCPU count exactly.
    Hinted,
    /// No hints were supplied.
    Unhinted,
    /// Hints were supplied but rejected.
    Fallback,
}

/// Resolved CPU topology. `sockets * cores * threads` always equals the
/// vCPU count it was resolved for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CpuTopology {
    pub sockets: u32,
    pub cores: u32,
    pub threads: u32,
    pub source: TopologySource,
}

impl CpuTopology {
    pub fn total(&self) -> u32 {
        self.sockets * self.cores * self.threads
    }

    /// `(sockets, cores, threads)`.
    pub fn as_tuple(&self) -> (u32, u32, u32) {
        (self.sockets, self.cores, self.threads)
    }
}

impl fmt::Display for CpuTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s/{}c/{}t", self.sockets, self.cores, self.threads)
    }
}

/// Resolve a topology for `total` vCPUs.
///
/// Zero hints are treated as absent. A zero vCPU count is treated as one.
pub fn resolve(cores_per_socket: Option<u32>, threads_per_core: Option<u32>, total: u32) -> CpuTopology {
    let total = total.max(1);
    let cores_hint = cores_per_socket.filter(|&c| c > 0);
    let threads_hint = threads_per_core.filter(|&t| t > 0);

    if cores_hint.is_none() && threads_hint.is_none() {
        return unhinted(total, TopologySource::Unhinted);
    }

    let cores = cores_hint.unwrap_or(1);
    let threads = threads_hint.unwrap_or(1);
    let per_socket = cores.saturating_mul(threads);

    if per_socket <= total && total % per_socket == 0 {
        return CpuTopology {
            sockets: total / per_socket,
            cores,
            threads,
            source: TopologySource::Hinted,
        };
    }

    // Both hints given and the thread count fits on its own: only the
    // product is wrong, so keep a single socket with every core.
    if cores_hint.is_some() && threads_hint.is_some() && total % threads == 0 {
        tracing::debug!(cores, threads, total, "cpu topology hints do not divide vcpus, using one socket");
        return CpuTopology {
            sockets: 1,
            cores: total,
            threads: 1,
            source: TopologySource::Fallback,
        };
    }

    tracing::debug!(?cores_hint, ?threads_hint, total, "rejecting cpu topology hints");
    unhinted(total, TopologySource::Fallback)
}

/// Resolve from the `cpu.*` extra-configuration hints. Unparsable values
/// count as absent.
pub fn resolve_from_details(cores: Option<&str>, threads: Option<&str>, total: u32) -> CpuTopology {
    let parse = |v: Option<&str>| v.and_then(|s| s.trim().parse::<u32>().ok());
    resolve(parse(cores), parse(threads), total)
}

/// Two sockets when the count is even, otherwise one single-core socket per vCPU.
fn unhinted(total: u32, source: TopologySource) -> CpuTopology {
    if total % 2 == 0 {
        CpuTopology {
            sockets: 2,
            cores: total / 2,
            threads: 1,
            source,
        }
    } else {
        CpuTopology {
            sockets: total,
            cores: 1,
            threads: 1,
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_golden_table() {
        let cases: [(Option<u32>, Option<u32>, u32, (u32, u32, u32)); 14] = [
            (Some(2), None, 8, (4, 2, 1)),
            (Some(4), None, 8, (2, 4, 1)),
            (None, None, 8, (2, 4, 1)),
            (None, None, 12, (2, 6, 1)),
            (Some(2), Some(2), 8, (2, 2, 2)),
            (Some(1), Some(2), 8, (4, 1, 2)),
            (None, Some(2), 8, (4, 1, 2)),
            (None, Some(2), 6, (3, 1, 2)),
            (Some(2), Some(2), 12, (3, 2, 2)),
            (Some(2), Some(2), 6, (1, 6, 1)),
            (None, None, 3, (3, 1, 1)),
            (Some(2), None, 3, (3, 1, 1)),
            (Some(2), Some(3), 8, (2, 4, 1)),
            (Some(2), Some(1), 1, (1, 1, 1)),
        ];

        for (cores, threads, total, expected) in cases {
            let topo = resolve(cores, threads, total);
            assert_eq!(
                topo.as_tuple(),
                expected,
                "resolve({:?}, {:?}, {})",
                cores,
                threads,
                total
            );
            assert_eq!(topo.total(), total);
        }
    }

    #[test]
    fn test_divisible_hints_multiply_back() {
        for total in 1..=64u32 {
            for cores in 1..=8u32 {
                for threads in 1..=4u32 {
                    if total % (cores * threads) != 0 {
                        continue;
                    }
                    let topo = resolve(Some(cores), Some(threads), total);
                    assert_eq!(topo.source, TopologySource::Hinted);
                    assert_eq!(topo.sockets * cores * threads, total);
                }
            }
        }
    }

    #[test]
    fn test_fallback_always_decomposes() {
        for total in 1..=32u32 {
            for cores in 0..=9u32 {
                for threads in 0..=5u32 {
                    let topo = resolve(Some(cores), Some(threads), total);
                    assert_eq!(topo.total(), total);
                }
            }
        }
    }

    #[test]
    fn test_source_reporting() {
        assert_eq!(resolve(None, None, 4).source, TopologySource::Unhinted);
        assert_eq!(resolve(Some(2), None, 4).source, TopologySource::Hinted);
        assert_eq!(resolve(Some(2), Some(2), 6).source, TopologySource::Fallback);
    }

    #[test]
    fn test_resolve_from_details_ignores_garbage() {
        let topo = resolve_from_details(Some("four"), Some(" 2 "), 8);
        assert_eq!(topo.as_tuple(), (4, 1, 2));
        assert_eq!(resolve_from_details(None, None, 0).as_tuple(), (1, 1, 1));
    }
}
