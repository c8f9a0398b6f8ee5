//! Per-session metrics collection over a shared SSH connection.
//!
//! One remote script per poll tick dumps every /proc-style source in a
//! single round trip; the collector parses the labeled sections and derives
//! rates (CPU %, network throughput) from the previous sample. Numeric
//! parse failures degrade to zero so one malformed field never blanks an
//! otherwise-valid frame.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::SshError;
use crate::ssh::Transport;

/// One batched report per tick. Section markers keep the parse trivial and
/// the output order fixed regardless of shell quirks.
const REPORT_SCRIPT: &str = r#"
echo "===SYSTEM==="
hostname 2>/dev/null || echo unknown
uname -s 2>/dev/null || echo unknown
uname -r 2>/dev/null || echo unknown
uname -m 2>/dev/null || echo unknown
nproc 2>/dev/null || echo 1
cut -d. -f1 /proc/uptime 2>/dev/null || echo 0
echo "===CPU==="
head -1 /proc/stat 2>/dev/null
echo "===LOAD==="
cat /proc/loadavg 2>/dev/null
echo "===MEMORY==="
cat /proc/meminfo 2>/dev/null
echo "===NET==="
cat /proc/net/dev 2>/dev/null
echo "===DISK==="
df -B1 -T -P 2>/dev/null
"#;

const EXEC_TIMEOUT_SECS: u64 = 10;

/// Mounts on pseudo filesystems or tiny partitions are noise, not capacity.
const EXCLUDED_FS_TYPES: &[&str] = &["tmpfs", "devtmpfs", "squashfs", "overlay", "efivarfs"];
const MIN_DISK_BYTES: u64 = 100 * 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemFacts {
    pub hostname: String,
    pub os: String,
    pub kernel: String,
    pub arch: String,
    pub cores: u32,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub buffers_bytes: u64,
    pub cached_bytes: u64,
    pub swap_total_bytes: u64,
    pub swap_used_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterfaceCounters {
    pub name: String,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkStats {
    /// Summed over all non-loopback interfaces.
    pub rx_bytes_per_sec: f64,
    pub tx_bytes_per_sec: f64,
    pub interfaces: Vec<InterfaceCounters>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskStats {
    pub device: String,
    pub fs_type: String,
    pub mount_point: String,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub usage_percent: f64,
}

/// One poll result, ready for compact binary framing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub timestamp: i64,
    pub cpu_percent: f64,
    pub load_avg: [f64; 3],
    pub memory: MemoryStats,
    pub network: NetworkStats,
    pub disks: Vec<DiskStats>,
    pub system: SystemFacts,
}

impl MetricSample {
    pub fn to_frame(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_frame(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// Counters carried between polls to derive rates.
#[derive(Debug, Clone)]
struct PreviousSample {
    cpu_busy: u64,
    cpu_total: u64,
    net: HashMap<String, (u64, u64)>,
    taken_at: Instant,
}

/// One collector per monitored session; not shared.
pub struct Collector {
    previous: Option<PreviousSample>,
}

impl Collector {
    pub fn new() -> Self {
        Self { previous: None }
    }

    /// Run one poll over `transport`.
    pub async fn collect(&mut self, transport: &Transport) -> Result<MetricSample, SshError> {
        let output = transport.exec(REPORT_SCRIPT, EXEC_TIMEOUT_SECS).await?;
        let elapsed = self
            .previous
            .as_ref()
            .map(|p| p.taken_at.elapsed())
            .unwrap_or(Duration::ZERO);
        Ok(self.ingest(&output.stdout, elapsed))
    }

    /// Fold one raw report into a sample, deriving rates against the
    /// previous report `elapsed` ago. Split from [`Collector::collect`] so
    /// the rate math is exercised without a live connection.
    pub fn ingest(&mut self, raw: &str, elapsed: Duration) -> MetricSample {
        let sections = split_sections(raw);

        let system = parse_system(sections.get("SYSTEM").copied().unwrap_or(""));
        let (cpu_busy, cpu_total) = parse_cpu(sections.get("CPU").copied().unwrap_or(""));
        let load_avg = parse_load(sections.get("LOAD").copied().unwrap_or(""));
        let memory = parse_memory(sections.get("MEMORY").copied().unwrap_or(""));
        let interfaces = parse_net(sections.get("NET").copied().unwrap_or(""));
        let disks = parse_disks(sections.get("DISK").copied().unwrap_or(""));

        let cpu_percent = match &self.previous {
            Some(prev) if cpu_total > prev.cpu_total => {
                let busy = cpu_busy.saturating_sub(prev.cpu_busy) as f64;
                let total = (cpu_total - prev.cpu_total) as f64;
                (busy / total * 100.0).clamp(0.0, 100.0)
            }
            _ => 0.0,
        };

        let secs = elapsed.as_secs_f64();
        let (mut rx_rate, mut tx_rate) = (0.0, 0.0);
        if let Some(prev) = &self.previous {
            if secs > 0.0 {
                for iface in &interfaces {
                    if iface.name == "lo" {
                        continue;
                    }
                    if let Some((prev_rx, prev_tx)) = prev.net.get(&iface.name) {
                        rx_rate += iface.rx_bytes.saturating_sub(*prev_rx) as f64 / secs;
                        tx_rate += iface.tx_bytes.saturating_sub(*prev_tx) as f64 / secs;
                    }
                }
            }
        }

        self.previous = Some(PreviousSample {
            cpu_busy,
            cpu_total,
            net: interfaces
                .iter()
                .map(|i| (i.name.clone(), (i.rx_bytes, i.tx_bytes)))
                .collect(),
            taken_at: Instant::now(),
        });

        MetricSample {
            timestamp: chrono::Utc::now().timestamp(),
            cpu_percent,
            load_avg,
            memory,
            network: NetworkStats {
                rx_bytes_per_sec: rx_rate,
                tx_bytes_per_sec: tx_rate,
                interfaces,
            },
            disks,
            system,
        }
    }
}

impl Default for Collector {
    fn default() -> Self {
        Self::new()
    }
}

fn split_sections(raw: &str) -> HashMap<&str, &str> {
    let mut sections = HashMap::new();
    let mut current: Option<(&str, usize)> = None;

    for (offset, line) in raw.lines().map(|l| (line_offset(raw, l), l)) {
        if let Some(name) = line.strip_prefix("===").and_then(|s| s.strip_suffix("===")) {
            if let Some((prev_name, start)) = current.take() {
                sections.insert(prev_name, raw[start..offset].trim_matches('\n'));
            }
            current = Some((name, offset + line.len()));
        }
    }
    if let Some((name, start)) = current {
        sections.insert(name, raw[start..].trim_matches('\n'));
    }
    sections
}

fn line_offset(raw: &str, line: &str) -> usize {
    line.as_ptr() as usize - raw.as_ptr() as usize
}

fn parse_u64(s: &str) -> u64 {
    s.trim().parse().unwrap_or(0)
}

fn parse_f64(s: &str) -> f64 {
    s.trim().parse().unwrap_or(0.0)
}

fn parse_system(section: &str) -> SystemFacts {
    let mut lines = section.lines();
    SystemFacts {
        hostname: lines.next().unwrap_or("unknown").trim().to_string(),
        os: lines.next().unwrap_or("unknown").trim().to_string(),
        kernel: lines.next().unwrap_or("unknown").trim().to_string(),
        arch: lines.next().unwrap_or("unknown").trim().to_string(),
        cores: lines.next().map(parse_u64).unwrap_or(1).max(1) as u32,
        uptime_secs: lines.next().map(parse_u64).unwrap_or(0),
    }
}

/// Returns (busy, total) jiffies from the aggregate cpu line.
fn parse_cpu(section: &str) -> (u64, u64) {
    let line = section.lines().find(|l| l.starts_with("cpu ")).unwrap_or("");
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .take(8)
        .map(parse_u64)
        .collect();
    if fields.len() < 4 {
        return (0, 0);
    }
    let total: u64 = fields.iter().sum();
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    (total.saturating_sub(idle), total)
}

fn parse_load(section: &str) -> [f64; 3] {
    let mut fields = section.split_whitespace().map(parse_f64);
    [
        fields.next().unwrap_or(0.0),
        fields.next().unwrap_or(0.0),
        fields.next().unwrap_or(0.0),
    ]
}

fn parse_memory(section: &str) -> MemoryStats {
    let kb = |key: &str| -> u64 {
        section
            .lines()
            .find(|l| l.starts_with(key))
            .and_then(|l| l.split_whitespace().nth(1))
            .map(parse_u64)
            .unwrap_or(0)
            * 1024
    };

    let total = kb("MemTotal:");
    let free = kb("MemFree:");
    let buffers = kb("Buffers:");
    let cached = kb("Cached:");
    let swap_total = kb("SwapTotal:");
    let swap_free = kb("SwapFree:");

    MemoryStats {
        total_bytes: total,
        used_bytes: total
            .saturating_sub(free)
            .saturating_sub(buffers)
            .saturating_sub(cached),
        free_bytes: free,
        buffers_bytes: buffers,
        cached_bytes: cached,
        swap_total_bytes: swap_total,
        swap_used_bytes: swap_total.saturating_sub(swap_free),
    }
}

fn parse_net(section: &str) -> Vec<InterfaceCounters> {
    section
        .lines()
        .filter_map(|line| {
            let (name, counters) = line.split_once(':')?;
            let fields: Vec<u64> = counters.split_whitespace().map(parse_u64).collect();
            if fields.len() < 10 {
                return None;
            }
            Some(InterfaceCounters {
                name: name.trim().to_string(),
                rx_bytes: fields[0],
                rx_packets: fields[1],
                tx_bytes: fields[8],
                tx_packets: fields[9],
            })
        })
        .collect()
}

fn parse_disks(section: &str) -> Vec<DiskStats> {
    section
        .lines()
        .filter_map(|line| {
            // df -B1 -T -P: device type total used available capacity% mount
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 7 || fields[0] == "Filesystem" {
                return None;
            }
            let fs_type = fields[1].to_string();
            if EXCLUDED_FS_TYPES.contains(&fs_type.as_str()) {
                return None;
            }
            let total = parse_u64(fields[2]);
            if total < MIN_DISK_BYTES {
                return None;
            }
            let used = parse_u64(fields[3]);
            Some(DiskStats {
                device: fields[0].to_string(),
                fs_type,
                mount_point: fields[6..].join(" "),
                total_bytes: total,
                used_bytes: used,
                available_bytes: parse_u64(fields[4]),
                usage_percent: if total > 0 {
                    used as f64 / total as f64 * 100.0
                } else {
                    0.0
                },
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(cpu_busy: u64, cpu_idle: u64, eth0_rx: u64, eth0_tx: u64) -> String {
        format!(
            "===SYSTEM===\n\
             testhost\n\
             Linux\n\
             6.8.0-45-generic\n\
             x86_64\n\
             4\n\
             86400\n\
             ===CPU===\n\
             cpu  {busy} 0 0 {idle} 0 0 0 0\n\
             ===LOAD===\n\
             0.52 0.58 0.59 1/467 12345\n\
             ===MEMORY===\n\
             MemTotal:       16384000 kB\n\
             MemFree:         4096000 kB\n\
             Buffers:          512000 kB\n\
             Cached:          2048000 kB\n\
             SwapTotal:       8192000 kB\n\
             SwapFree:        8192000 kB\n\
             ===NET===\n\
             Inter-|   Receive                                                |  Transmit\n\
              face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed\n\
                lo:  999999    1000    0    0    0     0          0         0   999999    1000    0    0    0     0       0          0\n\
              eth0: {rx}   2000    0    0    0     0          0         0  {tx}    1500    0    0    0     0       0          0\n\
             ===DISK===\n\
             Filesystem     Type  1-blocks       Used  Available Capacity Mounted on\n\
             /dev/sda1      ext4  100000000000 40000000000 60000000000      40% /\n\
             tmpfs          tmpfs   8000000000          0  8000000000       0% /dev/shm\n\
             /dev/sdb1      ext4      50000000   10000000    40000000      20% /boot/tiny\n",
            busy = cpu_busy,
            idle = cpu_idle,
            rx = eth0_rx,
            tx = eth0_tx,
        )
    }

    #[test]
    fn first_sample_reports_zero_rates() {
        let mut collector = Collector::new();
        let sample = collector.ingest(&report(100, 900, 1_000_000, 500_000), Duration::ZERO);

        assert_eq!(sample.cpu_percent, 0.0);
        assert_eq!(sample.network.rx_bytes_per_sec, 0.0);
        assert_eq!(sample.network.tx_bytes_per_sec, 0.0);
    }

    #[test]
    fn network_rate_is_delta_bytes_over_elapsed_seconds() {
        let mut collector = Collector::new();
        collector.ingest(&report(100, 900, 1_000_000, 500_000), Duration::ZERO);
        let sample = collector.ingest(
            &report(150, 1850, 3_000_000, 1_500_000),
            Duration::from_secs(2),
        );

        // 2,000,000 bytes over 2 seconds.
        assert!((sample.network.rx_bytes_per_sec - 1_000_000.0).abs() < 1.0);
        assert!((sample.network.tx_bytes_per_sec - 500_000.0).abs() < 1.0);
    }

    #[test]
    fn loopback_is_excluded_from_throughput() {
        let mut collector = Collector::new();
        // lo counters are identical in both reports; eth0 stays flat too,
        // so any nonzero rate would come from miscounting lo.
        collector.ingest(&report(100, 900, 1_000_000, 500_000), Duration::ZERO);
        let sample = collector.ingest(
            &report(150, 1850, 1_000_000, 500_000),
            Duration::from_secs(2),
        );

        assert_eq!(sample.network.rx_bytes_per_sec, 0.0);
        // The interface list itself still includes lo for inspection.
        assert!(sample.network.interfaces.iter().any(|i| i.name == "lo"));
    }

    #[test]
    fn cpu_percent_derives_from_jiffy_deltas() {
        let mut collector = Collector::new();
        collector.ingest(&report(100, 900, 0, 0), Duration::ZERO);
        // +50 busy out of +1000 total jiffies = 5%.
        let sample = collector.ingest(&report(150, 1850, 0, 0), Duration::from_secs(2));

        assert!((sample.cpu_percent - 5.0).abs() < 0.01);
    }

    #[test]
    fn memory_used_follows_linux_accounting() {
        let mut collector = Collector::new();
        let sample = collector.ingest(&report(100, 900, 0, 0), Duration::ZERO);

        let expected = (16_384_000u64 - 4_096_000 - 512_000 - 2_048_000) * 1024;
        assert_eq!(sample.memory.used_bytes, expected);
        assert_eq!(sample.memory.total_bytes, 16_384_000 * 1024);
        assert_eq!(sample.memory.swap_used_bytes, 0);
    }

    #[test]
    fn disks_exclude_pseudo_filesystems_and_tiny_partitions() {
        let mut collector = Collector::new();
        let sample = collector.ingest(&report(100, 900, 0, 0), Duration::ZERO);

        assert_eq!(sample.disks.len(), 1);
        assert_eq!(sample.disks[0].mount_point, "/");
        assert_eq!(sample.disks[0].fs_type, "ext4");
        assert!((sample.disks[0].usage_percent - 40.0).abs() < 0.01);
    }

    #[test]
    fn system_facts_and_load_are_parsed() {
        let mut collector = Collector::new();
        let sample = collector.ingest(&report(100, 900, 0, 0), Duration::ZERO);

        assert_eq!(sample.system.hostname, "testhost");
        assert_eq!(sample.system.os, "Linux");
        assert_eq!(sample.system.kernel, "6.8.0-45-generic");
        assert_eq!(sample.system.arch, "x86_64");
        assert_eq!(sample.system.cores, 4);
        assert_eq!(sample.system.uptime_secs, 86_400);
        assert!((sample.load_avg[0] - 0.52).abs() < 0.001);
    }

    #[test]
    fn malformed_fields_degrade_to_zero_not_failure() {
        let mut collector = Collector::new();
        let raw = "===SYSTEM===\nhost\nLinux\nx86_64\nnot-a-number\n\
                   ===CPU===\ncpu  garbage here totally 0\n\
                   ===LOAD===\nNaNish text\n\
                   ===MEMORY===\nMemTotal: abc kB\n\
                   ===NET===\n eth0: broken\n\
                   ===DISK===\n/dev/sda1 ext4 notanumber 0 0 0% /\n";
        let sample = collector.ingest(raw, Duration::ZERO);

        assert_eq!(sample.cpu_percent, 0.0);
        assert_eq!(sample.memory.total_bytes, 0);
        assert_eq!(sample.system.cores, 1);
        assert!(sample.disks.is_empty());
    }

    #[test]
    fn empty_report_yields_all_zero_sample() {
        let mut collector = Collector::new();
        let sample = collector.ingest("", Duration::ZERO);

        assert_eq!(sample.cpu_percent, 0.0);
        assert_eq!(sample.memory.total_bytes, 0);
        assert!(sample.network.interfaces.is_empty());
        assert!(sample.disks.is_empty());
    }

    #[test]
    fn counter_reset_does_not_produce_negative_rates() {
        let mut collector = Collector::new();
        collector.ingest(&report(100, 900, 5_000_000, 5_000_000), Duration::ZERO);
        // Counters went backwards (interface reset); rate clamps to zero.
        let sample = collector.ingest(
            &report(150, 1850, 1_000_000, 1_000_000),
            Duration::from_secs(2),
        );

        assert_eq!(sample.network.rx_bytes_per_sec, 0.0);
        assert_eq!(sample.network.tx_bytes_per_sec, 0.0);
    }

    #[test]
    fn sample_roundtrips_through_binary_frame() {
        let mut collector = Collector::new();
        let sample = collector.ingest(&report(100, 900, 1_000_000, 500_000), Duration::ZERO);

        let frame = sample.to_frame().expect("encode");
        let decoded = MetricSample::from_frame(&frame).expect("decode");
        assert_eq!(decoded, sample);
    }
}
