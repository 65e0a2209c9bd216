use anyhow::Result;

use crate::daemon::*;
use crate::fixtures;

const LSCPU: &str = "Architecture:                    x86_64
CPU op-mode(s):                  32-bit, 64-bit
CPU(s):                          16
On-line CPU(s) list:             0-15
Thread(s) per core:              2
Core(s) per socket:              8
Socket(s):                       1
NUMA node(s):                    1
";

const FREE: &str = "              total        used        free      shared  buff/cache   available
Mem:          31906        5012       20123         512        6770       25887
Swap:          2047           0        2047
";

#[test]
fn lscpu_output_is_parsed() -> Result<()> {
    let facts = parse_lscpu(LSCPU)?;
    assert_eq!(facts.cpus, 16, "unexpected cpus, got {}", facts.cpus);
    assert_eq!(facts.sockets, 1);
    assert_eq!(facts.cores_per_socket, 8);
    assert_eq!(facts.threads_per_core, 2);
    Ok(())
}

#[test]
fn lscpu_output_missing_fields_is_an_error() {
    assert!(parse_lscpu("Architecture: x86_64\n").is_err(), "expected missing fields to be rejected");
}

#[test]
fn free_output_is_parsed() -> Result<()> {
    assert_eq!(parse_free_m(FREE)?, 31906);
    Ok(())
}

#[test]
fn gpu_device_names_are_recognized() {
    assert!(is_gpu_device("nvidia0"));
    assert!(is_gpu_device("nvidia12"));
    assert!(!is_gpu_device("nvidiactl"));
    assert!(!is_gpu_device("nvidia-uvm"));
    assert!(!is_gpu_device("nvidia"));
}

#[tokio::test]
async fn rendered_config_is_written_atomically() -> Result<()> {
    let tmpdir = tempfile::tempdir_in("/tmp")?;
    let path = tmpdir.path().join("etc").join("cluster.json");
    let daemon = SystemdDaemon::new("slurmd.service".into(), &path);
    let snapshot = fixtures::snapshot(&[("login", &[("n1", false)])]);

    daemon.render_config(&snapshot).await?;

    let written = tokio::fs::read_to_string(&path).await?;
    let decoded = crate::models::ConfigSnapshot::decode(&written)?;
    assert_eq!(decoded, snapshot, "expected the rendered config to round trip");
    assert!(!path.with_extension("tmp").exists(), "expected no temp file to be left behind");
    Ok(())
}
