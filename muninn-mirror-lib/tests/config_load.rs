use std::fs;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use muninn_mirror_lib::{load_from_path, MirrorError, Protocol};

fn tmp_path(name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_nanos();
    std::env::temp_dir().join(format!("muninn-{nanos}-{name}.toml"))
}

#[test]
fn loads_minimal_config() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let path = tmp_path("minimal");
    let toml = r#"
[disk]
path = "/dev/loop7"

[net]
my_addr = "127.0.0.1:7788"
peer_addr = "10.0.0.2:7788"
protocol = "c"
"#;
    fs::write(&path, toml)?;

    let cfg = load_from_path(&path)?;
    assert_eq!(cfg.minor, 0);
    assert_eq!(cfg.net.protocol, Protocol::C);
    assert_eq!(cfg.net.timeout, 60);
    assert_eq!(cfg.net.sync_rate, 250);
    assert_eq!(cfg.net.tl_size, 256);
    assert_eq!(cfg.net.ping_int, 10);
    assert_eq!(cfg.net.try_connect_int, 10);
    assert!(!cfg.net.skip_sync);
    assert!(cfg.disk.size_kib.is_none());
    assert!(!cfg.disk.panic_on_disk_error);
    assert_eq!(cfg.meta.dir, PathBuf::from("/var/lib/muninn"));
    assert_eq!(cfg.logging.level, "info");
    Ok(())
}

#[test]
fn loads_full_config() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let path = tmp_path("full");
    let toml = r#"
minor = 3

[disk]
path = "/var/lib/muninn/backing.img"
size_kib = 1048576
panic_on_disk_error = true

[net]
my_addr = "192.168.1.10:7788"
peer_addr = "192.168.1.11:7788"
protocol = "b"
timeout = 80
sync_rate = 5000
skip_sync = true
tl_size = 512
ping_int = 5
try_connect_int = 3

[meta]
dir = "/data/muninn-meta"

[logging]
level = "debug"
show_target = true
"#;
    fs::write(&path, toml)?;

    let cfg = load_from_path(&path)?;
    assert_eq!(cfg.minor, 3);
    assert_eq!(cfg.disk.size_kib, Some(1_048_576));
    assert!(cfg.disk.panic_on_disk_error);
    assert_eq!(cfg.net.protocol, Protocol::B);
    assert_eq!(cfg.net.timeout, 80);
    assert!(cfg.net.skip_sync);
    assert_eq!(cfg.net.tl_size, 512);
    assert_eq!(cfg.meta.dir, PathBuf::from("/data/muninn-meta"));
    assert_eq!(
        cfg.net.timeout_duration(),
        Some(Duration::from_secs(8))
    );
    assert_eq!(
        cfg.net.half_timeout_duration(),
        Some(Duration::from_secs(4))
    );
    Ok(())
}

#[test]
fn rejects_identical_addresses() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let path = tmp_path("same-addr");
    let toml = r#"
[disk]
path = "/dev/loop7"

[net]
my_addr = "127.0.0.1:7788"
peer_addr = "127.0.0.1:7788"
protocol = "a"
"#;
    fs::write(&path, toml)?;

    match load_from_path(&path) {
        Err(MirrorError::Config(msg)) => assert!(msg.contains("my_addr")),
        other => panic!("expected a config error, got {other:?}"),
    }
    Ok(())
}

#[test]
fn rejects_tiny_transfer_log() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let path = tmp_path("tiny-tl");
    let toml = r#"
[disk]
path = "/dev/loop7"

[net]
my_addr = "127.0.0.1:7788"
peer_addr = "127.0.0.1:7789"
protocol = "c"
tl_size = 2
"#;
    fs::write(&path, toml)?;

    assert!(matches!(
        load_from_path(&path),
        Err(MirrorError::Config(_))
    ));
    Ok(())
}

#[test]
fn zero_timeout_disables_timers() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let path = tmp_path("no-timeout");
    let toml = r#"
[disk]
path = "/dev/loop7"

[net]
my_addr = "127.0.0.1:7788"
peer_addr = "127.0.0.1:7789"
protocol = "c"
timeout = 0
ping_int = 0
"#;
    fs::write(&path, toml)?;

    let cfg = load_from_path(&path)?;
    assert_eq!(cfg.net.timeout_duration(), None);
    assert_eq!(cfg.net.half_timeout_duration(), None);
    assert_eq!(cfg.net.ping_interval(), None);
    Ok(())
}
