use std::path::PathBuf;

use clap::Parser;

/// CLI configuration, covering every field spec.md names (`HttpAddr`,
/// `HttpsAddr`, `RouterAddr`, `PromAddr`, `PrefetchWorkers`, `LogLevel`)
/// plus the ambient cache/router tuning the distillation left implicit,
/// shaped the way `peserver::worker::Args` lays out its CLI.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Plain HTTP listener for `/blobs/*url` and `/v2/*`.
    #[arg(long, default_value = "0.0.0.0:7070")]
    pub http_addr: String,

    /// TLS listener, same routes, using a transport-provided certificate.
    #[arg(long)]
    pub https_addr: Option<String>,

    /// Certificate chain for `https_addr`. Required when `https_addr` is set.
    #[arg(long)]
    pub tls_cert_path: Option<PathBuf>,

    /// Private key for `https_addr`. Required when `https_addr` is set.
    #[arg(long)]
    pub tls_key_path: Option<PathBuf>,

    /// libp2p swarm listen multiaddr. Absent means run with `MockRouter`
    /// (no real DHT), which is the default for local development and tests.
    #[arg(long)]
    pub router_addr: Option<String>,

    /// Prometheus exposition bind address.
    #[arg(long)]
    pub prom_addr: Option<String>,

    /// Bootstrap peers for the DHT, `<peer-id>@<multiaddr>` pairs.
    #[arg(long)]
    pub bootstrap_peer: Vec<String>,

    #[arg(long, default_value_t = 2)]
    pub prefetch_workers: usize,

    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Root directory for the on-disk block cache.
    #[arg(long, default_value = "./blockpeer-cache")]
    pub cache_root: PathBuf,

    #[arg(long, default_value_t = 10_000)]
    pub cache_capacity: usize,

    #[arg(long, default_value_t = 10)]
    pub cache_evict_pct: u8,

    #[arg(long, default_value_t = 3)]
    pub resolve_retries: usize,

    #[arg(long, default_value_t = 1000)]
    pub resolve_timeout_ms: u64,

    #[arg(long, default_value_t = 30)]
    pub negative_cache_ttl_secs: u64,

    /// Containerd-style content directory consulted before falling back to
    /// a peer. Absent means always-miss (`NullLocalStore`), i.e. peer/DHT
    /// only operation.
    #[arg(long)]
    pub content_dir: Option<PathBuf>,

    // The remaining fields belong to the runtime-integration collaborator
    // (out of core scope per spec.md §6): accepted and threaded through to
    // `runtime_integration`, which logs them and otherwise no-ops.
    #[arg(long)]
    pub hosts: Option<String>,
    #[arg(long)]
    pub mirrors: Option<String>,
    #[arg(long)]
    pub containerd_hosts_config_path: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    pub add_mirror_configuration: bool,
}
