use log::info;

use crate::config::Config;

/// Stands in for the host-side mirror-config rewriting the original
/// performs against containerd's `hosts.toml` layout. Out of core scope
/// per spec.md §6 ("used by the runtime-integration collaborator"); this
/// carries the shape of the config and logs it so an operator can see what
/// was passed, without touching the host filesystem.
pub fn apply(config: &Config) {
    if config.hosts.is_none()
        && config.mirrors.is_none()
        && config.containerd_hosts_config_path.is_none()
        && !config.add_mirror_configuration
    {
        return;
    }
    info!(
        "runtime integration requested (hosts={:?}, mirrors={:?}, containerd_hosts_config_path={:?}, add_mirror_configuration={}) but is out of scope for this build; no host files were touched",
        config.hosts, config.mirrors, config.containerd_hosts_config_path, config.add_mirror_configuration
    );
}
